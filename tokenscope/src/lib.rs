pub mod error;
pub mod extractors;
pub mod gitlab;
pub mod project_ref;
pub mod reconciler;
pub mod report;
pub mod resolver;
pub mod scanner;

#[cfg(test)]
mod testutil;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use error::{BulkError, ProjectError, ProjectFailure};
use extractors::ExtractorRegistry;
use gitlab::{GitLabApi, ProjectQuery};
use project_ref::HostContext;
use reconciler::AllowlistReconciler;
use report::{ReportEntry, ReportWriter};
use scanner::{RepositoryScanner, ScanOutcome};

#[derive(Debug, Clone)]
pub struct AdjustOptions {
    /// Compute and report changes without issuing writes.
    pub dry_run: bool,
    /// Discover manifests below the repository root.
    pub monorepo: bool,
    /// Bound on in-flight dependency and project operations.
    pub concurrency: usize,
    /// Stop tree/listing pagination after this many pages.
    pub page_limit: Option<u32>,
    /// Per-project time budget in bulk mode.
    pub project_timeout: Option<Duration>,
}

impl Default for AdjustOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            monorepo: false,
            concurrency: reconciler::DEFAULT_CONCURRENCY,
            page_limit: None,
            project_timeout: None,
        }
    }
}

enum ProjectOutcome {
    /// Metadata was unavailable; bulk runs skip, single runs fail.
    Skipped,
    /// Nothing to change, with or without a dry-run entry.
    Done(Option<ReportEntry>),
}

/// Composes the scanner and reconciler over one project or every project the
/// token can see.
pub struct Adjuster {
    scanner: RepositoryScanner,
    reconciler: AllowlistReconciler,
    options: AdjustOptions,
}

impl Adjuster {
    pub fn new(api: Arc<dyn GitLabApi>, host: HostContext, options: AdjustOptions) -> Self {
        Self::with_registry(api, host, Arc::new(ExtractorRegistry::with_defaults()), options)
    }

    /// Like [`Adjuster::new`] with a caller-supplied extractor registry.
    pub fn with_registry(
        api: Arc<dyn GitLabApi>,
        host: HostContext,
        registry: Arc<ExtractorRegistry>,
        options: AdjustOptions,
    ) -> Self {
        let scanner =
            RepositoryScanner::new(api.clone(), registry, host, options.page_limit);
        let reconciler = AllowlistReconciler::new(api, options.concurrency);
        Self {
            scanner,
            reconciler,
            options,
        }
    }

    /// Adjust a single project. In dry-run mode returns the report entry
    /// when the project has dependencies; a live run returns `None` on
    /// success.
    pub async fn adjust_project(
        &self,
        project_id: u64,
    ) -> Result<Option<ReportEntry>, ProjectError> {
        match self.run_project(project_id).await? {
            ProjectOutcome::Skipped => Err(ProjectError::MetadataUnavailable { project_id }),
            ProjectOutcome::Done(entry) => Ok(entry),
        }
    }

    /// Adjust every project matched by `query`. Dry-run entries are appended
    /// to `reporter` as projects complete; failures are collected and raised
    /// together after every project has been attempted.
    pub async fn adjust_all_projects(
        &self,
        query: &ProjectQuery,
        reporter: Option<&ReportWriter>,
    ) -> Result<Vec<ReportEntry>, BulkError> {
        let projects = self
            .scanner_api()
            .get_all_projects(query)
            .await
            .map_err(|cause| BulkError::Listing { cause })?;
        info!(count = projects.len(), "adjusting all accessible projects");

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency));
        let attempts = projects.iter().map(|summary| {
            let semaphore = semaphore.clone();
            async move {
                let Some(project_id) = summary.id else {
                    warn!(
                        path = summary.path_with_namespace.as_deref().unwrap_or("<unknown>"),
                        "listing entry has no project id, skipping"
                    );
                    return Ok(None);
                };

                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let result = match self.options.project_timeout {
                    Some(budget) => {
                        match tokio::time::timeout(budget, self.run_project(project_id)).await {
                            Ok(result) => result,
                            Err(_) => {
                                return Err(ProjectFailure {
                                    project_id,
                                    cause: format!(
                                        "project {project_id}: timed out after {}s",
                                        budget.as_secs()
                                    ),
                                    details: vec![],
                                });
                            }
                        }
                    }
                    None => self.run_project(project_id).await,
                };

                match result {
                    Ok(ProjectOutcome::Skipped) | Ok(ProjectOutcome::Done(None)) => Ok(None),
                    Ok(ProjectOutcome::Done(Some(entry))) => {
                        if let Some(reporter) = reporter {
                            reporter.append(&entry);
                        }
                        Ok(Some(entry))
                    }
                    Err(e) => Err(ProjectFailure {
                        project_id,
                        cause: e.to_string(),
                        details: e.details(),
                    }),
                }
            }
        });

        let mut entries = Vec::new();
        let mut failures = Vec::new();
        for outcome in join_all(attempts).await {
            match outcome {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(failure) => failures.push(failure),
            }
        }

        if failures.is_empty() {
            Ok(entries)
        } else {
            Err(BulkError::Projects { failures })
        }
    }

    fn scanner_api(&self) -> &Arc<dyn GitLabApi> {
        self.scanner.api()
    }

    async fn run_project(&self, project_id: u64) -> Result<ProjectOutcome, ProjectError> {
        let outcome = self
            .scanner
            .scan(project_id, self.options.monorepo)
            .await
            .map_err(|e| ProjectError::Scan {
                project_id,
                cause: e.to_string(),
            })?;

        let Some(ScanOutcome { result, failures }) = outcome else {
            return Ok(ProjectOutcome::Skipped);
        };

        if result.dependencies.is_empty() && failures.is_empty() {
            info!(project = %result.project_name, "no GitLab-hosted dependencies, no changes required");
            return Ok(ProjectOutcome::Done(None));
        }

        if self.options.dry_run {
            if !failures.is_empty() {
                return Err(ProjectError::Files {
                    project_id,
                    failures,
                });
            }
            let entry = ReportEntry {
                project_name: result.project_name,
                project_id: result.project_id,
                dependencies: result.dependencies.into_iter().collect(),
            };
            return Ok(ProjectOutcome::Done(Some(entry)));
        }

        // Reconcile what was extracted even when some manifests failed;
        // partial application is accepted at every level.
        let reconciled = if result.dependencies.is_empty() {
            Ok(())
        } else {
            self.reconciler
                .reconcile(result.project_id, &result.dependencies)
                .await
        };

        match (reconciled, failures.is_empty()) {
            (Ok(()), true) => Ok(ProjectOutcome::Done(None)),
            (Ok(()), false) => Err(ProjectError::Files {
                project_id,
                failures,
            }),
            (Err(source), _) => Err(ProjectError::Reconcile {
                source,
                file_failures: failures,
            }),
        }
    }
}
