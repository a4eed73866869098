use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::error::{FileFailure, GitLabError};
use crate::extractors::ExtractorRegistry;
use crate::gitlab::GitLabApi;
use crate::project_ref::{HostContext, RawDependency};
use crate::resolver::PathResolver;

/// What one project scan discovered. Immutable once built.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub project_id: u64,
    pub project_name: String,
    pub default_branch: String,
    pub dependencies: BTreeSet<String>,
}

/// A scan's dependencies plus the manifest files that could not be
/// processed. Partial results are kept; the caller decides whether the
/// failures are fatal.
#[derive(Debug)]
pub struct ScanOutcome {
    pub result: ScanResult,
    pub failures: Vec<FileFailure>,
}

/// Discovers dependency manifests in a project and routes each one to its
/// extractor.
pub struct RepositoryScanner {
    api: Arc<dyn GitLabApi>,
    registry: Arc<ExtractorRegistry>,
    host: HostContext,
    page_limit: Option<u32>,
}

impl RepositoryScanner {
    pub fn new(
        api: Arc<dyn GitLabApi>,
        registry: Arc<ExtractorRegistry>,
        host: HostContext,
        page_limit: Option<u32>,
    ) -> Self {
        Self {
            api,
            registry,
            host,
            page_limit,
        }
    }

    pub(crate) fn api(&self) -> &Arc<dyn GitLabApi> {
        &self.api
    }

    /// Scan one project. `Ok(None)` means the project (or its repository)
    /// does not exist for this token; bulk callers skip it rather than fail.
    #[instrument(skip(self))]
    pub async fn scan(
        &self,
        project_id: u64,
        monorepo: bool,
    ) -> Result<Option<ScanOutcome>, GitLabError> {
        let project = match self.api.get_project(&project_id.to_string()).await {
            Ok(project) => project,
            Err(e) if e.is_not_found() => {
                warn!(project_id, "project metadata unavailable, skipping");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let Some(branch) = project.default_branch.clone() else {
            warn!(project = %project.path_with_namespace, "project has no default branch, skipping");
            return Ok(None);
        };

        let basenames = self.registry.basenames();
        let files = match self
            .api
            .find_dependency_files(project.id, &branch, &basenames, monorepo, self.page_limit)
            .await
        {
            Ok(files) => files,
            Err(e) if e.is_not_found() => {
                warn!(project = %project.path_with_namespace, "repository tree unavailable, treating as empty");
                vec![]
            }
            Err(e) => return Err(e),
        };
        info!(
            project = %project.path_with_namespace,
            manifests = files.len(),
            "discovered dependency manifests"
        );

        // One resolver per scan: ID lookups are memoized for this project
        // only.
        let resolver = PathResolver::new(self.api.clone(), project.path_with_namespace.clone());

        let mut dependencies: BTreeSet<String> = BTreeSet::new();
        let mut failures: Vec<FileFailure> = Vec::new();

        // Files are processed one at a time so diagnostics stay ordered and
        // a big monorepo does not hold every manifest in memory at once.
        for path in files {
            match self.process_file(project.id, &path, &branch, &resolver).await {
                Ok(deps) => {
                    dependencies.extend(deps);
                }
                Err(e) => {
                    warn!(project = %project.path_with_namespace, file = %path, error = %e, "failed to process manifest");
                    failures.push(FileFailure {
                        project_id: project.id,
                        path,
                        cause: e.to_string(),
                    });
                }
            }
        }

        // A project does not need to allowlist itself.
        dependencies.remove(&project.path_with_namespace);

        Ok(Some(ScanOutcome {
            result: ScanResult {
                project_id: project.id,
                project_name: project.path_with_namespace,
                default_branch: branch,
                dependencies,
            },
            failures,
        }))
    }

    async fn process_file(
        &self,
        project_id: u64,
        path: &str,
        branch: &str,
        resolver: &PathResolver,
    ) -> Result<Vec<String>, GitLabError> {
        let basename = path.rsplit('/').next().unwrap_or(path);
        let Some(extractor) = self.registry.get(basename) else {
            debug!(path, "no extractor registered, skipping");
            return Ok(vec![]);
        };
        let Some(content) = self.api.get_file_content(project_id, path, branch).await? else {
            debug!(path, "manifest has no content, skipping");
            return Ok(vec![]);
        };

        let raw = extractor.extract(&content, &self.host);
        let mut deps = Vec::with_capacity(raw.len());
        for dependency in raw {
            match dependency {
                RawDependency::Path(p) => deps.push(p),
                RawDependency::Id(id) => {
                    if let Some(p) = resolver.resolve(id).await {
                        deps.push(p);
                    }
                }
            }
        }
        debug!(path, count = deps.len(), "extracted dependencies");
        Ok(deps)
    }
}
