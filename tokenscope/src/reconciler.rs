use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Mutex, OnceCell, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::error::{DependencyFailure, GitLabError, ReconcileError};
use crate::gitlab::GitLabApi;

pub const DEFAULT_CONCURRENCY: usize = 5;

/// Brings dependency allowlists in sync with one or more source projects.
///
/// Lives for a whole run: path-to-ID lookups and `(source, dependency)`
/// allowlist checks are memoized across every project the run touches, so a
/// dependency shared by many source projects costs one lookup. Cache entries
/// are shared `OnceCell`s, handed out before the network call starts, so
/// concurrent requests for the same key never issue duplicate calls.
pub struct AllowlistReconciler {
    api: Arc<dyn GitLabApi>,
    concurrency: usize,
    ids: Mutex<HashMap<String, Arc<OnceCell<Option<u64>>>>>,
    checks: Mutex<HashMap<(u64, u64), Arc<OnceCell<bool>>>>,
}

impl AllowlistReconciler {
    pub fn new(api: Arc<dyn GitLabApi>, concurrency: usize) -> Self {
        Self {
            api,
            concurrency: concurrency.max(1),
            ids: Mutex::new(HashMap::new()),
            checks: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure every dependency allows job tokens from `source_id`.
    ///
    /// Dependencies are processed under a bounded pool; order is not
    /// significant. A failing dependency never stops its siblings, and
    /// whatever succeeded stays applied even when the aggregate errors.
    #[instrument(skip(self, dependencies), fields(count = dependencies.len()))]
    pub async fn reconcile(
        &self,
        source_id: u64,
        dependencies: &BTreeSet<String>,
    ) -> Result<(), ReconcileError> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        let attempts = dependencies.iter().map(|dependency| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                self.reconcile_one(source_id, dependency)
                    .await
                    .err()
                    .map(|cause| DependencyFailure {
                        dependency: dependency.clone(),
                        cause,
                    })
            }
        });

        let failures: Vec<DependencyFailure> =
            join_all(attempts).await.into_iter().flatten().collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ReconcileError {
                source_id,
                failures,
            })
        }
    }

    async fn reconcile_one(&self, source_id: u64, dependency: &str) -> Result<(), String> {
        let dep_id = self
            .lookup_id(dependency)
            .await
            .ok_or_else(|| format!("could not resolve project id for {dependency}"))?;

        if dep_id == source_id {
            debug!(dependency, "dependency is the source project itself, nothing to do");
            return Ok(());
        }

        let allowed = self
            .check_allowed(source_id, dep_id)
            .await
            .map_err(|e| format!("allowlist check failed: {e}"))?;
        if allowed {
            debug!(dependency, dep_id, "source already allowlisted, nothing to do");
            return Ok(());
        }

        self.api
            .allow_job_token_access(dep_id, source_id)
            .await
            .map_err(|e| format!("allowlist write failed: {e}"))?;
        info!(dependency, dep_id, source_id, "granted job token access");
        Ok(())
    }

    async fn lookup_id(&self, dependency: &str) -> Option<u64> {
        let cell = {
            let mut ids = self.ids.lock().await;
            ids.entry(dependency.to_string()).or_default().clone()
        };

        cell.get_or_init(|| async {
            match self.api.get_project(dependency).await {
                Ok(project) => Some(project.id),
                Err(e) => {
                    warn!(dependency, error = %e, "failed to look up dependency project");
                    None
                }
            }
        })
        .await
        .as_ref()
        .copied()
    }

    async fn check_allowed(&self, source_id: u64, dep_id: u64) -> Result<bool, GitLabError> {
        let cell = {
            let mut checks = self.checks.lock().await;
            checks.entry((source_id, dep_id)).or_default().clone()
        };

        cell.get_or_try_init(|| self.api.is_project_allowed(source_id, dep_id))
            .await
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::testutil::FakeGitLab;

    fn deps(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn fake_with_dep() -> Arc<FakeGitLab> {
        let api = Arc::new(FakeGitLab::new());
        api.add_project(1, "group/app", Some("main"));
        api.add_project(2, "group/dep", Some("main"));
        api
    }

    #[tokio::test]
    async fn missing_entry_is_written() {
        let api = fake_with_dep();
        let reconciler = AllowlistReconciler::new(api.clone(), DEFAULT_CONCURRENCY);

        reconciler.reconcile(1, &deps(&["group/dep"])).await.unwrap();
        assert_eq!(*api.allow_writes.lock().unwrap(), vec![(2, 1)]);
    }

    #[tokio::test]
    async fn existing_entry_is_a_noop() {
        let api = fake_with_dep();
        api.allow(2, 1);
        let reconciler = AllowlistReconciler::new(api.clone(), DEFAULT_CONCURRENCY);

        reconciler.reconcile(1, &deps(&["group/dep"])).await.unwrap();
        assert_eq!(api.allow_write_count(), 0, "already-allowed pair must not be re-written");
    }

    #[tokio::test]
    async fn self_dependency_is_a_noop() {
        let api = fake_with_dep();
        let reconciler = AllowlistReconciler::new(api.clone(), DEFAULT_CONCURRENCY);

        reconciler.reconcile(1, &deps(&["group/app"])).await.unwrap();
        assert_eq!(api.allow_write_count(), 0);
    }

    #[tokio::test]
    async fn failures_are_isolated_and_aggregated() {
        let api = Arc::new(FakeGitLab::new());
        api.add_project(1, "group/app", Some("main"));
        api.add_project(2, "group/ok", Some("main"));
        api.add_project(3, "group/broken", Some("main"));
        api.fail_allows_for(3);
        let reconciler = AllowlistReconciler::new(api.clone(), DEFAULT_CONCURRENCY);

        let err = reconciler
            .reconcile(1, &deps(&["group/ok", "group/broken", "group/missing"]))
            .await
            .unwrap_err();

        assert_eq!(err.source_id, 1);
        assert_eq!(err.failures.len(), 2);
        let failed: Vec<&str> = err.failures.iter().map(|f| f.dependency.as_str()).collect();
        assert!(failed.contains(&"group/broken"));
        assert!(failed.contains(&"group/missing"));
        // The healthy sibling was still applied.
        assert_eq!(*api.allow_writes.lock().unwrap(), vec![(2, 1)]);
    }

    #[tokio::test]
    async fn id_lookups_are_memoized_across_sources() {
        let api = fake_with_dep();
        api.add_project(7, "group/other", Some("main"));
        let reconciler = AllowlistReconciler::new(api.clone(), DEFAULT_CONCURRENCY);

        reconciler.reconcile(1, &deps(&["group/dep"])).await.unwrap();
        reconciler.reconcile(7, &deps(&["group/dep"])).await.unwrap();

        assert_eq!(api.project_lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn allowlist_checks_are_memoized_per_pair() {
        let api = fake_with_dep();
        api.allow(2, 1);
        let reconciler = AllowlistReconciler::new(api.clone(), DEFAULT_CONCURRENCY);

        reconciler.reconcile(1, &deps(&["group/dep"])).await.unwrap();
        reconciler.reconcile(1, &deps(&["group/dep"])).await.unwrap();

        assert_eq!(api.allowlist_checks.load(Ordering::SeqCst), 1);
        assert_eq!(api.allow_write_count(), 0);
    }

    #[tokio::test]
    async fn resolution_failures_are_cached() {
        let api = Arc::new(FakeGitLab::new());
        api.add_project(1, "group/app", Some("main"));
        let reconciler = AllowlistReconciler::new(api.clone(), DEFAULT_CONCURRENCY);

        let before = api.project_lookups.load(Ordering::SeqCst);
        assert!(reconciler.reconcile(1, &deps(&["group/gone"])).await.is_err());
        assert!(reconciler.reconcile(1, &deps(&["group/gone"])).await.is_err());
        assert_eq!(api.project_lookups.load(Ordering::SeqCst) - before, 1);
    }

    #[tokio::test]
    async fn empty_dependency_set_is_trivially_ok() {
        let api = fake_with_dep();
        let reconciler = AllowlistReconciler::new(api.clone(), DEFAULT_CONCURRENCY);
        reconciler.reconcile(1, &BTreeSet::new()).await.unwrap();
        assert_eq!(api.allow_write_count(), 0);
    }
}
