use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::warn;

use crate::gitlab::GitLabApi;

/// Resolves numeric project IDs to `path_with_namespace`, memoized for the
/// lifetime of one scan.
///
/// Entries are shared `OnceCell`s handed out before the lookup starts, so
/// concurrent requests for the same ID await a single network call instead
/// of racing to populate a completed-results map. Once a cell is initialized
/// (success or failure) it is never overwritten.
pub struct PathResolver {
    api: Arc<dyn GitLabApi>,
    /// Which project's scan these lookups belong to, for diagnostics.
    source: String,
    cache: Mutex<HashMap<u64, Arc<OnceCell<Option<String>>>>>,
}

impl PathResolver {
    pub fn new(api: Arc<dyn GitLabApi>, source: String) -> Self {
        Self {
            api,
            source,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, id: u64) -> Option<String> {
        let cell = {
            let mut cache = self.cache.lock().await;
            cache.entry(id).or_default().clone()
        };

        cell.get_or_init(|| async {
            match self.api.get_project(&id.to_string()).await {
                Ok(project) => Some(project.path_with_namespace),
                Err(e) => {
                    warn!(
                        source = %self.source,
                        dependency_id = id,
                        error = %e,
                        "failed to resolve dependency project id"
                    );
                    None
                }
            }
        })
        .await
        .clone()
    }
}
