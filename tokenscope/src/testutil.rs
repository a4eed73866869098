use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::GitLabError;
use crate::gitlab::{GitLabApi, Project, ProjectQuery, ProjectSummary};

/// Configurable in-memory GitLab used by unit tests across the pipeline.
#[derive(Default)]
pub struct FakeGitLab {
    projects: Mutex<Vec<Project>>,
    listing: Mutex<Vec<ProjectSummary>>,
    /// Manifest paths visible in each project's repository.
    trees: Mutex<HashMap<u64, Vec<String>>>,
    files: Mutex<HashMap<(u64, String), String>>,
    failing_files: Mutex<HashSet<(u64, String)>>,
    allowlists: Mutex<HashMap<u64, HashSet<u64>>>,
    failing_allows: Mutex<HashSet<u64>>,
    pub project_lookups: AtomicUsize,
    pub allowlist_checks: AtomicUsize,
    pub allow_writes: Mutex<Vec<(u64, u64)>>,
}

impl FakeGitLab {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_project(&self, id: u64, path: &str, branch: Option<&str>) {
        self.projects.lock().unwrap().push(Project {
            id,
            path_with_namespace: path.to_string(),
            default_branch: branch.map(str::to_string),
        });
        self.listing.lock().unwrap().push(ProjectSummary {
            id: Some(id),
            path_with_namespace: Some(path.to_string()),
        });
    }

    pub fn add_listing_entry_without_id(&self) {
        self.listing.lock().unwrap().push(ProjectSummary {
            id: None,
            path_with_namespace: None,
        });
    }

    pub fn add_file(&self, project_id: u64, path: &str, content: &str) {
        self.trees
            .lock()
            .unwrap()
            .entry(project_id)
            .or_default()
            .push(path.to_string());
        self.files
            .lock()
            .unwrap()
            .insert((project_id, path.to_string()), content.to_string());
    }

    /// Register a manifest whose content fetch fails with a server error.
    pub fn add_failing_file(&self, project_id: u64, path: &str) {
        self.trees
            .lock()
            .unwrap()
            .entry(project_id)
            .or_default()
            .push(path.to_string());
        self.failing_files
            .lock()
            .unwrap()
            .insert((project_id, path.to_string()));
    }

    pub fn allow(&self, dep_id: u64, source_id: u64) {
        self.allowlists
            .lock()
            .unwrap()
            .entry(dep_id)
            .or_default()
            .insert(source_id);
    }

    /// Make allowlist writes against `dep_id` fail.
    pub fn fail_allows_for(&self, dep_id: u64) {
        self.failing_allows.lock().unwrap().insert(dep_id);
    }

    pub fn allow_write_count(&self) -> usize {
        self.allow_writes.lock().unwrap().len()
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[async_trait]
impl GitLabApi for FakeGitLab {
    async fn get_project(&self, reference: &str) -> Result<Project, GitLabError> {
        self.project_lookups.fetch_add(1, Ordering::SeqCst);
        self.projects
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.id.to_string() == reference || p.path_with_namespace == reference)
            .cloned()
            .ok_or_else(|| GitLabError::NotFound(format!("project {reference}")))
    }

    async fn get_all_projects(
        &self,
        _query: &ProjectQuery,
    ) -> Result<Vec<ProjectSummary>, GitLabError> {
        Ok(self.listing.lock().unwrap().clone())
    }

    async fn find_dependency_files(
        &self,
        project_id: u64,
        _branch: &str,
        basenames: &[String],
        monorepo: bool,
        _page_limit: Option<u32>,
    ) -> Result<Vec<String>, GitLabError> {
        let trees = self.trees.lock().unwrap();
        Ok(trees
            .get(&project_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|p| monorepo || !p.contains('/'))
            .filter(|p| basenames.iter().any(|name| name == basename(p)))
            .collect())
    }

    async fn get_file_content(
        &self,
        project_id: u64,
        path: &str,
        _branch: &str,
    ) -> Result<Option<String>, GitLabError> {
        let key = (project_id, path.to_string());
        if self.failing_files.lock().unwrap().contains(&key) {
            return Err(GitLabError::Status {
                status: 500,
                url: format!("fake://{project_id}/{path}"),
            });
        }
        Ok(self.files.lock().unwrap().get(&key).cloned())
    }

    async fn is_project_allowed(&self, source_id: u64, dep_id: u64) -> Result<bool, GitLabError> {
        self.allowlist_checks.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .allowlists
            .lock()
            .unwrap()
            .get(&dep_id)
            .is_some_and(|sources| sources.contains(&source_id)))
    }

    async fn allow_job_token_access(
        &self,
        dep_id: u64,
        source_id: u64,
    ) -> Result<(), GitLabError> {
        if self.failing_allows.lock().unwrap().contains(&dep_id) {
            return Err(GitLabError::Status {
                status: 403,
                url: format!("fake://{dep_id}/allowlist"),
            });
        }
        self.allow_writes.lock().unwrap().push((dep_id, source_id));
        self.allowlists
            .lock()
            .unwrap()
            .entry(dep_id)
            .or_default()
            .insert(source_id);
        Ok(())
    }
}
