use std::fmt;

use thiserror::Error;

/// Failures surfaced by the GitLab REST boundary after retries are exhausted.
#[derive(Debug, Error)]
pub enum GitLabError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("GitLab API returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("unsupported content encoding {encoding:?} for {path}")]
    Encoding { path: String, encoding: String },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl GitLabError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GitLabError::NotFound(_))
    }
}

/// One manifest file that could not be fetched or processed.
#[derive(Debug, Clone)]
pub struct FileFailure {
    pub project_id: u64,
    pub path: String,
    pub cause: String,
}

impl fmt::Display for FileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (project {}): {}", self.path, self.project_id, self.cause)
    }
}

/// One dependency that could not be resolved or allowlisted.
#[derive(Debug, Clone)]
pub struct DependencyFailure {
    pub dependency: String,
    pub cause: String,
}

impl fmt::Display for DependencyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.dependency, self.cause)
    }
}

/// Aggregated reconciliation outcome for one source project. Dependencies
/// that succeeded before the failures were collected have already taken
/// effect; this is not transactional.
#[derive(Debug, Error)]
#[error("failed to allowlist {} of the dependencies of project {source_id}", .failures.len())]
pub struct ReconcileError {
    pub source_id: u64,
    pub failures: Vec<DependencyFailure>,
}

/// Why adjusting a single project failed.
#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("project {project_id}: metadata unavailable")]
    MetadataUnavailable { project_id: u64 },

    #[error("project {project_id}: scan failed: {cause}")]
    Scan { project_id: u64, cause: String },

    #[error("project {project_id}: {} manifest file(s) failed to process", .failures.len())]
    Files {
        project_id: u64,
        failures: Vec<FileFailure>,
    },

    #[error("{source}")]
    Reconcile {
        #[source]
        source: ReconcileError,
        file_failures: Vec<FileFailure>,
    },
}

impl ProjectError {
    /// Flatten every per-item failure into printable lines.
    pub fn details(&self) -> Vec<String> {
        match self {
            ProjectError::MetadataUnavailable { .. } | ProjectError::Scan { .. } => vec![],
            ProjectError::Files { failures, .. } => {
                failures.iter().map(|f| f.to_string()).collect()
            }
            ProjectError::Reconcile {
                source,
                file_failures,
            } => source
                .failures
                .iter()
                .map(|f| f.to_string())
                .chain(file_failures.iter().map(|f| f.to_string()))
                .collect(),
        }
    }
}

/// One project that failed during a bulk run. `cause` already names the
/// project.
#[derive(Debug, Clone)]
pub struct ProjectFailure {
    pub project_id: u64,
    pub cause: String,
    pub details: Vec<String>,
}

impl fmt::Display for ProjectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cause)
    }
}

/// Outcome of a bulk run where at least one project failed. Successful
/// projects keep their effects.
#[derive(Debug, Error)]
pub enum BulkError {
    #[error("failed to list projects: {cause}")]
    Listing { cause: GitLabError },

    #[error("{} project(s) failed during adjustment", .failures.len())]
    Projects { failures: Vec<ProjectFailure> },
}
