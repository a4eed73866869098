use std::path::PathBuf;

use clap::{ArgGroup, Parser};
use clap_verbosity_flag::{InfoLevel, Verbosity};

/// Grant GitLab CI job-token access to the dependency projects referenced by
/// a project's manifests
#[derive(Parser)]
#[command(name = "tokenscope", version)]
#[command(group = ArgGroup::new("target").required(true).args(["project", "all"]))]
pub struct Cli {
    /// Numeric ID of the project to adjust
    #[arg(short, long)]
    pub project: Option<u64>,

    /// Adjust every project visible to the token
    #[arg(long)]
    pub all: bool,

    /// Compute and report changes without touching any allowlist
    #[arg(long)]
    pub dry_run: bool,

    /// Discover manifests below the repository root (monorepos)
    #[arg(long)]
    pub monorepo: bool,

    /// GitLab instance base URL
    #[arg(long, env = "GITLAB_URL", default_value = "https://gitlab.com")]
    pub url: String,

    /// Access token with api scope
    #[arg(long, env = "GITLAB_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Write the dry-run YAML report to this file as projects complete
    #[arg(long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Maximum in-flight dependency and project operations
    #[arg(long, default_value_t = 5)]
    pub concurrency: usize,

    /// Stop paginating tree and project listings after this many pages
    #[arg(long)]
    pub page_limit: Option<u32>,

    /// Per-project time budget in bulk mode, in seconds
    #[arg(long, value_name = "SECONDS")]
    pub project_timeout: Option<u64>,

    /// Only list projects matching this search term (bulk mode)
    #[arg(long)]
    pub search: Option<String>,

    /// Only list projects the token's user is a member of (bulk mode)
    #[arg(long)]
    pub membership: bool,

    /// Only list projects the token's user owns (bulk mode)
    #[arg(long)]
    pub owned: bool,

    /// Filter by archived state (bulk mode)
    #[arg(long)]
    pub archived: Option<bool>,

    /// Minimum access level on listed projects (bulk mode)
    #[arg(long)]
    pub min_access_level: Option<u32>,

    /// Project listing sort key (bulk mode)
    #[arg(long)]
    pub order_by: Option<String>,

    /// Project listing sort direction, asc or desc (bulk mode)
    #[arg(long)]
    pub sort: Option<String>,

    /// Filter by visibility: public, internal or private (bulk mode)
    #[arg(long)]
    pub visibility: Option<String>,

    /// Listing page size, capped at 100 (bulk mode)
    #[arg(long)]
    pub per_page: Option<u32>,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
}
