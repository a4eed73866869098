use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::GitLabError;

/// Characters escaped when a project path or file path is used as a single
/// URL segment. The slash is the one that matters to GitLab.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'?')
    .add(b'&')
    .add(b'+');

fn encode_segment(reference: &str) -> String {
    utf8_percent_encode(reference, SEGMENT).to_string()
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    pub id: u64,
    pub path_with_namespace: String,
    #[serde(default)]
    pub default_branch: Option<String>,
}

/// A lenient view of one entry from the project listing. GitLab always
/// populates `id` in practice, but a missing one must be skipped rather than
/// fail the whole bulk run.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectSummary {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub path_with_namespace: Option<String>,
}

/// Listing filters, forwarded verbatim to `GET /projects`.
#[derive(Debug, Clone, Default)]
pub struct ProjectQuery {
    pub search: Option<String>,
    pub membership: Option<bool>,
    pub owned: Option<bool>,
    pub archived: Option<bool>,
    pub simple: Option<bool>,
    pub min_access_level: Option<u32>,
    pub order_by: Option<String>,
    pub sort: Option<String>,
    pub visibility: Option<String>,
    /// Server page size, capped at 100.
    pub per_page: Option<u32>,
    /// Stop after this many pages.
    pub page_limit: Option<u32>,
}

/// The GitLab surface the pipeline depends on. Implemented by
/// [`GitLabClient`] and by in-memory fakes in tests.
#[async_trait]
pub trait GitLabApi: Send + Sync {
    /// Fetch project metadata by numeric ID or full path.
    async fn get_project(&self, reference: &str) -> Result<Project, GitLabError>;

    /// Enumerate every project visible to the token, filtered by `query`.
    async fn get_all_projects(
        &self,
        query: &ProjectQuery,
    ) -> Result<Vec<ProjectSummary>, GitLabError>;

    /// Discover files named after one of `basenames` in a project's
    /// repository.
    async fn find_dependency_files(
        &self,
        project_id: u64,
        branch: &str,
        basenames: &[String],
        monorepo: bool,
        page_limit: Option<u32>,
    ) -> Result<Vec<String>, GitLabError>;

    /// Decoded file content, or `None` when the file does not exist.
    async fn get_file_content(
        &self,
        project_id: u64,
        path: &str,
        branch: &str,
    ) -> Result<Option<String>, GitLabError>;

    /// Whether `source_id` is already in `dep_id`'s job token allowlist.
    async fn is_project_allowed(&self, source_id: u64, dep_id: u64) -> Result<bool, GitLabError>;

    /// Add `source_id` to `dep_id`'s job token allowlist.
    async fn allow_job_token_access(&self, dep_id: u64, source_id: u64)
    -> Result<(), GitLabError>;
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub timeout: Duration,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Clone)]
pub struct GitLabClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    options: ClientOptions,
}

impl GitLabClient {
    pub fn new(base_url: &str, token: &str, options: ClientOptions) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent("tokenscope")
                .timeout(options.timeout)
                .build()
                .expect("failed to build HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            options,
        }
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/v4/{path}", self.base_url)
    }

    /// Send a request, retrying with linear backoff on 429/5xx responses and
    /// on connection or timeout errors.
    async fn execute(
        &self,
        url: &str,
        make: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, GitLabError> {
        let mut attempt = 1u32;
        loop {
            let result = make().header("PRIVATE-TOKEN", &self.token).send().await;
            let retryable = match &result {
                Ok(resp) => {
                    let status = resp.status();
                    status.as_u16() == 429 || status.is_server_error()
                }
                Err(e) => e.is_timeout() || e.is_connect(),
            };

            if retryable && attempt < self.options.retry_attempts {
                let delay = self.options.retry_base_delay * attempt;
                debug!(url, attempt, delay_ms = delay.as_millis() as u64, "retrying request");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            return result.map_err(|e| GitLabError::Transport {
                url: url.to_string(),
                source: e,
            });
        }
    }

    /// GET returning the parsed body and the `x-next-page` hint, or `None`
    /// on 404.
    async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Option<(Value, Option<u32>)>, GitLabError> {
        let resp = self
            .execute(url, || self.client.get(url).query(query))
            .await?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(GitLabError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let next = resp
            .headers()
            .get("x-next-page")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        let json = resp.json().await.map_err(|e| GitLabError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        Ok(Some((json, next)))
    }

    /// Accumulate pages of an array endpoint until the server stops
    /// advertising a next page or `page_limit` is hit. A 404 surfaces as
    /// [`GitLabError::NotFound`].
    async fn get_paged(
        &self,
        url: &str,
        params: &[(&str, String)],
        page_limit: Option<u32>,
    ) -> Result<Vec<Value>, GitLabError> {
        let mut items = Vec::new();
        let mut page = 1u32;
        loop {
            let mut query: Vec<(&str, String)> = params.to_vec();
            query.push(("page", page.to_string()));

            let Some((json, next)) = self.get_json(url, &query).await? else {
                return Err(GitLabError::NotFound(url.to_string()));
            };
            match json {
                Value::Array(batch) => items.extend(batch),
                _ => {
                    return Err(GitLabError::Decode {
                        url: url.to_string(),
                        message: "expected a JSON array".to_string(),
                    });
                }
            }

            match next {
                Some(n) if page_limit.is_none_or(|limit| page < limit) => page = n,
                _ => return Ok(items),
            }
        }
    }

    /// Locate manifests through the blob filename search. `Ok(None)` means
    /// the endpoint is unavailable on this instance and the caller should
    /// fall back to tree pagination.
    async fn search_blobs(
        &self,
        project_id: u64,
        branch: &str,
        basenames: &[String],
    ) -> Result<Option<Vec<String>>, GitLabError> {
        let url = self.api(&format!("projects/{project_id}/search"));
        let mut found = Vec::new();

        for name in basenames {
            let query = [
                ("scope", "blobs".to_string()),
                ("search", format!("filename:{name}")),
                ("ref", branch.to_string()),
                ("per_page", "100".to_string()),
            ];
            let resp = self
                .execute(&url, || self.client.get(&url).query(&query))
                .await?;

            let status = resp.status();
            if matches!(status.as_u16(), 400 | 403 | 404) {
                debug!(project_id, status = status.as_u16(), "blob search unavailable");
                return Ok(None);
            }
            if !status.is_success() {
                return Err(GitLabError::Status {
                    status: status.as_u16(),
                    url: url.clone(),
                });
            }

            let json: Value = resp.json().await.map_err(|e| GitLabError::Decode {
                url: url.clone(),
                message: e.to_string(),
            })?;
            if let Some(results) = json.as_array() {
                for item in results {
                    if let Some(path) = item.get("path").and_then(|p| p.as_str())
                        && basename(path) == name
                    {
                        found.push(path.to_string());
                    }
                }
            }
        }

        found.sort();
        found.dedup();
        Ok(Some(found))
    }

    async fn tree_files(
        &self,
        project_id: u64,
        branch: &str,
        basenames: &[String],
        monorepo: bool,
        page_limit: Option<u32>,
    ) -> Result<Vec<String>, GitLabError> {
        let url = self.api(&format!("projects/{project_id}/repository/tree"));
        let params = [
            ("ref", branch.to_string()),
            ("per_page", "100".to_string()),
            ("recursive", monorepo.to_string()),
        ];
        let entries = self.get_paged(&url, &params, page_limit).await?;

        Ok(entries
            .iter()
            .filter(|e| e.get("type").and_then(|t| t.as_str()) == Some("blob"))
            .filter_map(|e| e.get("path").and_then(|p| p.as_str()))
            .filter(|path| basenames.iter().any(|name| name == basename(path)))
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl GitLabApi for GitLabClient {
    #[instrument(skip(self))]
    async fn get_project(&self, reference: &str) -> Result<Project, GitLabError> {
        let url = self.api(&format!("projects/{}", encode_segment(reference)));
        match self.get_json(&url, &[]).await? {
            Some((json, _)) => serde_json::from_value(json).map_err(|e| GitLabError::Decode {
                url,
                message: e.to_string(),
            }),
            None => Err(GitLabError::NotFound(format!("project {reference}"))),
        }
    }

    #[instrument(skip(self, query))]
    async fn get_all_projects(
        &self,
        query: &ProjectQuery,
    ) -> Result<Vec<ProjectSummary>, GitLabError> {
        let per_page = query.per_page.unwrap_or(100).min(100);
        let mut params: Vec<(&str, String)> = vec![("per_page", per_page.to_string())];
        if let Some(search) = &query.search {
            params.push(("search", search.clone()));
        }
        if let Some(membership) = query.membership {
            params.push(("membership", membership.to_string()));
        }
        if let Some(owned) = query.owned {
            params.push(("owned", owned.to_string()));
        }
        if let Some(archived) = query.archived {
            params.push(("archived", archived.to_string()));
        }
        if let Some(simple) = query.simple {
            params.push(("simple", simple.to_string()));
        }
        if let Some(level) = query.min_access_level {
            params.push(("min_access_level", level.to_string()));
        }
        if let Some(order_by) = &query.order_by {
            params.push(("order_by", order_by.clone()));
        }
        if let Some(sort) = &query.sort {
            params.push(("sort", sort.clone()));
        }
        if let Some(visibility) = &query.visibility {
            params.push(("visibility", visibility.clone()));
        }

        let url = self.api("projects");
        let items = self.get_paged(&url, &params, query.page_limit).await?;
        debug!(count = items.len(), "listed projects");

        items
            .into_iter()
            .map(|item| {
                serde_json::from_value(item).map_err(|e| GitLabError::Decode {
                    url: url.clone(),
                    message: e.to_string(),
                })
            })
            .collect()
    }

    #[instrument(skip(self, basenames))]
    async fn find_dependency_files(
        &self,
        project_id: u64,
        branch: &str,
        basenames: &[String],
        monorepo: bool,
        page_limit: Option<u32>,
    ) -> Result<Vec<String>, GitLabError> {
        if let Some(paths) = self.search_blobs(project_id, branch, basenames).await? {
            // Search matches at any depth; outside monorepo mode only root
            // manifests count.
            let paths: Vec<String> = paths
                .into_iter()
                .filter(|p| monorepo || !p.contains('/'))
                .collect();
            debug!(project_id, count = paths.len(), "manifests found via blob search");
            return Ok(paths);
        }

        let paths = self
            .tree_files(project_id, branch, basenames, monorepo, page_limit)
            .await?;
        debug!(project_id, count = paths.len(), "manifests found via tree listing");
        Ok(paths)
    }

    #[instrument(skip(self))]
    async fn get_file_content(
        &self,
        project_id: u64,
        path: &str,
        branch: &str,
    ) -> Result<Option<String>, GitLabError> {
        let url = self.api(&format!(
            "projects/{project_id}/repository/files/{}",
            encode_segment(path)
        ));
        let Some((json, _)) = self.get_json(&url, &[("ref", branch.to_string())]).await? else {
            return Ok(None);
        };

        let encoding = json
            .get("encoding")
            .and_then(|e| e.as_str())
            .unwrap_or_default();
        if encoding != "base64" {
            return Err(GitLabError::Encoding {
                path: path.to_string(),
                encoding: encoding.to_string(),
            });
        }

        let content = json
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default();
        let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = BASE64.decode(compact).map_err(|e| GitLabError::Decode {
            url: url.clone(),
            message: format!("invalid base64 content: {e}"),
        })?;
        let text = String::from_utf8(bytes).map_err(|e| GitLabError::Decode {
            url,
            message: format!("file content is not UTF-8: {e}"),
        })?;
        Ok(Some(text))
    }

    #[instrument(skip(self))]
    async fn is_project_allowed(&self, source_id: u64, dep_id: u64) -> Result<bool, GitLabError> {
        let url = self.api(&format!("projects/{dep_id}/job_token_scope/allowlist"));
        let params = [("per_page", "100".to_string())];
        let entries = self.get_paged(&url, &params, None).await?;
        Ok(entries
            .iter()
            .any(|p| p.get("id").and_then(|v| v.as_u64()) == Some(source_id)))
    }

    #[instrument(skip(self))]
    async fn allow_job_token_access(
        &self,
        dep_id: u64,
        source_id: u64,
    ) -> Result<(), GitLabError> {
        let url = self.api(&format!("projects/{dep_id}/job_token_scope/allowlist"));
        let body = serde_json::json!({ "target_project_id": source_id });
        let resp = self
            .execute(&url, || self.client.post(&url).json(&body))
            .await?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(GitLabError::NotFound(format!("project {dep_id}")));
        }
        if !status.is_success() {
            return Err(GitLabError::Status {
                status: status.as_u16(),
                url,
            });
        }
        Ok(())
    }
}
