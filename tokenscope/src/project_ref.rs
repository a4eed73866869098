use percent_encoding::percent_decode_str;

/// The GitLab instance dependency references are matched against.
///
/// Extractors compare URL authorities to `authority()`, which is the base URL
/// with the scheme stripped (`https://gitlab.example.com` becomes
/// `gitlab.example.com`, ports preserved).
#[derive(Debug, Clone)]
pub struct HostContext {
    base_url: String,
    authority: String,
}

impl HostContext {
    pub fn new(base_url: &str) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        let without_scheme = base_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&base_url);
        let authority = without_scheme
            .split('/')
            .next()
            .unwrap_or(without_scheme)
            .to_string();
        Self {
            base_url,
            authority,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }
}

/// A dependency reference as produced by an extractor, before resolution.
///
/// `Path` values are already normalized project paths; `Id` values are
/// numeric project IDs that still need a metadata lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RawDependency {
    Path(String),
    Id(u64),
}

/// Normalize a raw project path fragment into `namespace/path` form.
///
/// Percent-decodes, cuts GitLab's `/-/...` archive markers, trims slashes and
/// strips a trailing `.git`. Returns `None` when nothing project-shaped
/// remains.
pub fn normalize_path(raw: &str) -> Option<String> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| raw.to_string());

    let cut = match decoded.find("/-/") {
        Some(pos) => &decoded[..pos],
        None => decoded.as_str(),
    };

    let trimmed = cut.trim_matches('/');
    let stripped = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    let path = stripped.trim_matches('/');

    if path.is_empty() || !path.contains('/') {
        return None;
    }
    Some(path.to_string())
}

/// The path portion of `url` when its authority matches `host`, with any
/// userinfo ignored. `git@gitlab.example.com` and `gitlab.example.com` are
/// the same authority.
fn host_path<'a>(url: &'a str, host: &HostContext) -> Option<&'a str> {
    let rest = url.split_once("://").map(|(_, r)| r)?;
    let (authority, path) = rest.split_once('/')?;
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    if authority != host.authority() {
        return None;
    }
    Some(path)
}

/// Parse an scp-like SSH remote (`git@host:namespace/project.git`).
pub fn parse_scp_like(url: &str, host: &HostContext) -> Option<String> {
    if url.contains("://") {
        return None;
    }
    let (user_host, path) = url.split_once(':')?;
    let (_, authority) = user_host.split_once('@')?;
    if authority != host.authority() {
        return None;
    }
    normalize_path(path)
}

/// Parse a direct project URL (`https://host/namespace/project.git`,
/// `ssh://git@host/namespace/project`, archive download links). API routes
/// are not project paths and are rejected here.
pub fn parse_remote_url(url: &str, host: &HostContext) -> Option<String> {
    let path = host_path(url, host)?;
    if path.starts_with("api/v4/") {
        return None;
    }
    normalize_path(path)
}

/// Parse a project reference embedded in an `/api/v4/projects/<ref>/...`
/// URL. Numeric references need resolution; everything else is treated as a
/// percent-encoded project path.
pub fn parse_api_project_ref(url: &str, host: &HostContext) -> Option<RawDependency> {
    let path = host_path(url, host)?;
    let rest = path.strip_prefix("api/v4/projects/")?;
    let reference = rest.split('/').next().filter(|r| !r.is_empty())?;

    if reference.chars().all(|c| c.is_ascii_digit()) {
        reference.parse().ok().map(RawDependency::Id)
    } else {
        normalize_path(reference).map(RawDependency::Path)
    }
}

/// Detect a group-level package endpoint
/// (`/api/v4/group(s)/<id>/-/packages/...`). These cannot be mapped to a
/// single project; the returned endpoint string identifies the group registry
/// for once-per-endpoint diagnostics.
pub fn group_packages_endpoint(url: &str, host: &HostContext) -> Option<String> {
    let path = host_path(url, host)?;
    if !(path.starts_with("api/v4/groups/") || path.starts_with("api/v4/group/")) {
        return None;
    }
    let marker = path.find("/-/packages")?;
    Some(path[..marker + "/-/packages".len()].to_string())
}
