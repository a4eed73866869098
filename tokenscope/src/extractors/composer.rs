use std::collections::HashSet;

use serde_json::Value;
use tracing::{debug, warn};

use super::ManifestExtractor;
use crate::project_ref::{
    HostContext, RawDependency, group_packages_endpoint, parse_api_project_ref, parse_remote_url,
    parse_scp_like,
};

/// Extracts repository entries from `composer.json`.
///
/// Only the `repositories` section is inspected: package names say nothing
/// about where a package is hosted, but a VCS repository URL on the target
/// host is a project reference.
pub struct ComposerManifestExtractor;

impl ManifestExtractor for ComposerManifestExtractor {
    fn extract(&self, content: &str, host: &HostContext) -> Vec<RawDependency> {
        let json: Value = match serde_json::from_str(content) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to parse composer.json");
                return vec![];
            }
        };

        let Some(repositories) = json.get("repositories") else {
            return vec![];
        };
        let entries: Vec<&Value> = match repositories {
            Value::Object(map) => map.values().collect(),
            Value::Array(list) => list.iter().collect(),
            _ => return vec![],
        };

        let mut deps = Vec::new();
        for entry in entries {
            let Some(url) = entry.get("url").and_then(|u| u.as_str()) else {
                continue;
            };
            match parse_scp_like(url, host).or_else(|| parse_remote_url(url, host)) {
                Some(path) => deps.push(RawDependency::Path(path)),
                None => debug!(url, "repository is not on the target host, skipping"),
            }
        }
        deps
    }
}

/// Extracts locked packages from `composer.lock`.
///
/// Walks `packages` and `packages-dev`; for each package the `source.url`
/// and `dist.url` are tried in order against three strategies: a direct
/// project URL, a group-level package endpoint (unsupported, warned once per
/// endpoint), and an `/api/v4/projects/<ref>/...` reference.
pub struct ComposerLockExtractor;

fn package_urls(package: &Value) -> impl Iterator<Item = &str> {
    ["source", "dist"].into_iter().filter_map(|section| {
        package
            .get(section)
            .and_then(|s| s.get("url"))
            .and_then(|u| u.as_str())
    })
}

impl ManifestExtractor for ComposerLockExtractor {
    fn extract(&self, content: &str, host: &HostContext) -> Vec<RawDependency> {
        let json: Value = match serde_json::from_str(content) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to parse composer.lock");
                return vec![];
            }
        };

        let mut deps = Vec::new();
        let mut warned_endpoints: HashSet<String> = HashSet::new();

        for section in ["packages", "packages-dev"] {
            let Some(packages) = json.get(section).and_then(|p| p.as_array()) else {
                continue;
            };
            for package in packages {
                let name = package
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or("<unnamed>");

                for url in package_urls(package) {
                    if let Some(path) = parse_scp_like(url, host).or_else(|| parse_remote_url(url, host)) {
                        deps.push(RawDependency::Path(path));
                        break;
                    }
                    if let Some(endpoint) = group_packages_endpoint(url, host) {
                        if warned_endpoints.insert(endpoint.clone()) {
                            warn!(
                                endpoint = %endpoint,
                                "group-level Composer registries are not supported; grant access to their projects manually"
                            );
                        }
                        continue;
                    }
                    if let Some(reference) = parse_api_project_ref(url, host) {
                        deps.push(reference);
                        break;
                    }
                    debug!(package = name, url, "package URL is not on the target host");
                }
            }
        }
        deps
    }
}
