use std::collections::HashSet;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use super::ManifestExtractor;
use crate::project_ref::{HostContext, RawDependency};

/// Extracts GitLab package-registry dependencies from `package-lock.json`.
///
/// The nested `dependencies` tree is walked iteratively with an explicit
/// stack; every node's `resolved` URL is matched against the instance's
/// project package route and captured numeric IDs are queued for resolution.
pub struct NpmLockExtractor;

impl ManifestExtractor for NpmLockExtractor {
    fn extract(&self, content: &str, host: &HostContext) -> Vec<RawDependency> {
        let json: Value = match serde_json::from_str(content) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to parse package-lock.json");
                return vec![];
            }
        };

        let pattern = format!(
            r"{}/api/v4/projects/(\d+)/packages",
            regex::escape(host.authority())
        );
        let resolved_re = match Regex::new(&pattern) {
            Ok(re) => re,
            Err(e) => {
                warn!(error = %e, "failed to build resolved-URL pattern");
                return vec![];
            }
        };

        let mut deps = Vec::new();
        let mut seen: HashSet<u64> = HashSet::new();
        let mut stack: Vec<&Value> = Vec::new();
        if let Some(root) = json.get("dependencies") {
            stack.push(root);
        }

        while let Some(node) = stack.pop() {
            let Some(entries) = node.as_object() else {
                continue;
            };
            for entry in entries.values() {
                if let Some(resolved) = entry.get("resolved").and_then(|r| r.as_str())
                    && let Some(captures) = resolved_re.captures(resolved)
                    && let Ok(id) = captures[1].parse::<u64>()
                    && seen.insert(id)
                {
                    deps.push(RawDependency::Id(id));
                }
                if let Some(nested) = entry.get("dependencies") {
                    stack.push(nested);
                }
            }
        }

        deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(content: &str) -> Vec<RawDependency> {
        NpmLockExtractor.extract(content, &HostContext::new("https://gitlab.example.com"))
    }

    #[test]
    fn registry_resolved_url_is_captured() {
        let content = r#"{
            "dependencies": {
                "@acme/widgets": {
                    "version": "1.2.0",
                    "resolved": "https://gitlab.example.com/api/v4/projects/42/packages/npm/@acme/widgets/-/@acme/widgets-1.2.0.tgz"
                }
            }
        }"#;
        assert_eq!(extract(content), vec![RawDependency::Id(42)]);
    }

    #[test]
    fn public_registry_urls_are_ignored() {
        let content = r#"{
            "dependencies": {
                "lodash": {
                    "version": "4.17.21",
                    "resolved": "https://registry.npmjs.org/lodash/-/lodash-4.17.21.tgz"
                }
            }
        }"#;
        assert!(extract(content).is_empty());
    }

    #[test]
    fn nested_dependencies_are_walked() {
        let content = r#"{
            "dependencies": {
                "outer": {
                    "version": "1.0.0",
                    "resolved": "https://registry.npmjs.org/outer/-/outer-1.0.0.tgz",
                    "dependencies": {
                        "inner": {
                            "version": "2.0.0",
                            "resolved": "https://gitlab.example.com/api/v4/projects/7/packages/npm/inner/-/inner-2.0.0.tgz",
                            "dependencies": {
                                "leaf": {
                                    "version": "3.0.0",
                                    "resolved": "https://gitlab.example.com/api/v4/projects/8/packages/npm/leaf/-/leaf-3.0.0.tgz"
                                }
                            }
                        }
                    }
                }
            }
        }"#;
        let mut ids = extract(content);
        ids.sort_by_key(|d| match d {
            RawDependency::Id(id) => *id,
            RawDependency::Path(_) => 0,
        });
        assert_eq!(ids, vec![RawDependency::Id(7), RawDependency::Id(8)]);
    }

    #[test]
    fn repeated_project_is_reported_once() {
        let content = r#"{
            "dependencies": {
                "@acme/widgets": {
                    "resolved": "https://gitlab.example.com/api/v4/projects/42/packages/npm/@acme/widgets/-/widgets-1.0.0.tgz"
                },
                "@acme/gadgets": {
                    "resolved": "https://gitlab.example.com/api/v4/projects/42/packages/npm/@acme/gadgets/-/gadgets-2.0.0.tgz"
                }
            }
        }"#;
        assert_eq!(extract(content), vec![RawDependency::Id(42)]);
    }

    #[test]
    fn entries_without_resolved_are_skipped() {
        let content = r#"{
            "dependencies": {
                "local-link": {"version": "file:../local-link"}
            }
        }"#;
        assert!(extract(content).is_empty());
    }

    #[test]
    fn missing_dependencies_tree_yields_nothing() {
        assert!(extract(r#"{"name": "app", "lockfileVersion": 3, "packages": {}}"#).is_empty());
    }

    #[test]
    fn malformed_json_yields_nothing() {
        assert!(extract("not json").is_empty());
    }
}
