use tracing::debug;

use super::ManifestExtractor;
use crate::project_ref::{HostContext, RawDependency, normalize_path};

/// Extracts GitLab-hosted modules from a `go.mod` `require ( ... )` block.
///
/// Pure text scanning: the first whitespace-delimited token of each entry
/// line is kept when it mentions the configured host. Nested or malformed
/// blocks are not validated; lines that do not parse are skipped.
pub struct GoModExtractor;

impl ManifestExtractor for GoModExtractor {
    fn extract(&self, content: &str, host: &HostContext) -> Vec<RawDependency> {
        let authority = host.authority();
        let mut deps = Vec::new();
        let mut in_block = false;

        for line in content.lines() {
            let trimmed = line.trim();
            if !in_block {
                if trimmed.starts_with("require") && trimmed.contains('(') {
                    in_block = true;
                }
                continue;
            }
            if trimmed.starts_with(')') {
                in_block = false;
                continue;
            }

            let Some(token) = trimmed.split_whitespace().next() else {
                continue;
            };
            let Some(pos) = token.find(authority) else {
                continue;
            };
            let remainder = &token[pos + authority.len()..];
            match normalize_path(remainder) {
                Some(path) => deps.push(RawDependency::Path(path)),
                None => debug!(token, "module path has no project component"),
            }
        }

        deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(content: &str) -> Vec<RawDependency> {
        GoModExtractor.extract(content, &HostContext::new("https://host.example"))
    }

    #[test]
    fn require_block_entry_matching_host() {
        let deps = extract("require (\n\thost.example/group/dep v1.0.0\n)\n");
        assert_eq!(deps, vec![RawDependency::Path("group/dep".into())]);
    }

    #[test]
    fn foreign_modules_are_ignored() {
        let content = "require (\n\
                       \tgithub.com/stretchr/testify v1.9.0\n\
                       \thost.example/group/dep v1.2.3\n\
                       \tgolang.org/x/sync v0.7.0\n\
                       )\n";
        let deps = extract(content);
        assert_eq!(deps, vec![RawDependency::Path("group/dep".into())]);
    }

    #[test]
    fn lines_outside_require_block_are_ignored() {
        let content = "module host.example/group/self\n\n\
                       go 1.22\n\n\
                       require (\n\
                       \thost.example/group/dep v1.0.0\n\
                       )\n\n\
                       replace host.example/group/other => ../other\n";
        let deps = extract(content);
        assert_eq!(deps, vec![RawDependency::Path("group/dep".into())]);
    }

    #[test]
    fn nested_subgroup_modules() {
        let deps = extract("require (\n\thost.example/group/sub/dep v0.3.0 // indirect\n)\n");
        assert_eq!(deps, vec![RawDependency::Path("group/sub/dep".into())]);
    }

    #[test]
    fn multiple_entries_in_one_block() {
        let content = "require (\n\
                       \thost.example/g/a v1.0.0\n\
                       \thost.example/g/b v2.0.0\n\
                       )\n";
        let deps = extract(content);
        assert_eq!(
            deps,
            vec![
                RawDependency::Path("g/a".into()),
                RawDependency::Path("g/b".into()),
            ]
        );
    }

    #[test]
    fn file_without_require_block_yields_nothing() {
        assert!(extract("module host.example/group/self\n\ngo 1.22\n").is_empty());
    }

    #[test]
    fn empty_and_blank_lines_are_skipped() {
        let deps = extract("require (\n\n\t\n\thost.example/g/a v1.0.0\n)\n");
        assert_eq!(deps, vec![RawDependency::Path("g/a".into())]);
    }

    #[test]
    fn unterminated_block_still_extracts_entries() {
        // Permissive by design: a missing closing paren does not discard
        // what was already matched.
        let deps = extract("require (\n\thost.example/g/a v1.0.0\n");
        assert_eq!(deps, vec![RawDependency::Path("g/a".into())]);
    }
}
