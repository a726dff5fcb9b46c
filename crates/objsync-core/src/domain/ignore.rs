//! Ignore rules
//!
//! A path or object name is ignored when any of its components equals one of
//! the configured names. The defaults cover package-manager and VCS
//! directories. Partially downloaded files are always ignored.

use std::path::{Component, Path};

/// Directory names ignored by default
pub const DEFAULT_IGNORED: &[&str] = &["node_modules", ".git", ".svn", ".hg"];

/// Suffix of the temporary file a download is streamed into before the rename
pub const PARTIAL_DOWNLOAD_SUFFIX: &str = ".objsync-part";

/// Set of component names excluded from synchronization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoreRules {
    names: Vec<String>,
}

impl IgnoreRules {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Rules that ignore nothing
    pub fn none() -> Self {
        Self { names: Vec::new() }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Check a normalized, `/`-separated object name
    pub fn is_ignored_name(&self, name: &str) -> bool {
        name.ends_with(PARTIAL_DOWNLOAD_SUFFIX)
            || name
                .split('/')
                .any(|segment| self.names.iter().any(|n| n == segment))
    }

    /// Check a local path (relative or absolute)
    pub fn is_ignored_path(&self, path: &Path) -> bool {
        let partial = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(PARTIAL_DOWNLOAD_SUFFIX));
        partial
            || path.components().any(|c| match c {
                Component::Normal(s) => self.names.iter().any(|n| s == n.as_str()),
                _ => false,
            })
    }
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self::new(DEFAULT_IGNORED.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules() {
        let rules = IgnoreRules::default();
        assert!(rules.is_ignored_name("node_modules/pkg/index.js"));
        assert!(rules.is_ignored_name("project/.git/HEAD"));
        assert!(!rules.is_ignored_name("docs/readme.md"));
    }

    #[test]
    fn test_component_match_only() {
        let rules = IgnoreRules::default();
        assert!(!rules.is_ignored_name("my_node_modules/file"));
        assert!(!rules.is_ignored_name("docs/.gitignore"));
    }

    #[test]
    fn test_paths() {
        let rules = IgnoreRules::default();
        assert!(rules.is_ignored_path(Path::new("/root/app/node_modules/x.js")));
        assert!(!rules.is_ignored_path(Path::new("/root/app/src/x.js")));
    }

    #[test]
    fn test_partial_downloads_always_ignored() {
        let rules = IgnoreRules::none();
        assert!(rules.is_ignored_path(Path::new("/root/docs/a.pdf.objsync-part")));
        assert!(rules.is_ignored_name("docs/a.pdf.objsync-part"));
        assert!(!rules.is_ignored_path(Path::new("/root/docs/a.pdf")));
    }

    #[test]
    fn test_none_ignores_nothing() {
        let rules = IgnoreRules::none();
        assert!(!rules.is_ignored_name("node_modules/x"));
    }
}
