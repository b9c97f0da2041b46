use std::path::Path;

use glob::{MatchOptions, Pattern};
use log::warn;

/// Compiled exclude patterns of a task.
///
/// Patterns match against the full path and, for bare patterns like
/// `*.tmp`, against the file name alone. Invalid patterns are logged and
/// dropped rather than failing the scan.
#[derive(Clone, Debug, Default)]
pub struct ExcludeSet {
    patterns: Vec<Pattern>,
}

impl ExcludeSet {
    pub fn compile(raw: &[String]) -> Self {
        let patterns = raw
            .iter()
            .filter_map(|p| match Pattern::new(p) {
                Ok(pat) => Some(pat),
                Err(e) => {
                    warn!("ignoring invalid exclude pattern {p:?}: {e}");
                    None
                }
            })
            .collect();
        ExcludeSet { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, path: &Path) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let opts = MatchOptions {
            require_literal_separator: false,
            ..Default::default()
        };
        let name = path.file_name().map(|n| n.to_string_lossy());
        self.patterns.iter().any(|pat| {
            pat.matches_path_with(path, opts)
                || name.as_deref().is_some_and(|n| pat.matches_with(n, opts))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_name_and_path() {
        let ex = ExcludeSet::compile(&["*.tmp".into(), "/var/cache/**".into()]);
        assert!(ex.matches(Path::new("/data/a/b/junk.tmp")));
        assert!(ex.matches(Path::new("/var/cache/apt/archives/x.deb")));
        assert!(!ex.matches(Path::new("/data/a/b/keep.txt")));
    }

    #[test]
    fn invalid_patterns_are_dropped() {
        let ex = ExcludeSet::compile(&["[".into(), "*.log".into()]);
        assert!(ex.matches(Path::new("/x/y.log")));
        assert!(!ex.matches(Path::new("/x/y.txt")));
    }
}
