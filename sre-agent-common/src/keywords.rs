// ABOUTME: loads operator-maintained keyword files (deny-list, auto-execute triggers).
// ABOUTME: swaps whole snapshots on reload so concurrent readers never see a partial list.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum KeywordListError {
    #[error("keyword file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read keyword file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Ordered, case-insensitive keywords. Matching is plain substring, so a keyword like
/// `rm` also matches inside `term`. That over-blocking is kept on purpose.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeywordList {
    entries: Vec<Entry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    original: String,
    folded: String,
}

impl KeywordList {
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| Entry {
                original: line.to_string(),
                folded: line.to_lowercase(),
            })
            .collect();
        Self { entries }
    }

    pub fn load(path: &Path) -> Result<Self, KeywordListError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(KeywordListError::NotFound(path.to_path_buf()))
            }
            Err(source) => Err(KeywordListError::Unreadable {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// First keyword, in file order, contained anywhere in `text`.
    pub fn first_match(&self, text: &str) -> Option<&str> {
        let folded = text.to_lowercase();
        self.entries
            .iter()
            .find(|entry| folded.contains(entry.folded.as_str()))
            .map(|entry| entry.original.as_str())
    }

    pub fn contains_match(&self, text: &str) -> bool {
        self.first_match(text).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A keyword list backed by a file that can be re-read at runtime.
#[derive(Debug)]
pub struct ReloadableKeywords {
    label: &'static str,
    path: Option<PathBuf>,
    current: RwLock<Arc<KeywordList>>,
}

impl ReloadableKeywords {
    /// Loads `path`, degrading to an empty list when it is missing or unreadable.
    pub fn open(path: impl Into<PathBuf>, label: &'static str) -> Self {
        let path = path.into();
        let list = load_or_empty(&path, label);
        Self {
            label,
            path: Some(path),
            current: RwLock::new(Arc::new(list)),
        }
    }

    /// A fixed list with no backing file; `reload` keeps it as is.
    pub fn fixed(list: KeywordList, label: &'static str) -> Self {
        Self {
            label,
            path: None,
            current: RwLock::new(Arc::new(list)),
        }
    }

    pub fn snapshot(&self) -> Arc<KeywordList> {
        let guard = self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Re-reads the backing file and swaps it in. Returns the number of keywords now active.
    pub fn reload(&self) -> usize {
        let Some(path) = &self.path else {
            return self.snapshot().len();
        };

        let next = Arc::new(load_or_empty(path, self.label));
        let count = next.len();
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = next;
        tracing::info!(list = self.label, keywords = count, "keyword list reloaded");
        count
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

fn load_or_empty(path: &Path, label: &'static str) -> KeywordList {
    match KeywordList::load(path) {
        Ok(list) => list,
        Err(err) => {
            tracing::warn!(
                list = label,
                error = %err,
                "keyword list unavailable; continuing with an empty list"
            );
            KeywordList::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_skips_blank_lines_and_trims() {
        let list = KeywordList::parse("  rm \n\n mkfs\n\t\n");
        assert_eq!(list.len(), 2);
        assert_eq!(list.first_match("mkfs.ext4 /dev/sdb"), Some("mkfs"));
    }

    #[test]
    fn first_match_is_case_insensitive_and_ordered() {
        let list = KeywordList::parse("shutdown\nRM\n");
        assert_eq!(list.first_match("rm -rf /tmp/x && SHUTDOWN"), Some("shutdown"));
        assert_eq!(list.first_match("Rm file"), Some("RM"));
    }

    #[test]
    fn substring_matching_over_blocks_compound_words() {
        let list = KeywordList::parse("rm\n");
        assert_eq!(list.first_match("echo $TERM"), Some("rm"));
    }

    #[test]
    fn missing_file_is_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = KeywordList::load(&dir.path().join("absent.txt")).unwrap_err();
        assert!(matches!(err, KeywordListError::NotFound(_)));
    }

    #[test]
    fn open_degrades_to_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        let keywords = ReloadableKeywords::open(dir.path().join("absent.txt"), "deny-list");
        assert!(keywords.snapshot().is_empty());
    }

    #[test]
    fn reload_swaps_snapshot_without_touching_held_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deny.txt");
        std::fs::write(&path, "rm\n").unwrap();

        let keywords = ReloadableKeywords::open(&path, "deny-list");
        let before = keywords.snapshot();

        std::fs::write(&path, "rm\nshutdown\n").unwrap();
        assert_eq!(keywords.reload(), 2);

        assert_eq!(before.len(), 1);
        assert_eq!(keywords.snapshot().len(), 2);
    }
}
