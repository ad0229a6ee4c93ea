//! Finding transcripts that still need notes and enqueueing them.

use std::path::{Path, PathBuf};

use tracing::{info, warn};
use walkdir::WalkDir;

use super::notes::notes_path_for;
use crate::error::StoreError;
use crate::storage::TaskStore;

const TRANSCRIPT_EXTENSION: &str = "srt";

/// An input item ready to be enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredItem {
    pub source_locator: String,
    pub display_name: String,
    pub group_name: String,
}

impl DiscoveredItem {
    fn from_path(path: &Path) -> Option<Self> {
        let display_name = path.file_stem()?.to_string_lossy().into_owned();
        let group_name = path
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Some(Self {
            source_locator: path.to_string_lossy().into_owned(),
            display_name,
            group_name,
        })
    }
}

/// Counts from [`enqueue_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueSummary {
    pub added: usize,
    pub duplicates: usize,
}

/// Walks `folders` for `.srt` files without a notes file beside them.
///
/// Non-recursive scans only look at the folder's direct children. Missing
/// folders are logged and skipped. Results are sorted by path.
pub fn scan(folders: &[PathBuf], recursive: bool) -> Vec<DiscoveredItem> {
    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut items = Vec::new();

    for folder in folders {
        if !folder.is_dir() {
            warn!(folder = %folder.display(), "Folder not found, skipping");
            continue;
        }

        for entry in WalkDir::new(folder).max_depth(max_depth).sort_by_file_name() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file() || !is_transcript(path) {
                continue;
            }
            if notes_path_for(path).is_some_and(|notes| notes.exists()) {
                continue;
            }
            if let Some(item) = DiscoveredItem::from_path(path) {
                items.push(item);
            }
        }
    }

    items.sort_by(|a, b| a.source_locator.cmp(&b.source_locator));
    items.dedup_by(|a, b| a.source_locator == b.source_locator);
    items
}

fn is_transcript(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(TRANSCRIPT_EXTENSION))
}

/// Enqueues every item; items already in the store count as duplicates.
pub async fn enqueue_all(
    store: &TaskStore,
    items: &[DiscoveredItem],
) -> Result<EnqueueSummary, StoreError> {
    let mut summary = EnqueueSummary::default();
    for item in items {
        if store
            .enqueue(&item.source_locator, &item.display_name, &item.group_name)
            .await?
        {
            summary.added += 1;
        } else {
            summary.duplicates += 1;
        }
    }
    info!(
        added = summary.added,
        duplicates = summary.duplicates,
        "Enqueued discovered transcripts"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "1\n00:00:01,000 --> 00:00:02,000\nhello\n").unwrap();
    }

    #[test]
    fn test_scan_skips_finished_and_non_transcripts() {
        let dir = tempdir().unwrap();
        let course = dir.path().join("rust-course");
        touch(&course.join("01-intro.srt"));
        touch(&course.join("02-ownership.SRT"));
        touch(&course.join("03-done.srt"));
        std::fs::write(course.join("03-done_Notes.md"), "## notes").unwrap();
        std::fs::write(course.join("readme.txt"), "x").unwrap();

        let items = scan(&[course.clone()], false);
        let names: Vec<_> = items.iter().map(|i| i.display_name.as_str()).collect();
        assert_eq!(names, vec!["01-intro", "02-ownership"]);
        assert!(items.iter().all(|i| i.group_name == "rust-course"));
    }

    #[test]
    fn test_scan_recursion() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("top.srt"));
        touch(&dir.path().join("module-2").join("nested.srt"));

        let shallow = scan(&[dir.path().to_path_buf()], false);
        assert_eq!(shallow.len(), 1);

        let deep = scan(&[dir.path().to_path_buf()], true);
        assert_eq!(deep.len(), 2);
        let nested = deep.iter().find(|i| i.display_name == "nested").unwrap();
        assert_eq!(nested.group_name, "module-2");
    }

    #[test]
    fn test_scan_missing_folder() {
        assert!(scan(&[PathBuf::from("/definitely/not/here")], true).is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_all_counts_duplicates() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("a.srt"));
        touch(&dir.path().join("b.srt"));
        let store = TaskStore::open(dir.path().join("tasks.db")).await.unwrap();

        let items = scan(&[dir.path().to_path_buf()], false);
        let first = enqueue_all(&store, &items).await.unwrap();
        assert_eq!(first, EnqueueSummary { added: 2, duplicates: 0 });

        let second = enqueue_all(&store, &items).await.unwrap();
        assert_eq!(second, EnqueueSummary { added: 0, duplicates: 2 });
        assert_eq!(store.statistics().await.unwrap().total, 2);
    }
}
