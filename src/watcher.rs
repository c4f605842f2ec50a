//! Filesystem watching for active folders.
//!
//! Events are debounced by `notify-debouncer-full` and reduced to a single
//! signal: "this folder changed". The folder's worker coalesces signals
//! into at most one follow-up incremental pass, and the pass itself works
//! out what changed from fingerprints.

use notify_debouncer_full::notify::event::ModifyKind;
use notify_debouncer_full::notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, DebouncedEvent, Debouncer, RecommendedCache};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::{IndexError, Result};
use crate::scan::{relative_path, ScanRules};

pub struct FolderWatcher {
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
}

impl FolderWatcher {
    /// Watch `root` recursively and notify `trigger` on relevant changes.
    pub fn start(
        root: &Path,
        rules: ScanRules,
        debounce: Duration,
        trigger: Arc<Notify>,
    ) -> Result<Self> {
        let root_buf: PathBuf = root.to_path_buf();
        let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    if events.iter().any(|e| is_relevant(&root_buf, &rules, e)) {
                        tracing::debug!(folder = %root_buf.display(), events = events.len(), "change detected");
                        trigger.notify_one();
                    }
                }
                Err(errors) => {
                    for error in errors {
                        tracing::warn!(folder = %root_buf.display(), error = %error, "watch error");
                    }
                }
            }
        })
        .map_err(|e| IndexError::io(format!("watch {}", root.display()), e))?;

        debouncer
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| IndexError::io(format!("watch {}", root.display()), e))?;
        tracing::debug!(folder = %root.display(), "watching");

        Ok(Self {
            _debouncer: debouncer,
        })
    }
}

/// Whether an event can change what a scan of `root` would index.
///
/// Creations and content edits count only for files the rules include.
/// Removals and renames also count for directories, whose paths never
/// match a file glob, unless the path is excluded.
pub fn is_relevant(root: &Path, rules: &ScanRules, event: &DebouncedEvent) -> bool {
    let structural = matches!(
        event.kind,
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
    );
    let content = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_));
    if !structural && !content {
        return false;
    }

    event.paths.iter().any(|path| {
        let Some(rel) = relative_path(root, path) else {
            return false;
        };
        if rel.is_empty() || rules.is_excluded(&rel) {
            return false;
        }
        structural || rules.matches(&rel)
    })
}
