use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::IndexingConfig;
use crate::error::{IndexError, Result};
use crate::fingerprint;

/// A candidate document found while walking a folder.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedFile {
    pub abs_path: PathBuf,
    /// Path relative to the folder root, `/`-separated.
    pub rel_path: String,
    pub size: u64,
    pub mtime_ms: i64,
}

/// Result of walking one folder.
#[derive(Debug, Clone, Default)]
pub struct FolderScan {
    /// Matching files, sorted by relative path.
    pub files: Vec<ScannedFile>,
    /// Relative paths of entries that could not be read this pass. Anything
    /// indexed at or below one of them is left alone rather than treated as
    /// deleted.
    pub unreadable: Vec<String>,
}

impl FolderScan {
    /// Whether `rel_path` is, or lies under, an entry that failed to read.
    pub fn is_unreadable(&self, rel_path: &str) -> bool {
        self.unreadable.iter().any(|u| {
            rel_path == u
                || (rel_path.len() > u.len()
                    && rel_path.starts_with(u.as_str())
                    && rel_path.as_bytes()[u.len()] == b'/')
        })
    }
}

/// Compiled include/exclude rules for one folder.
#[derive(Debug, Clone)]
pub struct ScanRules {
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
    max_file_bytes: u64,
}

impl ScanRules {
    pub fn from_config(config: &IndexingConfig) -> Result<Self> {
        let mut excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        excludes.extend(config.exclude_globs.iter().cloned());

        Ok(Self {
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
            follow_symlinks: config.follow_symlinks,
            max_file_bytes: config.max_file_bytes,
        })
    }

    /// Whether a relative path would be picked up by a scan.
    pub fn matches(&self, rel_path: &str) -> bool {
        !self.exclude.is_match(rel_path) && self.include.is_match(rel_path)
    }

    pub fn is_excluded(&self, rel_path: &str) -> bool {
        self.exclude.is_match(rel_path)
    }
}

/// Walk `root` and return every matching file, sorted by relative path.
///
/// Files that vanish between listing and stat are skipped. Entries that
/// fail for any other reason are listed in [`FolderScan::unreadable`].
pub fn scan_folder(root: &Path, rules: &ScanRules) -> Result<FolderScan> {
    if !root.is_dir() {
        return Err(IndexError::io(
            format!("scan {}", root.display()),
            "folder is missing or not a directory",
        ));
    }

    let mut scan = FolderScan::default();
    let walker = WalkDir::new(root).follow_links(rules.follow_symlinks);
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                if e.depth() == 0 {
                    return Err(IndexError::io(format!("scan {}", root.display()), e));
                }
                tracing::warn!(error = %e, "skipping unreadable entry");
                if let Some(rel_path) = e.path().and_then(|p| relative_path(root, p)) {
                    scan.unreadable.push(rel_path);
                }
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let Some(rel_path) = relative_path(root, path) else {
            continue;
        };
        if !rules.matches(&rel_path) {
            continue;
        }

        let (size, mtime_ms) = match fingerprint::stat(path) {
            Ok(stat) => stat,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                tracing::warn!(path = %rel_path, error = %e, "cannot stat file");
                scan.unreadable.push(rel_path);
                continue;
            }
        };
        if size > rules.max_file_bytes {
            tracing::debug!(path = %rel_path, size, "skipping oversized file");
            continue;
        }

        scan.files.push(ScannedFile {
            abs_path: path.to_path_buf(),
            rel_path,
            size,
            mtime_ms,
        });
    }

    // Sort for deterministic ordering
    scan.files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(scan)
}

/// `/`-separated path of `path` relative to `root`.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| IndexError::InvalidQuery(format!("bad glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| IndexError::InvalidQuery(format!("bad glob set: {}", e)))
}
