//! Status stream reporters.
//!
//! Render folder snapshots from the manager's status stream for a
//! terminal. Output goes to **stderr** so stdout remains parseable for
//! scripts.

use std::io::Write;

use crate::models::FolderSnapshot;

/// Renders folder snapshots. Implementations write to stderr.
pub trait StatusReporter: Send + Sync {
    fn report(&self, snapshot: &FolderSnapshot);
}

/// Human-friendly lines: "/home/me/notes  indexing  1,234 / 5,000 files  24%".
pub struct StderrStatus;

impl StatusReporter for StderrStatus {
    fn report(&self, snapshot: &FolderSnapshot) {
        let line = format!("{}\n", human_line(snapshot));
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable status: one JSON object per line on stderr.
pub struct JsonStatus;

impl StatusReporter for JsonStatus {
    fn report(&self, snapshot: &FolderSnapshot) {
        let obj = serde_json::json!({
            "event": "status",
            "folder": snapshot,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoStatus;

impl StatusReporter for NoStatus {
    fn report(&self, _snapshot: &FolderSnapshot) {}
}

pub fn human_line(snapshot: &FolderSnapshot) -> String {
    let folder = snapshot.path.display();
    match snapshot.state.as_str() {
        "downloading_model" => format!(
            "{}  downloading {}  {:.0}%",
            folder,
            snapshot.model_id,
            snapshot.download_percent.unwrap_or(0.0)
        ),
        "indexing" | "scanning" => format!(
            "{}  {}  {} / {} files  {:.0}%",
            folder,
            snapshot.state,
            format_number(snapshot.progress.files_indexed + snapshot.progress.files_failed),
            format_number(snapshot.progress.files_total),
            snapshot.progress.percent
        ),
        "error" => match &snapshot.error {
            Some(err) => format!(
                "{}  error ({}){}  {}",
                folder,
                err.kind,
                if err.retryable { ", retryable" } else { "" },
                err.message
            ),
            None => format!("{}  error", folder),
        },
        "active" if snapshot.progress.files_failed > 0 => format!(
            "{}  active  {} files, {} failed",
            folder,
            format_number(snapshot.progress.files_indexed),
            format_number(snapshot.progress.files_failed)
        ),
        "active" => format!(
            "{}  active  {} files",
            folder,
            format_number(snapshot.progress.files_indexed)
        ),
        other => format!("{}  {}", folder, other),
    }
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" | "none" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> Box<dyn StatusReporter> {
        match self {
            ProgressMode::Off => Box::new(NoStatus),
            ProgressMode::Human => Box::new(StderrStatus),
            ProgressMode::Json => Box::new(JsonStatus),
        }
    }
}
