//! Parser for the backup engine's `--json` line protocol.
//!
//! Every line is classified as progress, summary, error or ignored. Anything
//! unrecognized, including non-JSON noise, is ignored rather than rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::models::BackupProgress;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSummary {
    pub snapshot_id: Option<String>,
    pub files_new: u64,
    pub files_changed: u64,
    pub files_processed: u64,
    pub data_added: u64,
    /// Snapshot written but some files could not be read
    #[serde(default)]
    pub partial: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineLine {
    Progress(BackupProgress),
    Summary(BackupSummary),
    Error(String),
    Ignored,
}

#[derive(Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
enum RawLine {
    Status(RawStatus),
    Summary(RawSummary),
    Error(RawError),
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct RawStatus {
    #[serde(default)]
    percent_done: f64,
    #[serde(default)]
    total_files: u64,
    #[serde(default)]
    files_done: u64,
    #[serde(default)]
    total_bytes: u64,
    #[serde(default)]
    bytes_done: u64,
    #[serde(default)]
    current_files: Vec<String>,
}

#[derive(Deserialize)]
struct RawSummary {
    #[serde(default)]
    snapshot_id: Option<String>,
    #[serde(default)]
    files_new: u64,
    #[serde(default)]
    files_changed: u64,
    #[serde(default)]
    total_files_processed: u64,
    #[serde(default)]
    data_added: u64,
}

#[derive(Deserialize)]
struct RawError {
    #[serde(default)]
    error: Value,
    #[serde(default)]
    item: Option<String>,
}

pub fn parse_line(line: &str) -> EngineLine {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return EngineLine::Ignored;
    }
    let Ok(raw) = serde_json::from_str::<RawLine>(trimmed) else {
        return EngineLine::Ignored;
    };

    match raw {
        RawLine::Status(s) => {
            let percent_done = if s.percent_done.is_finite() {
                s.percent_done.clamp(0.0, 1.0)
            } else {
                0.0
            };
            EngineLine::Progress(BackupProgress {
                percent_done,
                files_done: s.files_done,
                total_files: s.total_files,
                bytes_done: s.bytes_done,
                total_bytes: s.total_bytes,
                message: s.current_files.into_iter().next(),
            })
        }
        RawLine::Summary(s) => EngineLine::Summary(BackupSummary {
            snapshot_id: s.snapshot_id.filter(|id| !id.is_empty()),
            files_new: s.files_new,
            files_changed: s.files_changed,
            files_processed: s.total_files_processed,
            data_added: s.data_added,
            partial: false,
        }),
        RawLine::Error(e) => {
            let message = match &e.error {
                Value::Object(map) => map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
                Value::String(s) => s.clone(),
                _ => "unknown error".to_string(),
            };
            match e.item {
                Some(item) if !item.is_empty() => EngineLine::Error(format!("{}: {}", item, message)),
                _ => EngineLine::Error(message),
            }
        }
        RawLine::Other => EngineLine::Ignored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_becomes_progress() {
        let line = r#"{"message_type":"status","seconds_elapsed":2,"percent_done":0.25,"total_files":8,"files_done":2,"total_bytes":4096,"bytes_done":1024,"current_files":["/home/u/Documents/a.txt"]}"#;
        match parse_line(line) {
            EngineLine::Progress(p) => {
                assert_eq!(p.percent_done, 0.25);
                assert_eq!(p.files_done, 2);
                assert_eq!(p.total_bytes, 4096);
                assert_eq!(p.message.as_deref(), Some("/home/u/Documents/a.txt"));
            }
            other => panic!("expected progress, got {:?}", other),
        }
    }

    #[test]
    fn percent_is_clamped() {
        let line = r#"{"message_type":"status","percent_done":1.7}"#;
        assert!(matches!(parse_line(line), EngineLine::Progress(p) if p.percent_done == 1.0));
        let line = r#"{"message_type":"status","percent_done":-0.5}"#;
        assert!(matches!(parse_line(line), EngineLine::Progress(p) if p.percent_done == 0.0));
    }

    #[test]
    fn summary_line() {
        let line = r#"{"message_type":"summary","files_new":3,"files_changed":1,"files_unmodified":0,"data_added":2048,"total_files_processed":4,"snapshot_id":"1a2b3c"}"#;
        let EngineLine::Summary(s) = parse_line(line) else {
            panic!("expected summary");
        };
        assert_eq!(s.snapshot_id.as_deref(), Some("1a2b3c"));
        assert_eq!(s.files_processed, 4);
        assert_eq!(s.data_added, 2048);
    }

    #[test]
    fn error_line_with_item() {
        let line = r#"{"message_type":"error","error":{"message":"permission denied"},"during":"archival","item":"/root/x"}"#;
        assert_eq!(
            parse_line(line),
            EngineLine::Error("/root/x: permission denied".into())
        );
    }

    #[test]
    fn noise_is_ignored() {
        assert_eq!(parse_line(""), EngineLine::Ignored);
        assert_eq!(parse_line("repository 1234 opened"), EngineLine::Ignored);
        assert_eq!(parse_line("{broken json"), EngineLine::Ignored);
        assert_eq!(
            parse_line(r#"{"message_type":"verbose_status","action":"new"}"#),
            EngineLine::Ignored
        );
        assert_eq!(parse_line(r#"{"no_type":1}"#), EngineLine::Ignored);
    }
}
