//! Disaster-recovery kit: what someone needs to find and open a drive's
//! repository without this daemon. Never contains the passphrase.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::models::TrustedDrive;
use super::persist::{write_atomic, write_json_atomic};

pub const KIT_JSON: &str = "recovery.json";
pub const KIT_TEXT: &str = "RECOVERY.txt";

#[derive(Debug, Serialize)]
pub struct RecoveryKit {
    pub format_version: u32,
    pub drive_id: String,
    pub label: String,
    pub repository_id: String,
    pub repository_path: PathBuf,
    pub media_uuid: Option<String>,
    pub created_at: Option<String>,
    pub exported_at: String,
    pub engine: &'static str,
    pub instructions: Vec<String>,
}

fn rfc3339(epoch: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(epoch, 0).map(|t| t.to_rfc3339())
}

impl RecoveryKit {
    pub fn for_drive(drive: &TrustedDrive) -> Self {
        let repo = Path::new("<mount point>").join(&drive.repository_path);
        let instructions = vec![
            "Install restic (https://restic.net).".to_string(),
            format!("Connect the drive labelled \"{}\" and mount it.", drive.label),
            format!("List snapshots: restic -r \"{}\" snapshots", repo.display()),
            format!(
                "Restore the latest snapshot: restic -r \"{}\" restore latest --target <directory>",
                repo.display()
            ),
            "restic asks for the repository passphrase. It is not stored in this kit.".to_string(),
        ];

        Self {
            format_version: 1,
            drive_id: drive.drive_id.clone(),
            label: drive.label.clone(),
            repository_id: drive.repository_id.clone(),
            repository_path: drive.repository_path.clone(),
            media_uuid: drive.media_uuid.clone(),
            created_at: rfc3339(drive.created_epoch),
            exported_at: Utc::now().to_rfc3339(),
            engine: "restic",
            instructions,
        }
    }

    fn to_text(&self) -> String {
        let mut text = String::new();
        text.push_str("KEEPD RECOVERY KIT\n==================\n\n");
        text.push_str(&format!("Drive label:     {}\n", self.label));
        text.push_str(&format!("Drive id:        {}\n", self.drive_id));
        text.push_str(&format!("Repository id:   {}\n", self.repository_id));
        text.push_str(&format!("Repository path: {}\n", self.repository_path.display()));
        if let Some(uuid) = &self.media_uuid {
            text.push_str(&format!("Filesystem UUID: {}\n", uuid));
        }
        if let Some(created) = &self.created_at {
            text.push_str(&format!("Set up:          {}\n", created));
        }
        text.push_str(&format!("Exported:        {}\n\n", self.exported_at));
        for (i, step) in self.instructions.iter().enumerate() {
            text.push_str(&format!("{}. {}\n", i + 1, step));
        }
        text
    }

    /// Write `recovery.json` and `RECOVERY.txt` into `destination`.
    pub fn write(&self, destination: &Path) -> Result<Vec<PathBuf>> {
        let json_path = destination.join(KIT_JSON);
        let text_path = destination.join(KIT_TEXT);
        write_json_atomic(&json_path, self)?;
        write_atomic(&text_path, self.to_text().as_bytes())?;
        Ok(vec![json_path, text_path])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive() -> TrustedDrive {
        TrustedDrive {
            drive_id: "d1".into(),
            label: "Travel".into(),
            repository_id: "repo-123".into(),
            repository_path: PathBuf::from(".keepd/repo"),
            media_uuid: Some("1234-ABCD".into()),
            backup_sources: Vec::new(),
            remember_passphrase: true,
            paranoid_mode: false,
            created_epoch: 1_700_000_000,
            last_seen_epoch: None,
            last_backup_epoch: None,
            last_snapshot_id: None,
        }
    }

    #[test]
    fn writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let files = RecoveryKit::for_drive(&drive()).write(dir.path()).unwrap();
        assert_eq!(files.len(), 2);

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(KIT_JSON)).unwrap()).unwrap();
        assert_eq!(json["repository_id"], "repo-123");
        assert_eq!(json["created_at"], "2023-11-14T22:13:20+00:00");

        let text = std::fs::read_to_string(dir.path().join(KIT_TEXT)).unwrap();
        assert!(text.contains("Travel"));
        assert!(text.contains("restic -r"));
    }
}
