//! Directory-backed tape emulation.
//!
//! Stands in for the hardware driver in development and tests: archives are
//! copied into a directory in write order, the label lives in a small JSON
//! file at its root. Positions are cumulative byte offsets, like blocks on
//! a real tape.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Datelike, Utc};
use log::info;
use parking_lot::Mutex;

use super::{TapeDrive, TapeError, TapeLabel, TapePosition};

const LABEL_FILE: &str = "tape_label.json";

pub struct DirDrive {
    root: PathBuf,
    state: Mutex<DirState>,
}

struct DirState {
    sequence: u64,
    bytes_written: u64,
}

impl DirDrive {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, TapeError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        // Resume the position from whatever is already "on tape".
        let mut sequence = 0;
        let mut bytes_written = 0;
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy() == LABEL_FILE {
                continue;
            }
            sequence += 1;
            bytes_written += entry.metadata()?.len();
        }
        Ok(DirDrive {
            root,
            state: Mutex::new(DirState {
                sequence,
                bytes_written,
            }),
        })
    }

    pub fn write_label(&self, label: &TapeLabel) -> Result<(), TapeError> {
        let body = serde_json::json!({
            "tape_id": label.tape_id,
            "created": label.created.map(|dt| dt.to_rfc3339()),
        });
        fs::write(self.root.join(LABEL_FILE), body.to_string())?;
        Ok(())
    }
}

impl TapeDrive for DirDrive {
    fn write_archive(&self, path: &Path) -> Result<TapePosition, TapeError> {
        let file_name = path
            .file_name()
            .ok_or_else(|| TapeError::Other(format!("not a file: {}", path.display())))?;
        let mut state = self.state.lock();
        let dest = self
            .root
            .join(format!("{:06}_{}", state.sequence, file_name.to_string_lossy()));
        let len = fs::copy(path, &dest)?;
        let position = TapePosition {
            block_start: state.bytes_written,
        };
        state.sequence += 1;
        state.bytes_written += len;
        Ok(position)
    }

    fn read_label(&self) -> Result<Option<TapeLabel>, TapeError> {
        let raw = match fs::read_to_string(self.root.join(LABEL_FILE)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| TapeError::Other(format!("bad label: {e}")))?;
        let tape_id = value
            .get("tape_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned();
        let created = value
            .get("created")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        Ok(Some(TapeLabel { tape_id, created }))
    }

    fn erase_preserve_label(&self, use_current_year_month: bool) -> Result<(), TapeError> {
        let mut state = self.state.lock();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy() == LABEL_FILE {
                continue;
            }
            fs::remove_file(entry.path())?;
        }
        state.sequence = 0;
        state.bytes_written = 0;
        drop(state);

        if use_current_year_month {
            let now = Utc::now();
            let label = match self.read_label()? {
                Some(mut label) => {
                    label.created = Some(now);
                    label
                }
                None => TapeLabel {
                    tape_id: format!("TAP{:02}{:02}{:02}001", now.year() % 100, now.month(), now.day()),
                    created: Some(now),
                },
            };
            self.write_label(&label)?;
            info!("tape erased, label refreshed to {}", label.tape_id);
        } else {
            info!("tape erased, label preserved");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_accumulate_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let a = src.path().join("a");
        let b = src.path().join("b");
        std::fs::write(&a, vec![1u8; 100]).unwrap();
        std::fs::write(&b, vec![2u8; 50]).unwrap();

        let drive = DirDrive::open(dir.path()).unwrap();
        assert_eq!(drive.write_archive(&a).unwrap().block_start, 0);
        assert_eq!(drive.write_archive(&b).unwrap().block_start, 100);

        // A reopened drive continues where the directory left off.
        let reopened = DirDrive::open(dir.path()).unwrap();
        assert_eq!(reopened.write_archive(&a).unwrap().block_start, 150);
    }

    #[test]
    fn erase_keeps_and_refreshes_label() {
        let dir = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let a = src.path().join("a");
        std::fs::write(&a, b"data").unwrap();

        let drive = DirDrive::open(dir.path()).unwrap();
        drive
            .write_label(&TapeLabel {
                tape_id: "TAP2501001".into(),
                created: None,
            })
            .unwrap();
        drive.write_archive(&a).unwrap();

        drive.erase_preserve_label(true).unwrap();
        let label = drive.read_label().unwrap().unwrap();
        assert_eq!(label.tape_id, "TAP2501001");
        assert!(label.matches_month(Utc::now()));
        assert_eq!(drive.write_archive(&a).unwrap().block_start, 0);
    }
}
