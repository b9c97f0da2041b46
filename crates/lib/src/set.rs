use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::{SetId, TaskId};

/// Lifecycle of a backup set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetStatus {
    /// Files are still being scanned, grouped or written.
    Active,
    /// Finalized after a successful run; aggregates are authoritative.
    Completed,
    /// The owning execution failed; the set is kept for inspection/resume.
    Failed,
}

impl SetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetStatus::Active => "active",
            SetStatus::Completed => "completed",
            SetStatus::Failed => "failed",
        }
    }
}

impl FromStr for SetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SetStatus::Active),
            "completed" => Ok(SetStatus::Completed),
            "failed" => Ok(SetStatus::Failed),
            other => Err(format!("unknown set status: {other:?}")),
        }
    }
}

/// One execution's container: the files backed up onto one tape in one run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupSet {
    pub id: SetId,
    /// Human-readable id, see [`format_set_id`].
    pub set_id: String,
    pub backup_task_id: TaskId,
    pub tape_id: Option<String>,
    pub status: SetStatus,
    pub total_files: u64,
    pub total_bytes: u64,
    pub compressed_bytes: u64,
    pub compression_ratio: f64,
    pub chunk_count: u32,
    pub retention_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Human-readable set id: `YYYY-MM_<task id zero-padded to 6>`.
///
/// The month prefix matches the tape-label month convention, so an operator
/// can eyeball which tape a set belongs on.
pub fn format_set_id(created: DateTime<Utc>, task_id: TaskId) -> String {
    format!("{:04}-{:02}_{:06}", created.year(), created.month(), task_id.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn set_id_format() {
        let at = Utc.with_ymd_and_hms(2026, 3, 7, 12, 0, 0).unwrap();
        assert_eq!(format_set_id(at, TaskId(42)), "2026-03_000042");
        assert_eq!(format_set_id(at, TaskId(1234567)), "2026-03_1234567");
    }
}
