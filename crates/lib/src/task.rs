use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::TaskId;

macro_rules! str_enum {
    (
        $(#[$doc:meta])*
        $name:ident { $($variant:ident => $repr:literal),+ $(,)? }
    ) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $repr),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($repr => Ok(Self::$variant),)+
                    _ => Err(UnknownVariant {
                        what: stringify!($name),
                        got: s.to_owned(),
                    }),
                }
            }
        }
    };
}

/// A string column held a value outside the enum's known representations.
#[derive(Debug, thiserror::Error)]
#[error("unknown {what} value: {got:?}")]
pub struct UnknownVariant {
    what: &'static str,
    got: String,
}

str_enum! {
    /// What kind of backup a task performs.
    TaskType {
        Full => "full",
        Incremental => "incremental",
        Differential => "differential",
        MonthlyFull => "monthly_full",
    }
}

str_enum! {
    /// Overall lifecycle state of a task execution.
    TaskStatus {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

str_enum! {
    /// Progress of the scan worker, tracked separately from [`TaskStatus`].
    ///
    /// Transitions are one-directional:
    /// `Pending -> Running -> {Retrieving, Completed}`. `Retrieving` is set
    /// by the group-forming side when it starts draining records after the
    /// walk finished; the scan side itself only ever writes `Running` and
    /// `Completed`.
    ScanStatus {
        Pending => "pending",
        Running => "running",
        Retrieving => "retrieving",
        Completed => "completed",
    }
}

impl ScanStatus {
    fn rank(&self) -> u8 {
        match self {
            ScanStatus::Pending => 0,
            ScanStatus::Running => 1,
            ScanStatus::Retrieving => 2,
            ScanStatus::Completed => 3,
        }
    }

    /// Whether moving from `self` to `next` goes forward in the lifecycle.
    pub fn may_advance_to(&self, next: ScanStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, ScanStatus::Completed)
    }
}

str_enum! {
    /// Coarse phase of the pipeline a task is currently in, for operators.
    OperationStage {
        Scan => "scan",
        Compress => "compress",
        Copy => "copy",
        Finalize => "finalize",
    }
}

/// The `result_summary` JSON column, with the keys the engine actually reads
/// given a known shape. Unknown keys round-trip through `extra`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    #[serde(default)]
    pub estimated_archive_count: u64,
    #[serde(default)]
    pub total_scanned_files: u64,
    #[serde(default)]
    pub total_scanned_bytes: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A named unit of backup work.
///
/// Templates (`is_template = true`) are immutable blueprints; running a
/// template clones it into a non-template child pointing back via
/// `template_id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupTask {
    pub id: TaskId,
    pub name: String,
    pub task_type: TaskType,
    pub source_paths: Vec<PathBuf>,
    pub exclude_patterns: Vec<String>,
    pub retention_days: u32,
    pub compression_enabled: bool,
    pub encryption_enabled: bool,
    pub description: Option<String>,
    pub tape_device: Option<String>,
    pub status: TaskStatus,
    pub scan_status: ScanStatus,
    pub total_files: u64,
    pub processed_files: u64,
    pub total_bytes: u64,
    pub processed_bytes: u64,
    pub compressed_bytes: u64,
    pub progress_percent: f64,
    pub operation_stage: Option<OperationStage>,
    pub operation_description: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_template: bool,
    pub template_id: Option<TaskId>,
    pub result_summary: ResultSummary,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Task-level progress from file counts.
///
/// The first 10% is reserved for the scan phase, so the value is
/// `10 + processed/total * 90`, clamped to `[10, 100]`. A task with zero
/// total files sits at the floor until finalize.
pub fn progress_percent(processed_files: u64, total_files: u64) -> f64 {
    if total_files == 0 {
        return 10.0;
    }
    let frac = processed_files as f64 / total_files as f64;
    (10.0 + frac * 90.0).clamp(10.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn progress_reserves_scan_phase() {
        assert_eq!(progress_percent(0, 100), 10.0);
        assert_eq!(progress_percent(50, 100), 55.0);
        assert_eq!(progress_percent(100, 100), 100.0);
        // Over-counting (races between drain and marking) clamps.
        assert_eq!(progress_percent(150, 100), 100.0);
        assert_eq!(progress_percent(0, 0), 10.0);
    }

    #[test]
    fn scan_status_is_one_directional() {
        assert!(ScanStatus::Pending.may_advance_to(ScanStatus::Running));
        assert!(ScanStatus::Running.may_advance_to(ScanStatus::Retrieving));
        assert!(ScanStatus::Running.may_advance_to(ScanStatus::Completed));
        assert!(ScanStatus::Retrieving.may_advance_to(ScanStatus::Completed));
        assert!(!ScanStatus::Completed.may_advance_to(ScanStatus::Retrieving));
        assert!(!ScanStatus::Retrieving.may_advance_to(ScanStatus::Running));
    }

    #[test]
    fn enum_round_trips_through_db_repr() {
        for t in [
            TaskType::Full,
            TaskType::Incremental,
            TaskType::Differential,
            TaskType::MonthlyFull,
        ] {
            assert_eq!(t.as_str().parse::<TaskType>().unwrap(), t);
        }
        assert!("weekly_full".parse::<TaskType>().is_err());
    }
}
