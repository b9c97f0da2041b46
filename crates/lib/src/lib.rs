//! Shared data model for the tapeback engine.
//!
//! The types here are the vocabulary spoken between the metadata store, the
//! pipeline workers and the control service: tasks, backup sets, file records
//! and the engine settings. No I/O lives in this crate.

use std::fmt;

use serde::{Deserialize, Serialize};

mod exclude;
mod file;
mod set;
mod settings;
mod task;

pub use exclude::ExcludeSet;
pub use file::{BackupFile, FileKind, FileRecord, PendingFile};
pub use set::{format_set_id, BackupSet, SetStatus};
pub use settings::{CompressionMethod, GroupTuning, Settings};
pub use task::{
    progress_percent, BackupTask, OperationStage, ResultSummary, ScanStatus, TaskStatus, TaskType,
    UnknownVariant,
};

macro_rules! row_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

row_id! {
    /// Primary key of a `backup_tasks` row. Templates and executions share
    /// the id space.
    TaskId
}

row_id! {
    /// Primary key of a `backup_sets` row.
    ///
    /// Not to be confused with the human-readable set id string
    /// (see [`format_set_id`]).
    SetId
}

row_id! {
    /// Primary key of a `backup_files` row within its per-set partition.
    FileId
}
