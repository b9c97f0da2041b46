//! Durable metadata store for the tapeback engine.
//!
//! [`MetaStore`] is the single source of truth for tasks, backup sets and
//! per-file pipeline state. The trait is backend-neutral; [`SqliteMetaStore`]
//! is the shipped implementation. The engine never conditions on backend
//! identity; everything it needs is expressed here.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tapeback_lib::{
    BackupFile, BackupSet, BackupTask, FileId, FileRecord, OperationStage, PendingFile, ScanStatus,
    SetId, SetStatus, TaskId, TaskStatus, TaskType,
};

pub mod error;
pub mod retry;
mod sqlite;

pub use error::{ErrorClass, MetaError, Result};
pub use retry::RetryPolicy;
pub use sqlite::SqliteMetaStore;

/// The definition of a new task template.
#[derive(Clone, Debug)]
pub struct TaskDraft {
    pub name: String,
    pub task_type: TaskType,
    pub source_paths: Vec<PathBuf>,
    pub exclude_patterns: Vec<String>,
    pub retention_days: u32,
    pub compression_enabled: bool,
    pub encryption_enabled: bool,
    pub description: Option<String>,
    pub tape_device: Option<String>,
}

impl TaskDraft {
    pub fn new(name: impl Into<String>, source_paths: Vec<PathBuf>) -> Self {
        TaskDraft {
            name: name.into(),
            task_type: TaskType::Full,
            source_paths,
            exclude_patterns: Vec::new(),
            retention_days: 0,
            compression_enabled: true,
            encryption_enabled: false,
            description: None,
            tape_device: None,
        }
    }
}

/// Filters for [`MetaStore::list_tasks`].
#[derive(Clone, Debug, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    /// Substring match on the task name.
    pub search: Option<String>,
    pub templates_only: Option<bool>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Filters for [`MetaStore::list_backup_sets`].
#[derive(Clone, Debug, Default)]
pub struct SetFilter {
    pub backup_task_id: Option<TaskId>,
    pub status: Option<SetStatus>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Outcome of a bulk insert: the successful subset is committed, failures
/// are reported per record index.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub updated: usize,
    /// Records whose on-store row is already copied and therefore immutable.
    pub skipped: usize,
    pub errors: Vec<(usize, MetaError)>,
}

impl BatchOutcome {
    pub fn merge(&mut self, other: BatchOutcome) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
    }
}

/// Everything `mark_files_copied` persists about a finished archive.
#[derive(Clone, Debug)]
pub struct ArchiveInfo {
    pub archive_path: PathBuf,
    pub compressed_size: u64,
    /// Hex-encoded checksum of the archive.
    pub checksum: String,
    pub compression_enabled: bool,
    pub backup_time: DateTime<Utc>,
}

/// Per-field overrides applied when a template is cloned into an
/// execution; `None` keeps the template's value.
#[derive(Clone, Debug, Default)]
pub struct TaskOverrides {
    pub name: Option<String>,
    pub source_paths: Option<Vec<PathBuf>>,
    pub exclude_patterns: Option<Vec<String>>,
    pub retention_days: Option<u32>,
    pub compression_enabled: Option<bool>,
    pub tape_device: Option<String>,
}

impl TaskOverrides {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.source_paths.is_none()
            && self.exclude_patterns.is_none()
            && self.retention_days.is_none()
            && self.compression_enabled.is_none()
            && self.tape_device.is_none()
    }
}

/// Small task-progress update; `None` fields are left untouched.
///
/// Counters only ever move forward: the store clamps each update against
/// the current value so progress is monotone even under racing writers.
#[derive(Clone, Copy, Debug, Default)]
pub struct TaskProgress {
    pub processed_files: Option<u64>,
    pub processed_bytes: Option<u64>,
    pub compressed_bytes: Option<u64>,
    pub progress_percent: Option<f64>,
}

/// Totals persisted periodically during the scan.
#[derive(Clone, Copy, Debug)]
pub struct ScanTotals {
    pub total_files: u64,
    pub total_bytes: u64,
    pub estimated_archive_count: u64,
}

/// The durable store of tasks, backup sets and file records.
///
/// Every mutating operation is one transactional unit of work; bulk
/// operations chunk internally and are at-least-once, so they are also
/// idempotent. Implementations retry transient backend errors with bounded
/// backoff before surfacing them.
pub trait MetaStore: Send + Sync {
    // ---- tasks -----------------------------------------------------------

    /// Insert a new template.
    fn create_template(&self, draft: &TaskDraft) -> Result<TaskId>;

    /// Clone `template_id` into a fresh non-template execution row.
    fn create_task_from_template(&self, template_id: TaskId) -> Result<TaskId>;

    fn get_task(&self, task_id: TaskId) -> Result<BackupTask>;

    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<BackupTask>>;

    /// Apply creation-time overrides to a freshly cloned execution.
    fn update_task_definition(&self, task_id: TaskId, overrides: &TaskOverrides) -> Result<()>;

    /// Delete a task and cascade to its sets and their file partitions.
    fn delete_task(&self, task_id: TaskId) -> Result<()>;

    /// Move a task to `status`, stamping `started_at`/`completed_at` as
    /// appropriate and recording `error_message` for failures.
    fn update_task_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<()>;

    fn update_task_progress(&self, task_id: TaskId, progress: TaskProgress) -> Result<()>;

    fn update_task_stage(
        &self,
        task_id: TaskId,
        stage: OperationStage,
        description: Option<&str>,
    ) -> Result<()>;

    /// Persist scan totals and the archive-count estimate into
    /// `result_summary`.
    fn update_scan_totals(&self, task_id: TaskId, totals: ScanTotals) -> Result<()>;

    fn get_scan_status(&self, task_id: TaskId) -> Result<ScanStatus>;

    /// Advance `scan_status`. Backward transitions are ignored (the
    /// lifecycle is one-directional), not errors, so racing writers can't
    /// regress the state.
    fn advance_scan_status(&self, task_id: TaskId, status: ScanStatus) -> Result<()>;

    // ---- backup sets -----------------------------------------------------

    /// Create the set row and its file partition. On return the row is
    /// guaranteed observable by subsequent reads (commit-and-verify).
    fn create_backup_set(
        &self,
        task: &BackupTask,
        tape_id: Option<&str>,
        retention_until: Option<DateTime<Utc>>,
    ) -> Result<BackupSet>;

    fn get_backup_set(&self, set_pk: SetId) -> Result<BackupSet>;

    fn get_backup_set_by_set_id(&self, set_id: &str) -> Result<Option<BackupSet>>;

    /// The most recent still-active set of a non-template execution of
    /// `template_id`, with its owning task. This is the resume anchor.
    fn find_incomplete_execution(
        &self,
        template_id: TaskId,
    ) -> Result<Option<(BackupTask, BackupSet)>>;

    fn list_backup_sets(&self, filter: &SetFilter) -> Result<Vec<BackupSet>>;

    /// Write final aggregates and the compression ratio.
    fn finalize_backup_set(
        &self,
        set_pk: SetId,
        file_count: u64,
        total_bytes: u64,
        compressed_bytes: u64,
        chunk_count: u32,
    ) -> Result<()>;

    fn set_backup_set_status(&self, set_pk: SetId, status: SetStatus) -> Result<()>;

    /// Delete the set row and drop its file partition.
    fn delete_backup_set(&self, set_pk: SetId) -> Result<()>;

    // ---- file records ----------------------------------------------------

    /// Insert a scanned record, or refresh the mutable fields of an
    /// existing `(set, path)` row that has not been copied yet. Copied rows
    /// are never overwritten.
    fn upsert_scanned_file(&self, set_pk: SetId, record: &FileRecord) -> Result<FileId>;

    /// Bulk [`Self::upsert_scanned_file`]. Atomic per internal chunk; the
    /// successful subset commits and per-record failures are reported in
    /// the outcome.
    fn batch_insert_scanned_files(
        &self,
        set_pk: SetId,
        records: &[FileRecord],
    ) -> Result<BatchOutcome>;

    /// Reserve `paths` for an in-flight group: set `is_copy_success` where
    /// it isn't already. Returns `(rows_updated, verified_count)` after a
    /// count-verify with one retry on mismatch. Idempotent.
    fn mark_files_queued(&self, set_pk: SetId, paths: &[PathBuf]) -> Result<(usize, u64)>;

    /// Persist the copied state of every file in a finished archive.
    /// Missing rows (compression raced ahead of staging drain, or a cleared
    /// partition) are inserted. Idempotent.
    fn mark_files_copied(
        &self,
        set_pk: SetId,
        files: &[PendingFile],
        archive: &ArchiveInfo,
        chunk_number: u32,
    ) -> Result<()>;

    /// Record where on tape an already-marked chunk landed.
    fn set_chunk_tape_position(
        &self,
        set_pk: SetId,
        chunk_number: u32,
        tape_block_start: u64,
    ) -> Result<()>;

    /// Smallest id among pending regular files, if any.
    fn min_pending_file_id(&self, set_pk: SetId) -> Result<Option<FileId>>;

    /// Up to `limit` pending regular files with `id > cursor`, ascending.
    fn fetch_pending_batch(
        &self,
        set_pk: SetId,
        cursor: FileId,
        limit: usize,
    ) -> Result<Vec<PendingFile>>;

    fn pending_files_count(&self, set_pk: SetId) -> Result<u64>;

    /// Count of rows already marked copied (`is_copy_success = true`).
    fn get_compressed_files_count(&self, set_pk: SetId) -> Result<u64>;

    /// How many of `paths` are marked copied: the post-write verification
    /// query.
    fn count_copied_among(&self, set_pk: SetId, paths: &[PathBuf]) -> Result<u64>;

    /// Count of rows of a given file type, used at finalize.
    fn count_files_of_kind(&self, set_pk: SetId, kind: tapeback_lib::FileKind) -> Result<u64>;

    /// Sum of `file_size` over regular-file rows.
    fn sum_file_bytes(&self, set_pk: SetId) -> Result<u64>;

    /// Sum of `compressed_size` over copied rows, i.e. the set's archive
    /// bytes.
    fn sum_compressed_bytes(&self, set_pk: SetId) -> Result<u64>;

    /// Delete every file row of the set. Used by cancel/restart.
    fn clear_backup_files_for_set(&self, set_pk: SetId) -> Result<()>;

    /// Lookup by exact path (smallest id wins when legacy duplicates
    /// exist).
    fn get_file_by_path(&self, set_pk: SetId, path: &Path) -> Result<Option<BackupFile>>;

    /// All rows of one chunk, ascending by id.
    fn files_in_chunk(&self, set_pk: SetId, chunk_number: u32) -> Result<Vec<BackupFile>>;

    /// Highest assigned chunk number, if any chunk was written.
    fn max_chunk_number(&self, set_pk: SetId) -> Result<Option<u32>>;
}
