use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::{MetaError, Result};
use crate::retry::RetryPolicy;
use crate::{
    ArchiveInfo, BatchOutcome, MetaStore, ScanTotals, SetFilter, TaskDraft, TaskFilter,
    TaskOverrides, TaskProgress,
};
use tapeback_lib::{
    BackupFile, BackupSet, BackupTask, FileId, FileKind, FileRecord, OperationStage, PendingFile,
    ScanStatus, SetId, SetStatus, TaskId, TaskStatus,
};

mod files;
mod schema;
mod sets;
mod tasks;


/// SQLite-backed [`MetaStore`].
///
/// One connection behind a mutex; every operation locks, runs its
/// transaction bracket and unlocks. WAL mode keeps readers off the writer's
/// back, and a busy timeout plus the retry policy absorb short contention.
pub struct SqliteMetaStore {
    conn: Mutex<Connection>,
    retry: RetryPolicy,
}

impl SqliteMetaStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = normal;
             PRAGMA foreign_keys = ON;",
        )?;
        conn.busy_timeout(Duration::from_secs(30))?;
        Self::from_conn(conn)
    }

    /// In-memory store, mainly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::from_conn(conn)
    }

    fn from_conn(conn: Connection) -> Result<Self> {
        schema::init(&conn)?;
        Ok(SqliteMetaStore {
            conn: Mutex::new(conn),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Insert a file row bypassing the upsert's path dedup, so tests can
    /// fabricate the legacy duplicate rows readers must resolve
    /// deterministically (lowest id wins).
    #[cfg(any(test, feature = "test"))]
    pub fn insert_file_row_unchecked(&self, set_pk: SetId, record: &FileRecord) -> Result<FileId> {
        files::insert_unchecked(&self.conn.lock(), set_pk, record)
    }
}

pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn opt_ts(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(ts)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MetaError::Invalid {
            what: "timestamp",
            reason: format!("{raw:?}: {e}"),
        })
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

impl MetaStore for SqliteMetaStore {
    fn create_template(&self, draft: &TaskDraft) -> Result<TaskId> {
        self.retry
            .run("create_template", || tasks::create_template(&mut self.conn.lock(), draft))
    }

    fn create_task_from_template(&self, template_id: TaskId) -> Result<TaskId> {
        self.retry.run("create_task_from_template", || {
            tasks::create_from_template(&mut self.conn.lock(), template_id)
        })
    }

    fn get_task(&self, task_id: TaskId) -> Result<BackupTask> {
        self.retry
            .run("get_task", || tasks::get(&self.conn.lock(), task_id))
    }

    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<BackupTask>> {
        self.retry
            .run("list_tasks", || tasks::list(&self.conn.lock(), filter))
    }

    fn update_task_definition(&self, task_id: TaskId, overrides: &TaskOverrides) -> Result<()> {
        self.retry.run("update_task_definition", || {
            tasks::update_definition(&self.conn.lock(), task_id, overrides)
        })
    }

    fn delete_task(&self, task_id: TaskId) -> Result<()> {
        self.retry
            .run("delete_task", || tasks::delete_cascade(&mut self.conn.lock(), task_id))
    }

    fn update_task_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.retry.run("update_task_status", || {
            tasks::update_status(&self.conn.lock(), task_id, status, error_message)
        })
    }

    fn update_task_progress(&self, task_id: TaskId, progress: TaskProgress) -> Result<()> {
        self.retry.run("update_task_progress", || {
            tasks::update_progress(&self.conn.lock(), task_id, progress)
        })
    }

    fn update_task_stage(
        &self,
        task_id: TaskId,
        stage: OperationStage,
        description: Option<&str>,
    ) -> Result<()> {
        self.retry.run("update_task_stage", || {
            tasks::update_stage(&self.conn.lock(), task_id, stage, description)
        })
    }

    fn update_scan_totals(&self, task_id: TaskId, totals: ScanTotals) -> Result<()> {
        self.retry.run("update_scan_totals", || {
            tasks::update_scan_totals(&mut self.conn.lock(), task_id, totals)
        })
    }

    fn get_scan_status(&self, task_id: TaskId) -> Result<ScanStatus> {
        self.retry
            .run("get_scan_status", || tasks::get_scan_status(&self.conn.lock(), task_id))
    }

    fn advance_scan_status(&self, task_id: TaskId, status: ScanStatus) -> Result<()> {
        self.retry.run("advance_scan_status", || {
            tasks::advance_scan_status(&mut self.conn.lock(), task_id, status)
        })
    }

    fn create_backup_set(
        &self,
        task: &BackupTask,
        tape_id: Option<&str>,
        retention_until: Option<DateTime<Utc>>,
    ) -> Result<BackupSet> {
        self.retry.run("create_backup_set", || {
            sets::create(&mut self.conn.lock(), task, tape_id, retention_until)
        })
    }

    fn get_backup_set(&self, set_pk: SetId) -> Result<BackupSet> {
        self.retry
            .run("get_backup_set", || sets::get(&self.conn.lock(), set_pk))
    }

    fn get_backup_set_by_set_id(&self, set_id: &str) -> Result<Option<BackupSet>> {
        self.retry
            .run("get_backup_set_by_set_id", || sets::get_by_set_id(&self.conn.lock(), set_id))
    }

    fn find_incomplete_execution(
        &self,
        template_id: TaskId,
    ) -> Result<Option<(BackupTask, BackupSet)>> {
        self.retry.run("find_incomplete_execution", || {
            sets::find_incomplete_execution(&self.conn.lock(), template_id)
        })
    }

    fn list_backup_sets(&self, filter: &SetFilter) -> Result<Vec<BackupSet>> {
        self.retry
            .run("list_backup_sets", || sets::list(&self.conn.lock(), filter))
    }

    fn finalize_backup_set(
        &self,
        set_pk: SetId,
        file_count: u64,
        total_bytes: u64,
        compressed_bytes: u64,
        chunk_count: u32,
    ) -> Result<()> {
        self.retry.run("finalize_backup_set", || {
            sets::finalize(
                &self.conn.lock(),
                set_pk,
                file_count,
                total_bytes,
                compressed_bytes,
                chunk_count,
            )
        })
    }

    fn set_backup_set_status(&self, set_pk: SetId, status: SetStatus) -> Result<()> {
        self.retry.run("set_backup_set_status", || {
            sets::set_status(&self.conn.lock(), set_pk, status)
        })
    }

    fn delete_backup_set(&self, set_pk: SetId) -> Result<()> {
        self.retry
            .run("delete_backup_set", || sets::delete(&mut self.conn.lock(), set_pk))
    }

    fn upsert_scanned_file(&self, set_pk: SetId, record: &FileRecord) -> Result<FileId> {
        self.retry.run("upsert_scanned_file", || {
            files::upsert_one(&mut self.conn.lock(), set_pk, record)
        })
    }

    fn batch_insert_scanned_files(
        &self,
        set_pk: SetId,
        records: &[FileRecord],
    ) -> Result<BatchOutcome> {
        // Chunking, shrink-on-transient and the individual-row fallback all
        // live below; no outer retry wrapper so a chunk is never replayed
        // after it committed.
        files::batch_upsert(&mut self.conn.lock(), set_pk, records, &self.retry)
    }

    fn mark_files_queued(&self, set_pk: SetId, paths: &[PathBuf]) -> Result<(usize, u64)> {
        files::mark_queued(&mut self.conn.lock(), set_pk, paths)
    }

    fn mark_files_copied(
        &self,
        set_pk: SetId,
        files_in_group: &[PendingFile],
        archive: &ArchiveInfo,
        chunk_number: u32,
    ) -> Result<()> {
        files::mark_copied(
            &mut self.conn.lock(),
            set_pk,
            files_in_group,
            archive,
            chunk_number,
            &self.retry,
        )
    }

    fn set_chunk_tape_position(
        &self,
        set_pk: SetId,
        chunk_number: u32,
        tape_block_start: u64,
    ) -> Result<()> {
        self.retry.run("set_chunk_tape_position", || {
            files::set_chunk_tape_position(&self.conn.lock(), set_pk, chunk_number, tape_block_start)
        })
    }

    fn min_pending_file_id(&self, set_pk: SetId) -> Result<Option<FileId>> {
        self.retry
            .run("min_pending_file_id", || files::min_pending_id(&self.conn.lock(), set_pk))
    }

    fn fetch_pending_batch(
        &self,
        set_pk: SetId,
        cursor: FileId,
        limit: usize,
    ) -> Result<Vec<PendingFile>> {
        self.retry.run("fetch_pending_batch", || {
            files::fetch_pending_batch(&self.conn.lock(), set_pk, cursor, limit)
        })
    }

    fn pending_files_count(&self, set_pk: SetId) -> Result<u64> {
        self.retry
            .run("pending_files_count", || files::pending_count(&self.conn.lock(), set_pk))
    }

    fn get_compressed_files_count(&self, set_pk: SetId) -> Result<u64> {
        self.retry.run("get_compressed_files_count", || {
            files::copied_count(&self.conn.lock(), set_pk)
        })
    }

    fn count_copied_among(&self, set_pk: SetId, paths: &[PathBuf]) -> Result<u64> {
        self.retry.run("count_copied_among", || {
            files::count_copied_among(&self.conn.lock(), set_pk, paths)
        })
    }

    fn count_files_of_kind(&self, set_pk: SetId, kind: FileKind) -> Result<u64> {
        self.retry.run("count_files_of_kind", || {
            files::count_of_kind(&self.conn.lock(), set_pk, kind)
        })
    }

    fn sum_file_bytes(&self, set_pk: SetId) -> Result<u64> {
        self.retry
            .run("sum_file_bytes", || files::sum_file_bytes(&self.conn.lock(), set_pk))
    }

    fn sum_compressed_bytes(&self, set_pk: SetId) -> Result<u64> {
        self.retry.run("sum_compressed_bytes", || {
            files::sum_compressed_bytes(&self.conn.lock(), set_pk)
        })
    }

    fn clear_backup_files_for_set(&self, set_pk: SetId) -> Result<()> {
        self.retry.run("clear_backup_files_for_set", || {
            files::clear_for_set(&self.conn.lock(), set_pk)
        })
    }

    fn get_file_by_path(&self, set_pk: SetId, path: &Path) -> Result<Option<BackupFile>> {
        self.retry.run("get_file_by_path", || {
            files::get_by_path(&self.conn.lock(), set_pk, path)
        })
    }

    fn files_in_chunk(&self, set_pk: SetId, chunk_number: u32) -> Result<Vec<BackupFile>> {
        self.retry.run("files_in_chunk", || {
            files::files_in_chunk(&self.conn.lock(), set_pk, chunk_number)
        })
    }

    fn max_chunk_number(&self, set_pk: SetId) -> Result<Option<u32>> {
        self.retry
            .run("max_chunk_number", || files::max_chunk_number(&self.conn.lock(), set_pk))
    }
}
