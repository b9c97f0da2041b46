use rusqlite::Connection;

use crate::error::Result;
use tapeback_lib::SetId;

/// Base tables. File rows live in per-set partitions created alongside each
/// backup set, see [`files_table`].
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS backup_tasks (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    name                  TEXT NOT NULL,
    task_type             TEXT NOT NULL,
    source_paths          TEXT NOT NULL DEFAULT '[]',
    exclude_patterns      TEXT NOT NULL DEFAULT '[]',
    retention_days        INTEGER NOT NULL DEFAULT 0,
    compression_enabled   INTEGER NOT NULL DEFAULT 1,
    encryption_enabled    INTEGER NOT NULL DEFAULT 0,
    description           TEXT,
    tape_device           TEXT,
    status                TEXT NOT NULL DEFAULT 'pending',
    scan_status           TEXT NOT NULL DEFAULT 'pending',
    total_files           INTEGER NOT NULL DEFAULT 0,
    processed_files       INTEGER NOT NULL DEFAULT 0,
    total_bytes           INTEGER NOT NULL DEFAULT 0,
    processed_bytes       INTEGER NOT NULL DEFAULT 0,
    compressed_bytes      INTEGER NOT NULL DEFAULT 0,
    progress_percent      REAL NOT NULL DEFAULT 0,
    operation_stage       TEXT,
    operation_description TEXT,
    error_message         TEXT,
    started_at            TEXT,
    completed_at          TEXT,
    is_template           INTEGER NOT NULL DEFAULT 0,
    template_id           INTEGER REFERENCES backup_tasks(id) ON DELETE SET NULL,
    result_summary        TEXT NOT NULL DEFAULT '{}',
    tags                  TEXT NOT NULL DEFAULT '[]',
    created_at            TEXT NOT NULL,
    updated_at            TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_backup_tasks_template ON backup_tasks(template_id);
CREATE INDEX IF NOT EXISTS idx_backup_tasks_status ON backup_tasks(status);

CREATE TABLE IF NOT EXISTS backup_sets (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    set_id            TEXT NOT NULL,
    backup_task_id    INTEGER NOT NULL REFERENCES backup_tasks(id) ON DELETE CASCADE,
    tape_id           TEXT,
    status            TEXT NOT NULL DEFAULT 'active',
    total_files       INTEGER NOT NULL DEFAULT 0,
    total_bytes       INTEGER NOT NULL DEFAULT 0,
    compressed_bytes  INTEGER NOT NULL DEFAULT 0,
    compression_ratio REAL NOT NULL DEFAULT 0,
    chunk_count       INTEGER NOT NULL DEFAULT 0,
    retention_until   TEXT,
    created_at        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_backup_sets_task ON backup_sets(backup_task_id);
";

pub(crate) fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// The one place a physical file-partition name is composed. Everything
/// else resolves the table through here.
pub(crate) fn files_table(set_pk: SetId) -> String {
    format!("backup_files_{}", set_pk.0)
}

/// DDL for one set's file partition.
///
/// Note there is no UNIQUE constraint on `file_path`: legacy data can carry
/// duplicates, which readers resolve deterministically (smallest id wins).
pub(crate) fn create_files_partition(conn: &Connection, set_pk: SetId) -> Result<()> {
    let table = files_table(set_pk);
    conn.execute_batch(&format!(
        "
CREATE TABLE IF NOT EXISTS {table} (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    backup_set_id    INTEGER NOT NULL,
    file_path        TEXT NOT NULL,
    file_name        TEXT NOT NULL,
    file_size        INTEGER NOT NULL DEFAULT 0,
    file_type        TEXT NOT NULL,
    file_permissions INTEGER,
    created_time     TEXT,
    modified_time    TEXT,
    accessed_time    TEXT,
    compressed_size  INTEGER,
    compressed       INTEGER NOT NULL DEFAULT 0,
    checksum         TEXT,
    chunk_number     INTEGER,
    tape_block_start INTEGER,
    is_copy_success  INTEGER NOT NULL DEFAULT 0,
    copy_status_at   TEXT,
    file_metadata    TEXT NOT NULL DEFAULT '{{}}',
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_{table}_pending
    ON {table}(backup_set_id, is_copy_success, file_type, id);
CREATE INDEX IF NOT EXISTS idx_{table}_path ON {table}(file_path);
CREATE INDEX IF NOT EXISTS idx_{table}_chunk ON {table}(chunk_number);
"
    ))?;
    Ok(())
}

pub(crate) fn drop_files_partition(conn: &Connection, set_pk: SetId) -> Result<()> {
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", files_table(set_pk)))?;
    Ok(())
}

pub(crate) fn partition_exists(conn: &Connection, set_pk: SetId) -> Result<bool> {
    let n: u32 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [files_table(set_pk)],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}
