use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use itertools::Itertools;
use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::schema::{files_table, partition_exists};
use super::{opt_ts, parse_opt_ts, parse_ts, ts};
use crate::error::{MetaError, Result};
use crate::retry::{shrink_on, RetryPolicy};
use crate::{ArchiveInfo, BatchOutcome};
use tapeback_lib::{BackupFile, FileId, FileKind, FileRecord, PendingFile, SetId};

/// Rows per committed chunk for bulk inserts.
const INSERT_CHUNK: usize = 1000;
/// Paths per statement for the marking operations.
const MARK_CHUNK: usize = 500;

fn placeholders(n: usize) -> String {
    itertools::repeat_n("?", n).join(", ")
}

fn file_from_row(row: &Row<'_>) -> Result<BackupFile> {
    let kind: String = row.get("file_type")?;
    let metadata: String = row.get("file_metadata")?;
    let path: String = row.get("file_path")?;
    Ok(BackupFile {
        id: FileId(row.get("id")?),
        backup_set_id: SetId(row.get("backup_set_id")?),
        record: FileRecord {
            path: PathBuf::from(path),
            file_name: row.get("file_name")?,
            size: row.get::<_, i64>("file_size")? as u64,
            kind: kind.parse::<FileKind>().map_err(|reason| MetaError::Invalid {
                what: "file type",
                reason,
            })?,
            permissions: row.get::<_, Option<i64>>("file_permissions")?.map(|p| p as u32),
            created: parse_opt_ts(row.get("created_time")?)?,
            modified: parse_opt_ts(row.get("modified_time")?)?,
            accessed: parse_opt_ts(row.get("accessed_time")?)?,
            metadata: serde_json::from_str(&metadata).map_err(|source| MetaError::Decode {
                column: "file_metadata",
                source,
            })?,
        },
        compressed_size: row.get::<_, Option<i64>>("compressed_size")?.map(|v| v as u64),
        compressed: row.get("compressed")?,
        checksum: row.get("checksum")?,
        chunk_number: row.get::<_, Option<i64>>("chunk_number")?.map(|v| v as u32),
        tape_block_start: row.get::<_, Option<i64>>("tape_block_start")?.map(|v| v as u64),
        is_copy_success: row.get("is_copy_success")?,
        copy_status_at: parse_opt_ts(row.get("copy_status_at")?)?,
        created_at: parse_ts(&row.get::<_, String>("created_at")?)?,
        updated_at: parse_ts(&row.get::<_, String>("updated_at")?)?,
    })
}

fn insert_record(conn: &Connection, set_pk: SetId, record: &FileRecord) -> Result<FileId> {
    let table = files_table(set_pk);
    let now = ts(Utc::now());
    conn.execute(
        &format!(
            "INSERT INTO {table} (backup_set_id, file_path, file_name, file_size, file_type, \
             file_permissions, created_time, modified_time, accessed_time, file_metadata, \
             created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)"
        ),
        params![
            set_pk.0,
            record.path.to_string_lossy(),
            record.file_name,
            record.size as i64,
            record.kind.as_str(),
            record.permissions.map(|p| p as i64),
            opt_ts(record.created),
            opt_ts(record.modified),
            opt_ts(record.accessed),
            serde_json::to_string(&record.metadata).map_err(|source| MetaError::Decode {
                column: "file_metadata",
                source
            })?,
            now,
        ],
    )?;
    Ok(FileId(conn.last_insert_rowid()))
}

fn update_record(conn: &Connection, set_pk: SetId, id: FileId, record: &FileRecord) -> Result<()> {
    let table = files_table(set_pk);
    conn.execute(
        &format!(
            "UPDATE {table} SET file_size = ?1, file_permissions = ?2, created_time = ?3, \
             modified_time = ?4, accessed_time = ?5, file_metadata = ?6, updated_at = ?7 \
             WHERE id = ?8"
        ),
        params![
            record.size as i64,
            record.permissions.map(|p| p as i64),
            opt_ts(record.created),
            opt_ts(record.modified),
            opt_ts(record.accessed),
            serde_json::to_string(&record.metadata).map_err(|source| MetaError::Decode {
                column: "file_metadata",
                source
            })?,
            ts(Utc::now()),
            id.0,
        ],
    )?;
    Ok(())
}

/// Raw row insert without the path-dedup of the upsert path. Fabricates the
/// legacy duplicate rows the readers must tolerate.
#[cfg(any(test, feature = "test"))]
pub(super) fn insert_unchecked(
    conn: &Connection,
    set_pk: SetId,
    record: &FileRecord,
) -> Result<FileId> {
    insert_record(conn, set_pk, record)
}

/// `(lowest id, is_copy_success)` per path, for a slice of records.
///
/// The map is local to one bulk call on purpose: a path cache shared across
/// writers would leak ids between concurrent sets.
fn existing_by_path(
    conn: &Connection,
    set_pk: SetId,
    records: &[&FileRecord],
) -> Result<HashMap<String, (FileId, bool)>> {
    let table = files_table(set_pk);
    let mut out: HashMap<String, (FileId, bool)> = HashMap::new();
    for chunk in records.chunks(MARK_CHUNK) {
        let sql = format!(
            "SELECT file_path, id, is_copy_success FROM {table} \
             WHERE file_path IN ({}) ORDER BY id",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(chunk.iter().map(|r| r.path.to_string_lossy().into_owned())),
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    FileId(row.get::<_, i64>(1)?),
                    row.get::<_, bool>(2)?,
                ))
            },
        )?;
        for row in rows {
            let (path, id, copied) = row?;
            // Ascending id order: the first hit per path is the winner.
            out.entry(path).or_insert((id, copied));
        }
    }
    Ok(out)
}

pub(super) fn upsert_one(conn: &mut Connection, set_pk: SetId, record: &FileRecord) -> Result<FileId> {
    let tx = conn.transaction()?;
    let id = {
        let existing = existing_by_path(&tx, set_pk, &[record])?;
        match existing.get(record.path.to_string_lossy().as_ref()) {
            None => insert_record(&tx, set_pk, record)?,
            Some(&(id, copied)) => {
                if !copied {
                    update_record(&tx, set_pk, id, record)?;
                }
                id
            }
        }
    };
    tx.commit()?;
    Ok(id)
}

pub(super) fn batch_upsert(
    conn: &mut Connection,
    set_pk: SetId,
    records: &[FileRecord],
    retry: &RetryPolicy,
) -> Result<BatchOutcome> {
    let mut outcome = BatchOutcome::default();
    let mut offset = 0;
    let mut chunk_size = INSERT_CHUNK;
    let mut failures = 0u32;

    while offset < records.len() {
        let end = (offset + chunk_size).min(records.len());
        let chunk = &records[offset..end];
        match upsert_chunk(conn, set_pk, chunk) {
            Ok(part) => {
                outcome.merge(part);
                offset = end;
                failures = 0;
            }
            Err(e) => {
                failures += 1;
                match shrink_on(&e, chunk_size) {
                    Some(smaller) if failures < retry.max_attempts => {
                        debug!(
                            "bulk insert chunk failed ({e}); shrinking {chunk_size} -> {smaller} and retrying"
                        );
                        std::thread::sleep(retry.backoff(failures - 1));
                        chunk_size = smaller;
                    }
                    Some(_) => return Err(e),
                    None => {
                        // Permanent chunk failure: fall back to row-at-a-time
                        // so one poison record cannot sink its neighbours.
                        let part = upsert_individually(conn, set_pk, chunk, offset);
                        outcome.merge(part);
                        offset = end;
                        failures = 0;
                    }
                }
            }
        }
    }
    Ok(outcome)
}

fn upsert_chunk(conn: &mut Connection, set_pk: SetId, chunk: &[FileRecord]) -> Result<BatchOutcome> {
    let mut outcome = BatchOutcome::default();
    let tx = conn.transaction()?;
    {
        let refs: Vec<&FileRecord> = chunk.iter().collect();
        let mut existing = existing_by_path(&tx, set_pk, &refs)?;
        for record in chunk {
            let key = record.path.to_string_lossy().into_owned();
            match existing.get(&key) {
                None => {
                    let id = insert_record(&tx, set_pk, record)?;
                    // Later duplicates inside the same chunk must update,
                    // not insert again.
                    existing.insert(key, (id, false));
                    outcome.inserted += 1;
                }
                Some(&(id, false)) => {
                    update_record(&tx, set_pk, id, record)?;
                    outcome.updated += 1;
                }
                Some(&(_, true)) => outcome.skipped += 1,
            }
        }
    }
    tx.commit()?;
    Ok(outcome)
}

fn upsert_individually(
    conn: &mut Connection,
    set_pk: SetId,
    chunk: &[FileRecord],
    base_index: usize,
) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    for (i, record) in chunk.iter().enumerate() {
        match upsert_one(conn, set_pk, record) {
            Ok(_) => outcome.inserted += 1,
            Err(e) => outcome.errors.push((base_index + i, e)),
        }
    }
    outcome
}

pub(super) fn mark_queued(
    conn: &mut Connection,
    set_pk: SetId,
    paths: &[PathBuf],
) -> Result<(usize, u64)> {
    let table = files_table(set_pk);
    let mut updated = 0usize;
    let mut verified = 0u64;

    for chunk in paths.chunks(MARK_CHUNK) {
        let args: Vec<String> = chunk.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        let expected = args.iter().unique().count() as u64;
        let update_sql = format!(
            "UPDATE {table} SET is_copy_success = 1, copy_status_at = ?, updated_at = ? \
             WHERE backup_set_id = ? AND is_copy_success = 0 AND file_path IN ({})",
            placeholders(args.len())
        );
        let count_sql = format!(
            "SELECT COUNT(DISTINCT file_path) FROM {table} \
             WHERE backup_set_id = ? AND is_copy_success = 1 AND file_path IN ({})",
            placeholders(args.len())
        );

        let run_update = |conn: &Connection| -> Result<usize> {
            let now = ts(Utc::now());
            let mut params: Vec<Box<dyn rusqlite::ToSql>> =
                vec![Box::new(now.clone()), Box::new(now), Box::new(set_pk.0)];
            params.extend(args.iter().map(|p| Box::new(p.clone()) as Box<dyn rusqlite::ToSql>));
            Ok(conn.execute(
                &update_sql,
                rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            )?)
        };
        let run_count = |conn: &Connection| -> Result<u64> {
            let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(set_pk.0)];
            params.extend(args.iter().map(|p| Box::new(p.clone()) as Box<dyn rusqlite::ToSql>));
            Ok(conn.query_row(
                &count_sql,
                rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                |row| row.get::<_, i64>(0),
            )? as u64)
        };

        updated += run_update(conn)?;
        let mut confirmed = run_count(conn)?;
        if confirmed < expected {
            // One verify-retry, then log and return the partial result; the
            // group builder will re-select anything still pending.
            warn!(
                "mark_files_queued verification shortfall on set {set_pk}: \
                 {confirmed}/{expected}; retrying once"
            );
            updated += run_update(conn)?;
            confirmed = run_count(conn)?;
            if confirmed < expected {
                warn!(
                    "mark_files_queued still short on set {set_pk}: {confirmed}/{expected}; \
                     continuing with partial result"
                );
            }
        }
        verified += confirmed;
    }
    Ok((updated, verified))
}

pub(super) fn mark_copied(
    conn: &mut Connection,
    set_pk: SetId,
    files: &[PendingFile],
    archive: &ArchiveInfo,
    chunk_number: u32,
    retry: &RetryPolicy,
) -> Result<()> {
    let group_bytes: u64 = files.iter().map(|f| f.size).sum();
    let mut offset = 0;
    let mut chunk_size = MARK_CHUNK;
    let mut failures = 0u32;

    while offset < files.len() {
        let end = (offset + chunk_size).min(files.len());
        match mark_copied_chunk(conn, set_pk, &files[offset..end], archive, chunk_number, group_bytes)
        {
            Ok(()) => {
                offset = end;
                failures = 0;
            }
            Err(e) => {
                failures += 1;
                match shrink_on(&e, chunk_size) {
                    Some(smaller) if failures < retry.max_attempts => {
                        debug!("mark_files_copied chunk failed ({e}); retrying at {smaller}");
                        std::thread::sleep(retry.backoff(failures - 1));
                        chunk_size = smaller;
                    }
                    _ => return Err(e),
                }
            }
        }
    }
    Ok(())
}

fn mark_copied_chunk(
    conn: &mut Connection,
    set_pk: SetId,
    files: &[PendingFile],
    archive: &ArchiveInfo,
    chunk_number: u32,
    group_bytes: u64,
) -> Result<()> {
    let table = files_table(set_pk);
    let now = ts(Utc::now());
    let copied_at = ts(archive.backup_time);
    let tx = conn.transaction()?;
    for file in files {
        // Per-file share of the archive, proportional by input size.
        let compressed_size = if group_bytes > 0 {
            (archive.compressed_size as u128 * file.size as u128 / group_bytes as u128) as i64
        } else {
            0
        };
        // The chunk guard keeps this idempotent and refuses to steal a row
        // that already belongs to another chunk.
        let n = tx.execute(
            &format!(
                "UPDATE {table} SET is_copy_success = 1, compressed = ?1, chunk_number = ?2, \
                 compressed_size = ?3, checksum = ?4, copy_status_at = ?5, updated_at = ?6 \
                 WHERE id = ?7 AND (chunk_number IS NULL OR chunk_number = ?2)"
            ),
            params![
                archive.compression_enabled,
                chunk_number,
                compressed_size,
                archive.checksum,
                copied_at,
                now,
                file.id.0,
            ],
        )?;
        if n == 0 {
            let existing: Option<Option<i64>> = tx
                .query_row(
                    &format!("SELECT chunk_number FROM {table} WHERE id = ?1"),
                    [file.id.0],
                    |row| row.get(0),
                )
                .optional()?;
            match existing {
                Some(other) => warn!(
                    "file {} already assigned to chunk {other:?}, not moving it to {chunk_number}",
                    file.id
                ),
                None => {
                    // The row raced ahead of scan persistence (or the
                    // partition was cleared); insert it in copied state.
                    let file_name = file
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    tx.execute(
                        &format!(
                            "INSERT INTO {table} (backup_set_id, file_path, file_name, file_size, \
                             file_type, compressed, compressed_size, checksum, chunk_number, \
                             is_copy_success, copy_status_at, file_metadata, created_at, updated_at) \
                             VALUES (?1, ?2, ?3, ?4, 'file', ?5, ?6, ?7, ?8, 1, ?9, '{{}}', ?10, ?10)"
                        ),
                        params![
                            set_pk.0,
                            file.path.to_string_lossy(),
                            file_name,
                            file.size as i64,
                            archive.compression_enabled,
                            compressed_size,
                            archive.checksum,
                            chunk_number,
                            copied_at,
                            now,
                        ],
                    )?;
                }
            }
        }
    }
    tx.commit()?;
    Ok(())
}

pub(super) fn set_chunk_tape_position(
    conn: &Connection,
    set_pk: SetId,
    chunk_number: u32,
    tape_block_start: u64,
) -> Result<()> {
    let table = files_table(set_pk);
    conn.execute(
        &format!("UPDATE {table} SET tape_block_start = ?1 WHERE chunk_number = ?2"),
        params![tape_block_start as i64, chunk_number],
    )?;
    Ok(())
}

/// Predicate excluding rows shadowed by a smaller-id sibling with the same
/// path. Legacy duplicates are possible; the lowest id wins, and the shadow
/// must never reach a group even after the winner has been archived.
fn not_shadowed(table: &str) -> String {
    format!(
        "NOT EXISTS (SELECT 1 FROM {table} d \
         WHERE d.backup_set_id = t.backup_set_id AND d.file_path = t.file_path AND d.id < t.id)"
    )
}

pub(super) fn min_pending_id(conn: &Connection, set_pk: SetId) -> Result<Option<FileId>> {
    if !partition_exists(conn, set_pk)? {
        return Ok(None);
    }
    let table = files_table(set_pk);
    let min: Option<i64> = conn.query_row(
        &format!(
            "SELECT MIN(t.id) FROM {table} t \
             WHERE t.backup_set_id = ?1 AND t.is_copy_success = 0 AND t.file_type = 'file' \
               AND {}",
            not_shadowed(&table)
        ),
        [set_pk.0],
        |row| row.get(0),
    )?;
    Ok(min.map(FileId))
}

pub(super) fn fetch_pending_batch(
    conn: &Connection,
    set_pk: SetId,
    cursor: FileId,
    limit: usize,
) -> Result<Vec<PendingFile>> {
    if !partition_exists(conn, set_pk)? {
        return Ok(Vec::new());
    }
    let table = files_table(set_pk);
    let mut stmt = conn.prepare(&format!(
        "SELECT t.id, t.file_path, t.file_size FROM {table} t \
         WHERE t.backup_set_id = ?1 AND t.is_copy_success = 0 AND t.file_type = 'file' \
           AND t.id > ?2 AND {} \
         ORDER BY t.id LIMIT ?3",
        not_shadowed(&table)
    ))?;
    let rows = stmt.query_map(params![set_pk.0, cursor.0, limit as i64], |row| {
        Ok(PendingFile {
            id: FileId(row.get(0)?),
            path: PathBuf::from(row.get::<_, String>(1)?),
            size: row.get::<_, i64>(2)? as u64,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub(super) fn pending_count(conn: &Connection, set_pk: SetId) -> Result<u64> {
    if !partition_exists(conn, set_pk)? {
        return Ok(0);
    }
    let table = files_table(set_pk);
    let n: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {table} t \
             WHERE t.backup_set_id = ?1 AND t.is_copy_success = 0 AND t.file_type = 'file' \
               AND {}",
            not_shadowed(&table)
        ),
        [set_pk.0],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

pub(super) fn copied_count(conn: &Connection, set_pk: SetId) -> Result<u64> {
    if !partition_exists(conn, set_pk)? {
        return Ok(0);
    }
    let table = files_table(set_pk);
    let n: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {table} \
             WHERE backup_set_id = ?1 AND is_copy_success = 1 AND file_type = 'file'"
        ),
        [set_pk.0],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

pub(super) fn count_copied_among(
    conn: &Connection,
    set_pk: SetId,
    paths: &[PathBuf],
) -> Result<u64> {
    if !partition_exists(conn, set_pk)? {
        return Ok(0);
    }
    let table = files_table(set_pk);
    let mut total = 0u64;
    for chunk in paths.chunks(MARK_CHUNK) {
        let sql = format!(
            "SELECT COUNT(DISTINCT file_path) FROM {table} \
             WHERE backup_set_id = ? AND is_copy_success = 1 AND file_path IN ({})",
            placeholders(chunk.len())
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(set_pk.0)];
        params.extend(
            chunk
                .iter()
                .map(|p| Box::new(p.to_string_lossy().into_owned()) as Box<dyn rusqlite::ToSql>),
        );
        let n: i64 = conn.query_row(
            &sql,
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            |row| row.get(0),
        )?;
        total += n as u64;
    }
    Ok(total)
}

pub(super) fn count_of_kind(conn: &Connection, set_pk: SetId, kind: FileKind) -> Result<u64> {
    if !partition_exists(conn, set_pk)? {
        return Ok(0);
    }
    let table = files_table(set_pk);
    let n: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {table} WHERE backup_set_id = ?1 AND file_type = ?2"),
        params![set_pk.0, kind.as_str()],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

pub(super) fn sum_file_bytes(conn: &Connection, set_pk: SetId) -> Result<u64> {
    if !partition_exists(conn, set_pk)? {
        return Ok(0);
    }
    let table = files_table(set_pk);
    let n: i64 = conn.query_row(
        &format!(
            "SELECT COALESCE(SUM(file_size), 0) FROM {table} \
             WHERE backup_set_id = ?1 AND file_type = 'file'"
        ),
        [set_pk.0],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

pub(super) fn sum_compressed_bytes(conn: &Connection, set_pk: SetId) -> Result<u64> {
    if !partition_exists(conn, set_pk)? {
        return Ok(0);
    }
    let table = files_table(set_pk);
    let n: i64 = conn.query_row(
        &format!(
            "SELECT COALESCE(SUM(compressed_size), 0) FROM {table} \
             WHERE backup_set_id = ?1 AND is_copy_success = 1"
        ),
        [set_pk.0],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

pub(super) fn clear_for_set(conn: &Connection, set_pk: SetId) -> Result<()> {
    if !partition_exists(conn, set_pk)? {
        return Ok(());
    }
    let table = files_table(set_pk);
    let n = conn.execute(&format!("DELETE FROM {table} WHERE backup_set_id = ?1"), [set_pk.0])?;
    debug!("cleared {n} file rows for set {set_pk}");
    Ok(())
}

pub(super) fn get_by_path(
    conn: &Connection,
    set_pk: SetId,
    path: &Path,
) -> Result<Option<BackupFile>> {
    if !partition_exists(conn, set_pk)? {
        return Ok(None);
    }
    let table = files_table(set_pk);
    conn.query_row(
        &format!(
            "SELECT * FROM {table} WHERE backup_set_id = ?1 AND file_path = ?2 \
             ORDER BY id LIMIT 1"
        ),
        params![set_pk.0, path.to_string_lossy()],
        |row| Ok(file_from_row(row)),
    )
    .optional()?
    .transpose()
}

pub(super) fn files_in_chunk(
    conn: &Connection,
    set_pk: SetId,
    chunk_number: u32,
) -> Result<Vec<BackupFile>> {
    if !partition_exists(conn, set_pk)? {
        return Ok(Vec::new());
    }
    let table = files_table(set_pk);
    let mut stmt = conn.prepare(&format!(
        "SELECT * FROM {table} WHERE backup_set_id = ?1 AND chunk_number = ?2 ORDER BY id"
    ))?;
    let rows = stmt.query_map(params![set_pk.0, chunk_number], |row| Ok(file_from_row(row)))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

pub(super) fn max_chunk_number(conn: &Connection, set_pk: SetId) -> Result<Option<u32>> {
    if !partition_exists(conn, set_pk)? {
        return Ok(None);
    }
    let table = files_table(set_pk);
    let max: Option<i64> = conn.query_row(
        &format!("SELECT MAX(chunk_number) FROM {table} WHERE backup_set_id = ?1"),
        [set_pk.0],
        |row| row.get(0),
    )?;
    Ok(max.map(|v| v as u32))
}
