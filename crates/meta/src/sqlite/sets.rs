use chrono::{DateTime, Utc};
use log::info;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{opt_ts, parse_opt_ts, parse_ts, schema, ts};
use crate::error::{MetaError, Result};
use crate::SetFilter;
use tapeback_lib::{format_set_id, BackupSet, BackupTask, SetId, SetStatus, TaskId};

const SET_COLUMNS: &str = "id, set_id, backup_task_id, tape_id, status, total_files, \
     total_bytes, compressed_bytes, compression_ratio, chunk_count, retention_until, created_at";

fn set_from_row(row: &Row<'_>) -> Result<BackupSet> {
    let status: String = row.get("status")?;
    Ok(BackupSet {
        id: SetId(row.get("id")?),
        set_id: row.get("set_id")?,
        backup_task_id: TaskId(row.get("backup_task_id")?),
        tape_id: row.get("tape_id")?,
        status: status.parse::<SetStatus>().map_err(|reason| MetaError::Invalid {
            what: "set status",
            reason,
        })?,
        total_files: row.get::<_, i64>("total_files")? as u64,
        total_bytes: row.get::<_, i64>("total_bytes")? as u64,
        compressed_bytes: row.get::<_, i64>("compressed_bytes")? as u64,
        compression_ratio: row.get("compression_ratio")?,
        chunk_count: row.get("chunk_count")?,
        retention_until: parse_opt_ts(row.get("retention_until")?)?,
        created_at: parse_ts(&row.get::<_, String>("created_at")?)?,
    })
}

pub(super) fn create(
    conn: &mut Connection,
    task: &BackupTask,
    tape_id: Option<&str>,
    retention_until: Option<DateTime<Utc>>,
) -> Result<BackupSet> {
    let created_at = Utc::now();
    let set_id = format_set_id(created_at, task.id);

    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO backup_sets (set_id, backup_task_id, tape_id, status, retention_until, \
         created_at) VALUES (?1, ?2, ?3, 'active', ?4, ?5)",
        params![set_id, task.id.0, tape_id, opt_ts(retention_until), ts(created_at)],
    )?;
    let pk = SetId(tx.last_insert_rowid());
    schema::create_files_partition(&tx, pk)?;
    tx.commit()?;

    // Commit-and-verify: the caller is entitled to read this row back
    // immediately, so confirm it is observable before returning.
    let set = get(conn, pk)?;
    info!("created backup set {} (pk {pk}) for task {}", set.set_id, task.id);
    Ok(set)
}

pub(super) fn get(conn: &Connection, set_pk: SetId) -> Result<BackupSet> {
    conn.query_row(
        &format!("SELECT {SET_COLUMNS} FROM backup_sets WHERE id = ?1"),
        [set_pk.0],
        |row| Ok(set_from_row(row)),
    )
    .optional()?
    .transpose()?
    .ok_or_else(|| MetaError::not_found("backup set", set_pk))
}

pub(super) fn get_by_set_id(conn: &Connection, set_id: &str) -> Result<Option<BackupSet>> {
    conn.query_row(
        &format!("SELECT {SET_COLUMNS} FROM backup_sets WHERE set_id = ?1 ORDER BY id LIMIT 1"),
        [set_id],
        |row| Ok(set_from_row(row)),
    )
    .optional()?
    .transpose()
}

pub(super) fn find_incomplete_execution(
    conn: &Connection,
    template_id: TaskId,
) -> Result<Option<(BackupTask, BackupSet)>> {
    let found = conn
        .query_row(
            "SELECT s.id FROM backup_sets s \
             JOIN backup_tasks t ON t.id = s.backup_task_id \
             WHERE t.template_id = ?1 AND t.is_template = 0 \
               AND t.status IN ('pending', 'running', 'failed', 'cancelled') \
               AND s.status = 'active' \
             ORDER BY s.id DESC LIMIT 1",
            [template_id.0],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    match found {
        None => Ok(None),
        Some(set_pk) => {
            let set = get(conn, SetId(set_pk))?;
            let task = super::tasks::get(conn, set.backup_task_id)?;
            Ok(Some((task, set)))
        }
    }
}

pub(super) fn list(conn: &Connection, filter: &SetFilter) -> Result<Vec<BackupSet>> {
    let mut sql = format!("SELECT {SET_COLUMNS} FROM backup_sets WHERE 1=1");
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(task_id) = filter.backup_task_id {
        sql.push_str(" AND backup_task_id = ?");
        args.push(Box::new(task_id.0));
    }
    if let Some(status) = filter.status {
        sql.push_str(" AND status = ?");
        args.push(Box::new(status.as_str()));
    }
    sql.push_str(" ORDER BY id DESC");
    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {limit} OFFSET {}", filter.offset));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
        |row| Ok(set_from_row(row)),
    )?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

pub(super) fn finalize(
    conn: &Connection,
    set_pk: SetId,
    file_count: u64,
    total_bytes: u64,
    compressed_bytes: u64,
    chunk_count: u32,
) -> Result<()> {
    let ratio = if total_bytes > 0 {
        compressed_bytes as f64 / total_bytes as f64
    } else {
        0.0
    };
    let n = conn.execute(
        "UPDATE backup_sets SET status = 'completed', total_files = ?1, total_bytes = ?2, \
         compressed_bytes = ?3, compression_ratio = ?4, chunk_count = ?5 WHERE id = ?6",
        params![
            file_count as i64,
            total_bytes as i64,
            compressed_bytes as i64,
            ratio,
            chunk_count,
            set_pk.0
        ],
    )?;
    if n == 0 {
        return Err(MetaError::not_found("backup set", set_pk));
    }
    info!(
        "finalized backup set {set_pk}: {file_count} files, {total_bytes} bytes, \
         {chunk_count} chunks, ratio {ratio:.3}"
    );
    Ok(())
}

pub(super) fn set_status(conn: &Connection, set_pk: SetId, status: SetStatus) -> Result<()> {
    let n = conn.execute(
        "UPDATE backup_sets SET status = ?1 WHERE id = ?2",
        params![status.as_str(), set_pk.0],
    )?;
    if n == 0 {
        return Err(MetaError::not_found("backup set", set_pk));
    }
    Ok(())
}

pub(super) fn delete(conn: &mut Connection, set_pk: SetId) -> Result<()> {
    let tx = conn.transaction()?;
    schema::drop_files_partition(&tx, set_pk)?;
    let n = tx.execute("DELETE FROM backup_sets WHERE id = ?1", [set_pk.0])?;
    tx.commit()?;
    if n == 0 {
        return Err(MetaError::not_found("backup set", set_pk));
    }
    Ok(())
}
