use chrono::Utc;
use log::debug;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{parse_opt_ts, parse_ts, ts};
use crate::error::{MetaError, Result};
use crate::{ScanTotals, TaskDraft, TaskFilter, TaskOverrides, TaskProgress};
use tapeback_lib::{
    BackupTask, OperationStage, ResultSummary, ScanStatus, TaskId, TaskStatus, TaskType,
};

const TASK_COLUMNS: &str = "id, name, task_type, source_paths, exclude_patterns, retention_days, \
     compression_enabled, encryption_enabled, description, tape_device, status, scan_status, \
     total_files, processed_files, total_bytes, processed_bytes, compressed_bytes, \
     progress_percent, operation_stage, operation_description, error_message, started_at, \
     completed_at, is_template, template_id, result_summary, created_at, updated_at";

fn task_from_row(row: &Row<'_>) -> Result<BackupTask> {
    let source_paths: String = row.get("source_paths")?;
    let exclude_patterns: String = row.get("exclude_patterns")?;
    let result_summary: String = row.get("result_summary")?;
    let task_type: String = row.get("task_type")?;
    let status: String = row.get("status")?;
    let scan_status: String = row.get("scan_status")?;
    let operation_stage: Option<String> = row.get("operation_stage")?;

    Ok(BackupTask {
        id: TaskId(row.get("id")?),
        name: row.get("name")?,
        task_type: task_type.parse::<TaskType>().map_err(invalid("task_type"))?,
        source_paths: serde_json::from_str(&source_paths).map_err(decode("source_paths"))?,
        exclude_patterns: serde_json::from_str(&exclude_patterns)
            .map_err(decode("exclude_patterns"))?,
        retention_days: row.get("retention_days")?,
        compression_enabled: row.get("compression_enabled")?,
        encryption_enabled: row.get("encryption_enabled")?,
        description: row.get("description")?,
        tape_device: row.get("tape_device")?,
        status: status.parse::<TaskStatus>().map_err(invalid("status"))?,
        scan_status: scan_status
            .parse::<ScanStatus>()
            .map_err(invalid("scan_status"))?,
        total_files: row.get::<_, i64>("total_files")? as u64,
        processed_files: row.get::<_, i64>("processed_files")? as u64,
        total_bytes: row.get::<_, i64>("total_bytes")? as u64,
        processed_bytes: row.get::<_, i64>("processed_bytes")? as u64,
        compressed_bytes: row.get::<_, i64>("compressed_bytes")? as u64,
        progress_percent: row.get("progress_percent")?,
        operation_stage: operation_stage
            .map(|s| s.parse::<OperationStage>().map_err(invalid("operation_stage")))
            .transpose()?,
        operation_description: row.get("operation_description")?,
        error_message: row.get("error_message")?,
        started_at: parse_opt_ts(row.get("started_at")?)?,
        completed_at: parse_opt_ts(row.get("completed_at")?)?,
        is_template: row.get("is_template")?,
        template_id: row.get::<_, Option<i64>>("template_id")?.map(TaskId),
        result_summary: serde_json::from_str::<ResultSummary>(&result_summary)
            .map_err(decode("result_summary"))?,
        created_at: parse_ts(&row.get::<_, String>("created_at")?)?,
        updated_at: parse_ts(&row.get::<_, String>("updated_at")?)?,
    })
}

fn invalid<E: std::fmt::Display>(what: &'static str) -> impl FnOnce(E) -> MetaError {
    move |e| MetaError::Invalid {
        what,
        reason: e.to_string(),
    }
}

fn decode(column: &'static str) -> impl FnOnce(serde_json::Error) -> MetaError {
    move |source| MetaError::Decode { column, source }
}

pub(super) fn create_template(conn: &mut Connection, draft: &TaskDraft) -> Result<TaskId> {
    let now = ts(Utc::now());
    conn.execute(
        "INSERT INTO backup_tasks (name, task_type, source_paths, exclude_patterns, \
         retention_days, compression_enabled, encryption_enabled, description, tape_device, \
         is_template, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?10, ?10)",
        params![
            draft.name,
            draft.task_type.as_str(),
            serde_json::to_string(&draft.source_paths).map_err(decode("source_paths"))?,
            serde_json::to_string(&draft.exclude_patterns).map_err(decode("exclude_patterns"))?,
            draft.retention_days,
            draft.compression_enabled,
            draft.encryption_enabled,
            draft.description,
            draft.tape_device,
            now,
        ],
    )?;
    Ok(TaskId(conn.last_insert_rowid()))
}

pub(super) fn create_from_template(conn: &mut Connection, template_id: TaskId) -> Result<TaskId> {
    let tx = conn.transaction()?;
    let template = tx
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM backup_tasks WHERE id = ?1 AND is_template = 1"),
            [template_id.0],
            |row| Ok(task_from_row(row)),
        )
        .optional()?
        .transpose()?
        .ok_or_else(|| MetaError::not_found("task template", template_id))?;

    let now = ts(Utc::now());
    tx.execute(
        "INSERT INTO backup_tasks (name, task_type, source_paths, exclude_patterns, \
         retention_days, compression_enabled, encryption_enabled, description, tape_device, \
         status, is_template, template_id, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', 0, ?10, ?11, ?11)",
        params![
            template.name,
            template.task_type.as_str(),
            serde_json::to_string(&template.source_paths).map_err(decode("source_paths"))?,
            serde_json::to_string(&template.exclude_patterns)
                .map_err(decode("exclude_patterns"))?,
            template.retention_days,
            template.compression_enabled,
            template.encryption_enabled,
            template.description,
            template.tape_device,
            template_id.0,
            now,
        ],
    )?;
    let id = TaskId(tx.last_insert_rowid());
    tx.commit()?;
    debug!("created task {id} from template {template_id}");
    Ok(id)
}

pub(super) fn get(conn: &Connection, task_id: TaskId) -> Result<BackupTask> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM backup_tasks WHERE id = ?1"),
        [task_id.0],
        |row| Ok(task_from_row(row)),
    )
    .optional()?
    .transpose()?
    .ok_or_else(|| MetaError::not_found("task", task_id))
}

pub(super) fn list(conn: &Connection, filter: &TaskFilter) -> Result<Vec<BackupTask>> {
    let mut sql = format!("SELECT {TASK_COLUMNS} FROM backup_tasks WHERE 1=1");
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(status) = filter.status {
        sql.push_str(" AND status = ?");
        args.push(Box::new(status.as_str()));
    }
    if let Some(task_type) = filter.task_type {
        sql.push_str(" AND task_type = ?");
        args.push(Box::new(task_type.as_str()));
    }
    if let Some(search) = &filter.search {
        sql.push_str(" AND name LIKE ?");
        args.push(Box::new(format!("%{search}%")));
    }
    if let Some(templates_only) = filter.templates_only {
        sql.push_str(" AND is_template = ?");
        args.push(Box::new(templates_only));
    }
    sql.push_str(" ORDER BY id DESC");
    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {limit} OFFSET {}", filter.offset));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
        Ok(task_from_row(row))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

pub(super) fn update_definition(
    conn: &Connection,
    task_id: TaskId,
    overrides: &TaskOverrides,
) -> Result<()> {
    let source_paths = overrides
        .source_paths
        .as_ref()
        .map(|p| serde_json::to_string(p))
        .transpose()
        .map_err(decode("source_paths"))?;
    let exclude_patterns = overrides
        .exclude_patterns
        .as_ref()
        .map(|p| serde_json::to_string(p))
        .transpose()
        .map_err(decode("exclude_patterns"))?;
    let n = conn.execute(
        "UPDATE backup_tasks SET \
         name = COALESCE(?1, name), \
         source_paths = COALESCE(?2, source_paths), \
         exclude_patterns = COALESCE(?3, exclude_patterns), \
         retention_days = COALESCE(?4, retention_days), \
         compression_enabled = COALESCE(?5, compression_enabled), \
         tape_device = COALESCE(?6, tape_device), \
         updated_at = ?7 \
         WHERE id = ?8 AND is_template = 0",
        params![
            overrides.name,
            source_paths,
            exclude_patterns,
            overrides.retention_days,
            overrides.compression_enabled,
            overrides.tape_device,
            ts(Utc::now()),
            task_id.0
        ],
    )?;
    if n == 0 {
        return Err(MetaError::not_found("task", task_id));
    }
    Ok(())
}

pub(super) fn delete_cascade(conn: &mut Connection, task_id: TaskId) -> Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare("SELECT id FROM backup_sets WHERE backup_task_id = ?1")?;
        let set_pks: Vec<i64> = stmt
            .query_map([task_id.0], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        for pk in set_pks {
            super::schema::drop_files_partition(&tx, tapeback_lib::SetId(pk))?;
        }
    }
    tx.execute("DELETE FROM backup_sets WHERE backup_task_id = ?1", [task_id.0])?;
    let n = tx.execute("DELETE FROM backup_tasks WHERE id = ?1", [task_id.0])?;
    tx.commit()?;
    if n == 0 {
        return Err(MetaError::not_found("task", task_id));
    }
    Ok(())
}

pub(super) fn update_status(
    conn: &Connection,
    task_id: TaskId,
    status: TaskStatus,
    error_message: Option<&str>,
) -> Result<()> {
    let now = ts(Utc::now());
    let (started_at, completed_at) = match status {
        TaskStatus::Running => (Some(now.clone()), None),
        TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
            (None, Some(now.clone()))
        }
        TaskStatus::Pending => (None, None),
    };
    let n = conn.execute(
        "UPDATE backup_tasks SET status = ?1, \
         error_message = COALESCE(?2, error_message), \
         started_at = COALESCE(?3, started_at), \
         completed_at = COALESCE(?4, completed_at), \
         updated_at = ?5 \
         WHERE id = ?6",
        params![status.as_str(), error_message, started_at, completed_at, now, task_id.0],
    )?;
    if n == 0 {
        return Err(MetaError::not_found("task", task_id));
    }
    Ok(())
}

pub(super) fn update_progress(
    conn: &Connection,
    task_id: TaskId,
    progress: TaskProgress,
) -> Result<()> {
    // max() keeps the counters monotone even if a stale writer lands late.
    let n = conn.execute(
        "UPDATE backup_tasks SET \
         processed_files = max(processed_files, COALESCE(?1, processed_files)), \
         processed_bytes = max(processed_bytes, COALESCE(?2, processed_bytes)), \
         compressed_bytes = max(compressed_bytes, COALESCE(?3, compressed_bytes)), \
         progress_percent = max(progress_percent, COALESCE(?4, progress_percent)), \
         updated_at = ?5 \
         WHERE id = ?6",
        params![
            progress.processed_files.map(|v| v as i64),
            progress.processed_bytes.map(|v| v as i64),
            progress.compressed_bytes.map(|v| v as i64),
            progress.progress_percent,
            ts(Utc::now()),
            task_id.0
        ],
    )?;
    if n == 0 {
        return Err(MetaError::not_found("task", task_id));
    }
    Ok(())
}

pub(super) fn update_stage(
    conn: &Connection,
    task_id: TaskId,
    stage: OperationStage,
    description: Option<&str>,
) -> Result<()> {
    let n = conn.execute(
        "UPDATE backup_tasks SET operation_stage = ?1, \
         operation_description = COALESCE(?2, operation_description), updated_at = ?3 \
         WHERE id = ?4",
        params![stage.as_str(), description, ts(Utc::now()), task_id.0],
    )?;
    if n == 0 {
        return Err(MetaError::not_found("task", task_id));
    }
    Ok(())
}

pub(super) fn update_scan_totals(
    conn: &mut Connection,
    task_id: TaskId,
    totals: ScanTotals,
) -> Result<()> {
    let tx = conn.transaction()?;
    let raw: String = tx
        .query_row(
            "SELECT result_summary FROM backup_tasks WHERE id = ?1",
            [task_id.0],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| MetaError::not_found("task", task_id))?;
    let mut summary: ResultSummary =
        serde_json::from_str(&raw).map_err(decode("result_summary"))?;
    summary.estimated_archive_count = totals.estimated_archive_count;
    summary.total_scanned_files = totals.total_files;
    summary.total_scanned_bytes = totals.total_bytes;

    tx.execute(
        "UPDATE backup_tasks SET total_files = ?1, total_bytes = ?2, result_summary = ?3, \
         updated_at = ?4 WHERE id = ?5",
        params![
            totals.total_files as i64,
            totals.total_bytes as i64,
            serde_json::to_string(&summary).map_err(decode("result_summary"))?,
            ts(Utc::now()),
            task_id.0
        ],
    )?;
    tx.commit()?;
    Ok(())
}

pub(super) fn get_scan_status(conn: &Connection, task_id: TaskId) -> Result<ScanStatus> {
    let raw: String = conn
        .query_row(
            "SELECT scan_status FROM backup_tasks WHERE id = ?1",
            [task_id.0],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| MetaError::not_found("task", task_id))?;
    raw.parse::<ScanStatus>().map_err(invalid("scan_status"))
}

pub(super) fn advance_scan_status(
    conn: &mut Connection,
    task_id: TaskId,
    status: ScanStatus,
) -> Result<()> {
    let tx = conn.transaction()?;
    let raw: String = tx
        .query_row(
            "SELECT scan_status FROM backup_tasks WHERE id = ?1",
            [task_id.0],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| MetaError::not_found("task", task_id))?;
    let current = raw.parse::<ScanStatus>().map_err(invalid("scan_status"))?;
    if current.may_advance_to(status) {
        tx.execute(
            "UPDATE backup_tasks SET scan_status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), ts(Utc::now()), task_id.0],
        )?;
    } else if current != status {
        debug!("ignoring backward scan_status transition {current} -> {status} for task {task_id}");
    }
    tx.commit()?;
    Ok(())
}
