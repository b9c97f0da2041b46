//! In-memory staging ahead of the metadata store.
//!
//! The scanner can outrun any database. [`StagingBuffer`] absorbs the burst:
//! records queue in memory with monotonically assigned staging ids, a single
//! background drainer flushes them to [`MetaStore`] in batches, and a hard
//! cap turns into backpressure on `add_files`. Rows are never dropped on
//! store failure: they stay queued with their error until a later drain
//! succeeds, and optional checkpoints make the queue survive an unclean
//! shutdown.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use tapeback_lib::{FileRecord, Settings, SetId};
use tapeback_meta::{MetaError, MetaStore};

/// How long a blocked `add_files` waits on a non-draining store before the
/// run is declared dead.
const RECOVERY_WINDOW: Duration = Duration::from_secs(120);

/// How records reach the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StagingMode {
    /// Straight through to bulk inserts; used when the backend keeps up.
    Direct,
    /// Buffer in memory, drain in the background.
    Buffered,
}

#[derive(Clone, Debug)]
pub struct StagingConfig {
    pub mode: StagingMode,
    pub sync_batch_size: usize,
    pub sync_interval: Duration,
    pub max_memory_files: usize,
    pub checkpoint_interval: Duration,
    pub checkpoint_retention: Duration,
    /// None disables checkpointing.
    pub checkpoint_dir: Option<PathBuf>,
}

impl StagingConfig {
    pub fn from_settings(settings: &Settings, mode: StagingMode) -> Self {
        StagingConfig {
            mode,
            sync_batch_size: settings.staging_sync_batch_size,
            sync_interval: settings.staging_sync_interval,
            max_memory_files: settings.staging_max_files,
            checkpoint_interval: settings.staging_checkpoint_interval,
            checkpoint_retention: Duration::from_secs(
                settings.staging_checkpoint_retention_hours * 3600,
            ),
            checkpoint_dir: Some(settings.checkpoint_dir.clone()),
        }
    }
}

struct StagedRow {
    staging_id: u64,
    record: FileRecord,
    sync_error: Option<String>,
}

#[derive(Default)]
struct State {
    rows: VecDeque<StagedRow>,
    next_id: u64,
    total_added: u64,
    total_synced: u64,
    last_checkpoint: Option<SystemTime>,
}

impl State {
    /// Highest staging id below which everything has synced. Failed rows
    /// stay queued at their position, so this is simply "just before the
    /// oldest remaining row".
    fn synced_watermark(&self) -> u64 {
        match self.rows.front() {
            Some(row) => row.staging_id.saturating_sub(1),
            None => self.next_id.saturating_sub(1),
        }
    }
}

/// What `stop()` reports back.
#[derive(Debug)]
pub struct StagingReport {
    pub total_added: u64,
    pub total_synced: u64,
    /// Rows the store never accepted; non-zero only on permanent store
    /// failure, in which case the checkpoint is preserved.
    pub unsynced: usize,
}

#[derive(Clone)]
pub struct StagingBuffer {
    inner: Arc<Inner>,
}

struct Inner {
    meta: Arc<dyn MetaStore>,
    set_pk: SetId,
    cfg: StagingConfig,
    state: Mutex<State>,
    drain_signal: Notify,
    space_signal: Notify,
    drain_gate: tokio::sync::Mutex<()>,
}

impl StagingBuffer {
    pub fn new(meta: Arc<dyn MetaStore>, set_pk: SetId, cfg: StagingConfig) -> Self {
        if let Some(dir) = &cfg.checkpoint_dir {
            if let Err(e) = cleanup_stale_checkpoints(dir, cfg.checkpoint_retention) {
                warn!("could not clean stale checkpoints in {}: {e}", dir.display());
            }
        }
        StagingBuffer {
            inner: Arc::new(Inner {
                meta,
                set_pk,
                cfg,
                state: Mutex::new(State::default()),
                drain_signal: Notify::new(),
                space_signal: Notify::new(),
                drain_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Accept a batch of scanned records.
    ///
    /// In buffered mode this only errors if the caller raced `stop()`; store
    /// trouble is absorbed by the drainer. In direct mode per-record store
    /// failures are logged, not raised.
    pub async fn add_files(&self, records: Vec<FileRecord>) -> Result<(), MetaError> {
        if records.is_empty() {
            return Ok(());
        }
        match self.inner.cfg.mode {
            StagingMode::Direct => {
                let outcome = self
                    .inner
                    .meta
                    .batch_insert_scanned_files(self.inner.set_pk, &records)?;
                for (index, error) in &outcome.errors {
                    warn!("direct staging insert failed for record {index}: {error}");
                }
                Ok(())
            }
            StagingMode::Buffered => {
                // Block while the buffer is at the cap; the drainer frees
                // space as batches commit. A store that stops accepting rows
                // altogether must not hang the scan forever, so the wait is
                // bounded by a recovery window.
                let deadline = std::time::Instant::now() + RECOVERY_WINDOW;
                loop {
                    let space = self.inner.space_signal.notified();
                    {
                        let state = self.inner.state.lock();
                        if state.rows.len() < self.inner.cfg.max_memory_files {
                            break;
                        }
                    }
                    if std::time::Instant::now() >= deadline {
                        return Err(MetaError::Conflict(
                            "staging buffer full and the store is not draining".into(),
                        ));
                    }
                    self.inner.drain_signal.notify_one();
                    let _ = tokio::time::timeout(Duration::from_secs(5), space).await;
                }

                let trigger = {
                    let mut state = self.inner.state.lock();
                    for record in records {
                        let staging_id = state.next_id;
                        state.next_id += 1;
                        state.total_added += 1;
                        state.rows.push_back(StagedRow {
                            staging_id,
                            record,
                            sync_error: None,
                        });
                    }
                    state.rows.len() >= self.inner.cfg.sync_batch_size
                };
                if trigger {
                    self.inner.drain_signal.notify_one();
                }
                Ok(())
            }
        }
    }

    /// Spawn the background drainer. One per buffer; triggers coalesce into
    /// the running loop.
    pub fn spawn_drainer(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.drain_signal.notified() => {}
                    _ = tokio::time::sleep(inner.cfg.sync_interval) => {}
                    _ = cancel.cancelled() => break,
                }
                inner.drain_once().await;
                inner.maybe_checkpoint();
            }
            // Exit path: everything still queued gets a last chance.
            inner.drain_to_empty().await;
        })
    }

    /// Drain until the queue is empty or the store stops making progress.
    pub async fn flush(&self) -> usize {
        self.inner.drain_to_empty().await
    }

    /// Final flush + checkpoint accounting. The buffer stays usable, but by
    /// contract this is the last call of a run.
    pub async fn stop(&self) -> StagingReport {
        let unsynced = self.flush().await;
        let state = self.inner.state.lock();
        let report = StagingReport {
            total_added: state.total_added,
            total_synced: state.total_synced,
            unsynced,
        };
        drop(state);
        if report.unsynced == 0 {
            self.inner.remove_obsolete_checkpoints();
        } else {
            warn!(
                "staging buffer stopping with {} unsynced rows; checkpoint preserved",
                report.unsynced
            );
            self.inner.maybe_checkpoint_forced();
        }
        report
    }

    pub fn queued(&self) -> usize {
        self.inner.state.lock().rows.len()
    }
}

impl Inner {
    async fn drain_once(&self) {
        let _gate = self.drain_gate.lock().await;
        loop {
            let batch: Vec<(u64, FileRecord)> = {
                let state = self.state.lock();
                state
                    .rows
                    .iter()
                    .take(self.cfg.sync_batch_size)
                    .map(|row| (row.staging_id, row.record.clone()))
                    .collect()
            };
            if batch.is_empty() {
                return;
            }
            let records: Vec<FileRecord> = batch.iter().map(|(_, r)| r.clone()).collect();
            match self.meta.batch_insert_scanned_files(self.set_pk, &records) {
                Ok(outcome) => {
                    let failed: Vec<usize> = outcome.errors.iter().map(|(i, _)| *i).collect();
                    for (index, error) in &outcome.errors {
                        warn!("staging sync failed for record {index}: {error}");
                    }
                    let synced = self.retire_batch(&batch, &failed, &outcome.errors);
                    debug!(
                        "staging drain: {synced} rows synced, {} failed, {} still queued",
                        failed.len(),
                        self.state.lock().rows.len()
                    );
                    self.space_signal.notify_waiters();
                    if !failed.is_empty() {
                        // Leave failed rows for a later pass instead of
                        // spinning on them.
                        return;
                    }
                    let more = {
                        let state = self.state.lock();
                        state.rows.len() >= self.cfg.sync_batch_size
                    };
                    if !more {
                        return;
                    }
                }
                Err(e) => {
                    warn!("staging drain batch failed entirely: {e}");
                    let mut state = self.state.lock();
                    let message = e.to_string();
                    for row in state.rows.iter_mut().take(batch.len()) {
                        row.sync_error = Some(message.clone());
                    }
                    return;
                }
            }
        }
    }

    /// Remove the synced rows of `batch` from the queue, keep the failed
    /// ones (annotated) in place. Returns how many retired.
    fn retire_batch(
        &self,
        batch: &[(u64, FileRecord)],
        failed_indices: &[usize],
        errors: &[(usize, MetaError)],
    ) -> usize {
        let mut state = self.state.lock();
        let mut retired = 0;
        for (index, (staging_id, _)) in batch.iter().enumerate() {
            if failed_indices.contains(&index) {
                if let Some(row) = state.rows.iter_mut().find(|r| r.staging_id == *staging_id) {
                    row.sync_error = errors
                        .iter()
                        .find(|(i, _)| i == &index)
                        .map(|(_, e)| e.to_string());
                }
                continue;
            }
            if let Some(pos) = state.rows.iter().position(|r| r.staging_id == *staging_id) {
                state.rows.remove(pos);
                state.total_synced += 1;
                retired += 1;
            }
        }
        retired
    }

    async fn drain_to_empty(&self) -> usize {
        let mut previous = usize::MAX;
        loop {
            let remaining = self.state.lock().rows.len();
            if remaining == 0 || remaining >= previous {
                return remaining;
            }
            previous = remaining;
            self.drain_once().await;
        }
    }

    fn maybe_checkpoint(&self) {
        let due = {
            let state = self.state.lock();
            if state.rows.is_empty() {
                false
            } else {
                match state.last_checkpoint {
                    None => true,
                    Some(at) => at.elapsed().unwrap_or_default() >= self.cfg.checkpoint_interval,
                }
            }
        };
        if due {
            self.maybe_checkpoint_forced();
        }
        self.remove_obsolete_checkpoints();
    }

    fn maybe_checkpoint_forced(&self) {
        let Some(dir) = &self.cfg.checkpoint_dir else {
            return;
        };
        let result = {
            let state = self.state.lock();
            write_checkpoint(dir, &state.rows)
        };
        match result {
            Ok(Some(path)) => {
                debug!("staging checkpoint written: {}", path.display());
                self.state.lock().last_checkpoint = Some(SystemTime::now());
            }
            Ok(None) => {}
            Err(e) => warn!("staging checkpoint failed: {e}"),
        }
    }

    fn remove_obsolete_checkpoints(&self) {
        let Some(dir) = &self.cfg.checkpoint_dir else {
            return;
        };
        let watermark = self.state.lock().synced_watermark();
        if let Err(e) = remove_synced_checkpoints(dir, watermark) {
            warn!("checkpoint cleanup failed: {e}");
        }
    }
}

fn checkpoint_path(dir: &Path) -> PathBuf {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    dir.join(format!("tmp{ms}.sql"))
}

/// Serialize the queued rows: a header line carrying the highest staging id,
/// then one JSON record per line. The `.sql` suffix is a compatibility
/// convention, the body is JSON lines.
fn write_checkpoint(dir: &Path, rows: &VecDeque<StagedRow>) -> std::io::Result<Option<PathBuf>> {
    if rows.is_empty() {
        return Ok(None);
    }
    std::fs::create_dir_all(dir)?;
    let path = checkpoint_path(dir);
    let mut out = std::fs::File::create(&path)?;
    let max_id = rows.back().map(|r| r.staging_id).unwrap_or(0);
    writeln!(out, "{}", serde_json::json!({ "max_id": max_id }))?;
    for row in rows {
        let line = serde_json::json!({
            "staging_id": row.staging_id,
            "record": row.record,
            "sync_error": row.sync_error,
        });
        writeln!(out, "{line}")?;
    }
    out.sync_all()?;
    Ok(Some(path))
}

/// Read the records of one checkpoint file back.
pub fn read_checkpoint(path: &Path) -> std::io::Result<Vec<FileRecord>> {
    let file = std::fs::File::open(path)?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines().skip(1) {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(&line)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if let Some(record) = value.get("record") {
            let record: FileRecord = serde_json::from_value(record.clone())
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            records.push(record);
        }
    }
    Ok(records)
}

fn checkpoint_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let path = entry?.path();
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        if let Some(name) = name {
            if name.starts_with("tmp") && name.ends_with(".sql") {
                files.push(path);
            }
        }
    }
    Ok(files)
}

/// Delete checkpoints fully covered by the synced watermark.
fn remove_synced_checkpoints(dir: &Path, watermark: u64) -> std::io::Result<()> {
    for path in checkpoint_files(dir)? {
        let covered = {
            let file = std::fs::File::open(&path)?;
            let mut header = String::new();
            BufReader::new(file).read_line(&mut header)?;
            serde_json::from_str::<serde_json::Value>(&header)
                .ok()
                .and_then(|v| v.get("max_id").and_then(|m| m.as_u64()))
                .is_some_and(|max_id| max_id <= watermark)
        };
        if covered {
            std::fs::remove_file(&path)?;
            debug!("removed synced checkpoint {}", path.display());
        }
    }
    Ok(())
}

/// Startup sweep: checkpoints beyond the retention window are dead weight.
fn cleanup_stale_checkpoints(dir: &Path, retention: Duration) -> std::io::Result<()> {
    for path in checkpoint_files(dir)? {
        let stale = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .map(|modified| modified.elapsed().unwrap_or_default() > retention)
            .unwrap_or(false);
        if stale {
            info!("removing stale checkpoint {}", path.display());
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}
