//! The pipeline driver: fetch group → compress → mark → hand to tape →
//! repeat, until the scan is done and nothing is left pending.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::compress::{CompressionProgress, Compressor};
use crate::error::{EngineError, Result};
use crate::group::GroupBuilder;
use crate::tape::{TapeWriter, WriteRequest};
use tapeback_lib::{
    progress_percent, BackupSet, OperationStage, PendingFile, Settings, TaskId,
};
use tapeback_meta::{ArchiveInfo, MetaStore, TaskProgress};

/// Idle checks before the "still waiting" warning (~1 minute).
const MAX_IDLE_CHECKS: u32 = 12;
/// Repeated compression failures on the same group before the task fails.
const MAX_GROUP_FAILURES: u32 = 3;
/// Cadence of the per-archive progress refresher.
const PROGRESS_REFRESH: Duration = Duration::from_secs(2);

/// Aggregates of one compression run.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompressionOutcome {
    pub processed_files: u64,
    pub original_bytes: u64,
    pub compressed_bytes: u64,
    /// Number of chunks produced so far (also the next chunk index).
    pub chunks_written: u32,
    pub cancelled: bool,
}

pub struct CompressionWorker {
    meta: Arc<dyn MetaStore>,
    builder: GroupBuilder,
    compressor: Arc<dyn Compressor>,
    tape: Arc<TapeWriter>,
    settings: Settings,
    set: BackupSet,
    task_id: TaskId,
}

impl CompressionWorker {
    pub fn new(
        meta: Arc<dyn MetaStore>,
        builder: GroupBuilder,
        compressor: Arc<dyn Compressor>,
        tape: Arc<TapeWriter>,
        settings: Settings,
        set: BackupSet,
        task_id: TaskId,
    ) -> Self {
        CompressionWorker {
            meta,
            builder,
            compressor,
            tape,
            settings,
            set,
            task_id,
        }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<CompressionOutcome> {
        let set_pk = self.set.id;
        let mut outcome = CompressionOutcome::default();
        // Resuming continues the chunk numbering where the last run stopped.
        let mut group_idx = self
            .meta
            .max_chunk_number(set_pk)?
            .map(|c| c + 1)
            .unwrap_or(0);
        outcome.chunks_written = group_idx;
        // On resume the processed counter continues from what earlier runs
        // already archived.
        outcome.processed_files = self.meta.get_compressed_files_count(set_pk)?;

        let mut last_processed_id: i64 = 0;
        let mut wait_retry_count: u32 = 0;
        let mut idle_checks: u32 = 0;
        let mut failed_group_anchor: i64 = -1;
        let mut failure_count: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                info!("compression loop cancelled cleanly after {group_idx} chunks");
                outcome.cancelled = true;
                break;
            }

            let may_wait = wait_retry_count < self.builder.tuning().max_retries;
            let fetched =
                self.builder
                    .fetch_pending_group(set_pk, self.task_id, may_wait, last_processed_id)?;

            if fetched.files.is_empty() {
                if fetched.next_cursor < last_processed_id {
                    // Earlier pending rows appeared; reset and re-read.
                    debug!(
                        "group cursor reset: {} -> {}",
                        last_processed_id, fetched.next_cursor
                    );
                    last_processed_id = fetched.next_cursor;
                    continue;
                }
                last_processed_id = fetched.next_cursor;
                if wait_retry_count < self.builder.tuning().max_retries {
                    wait_retry_count += 1;
                }
                idle_checks += 1;

                let scan_done = self.meta.get_scan_status(self.task_id)?.is_completed();
                if scan_done {
                    let pending = self.meta.pending_files_count(set_pk)?;
                    let total_files = self.meta.get_task(self.task_id)?.total_files;
                    if pending == 0 || outcome.processed_files >= total_files {
                        info!(
                            "all files compressed, exiting loop \
                             (processed {}, total {total_files})",
                            outcome.processed_files
                        );
                        break;
                    }
                }
                if idle_checks >= MAX_IDLE_CHECKS {
                    warn!(
                        "waited ~{:?} for more files (scan not finished), still waiting",
                        self.settings.worker_poll_interval * idle_checks
                    );
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.worker_poll_interval) => {}
                    _ = cancel.cancelled() => {}
                }
                continue;
            }

            wait_retry_count = 0;
            idle_checks = 0;
            last_processed_id = fetched.next_cursor;
            let files = fetched.files;
            let group_bytes = fetched.total_size;

            info!(
                "group {}: {} files, {} bytes",
                group_idx + 1,
                files.len(),
                group_bytes
            );
            self.meta.update_task_stage(
                self.task_id,
                OperationStage::Compress,
                Some(&format!(
                    "compressing group {}: {} files, {group_bytes} bytes",
                    group_idx + 1,
                    files.len()
                )),
            )?;

            let stats = match self.compress_with_refresher(&files, group_idx, cancel).await {
                Ok(stats) => {
                    failed_group_anchor = -1;
                    failure_count = 0;
                    stats
                }
                Err(e) => {
                    let anchor = files.first().map(|f| f.id.0).unwrap_or(-1);
                    if anchor == failed_group_anchor {
                        failure_count += 1;
                    } else {
                        failed_group_anchor = anchor;
                        failure_count = 1;
                    }
                    if failure_count >= MAX_GROUP_FAILURES {
                        return Err(EngineError::Compression {
                            group_idx,
                            source: e,
                        });
                    }
                    // The files stay pending and the next fetch re-selects
                    // them; a transient bad run retries itself this way.
                    warn!(
                        "compression of group {} failed (attempt {failure_count}): {e}",
                        group_idx + 1
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = cancel.cancelled() => {}
                    }
                    continue;
                }
            };

            // Either way every row is marked before the next fetch, so the
            // next group cannot re-select these files.
            let archive = ArchiveInfo {
                archive_path: stats.path.clone(),
                compressed_size: stats.archive_size,
                checksum: stats.checksum.clone(),
                compression_enabled: stats.compression_enabled,
                backup_time: Utc::now(),
            };
            if self.settings.compress_directly_to_tape {
                // Pre-commit the reservation (`chunk_number` still NULL),
                // write inline under the tape lease, then record the chunk
                // and where it landed.
                let paths: Vec<PathBuf> = files.iter().map(|f| f.path.clone()).collect();
                let (updated, verified) = self.meta.mark_files_queued(set_pk, &paths)?;
                debug!(
                    "reserved {updated} rows for group {} (verified {verified})",
                    group_idx + 1
                );
                let position = self.hand_to_tape(stats.path.clone(), group_idx).await?;
                self.meta
                    .mark_files_copied(set_pk, &files, &archive, group_idx)?;
                if let Some(position) = position {
                    self.meta
                        .set_chunk_tape_position(set_pk, group_idx, position.block_start)?;
                }
            } else {
                self.meta
                    .mark_files_copied(set_pk, &files, &archive, group_idx)?;
                self.hand_to_tape(stats.path.clone(), group_idx).await?;
            }

            outcome.processed_files += files.len() as u64;
            outcome.original_bytes += group_bytes;
            outcome.compressed_bytes += stats.archive_size;
            let total_files = self.meta.get_task(self.task_id)?.total_files;
            self.meta.update_task_progress(
                self.task_id,
                TaskProgress {
                    processed_files: Some(outcome.processed_files),
                    processed_bytes: Some(outcome.original_bytes),
                    compressed_bytes: Some(outcome.compressed_bytes),
                    progress_percent: Some(progress_percent(
                        outcome.processed_files,
                        total_files,
                    )),
                },
            )?;

            self.post_verify(set_pk, &files, &archive, group_idx)?;

            group_idx += 1;
            outcome.chunks_written = group_idx;
        }

        Ok(outcome)
    }

    /// Run the codec on a blocking thread while a sidecar task refreshes the
    /// task row with mid-archive progress.
    async fn compress_with_refresher(
        &self,
        files: &[PendingFile],
        group_idx: u32,
        cancel: &CancellationToken,
    ) -> anyhow::Result<crate::compress::ArchiveStats> {
        let progress = Arc::new(CompressionProgress::default());
        let refresher_stop = cancel.child_token();
        let refresher = {
            let meta = self.meta.clone();
            let task_id = self.task_id;
            let progress = progress.clone();
            let stop = refresher_stop.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(PROGRESS_REFRESH) => {}
                        _ = stop.cancelled() => break,
                    }
                    let (current, total) = progress.snapshot();
                    if total == 0 {
                        continue;
                    }
                    let description = format!(
                        "compressing group {}: {current}/{total} files ({:.1}%)",
                        group_idx + 1,
                        progress.percent()
                    );
                    if let Err(e) =
                        meta.update_task_stage(task_id, OperationStage::Compress, Some(&description))
                    {
                        debug!("progress refresh failed (ignored): {e}");
                    }
                }
            })
        };

        let archive_name = format!(
            "{}_chunk{}{}",
            self.set.set_id,
            group_idx,
            self.settings.compression_method.extension()
        );
        let out_path = self.settings.staging_dir.join(archive_name);
        let compressor = self.compressor.clone();
        let files = files.to_vec();
        let progress_for_codec = progress.clone();
        let result = tokio::task::spawn_blocking(move || {
            compressor.compress_group(&files, &out_path, &progress_for_codec)
        })
        .await;

        refresher_stop.cancel();
        let _ = refresher.await;

        match result {
            Ok(res) => res,
            Err(join) => Err(anyhow::anyhow!("compression task panicked: {join}")),
        }
    }

    /// Move the archive toward the tape. In queued mode this returns `None`
    /// as soon as the writer accepted it (FIFO order and position recording
    /// are the writer's concern); in direct mode the write happens inline
    /// under the writer's lease and the position comes back to the caller.
    async fn hand_to_tape(
        &self,
        archive_path: PathBuf,
        chunk_number: u32,
    ) -> Result<Option<crate::tape::TapePosition>> {
        let set_pk = self.set.id;
        self.meta.update_task_stage(
            self.task_id,
            OperationStage::Copy,
            Some(&format!("writing chunk {chunk_number} to tape")),
        )?;

        if self.settings.compress_directly_to_tape {
            let tape = self.tape.clone();
            let path = archive_path.clone();
            let position = tokio::task::spawn_blocking(move || tape.write_serialized(&path))
                .await
                .map_err(|e| EngineError::Fatal(format!("tape write task panicked: {e}")))??;
            if let Err(e) = std::fs::remove_file(&archive_path) {
                warn!(
                    "could not remove archive {} after tape write: {e}",
                    archive_path.display()
                );
            }
            return Ok(Some(position));
        }

        // Stage into the final directory for the writer to consume.
        std::fs::create_dir_all(&self.settings.final_dir)?;
        let archive_name = archive_path
            .file_name()
            .map(|n| n.to_owned())
            .unwrap_or_default();
        let final_path = self.settings.final_dir.join(archive_name);
        move_file(&archive_path, &final_path)?;

        let meta = self.meta.clone();
        let request = WriteRequest {
            archive_path: final_path,
            set_pk,
            chunk_number,
            on_done: Box::new(move |result| match result {
                Ok(position) => {
                    if let Err(e) =
                        meta.set_chunk_tape_position(set_pk, chunk_number, position.block_start)
                    {
                        warn!("could not record tape position for chunk {chunk_number}: {e}");
                    }
                }
                Err(e) => {
                    warn!("tape write failed for chunk {chunk_number}: {e}; archive retained");
                }
            }),
        };
        self.tape.enqueue(request).await?;
        Ok(None)
    }

    /// Batched COUNT after marking; on shortfall, re-issue once. The next
    /// group-builder pass re-selects anything still missed, so the pipeline
    /// self-heals past this point.
    fn post_verify(
        &self,
        set_pk: tapeback_lib::SetId,
        files: &[PendingFile],
        archive: &ArchiveInfo,
        chunk_number: u32,
    ) -> Result<()> {
        let paths: Vec<PathBuf> = files.iter().map(|f| f.path.clone()).collect();
        let expected = {
            let mut unique = paths.clone();
            unique.sort();
            unique.dedup();
            unique.len() as u64
        };
        let confirmed = self.meta.count_copied_among(set_pk, &paths)?;
        if confirmed < expected {
            warn!(
                "post-verify shortfall on chunk {chunk_number}: {confirmed}/{expected}; \
                 re-issuing mark"
            );
            self.meta
                .mark_files_copied(set_pk, files, archive, chunk_number)?;
        }
        Ok(())
    }
}

fn move_file(from: &std::path::Path, to: &std::path::Path) -> std::io::Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        // Cross-device moves fall back to copy + remove.
        Err(_) => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)
        }
    }
}
