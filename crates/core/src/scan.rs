//! Filesystem scanning: walk the task's source roots and feed records into
//! the staging buffer.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::error::Result;
use crate::staging::StagingBuffer;
use tapeback_lib::{ExcludeSet, FileKind, FileRecord, ScanStatus, TaskId};
use tapeback_meta::{MetaStore, ScanTotals};

/// Record batch size between staging handoffs.
const SCAN_BATCH: usize = 512;

/// Source of scan entries. The engine consumes this; [`WalkScanner`] is the
/// shipped walkdir-backed implementation.
pub trait Scanner: Send {
    /// Next record, `None` when exhausted. Unreadable entries are logged
    /// and skipped inside the scanner, they do not surface here.
    fn next_entry(&mut self) -> Option<FileRecord>;
}

pub struct WalkScanner {
    roots: VecDeque<PathBuf>,
    excludes: ExcludeSet,
    current: Option<walkdir::IntoIter>,
}

impl WalkScanner {
    pub fn new(roots: &[PathBuf], excludes: ExcludeSet) -> Self {
        WalkScanner {
            roots: roots.iter().cloned().collect(),
            excludes,
            current: None,
        }
    }

    fn record_for(entry: &walkdir::DirEntry) -> Option<FileRecord> {
        let kind = if entry.file_type().is_symlink() {
            FileKind::Symlink
        } else if entry.file_type().is_dir() {
            FileKind::Directory
        } else {
            FileKind::File
        };
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("skipping unreadable entry {}: {e}", entry.path().display());
                return None;
            }
        };
        let size = if kind == FileKind::File { metadata.len() } else { 0 };
        let mut record = FileRecord::new(entry.path().to_owned(), size, kind);
        record.modified = metadata.modified().ok().map(DateTime::<Utc>::from);
        record.accessed = metadata.accessed().ok().map(DateTime::<Utc>::from);
        record.created = metadata.created().ok().map(DateTime::<Utc>::from);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            record.permissions = Some(metadata.permissions().mode());
        }
        Some(record)
    }
}

impl Scanner for WalkScanner {
    fn next_entry(&mut self) -> Option<FileRecord> {
        loop {
            let iter = match &mut self.current {
                Some(iter) => iter,
                None => {
                    let root = self.roots.pop_front()?;
                    debug!("scanning root {}", root.display());
                    self.current = Some(WalkDir::new(root).follow_links(false).into_iter());
                    continue;
                }
            };
            match iter.next() {
                None => {
                    self.current = None;
                }
                Some(Err(e)) => {
                    // Counted toward neither total.
                    warn!("skipping unreadable entry: {e}");
                }
                Some(Ok(entry)) => {
                    if self.excludes.matches(entry.path()) {
                        if entry.file_type().is_dir() {
                            iter.skip_current_dir();
                        }
                        continue;
                    }
                    if let Some(record) = Self::record_for(&entry) {
                        return Some(record);
                    }
                }
            }
        }
    }
}

/// Totals observed by one scan run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Regular files only; directories and symlinks are recorded but not
    /// counted.
    pub total_files: u64,
    pub total_bytes: u64,
    pub cancelled: bool,
}

pub struct ScanWorker {
    meta: Arc<dyn MetaStore>,
    staging: StagingBuffer,
    task_id: TaskId,
    max_file_size: u64,
    update_records: u64,
    update_interval: Duration,
}

impl ScanWorker {
    pub fn new(
        meta: Arc<dyn MetaStore>,
        staging: StagingBuffer,
        task_id: TaskId,
        max_file_size: u64,
        update_records: u64,
        update_interval: Duration,
    ) -> Self {
        ScanWorker {
            meta,
            staging,
            task_id,
            max_file_size,
            update_records: update_records.max(1),
            update_interval,
        }
    }

    /// Drive the scanner to exhaustion, batching records into the staging
    /// buffer and persisting progress periodically. `cancel` is observed
    /// between iterator steps: a cancelled scan records its partial totals
    /// and returns without error, leaving `scan_status` short of
    /// `Completed`.
    pub async fn run(
        &self,
        mut scanner: impl Scanner,
        cancel: &CancellationToken,
    ) -> Result<ScanOutcome, crate::EngineError> {
        self.meta.advance_scan_status(self.task_id, ScanStatus::Running)?;

        let mut outcome = ScanOutcome::default();
        let mut batch: Vec<FileRecord> = Vec::with_capacity(SCAN_BATCH);
        let mut since_update = 0u64;
        let mut last_update = Instant::now();

        loop {
            if cancel.is_cancelled() {
                self.staging.add_files(std::mem::take(&mut batch)).await?;
                self.staging.flush().await;
                self.persist_totals(&outcome)?;
                info!(
                    "scan cancelled after {} files / {} bytes",
                    outcome.total_files, outcome.total_bytes
                );
                outcome.cancelled = true;
                return Ok(outcome);
            }
            let Some(record) = scanner.next_entry() else {
                break;
            };
            if record.kind == FileKind::File {
                outcome.total_files += 1;
                outcome.total_bytes += record.size;
            }
            batch.push(record);
            since_update += 1;
            if batch.len() >= SCAN_BATCH {
                self.staging.add_files(std::mem::take(&mut batch)).await?;
            }
            if since_update >= self.update_records || last_update.elapsed() >= self.update_interval
            {
                self.persist_totals(&outcome)?;
                since_update = 0;
                last_update = Instant::now();
            }
        }

        self.staging.add_files(std::mem::take(&mut batch)).await?;
        // Everything must be queryable before `Completed` becomes visible,
        // or the group builder could see "scan done, nothing pending" while
        // records still sit in memory.
        let unsynced = self.staging.flush().await;
        if unsynced > 0 {
            return Err(crate::EngineError::Fatal(format!(
                "{unsynced} scanned records could not be persisted"
            )));
        }
        self.persist_totals(&outcome)?;
        self.meta
            .advance_scan_status(self.task_id, ScanStatus::Completed)?;
        info!(
            "scan completed: {} files, {} bytes",
            outcome.total_files, outcome.total_bytes
        );
        Ok(outcome)
    }

    fn persist_totals(&self, outcome: &ScanOutcome) -> Result<(), tapeback_meta::MetaError> {
        self.meta.update_scan_totals(
            self.task_id,
            ScanTotals {
                total_files: outcome.total_files,
                total_bytes: outcome.total_bytes,
                estimated_archive_count: outcome.total_bytes.div_ceil(self.max_file_size.max(1)),
            },
        )
    }
}
