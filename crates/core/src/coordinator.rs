//! Orchestration of a single task execution: locks and pre-checks, worker
//! startup and shutdown, finalize and failure handling.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Months, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::compress::Compressor;
use crate::error::{EngineError, Result};
use crate::group::GroupBuilder;
use crate::notify::{Notification, Notifier};
use crate::scan::{ScanWorker, WalkScanner};
use crate::staging::{StagingBuffer, StagingConfig, StagingMode};
use crate::tape::{TapeDrive, TapeWriter};
use crate::worker::CompressionWorker;
use tapeback_lib::{
    BackupSet, BackupTask, ExcludeSet, FileKind, OperationStage, SetId, SetStatus, Settings,
    TaskId, TaskStatus, TaskType,
};
use tapeback_meta::{MetaError, MetaStore, TaskProgress};

/// How a manual run treats an earlier interrupted execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunMode {
    /// Resume if an incomplete execution exists, otherwise start fresh.
    #[default]
    Auto,
    /// Reattach to the incomplete execution; error if there is none.
    Resume,
    /// Discard the incomplete execution's file state and start over.
    Restart,
}

/// The schedule period backing the idempotency check for non-manual runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulePeriod {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl SchedulePeriod {
    /// Whether `last` and `now` fall into the same period.
    pub fn same_period(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            SchedulePeriod::Daily => last.date_naive() == now.date_naive(),
            SchedulePeriod::Weekly => {
                let (ly, lw) = (last.iso_week().year(), last.iso_week().week());
                let (ny, nw) = (now.iso_week().year(), now.iso_week().week());
                ly == ny && lw == nw
            }
            SchedulePeriod::Monthly => last.year() == now.year() && last.month() == now.month(),
            SchedulePeriod::Yearly => last.year() == now.year(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub mode: RunMode,
    /// Manual runs skip the schedule-period check and never trigger the
    /// pre-run tape erase.
    pub manual: bool,
    pub force_rescan: bool,
    pub schedule: Option<SchedulePeriod>,
    /// Last successful run of this schedule, for the period check.
    pub last_success: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Skipped(String),
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct ExecutionReport {
    pub outcome: ExecutionOutcome,
    pub task_id: Option<TaskId>,
    pub set_pk: Option<SetId>,
    pub chunk_count: u32,
    pub total_files: u64,
    pub total_bytes: u64,
    pub compressed_bytes: u64,
}

impl ExecutionReport {
    fn skipped(reason: impl Into<String>) -> Self {
        ExecutionReport {
            outcome: ExecutionOutcome::Skipped(reason.into()),
            task_id: None,
            set_pk: None,
            chunk_count: 0,
            total_files: 0,
            total_bytes: 0,
            compressed_bytes: 0,
        }
    }
}

pub struct TaskCoordinator {
    meta: Arc<dyn MetaStore>,
    drive: Arc<dyn TapeDrive>,
    compressor: Arc<dyn Compressor>,
    notifier: Arc<dyn Notifier>,
    settings: Settings,
    /// Per-anchor execution locks: anchor task id -> start time.
    locks: Mutex<HashMap<i64, DateTime<Utc>>>,
}

impl TaskCoordinator {
    pub fn new(
        meta: Arc<dyn MetaStore>,
        drive: Arc<dyn TapeDrive>,
        compressor: Arc<dyn Compressor>,
        notifier: Arc<dyn Notifier>,
        settings: Settings,
    ) -> Self {
        TaskCoordinator {
            meta,
            drive,
            compressor,
            notifier,
            settings,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Execute a backup anchored at `anchor`: a template (cloned or resumed
    /// per `opts.mode`) or a pending non-template task.
    pub async fn execute(
        &self,
        anchor: TaskId,
        opts: RunOptions,
        cancel: CancellationToken,
    ) -> Result<ExecutionReport> {
        let anchor_task = self.meta.get_task(anchor)?;

        // Per-anchor execution lock. A same-day holder means a duplicate
        // trigger; a holder past 24h is presumed dead.
        {
            let mut locks = self.locks.lock();
            if let Some(&started) = locks.get(&anchor.0) {
                let now = Utc::now();
                if now - started >= chrono::Duration::hours(24) {
                    warn!(
                        "execution lock for task {anchor} held since {started}, \
                         proceeding anyway"
                    );
                } else if started.date_naive() == now.date_naive() {
                    return Ok(ExecutionReport::skipped(
                        "an execution of this task already started today",
                    ));
                } else {
                    return Ok(ExecutionReport::skipped("another execution is running"));
                }
            }
            locks.insert(anchor.0, Utc::now());
        }
        let _unlock = scopeguard::guard((), |_| {
            self.locks.lock().remove(&anchor.0);
        });

        // Schedule-period idempotency for non-manual runs.
        if !opts.manual {
            if let (Some(period), Some(last)) = (opts.schedule, opts.last_success) {
                if period.same_period(last, Utc::now()) {
                    info!("skipping task {anchor}: already succeeded in the current period");
                    return Ok(ExecutionReport::skipped("already ran in the current period"));
                }
            }
        }

        let targets_tape = anchor_task.tape_device.is_some();
        if targets_tape {
            self.check_tape_label()?;
            let is_full = matches!(anchor_task.task_type, TaskType::Full | TaskType::MonthlyFull);
            if !opts.manual && is_full {
                info!("scheduled full backup: erasing tape (label preserved)");
                self.drive.erase_preserve_label(true)?;
            }
        }

        let (task, set, resumed) = self.resolve_execution(&anchor_task, &opts)?;
        info!(
            "executing task {} on set {} ({})",
            task.id,
            set.set_id,
            if resumed { "resumed" } else { "fresh" }
        );

        let result = self
            .run_pipeline(&task, &set, opts.force_rescan, cancel.clone())
            .await;
        self.conclude(&task, &set, result).await
    }

    /// Label precondition for tape-targeted tasks; used both by `execute`
    /// and by the service's synchronous `run_task` precheck.
    pub(crate) fn precheck_tape(&self, task: &BackupTask) -> Result<()> {
        if task.tape_device.is_some() {
            self.check_tape_label()?;
        }
        Ok(())
    }

    fn check_tape_label(&self) -> Result<()> {
        match self.drive.read_label() {
            Ok(Some(label)) if !label.matches_month(Utc::now()) => {
                self.notifier.notify(Notification::TapeChangeRequired {
                    tape_id: &label.tape_id,
                });
                Err(EngineError::OperatorRequired(format!(
                    "loaded tape {} is not labeled for the current month",
                    label.tape_id
                )))
            }
            Ok(_) => Ok(()),
            Err(e) => {
                // An unreadable label does not block the run; the business
                // layer will prompt for a tape change if writing fails.
                warn!("could not read tape label: {e}");
                Ok(())
            }
        }
    }

    /// Turn the anchor into the concrete (task, set) this run operates on.
    fn resolve_execution(
        &self,
        anchor: &BackupTask,
        opts: &RunOptions,
    ) -> Result<(BackupTask, BackupSet, bool)> {
        if !anchor.is_template {
            // A pending execution row run directly: reuse its active set if
            // it has one, otherwise open a new one.
            let existing = self
                .meta
                .list_backup_sets(&tapeback_meta::SetFilter {
                    backup_task_id: Some(anchor.id),
                    status: Some(SetStatus::Active),
                    ..Default::default()
                })?
                .into_iter()
                .next();
            let (set, resumed) = match existing {
                Some(set) => (set, true),
                None => (self.open_set(anchor)?, false),
            };
            return Ok((anchor.clone(), set, resumed));
        }

        let incomplete = self.meta.find_incomplete_execution(anchor.id)?;
        match opts.mode {
            RunMode::Resume => match incomplete {
                Some((task, set)) => Ok((task, set, true)),
                None => Err(EngineError::Meta(MetaError::NotFound {
                    what: "incomplete execution",
                    id: anchor.id.to_string(),
                })),
            },
            RunMode::Auto => match incomplete {
                Some((task, set)) => Ok((task, set, true)),
                None => self.fresh_execution(anchor.id).map(|(t, s)| (t, s, false)),
            },
            RunMode::Restart => {
                if let Some((old_task, old_set)) = incomplete {
                    info!(
                        "restart requested: discarding incomplete execution {} (set {})",
                        old_task.id, old_set.set_id
                    );
                    self.meta.clear_backup_files_for_set(old_set.id)?;
                    self.meta.set_backup_set_status(old_set.id, SetStatus::Failed)?;
                    self.meta.update_task_status(
                        old_task.id,
                        TaskStatus::Cancelled,
                        Some("superseded by restart"),
                    )?;
                }
                self.fresh_execution(anchor.id).map(|(t, s)| (t, s, false))
            }
        }
    }

    fn fresh_execution(&self, template_id: TaskId) -> Result<(BackupTask, BackupSet)> {
        let task_id = self.meta.create_task_from_template(template_id)?;
        let task = self.meta.get_task(task_id)?;
        let set = self.open_set(&task)?;
        Ok((task, set))
    }

    fn open_set(&self, task: &BackupTask) -> Result<BackupSet> {
        let retention_until = if task.retention_days > 0 {
            Some(Utc::now() + chrono::Duration::days(task.retention_days as i64))
        } else {
            Utc::now().checked_add_months(Months::new(self.settings.default_retention_months))
        };
        let tape_id = match self.drive.read_label() {
            Ok(Some(label)) => Some(label.tape_id),
            _ => None,
        };
        Ok(self
            .meta
            .create_backup_set(task, tape_id.as_deref(), retention_until)?)
    }

    async fn run_pipeline(
        &self,
        task: &BackupTask,
        set: &BackupSet,
        force_rescan: bool,
        cancel: CancellationToken,
    ) -> Result<crate::worker::CompressionOutcome> {
        self.meta
            .update_task_status(task.id, TaskStatus::Running, None)?;
        self.meta
            .update_task_stage(task.id, OperationStage::Scan, Some("scanning sources"))?;

        let staging = StagingBuffer::new(
            self.meta.clone(),
            set.id,
            StagingConfig::from_settings(&self.settings, StagingMode::Buffered),
        );
        let drain_stop = CancellationToken::new();
        let drainer = staging.spawn_drainer(drain_stop.clone());
        let tape = Arc::new(TapeWriter::start(
            self.drive.clone(),
            TapeWriter::DEFAULT_QUEUE_DEPTH,
        ));

        let scan_worker = ScanWorker::new(
            self.meta.clone(),
            staging.clone(),
            task.id,
            self.settings.max_file_size,
            self.settings.scan_update_records,
            self.settings.scan_update_interval,
        );
        let scanner = WalkScanner::new(
            &task.source_paths,
            ExcludeSet::compile(&task.exclude_patterns),
        );
        let compression_worker = CompressionWorker::new(
            self.meta.clone(),
            GroupBuilder::new(self.meta.clone(), self.settings.group_tuning()),
            self.compressor.clone(),
            tape.clone(),
            self.settings.clone(),
            set.clone(),
            task.id,
        );

        // A resumed execution whose scan already completed does not re-walk
        // the sources unless asked to; the file rows are all there.
        let skip_scan = !force_rescan
            && self.meta.get_scan_status(task.id)?.is_completed();
        if skip_scan {
            info!("scan already completed for task {}, skipping re-scan", task.id);
        }

        // Scan and compression run concurrently; a failure on either side
        // cancels the other so shutdown stays bounded.
        let exec_cancel = cancel.child_token();
        let scan_fut = async {
            if skip_scan {
                return Ok(crate::scan::ScanOutcome {
                    total_files: task.total_files,
                    total_bytes: task.total_bytes,
                    cancelled: false,
                });
            }
            let result = scan_worker.run(scanner, &exec_cancel).await;
            if result.is_err() {
                exec_cancel.cancel();
            }
            result
        };
        let work_fut = async {
            let result = compression_worker.run(&exec_cancel).await;
            if result.is_err() {
                exec_cancel.cancel();
            }
            result
        };
        let (scan_result, work_result) = tokio::join!(scan_fut, work_fut);

        // Workers are down; flush staging and drain the tape queue whatever
        // the outcome, then report the first error if any.
        drain_stop.cancel();
        let _ = drainer.await;
        let staging_report = staging.stop().await;
        let tape_for_shutdown = tape.clone();
        let _ = tokio::task::spawn_blocking(move || tape_for_shutdown.shutdown()).await;

        let scan_outcome = scan_result?;
        let mut outcome = work_result?;
        if staging_report.unsynced > 0 {
            return Err(EngineError::Fatal(format!(
                "{} staged records were never persisted",
                staging_report.unsynced
            )));
        }
        outcome.cancelled = outcome.cancelled || scan_outcome.cancelled;
        Ok(outcome)
    }

    /// Translate the pipeline result into final task/set state.
    async fn conclude(
        &self,
        task: &BackupTask,
        set: &BackupSet,
        result: Result<crate::worker::CompressionOutcome>,
    ) -> Result<ExecutionReport> {
        match result {
            Ok(outcome) if outcome.cancelled => {
                self.meta
                    .update_task_status(task.id, TaskStatus::Cancelled, None)?;
                info!("task {} cancelled; partial set {} kept", task.id, set.set_id);
                Ok(ExecutionReport {
                    outcome: ExecutionOutcome::Cancelled,
                    task_id: Some(task.id),
                    set_pk: Some(set.id),
                    chunk_count: outcome.chunks_written,
                    total_files: outcome.processed_files,
                    total_bytes: outcome.original_bytes,
                    compressed_bytes: outcome.compressed_bytes,
                })
            }
            Ok(outcome) => {
                self.meta.update_task_stage(
                    task.id,
                    OperationStage::Finalize,
                    Some("finalizing backup set"),
                )?;
                let file_count = self.meta.count_files_of_kind(set.id, FileKind::File)?;
                let total_bytes = self.meta.sum_file_bytes(set.id)?;
                let compressed_bytes = self.meta.sum_compressed_bytes(set.id)?;
                let chunk_count = self
                    .meta
                    .max_chunk_number(set.id)?
                    .map(|c| c + 1)
                    .unwrap_or(0);
                self.meta.finalize_backup_set(
                    set.id,
                    file_count,
                    total_bytes,
                    compressed_bytes,
                    chunk_count,
                )?;
                self.meta.update_task_progress(
                    task.id,
                    TaskProgress {
                        progress_percent: Some(100.0),
                        ..Default::default()
                    },
                )?;
                self.meta
                    .update_task_status(task.id, TaskStatus::Completed, None)?;
                self.notifier.notify(Notification::TaskCompleted {
                    task_id: task.id,
                    chunks: chunk_count,
                    total_bytes,
                });
                Ok(ExecutionReport {
                    outcome: ExecutionOutcome::Completed,
                    task_id: Some(task.id),
                    set_pk: Some(set.id),
                    chunk_count,
                    total_files: file_count,
                    total_bytes,
                    compressed_bytes: outcome.compressed_bytes.max(compressed_bytes),
                })
            }
            Err(e) => {
                let message = e.to_string();
                // Partial state is kept for inspection and resume.
                if let Err(status_err) =
                    self.meta
                        .update_task_status(task.id, TaskStatus::Failed, Some(&message))
                {
                    warn!("could not record failure on task {}: {status_err}", task.id);
                }
                self.notifier.notify(Notification::TaskFailed {
                    task_id: task.id,
                    error: &message,
                });
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap()
    }

    #[test]
    fn period_checks() {
        assert!(SchedulePeriod::Daily.same_period(at(2026, 8, 1), at(2026, 8, 1)));
        assert!(!SchedulePeriod::Daily.same_period(at(2026, 7, 31), at(2026, 8, 1)));
        // 2026-08-01 is a Saturday, 2026-08-03 the following Monday.
        assert!(!SchedulePeriod::Weekly.same_period(at(2026, 8, 1), at(2026, 8, 3)));
        assert!(SchedulePeriod::Weekly.same_period(at(2026, 8, 3), at(2026, 8, 7)));
        assert!(SchedulePeriod::Monthly.same_period(at(2026, 8, 1), at(2026, 8, 30)));
        assert!(!SchedulePeriod::Monthly.same_period(at(2026, 7, 31), at(2026, 8, 1)));
        assert!(SchedulePeriod::Yearly.same_period(at(2026, 1, 1), at(2026, 12, 31)));
        assert!(!SchedulePeriod::Yearly.same_period(at(2025, 12, 31), at(2026, 1, 1)));
    }
}
