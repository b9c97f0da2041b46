//! End-to-end pipeline runs against a memory tape drive and a SQLite store.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tapeback_core::compress::{ArchiveStats, CompressionProgress, Compressor, RecordingCompressor};
use tapeback_core::notify::LogNotifier;
use tapeback_core::tape::MemDrive;
use tapeback_core::{
    BackupService, ExecutionOutcome, RunMode, RunOptions, ServiceError, TaskCoordinator,
};
use tapeback_lib::{FileKind, PendingFile, SetId, Settings, TaskId, TaskStatus};
use tapeback_meta::{MetaStore, SetFilter, SqliteMetaStore, TaskDraft, TaskOverrides};

fn enable_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

struct Harness {
    meta: Arc<SqliteMetaStore>,
    drive: Arc<MemDrive>,
    coordinator: Arc<TaskCoordinator>,
    template_id: TaskId,
    #[allow(dead_code)]
    source: tempfile::TempDir,
    #[allow(dead_code)]
    work: tempfile::TempDir,
}

fn test_settings(work: &Path, max_file_size: u64) -> Settings {
    Settings {
        max_file_size,
        staging_sync_batch_size: 64,
        staging_sync_interval: Duration::from_millis(20),
        staging_max_files: 10_000,
        worker_poll_interval: Duration::from_millis(25),
        scan_update_records: 50,
        scan_update_interval: Duration::from_millis(200),
        staging_dir: work.join("staging"),
        final_dir: work.join("final"),
        checkpoint_dir: work.join("checkpoints"),
        ..Settings::default()
    }
}

/// Lay out `count` regular files of `size` bytes each under `dir`.
fn populate(dir: &Path, count: usize, size: usize) {
    std::fs::create_dir_all(dir.join("sub")).unwrap();
    for i in 0..count {
        let parent = if i % 3 == 0 { dir.join("sub") } else { dir.to_owned() };
        std::fs::write(parent.join(format!("file{i:04}.dat")), vec![0xA5u8; size]).unwrap();
    }
}

fn harness_with(
    compressor: Arc<dyn Compressor>,
    max_file_size: u64,
    file_count: usize,
    file_size: usize,
) -> Harness {
    enable_logging();
    let source = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    populate(source.path(), file_count, file_size);

    let meta = Arc::new(SqliteMetaStore::open_in_memory().unwrap());
    let mut draft = TaskDraft::new("pipeline-test", vec![source.path().to_owned()]);
    draft.tape_device = Some("drive0".into());
    let template_id = meta.create_template(&draft).unwrap();

    let drive = Arc::new(MemDrive::new());
    let coordinator = Arc::new(TaskCoordinator::new(
        meta.clone(),
        drive.clone(),
        compressor,
        Arc::new(LogNotifier),
        test_settings(work.path(), max_file_size),
    ));
    Harness {
        meta,
        drive,
        coordinator,
        template_id,
        source,
        work,
    }
}

fn harness(max_file_size: u64, file_count: usize, file_size: usize) -> Harness {
    harness_with(Arc::new(RecordingCompressor), max_file_size, file_count, file_size)
}

impl Harness {
    async fn run(&self, mode: RunMode) -> tapeback_core::ExecutionReport {
        self.run_with_token(mode, CancellationToken::new())
            .await
            .unwrap()
    }

    async fn run_with_token(
        &self,
        mode: RunMode,
        cancel: CancellationToken,
    ) -> tapeback_core::Result<tapeback_core::ExecutionReport> {
        self.coordinator
            .execute(
                self.template_id,
                RunOptions {
                    mode,
                    manual: true,
                    ..Default::default()
                },
                cancel,
            )
            .await
    }

    fn latest_set(&self) -> tapeback_lib::BackupSet {
        self.meta
            .list_backup_sets(&SetFilter::default())
            .unwrap()
            .into_iter()
            .next()
            .unwrap()
    }

    /// The universal invariants of §every-run: unique membership, ordering
    /// by id across chunks, group size bound.
    fn assert_invariants(&self, set_pk: SetId, max_file_size: u64) {
        let chunk_count = self.meta.max_chunk_number(set_pk).unwrap().map(|c| c + 1).unwrap_or(0);
        let tolerance = max_file_size / 20;
        let mut seen_paths: Vec<PathBuf> = Vec::new();
        let mut previous_max_id = i64::MIN;
        for chunk in 0..chunk_count {
            let files = self.meta.files_in_chunk(set_pk, chunk).unwrap();
            assert!(!files.is_empty(), "chunk {chunk} is empty");
            for file in &files {
                assert!(file.is_copy_success);
                assert_eq!(file.record.kind, FileKind::File);
                assert!(
                    !seen_paths.contains(&file.record.path),
                    "path {} archived twice",
                    file.record.path.display()
                );
                seen_paths.push(file.record.path.clone());
            }
            let min_id = files.iter().map(|f| f.id.0).min().unwrap();
            let max_id = files.iter().map(|f| f.id.0).max().unwrap();
            assert!(
                min_id > previous_max_id,
                "chunk {chunk} overlaps ids with an earlier chunk"
            );
            previous_max_id = max_id;

            let total: u64 = files.iter().map(|f| f.record.size).sum();
            if files.len() > 1 {
                assert!(
                    total <= max_file_size + tolerance,
                    "chunk {chunk} breaches the size bound: {total}"
                );
            }
        }
    }
}

const KIB: u64 = 1024;

#[tokio::test(flavor = "multi_thread")]
async fn clean_full_backup() {
    // 100 files x 10 KiB against a 100 KiB target: ten groups of ten.
    let h = harness(100 * KIB, 100, 10 * KIB as usize);
    let report = h.run(RunMode::Auto).await;

    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert_eq!(report.total_files, 100);
    assert!((10..=11).contains(&report.chunk_count), "{}", report.chunk_count);

    let task = h.meta.get_task(report.task_id.unwrap()).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.total_files, 100);
    assert_eq!(task.processed_files, 100);
    assert_eq!(task.progress_percent, 100.0);

    let set = h.latest_set();
    assert_eq!(set.total_files, 100);
    assert_eq!(set.chunk_count, report.chunk_count);
    assert!(set.compression_ratio > 0.0);
    assert_eq!(
        h.meta.get_compressed_files_count(set.id).unwrap(),
        100
    );

    // Every archive made it onto the tape, in chunk order.
    let writes = h.drive.writes();
    assert_eq!(writes.len(), report.chunk_count as usize);
    assert!(writes.windows(2).all(|w| w[0].position < w[1].position));

    h.assert_invariants(set.id, 100 * KIB);
}

#[tokio::test(flavor = "multi_thread")]
async fn giant_file_gets_its_own_chunk() {
    let h = harness(100 * KIB, 20, 2 * KIB as usize);
    // A 250 KiB giant in a root of its own, scanned after the small files
    // so the small-file accumulation is contiguous.
    let giant_root = tempfile::tempdir().unwrap();
    std::fs::write(giant_root.path().join("giant.bin"), vec![1u8; 250 * KIB as usize]).unwrap();
    let mut draft = TaskDraft::new(
        "with-giant",
        vec![h.source.path().to_owned(), giant_root.path().to_owned()],
    );
    draft.tape_device = Some("drive0".into());
    let template_id = h.meta.create_template(&draft).unwrap();

    let report = h
        .coordinator
        .execute(
            template_id,
            RunOptions {
                manual: true,
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert_eq!(report.total_files, 21);
    assert_eq!(report.chunk_count, 2);

    let set = h.meta.get_backup_set(report.set_pk.unwrap()).unwrap();
    let giant_chunk: Vec<u32> = (0..2)
        .filter(|&c| {
            h.meta
                .files_in_chunk(set.id, c)
                .unwrap()
                .iter()
                .any(|f| f.record.path.ends_with("giant.bin"))
        })
        .collect();
    assert_eq!(giant_chunk.len(), 1);
    let giant_files = h.meta.files_in_chunk(set.id, giant_chunk[0]).unwrap();
    assert_eq!(giant_files.len(), 1, "the giant must be alone in its chunk");

    h.assert_invariants(set.id, 100 * KIB);
}

/// Completes normally, then fires the cancel token after `after` groups.
struct CancelAfter {
    inner: RecordingCompressor,
    compressed: AtomicU32,
    after: u32,
    cancel: CancellationToken,
}

impl Compressor for CancelAfter {
    fn compress_group(
        &self,
        files: &[PendingFile],
        out_path: &Path,
        progress: &CompressionProgress,
    ) -> anyhow::Result<ArchiveStats> {
        let stats = self.inner.compress_group(files, out_path, progress)?;
        if self.compressed.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            self.cancel.cancel();
        }
        Ok(stats)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_mid_compress_leaves_no_partial_chunk() {
    enable_logging();
    let cancel = CancellationToken::new();
    let compressor = Arc::new(CancelAfter {
        inner: RecordingCompressor,
        compressed: AtomicU32::new(0),
        after: 3,
        cancel: cancel.clone(),
    });
    // 80 files x 10 KiB -> would be 8 chunks uncancelled.
    let h = harness_with(compressor, 100 * KIB, 80, 10 * KIB as usize);

    let report = h.run_with_token(RunMode::Auto, cancel).await.unwrap();
    assert_eq!(report.outcome, ExecutionOutcome::Cancelled);

    let task = h.meta.get_task(report.task_id.unwrap()).unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);

    let set = h.latest_set();
    let chunk_count = h.meta.max_chunk_number(set.id).unwrap().map(|c| c + 1).unwrap_or(0);
    // The in-flight chunk either completed fully or never started.
    assert!((3..=4).contains(&chunk_count), "{chunk_count}");
    let copied = h.meta.get_compressed_files_count(set.id).unwrap();
    assert_eq!(copied, chunk_count as u64 * 10, "partially marked chunk");

    h.assert_invariants(set.id, 100 * KIB);
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_after_interruption_completes_contiguously() {
    enable_logging();
    let cancel = CancellationToken::new();
    let compressor = Arc::new(CancelAfter {
        inner: RecordingCompressor,
        compressed: AtomicU32::new(0),
        after: 2,
        cancel: cancel.clone(),
    });
    let h = harness_with(compressor, 100 * KIB, 60, 10 * KIB as usize);

    let first = h.run_with_token(RunMode::Auto, cancel).await.unwrap();
    assert_eq!(first.outcome, ExecutionOutcome::Cancelled);
    let set = h.latest_set();
    let interrupted_chunks = h.meta.max_chunk_number(set.id).unwrap().map(|c| c + 1).unwrap();
    let copied_before = h.meta.get_compressed_files_count(set.id).unwrap();

    // Resume reattaches to the same set and continues the numbering.
    let second = h.run(RunMode::Resume).await;
    assert_eq!(second.outcome, ExecutionOutcome::Completed);
    assert_eq!(second.set_pk, Some(set.id));
    assert_eq!(second.total_files, 60);

    let final_chunks = h.meta.max_chunk_number(set.id).unwrap().map(|c| c + 1).unwrap();
    assert!(final_chunks > interrupted_chunks);
    assert_eq!(h.meta.get_compressed_files_count(set.id).unwrap(), 60);
    assert!(copied_before < 60);
    // Contiguous numbering, no chunk skipped or duplicated.
    for chunk in 0..final_chunks {
        assert!(!h.meta.files_in_chunk(set.id, chunk).unwrap().is_empty());
    }
    h.assert_invariants(set.id, 100 * KIB);

    let task = h.meta.get_task(second.task_id.unwrap()).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_discards_previous_state() {
    enable_logging();
    let cancel = CancellationToken::new();
    let compressor = Arc::new(CancelAfter {
        inner: RecordingCompressor,
        compressed: AtomicU32::new(0),
        after: 2,
        cancel: cancel.clone(),
    });
    let h = harness_with(compressor, 100 * KIB, 40, 10 * KIB as usize);

    let first = h.run_with_token(RunMode::Auto, cancel).await.unwrap();
    assert_eq!(first.outcome, ExecutionOutcome::Cancelled);
    let old_set = first.set_pk.unwrap();

    let second = h.run(RunMode::Restart).await;
    assert_eq!(second.outcome, ExecutionOutcome::Completed);
    let new_set = second.set_pk.unwrap();
    assert_ne!(old_set, new_set);

    // The old set's file state was cleared; the new set is complete.
    assert_eq!(h.meta.get_compressed_files_count(old_set).unwrap(), 0);
    assert_eq!(h.meta.get_compressed_files_count(new_set).unwrap(), 40);
    assert_eq!(second.total_files, 40);
    h.assert_invariants(new_set, 100 * KIB);
}

#[tokio::test(flavor = "multi_thread")]
async fn excluded_and_special_entries_are_not_archived() {
    let h = harness(100 * KIB, 12, 10 * KIB as usize);
    std::fs::write(h.source.path().join("skip.tmp"), vec![0u8; 10 * KIB as usize]).unwrap();
    #[cfg(unix)]
    std::os::unix::fs::symlink(
        h.source.path().join("file0000.dat"),
        h.source.path().join("alias"),
    )
    .unwrap();

    // A template of its own, carrying the exclude pattern.
    let mut draft = TaskDraft::new("with-excludes", vec![h.source.path().to_owned()]);
    draft.exclude_patterns = vec!["*.tmp".into()];
    let template_id = h.meta.create_template(&draft).unwrap();
    let report = h
        .coordinator
        .execute(
            template_id,
            RunOptions {
                manual: true,
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert_eq!(report.total_files, 12, "tmp file and symlink must not count");
    let set = h.meta.get_backup_set(report.set_pk.unwrap()).unwrap();
    assert_eq!(set.total_files, 12);
    // Directory and symlink rows exist but are never selected into chunks.
    assert_eq!(
        h.meta
            .count_files_of_kind(set.id, FileKind::Directory)
            .unwrap(),
        2
    );
    h.assert_invariants(set.id, 100 * KIB);
}

#[tokio::test(flavor = "multi_thread")]
async fn direct_to_tape_writes_inline() {
    enable_logging();
    let source = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    populate(source.path(), 30, 10 * KIB as usize);

    let meta = Arc::new(SqliteMetaStore::open_in_memory().unwrap());
    let mut draft = TaskDraft::new("direct", vec![source.path().to_owned()]);
    draft.tape_device = Some("drive0".into());
    let template_id = meta.create_template(&draft).unwrap();

    let drive = Arc::new(MemDrive::new());
    let mut settings = test_settings(work.path(), 100 * KIB);
    settings.compress_directly_to_tape = true;
    let coordinator = Arc::new(TaskCoordinator::new(
        meta.clone(),
        drive.clone(),
        Arc::new(RecordingCompressor),
        Arc::new(LogNotifier),
        settings,
    ));

    let report = coordinator
        .execute(
            template_id,
            RunOptions {
                manual: true,
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert_eq!(report.total_files, 30);
    assert_eq!(drive.writes().len(), report.chunk_count as usize);
    // Inline writes record their tape position on the chunk rows.
    let set_pk = report.set_pk.unwrap();
    for chunk in 0..report.chunk_count {
        let files = meta.files_in_chunk(set_pk, chunk).unwrap();
        assert!(files.iter().all(|f| f.tape_block_start.is_some()));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn service_surface_round_trip() {
    let h = harness(100 * KIB, 30, 10 * KIB as usize);
    let service = BackupService::new(h.meta.clone(), h.coordinator.clone());

    let task_id = service
        .create_task(
            h.template_id,
            TaskOverrides {
                name: Some("overridden".into()),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(service.get_task_status(task_id).unwrap().name, "overridden");

    service
        .run_task(
            task_id,
            RunOptions {
                manual: true,
                ..Default::default()
            },
        )
        .unwrap();
    // A second run while the first is in flight conflicts.
    match service.run_task(task_id, RunOptions::default()) {
        Err(ServiceError::Conflict(_)) => {}
        other => panic!("expected Conflict, got {other:?}"),
    }

    let report = service
        .join_execution(task_id)
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert!(!service.is_running(task_id));

    // Deleting the finished task cascades to its set.
    let set_pk = report.set_pk.unwrap();
    service.delete_task(task_id).unwrap();
    assert!(h.meta.get_backup_set(set_pk).is_err());
    match service.get_task_status(TaskId(999_999)) {
        Err(ServiceError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_via_service_stops_mutations() {
    let h = harness(100 * KIB, 200, 10 * KIB as usize);
    let service = Arc::new(BackupService::new(h.meta.clone(), h.coordinator.clone()));

    let task_id = service.create_task(h.template_id, TaskOverrides::default()).unwrap();
    service
        .run_task(
            task_id,
            RunOptions {
                manual: true,
                ..Default::default()
            },
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    service.cancel_task(task_id).unwrap();
    let report = service
        .join_execution(task_id)
        .await
        .unwrap_or_else(|e| panic!("{e}"));

    // Cancel purity: once workers stopped, the row state is frozen.
    let task = h.meta.get_task(task_id).unwrap();
    assert!(matches!(
        task.status,
        TaskStatus::Cancelled | TaskStatus::Completed
    ));
    if task.status == TaskStatus::Cancelled {
        let set_pk = report.set_pk.unwrap();
        let before = h.meta.get_compressed_files_count(set_pk).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.meta.get_compressed_files_count(set_pk).unwrap(), before);
        h.assert_invariants(set_pk, 100 * KIB);
    }
}
