//! Group forming: assemble the next archive-sized batch of pending files.
//!
//! Selection is strictly by ascending id (scan order); the group closes on
//! the append that crosses `min_group`, giants get their own group, and a
//! too-small group either waits for more arrivals or ships as a residual
//! once the scan has completed. Callers carry the retry budget; the cursor
//! discipline below guarantees no pending row is ever skipped.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use tapeback_lib::{FileId, GroupTuning, PendingFile, ScanStatus, SetId, TaskId};
use tapeback_meta::{MetaStore, Result};

/// One `fetch_pending_group` answer.
///
/// Empty `files` with `next_cursor < resume_cursor` tells the caller to
/// reset and re-read from an earlier id; empty with a cursor at or past the
/// old one means "nothing to group yet, wait".
#[derive(Debug)]
pub struct FetchedGroup {
    pub files: Vec<PendingFile>,
    pub total_size: u64,
    pub next_cursor: i64,
}

impl FetchedGroup {
    fn empty(next_cursor: i64) -> Self {
        FetchedGroup {
            files: Vec::new(),
            total_size: 0,
            next_cursor,
        }
    }
}

pub struct GroupBuilder {
    meta: Arc<dyn MetaStore>,
    tuning: GroupTuning,
}

impl GroupBuilder {
    pub fn new(meta: Arc<dyn MetaStore>, tuning: GroupTuning) -> Self {
        GroupBuilder { meta, tuning }
    }

    pub fn tuning(&self) -> &GroupTuning {
        &self.tuning
    }

    /// Assemble the next group starting after `resume_cursor`.
    ///
    /// `may_wait` reflects the caller's remaining retry budget: while true,
    /// an under-target group is withheld (empty result, cursor backed up to
    /// just before the group's first file so nothing is lost); once false,
    /// whatever accumulated is returned as-is.
    pub fn fetch_pending_group(
        &self,
        set_pk: SetId,
        task_id: TaskId,
        may_wait: bool,
        resume_cursor: i64,
    ) -> Result<FetchedGroup> {
        // The drain phase is visible to observers as `retrieving`, but only
        // until the scan itself reports completion.
        let scan = self.meta.get_scan_status(task_id)?;
        if !matches!(scan, ScanStatus::Retrieving | ScanStatus::Completed) {
            self.meta.advance_scan_status(task_id, ScanStatus::Retrieving)?;
        }

        let Some(min_pending) = self.meta.min_pending_file_id(set_pk)? else {
            return Ok(FetchedGroup::empty(resume_cursor));
        };
        let min_id = min_pending.0;
        // Never skip the first pending row: a cursor outside
        // [min_id - 1, min_id] is stale and resets.
        let mut cursor = if resume_cursor < min_id - 1 || resume_cursor > min_id {
            debug!(
                "group cursor {resume_cursor} out of range for min pending {min_id}, resetting"
            );
            min_id - 1
        } else {
            resume_cursor
        };

        let mut files: Vec<PendingFile> = Vec::new();
        let mut total: u64 = 0;
        let mut index_by_path: HashMap<PathBuf, usize> = HashMap::new();
        let mut limit = self.tuning.batch;

        loop {
            let (batch, used_limit) = self.fetch_batch_hardened(set_pk, cursor, limit)?;
            limit = used_limit;
            let end_reached = batch.len() < used_limit;

            for row in batch {
                cursor = row.id.0;

                if let Some(&at) = index_by_path.get(&row.path) {
                    // Duplicate path: the smaller id wins. Ascending order
                    // makes the existing entry the winner, but guard the
                    // swap for defense against out-of-order rows.
                    if row.id < files[at].id {
                        total = total - files[at].size + row.size;
                        files[at] = row;
                    }
                    continue;
                }

                if self.tuning.is_giant(row.size) {
                    if files.is_empty() {
                        info!(
                            "giant file {} ({} bytes) forms its own group",
                            row.path.display(),
                            row.size
                        );
                        return Ok(FetchedGroup {
                            total_size: row.size,
                            next_cursor: row.id.0,
                            files: vec![row],
                        });
                    }
                    // Close the accumulated group; back the cursor up so the
                    // giant is re-seen by the next call.
                    return Ok(FetchedGroup {
                        files,
                        total_size: total,
                        next_cursor: row.id.0 - 1,
                    });
                }

                let closes = total + row.size > self.tuning.min_group;
                total += row.size;
                index_by_path.insert(row.path.clone(), files.len());
                files.push(row);
                if closes {
                    return Ok(FetchedGroup {
                        files,
                        total_size: total,
                        next_cursor: cursor,
                    });
                }
            }

            if !end_reached {
                continue;
            }

            // End of the pending iteration: decide what the partial group
            // becomes.
            if total >= self.tuning.min_group {
                return Ok(FetchedGroup {
                    files,
                    total_size: total,
                    next_cursor: cursor,
                });
            }
            let scan_done = self.meta.get_scan_status(task_id)?.is_completed();
            if scan_done {
                if !files.is_empty() && total < self.tuning.min_acceptable {
                    info!("shipping residual group of {total} bytes after scan completion");
                }
                return Ok(FetchedGroup {
                    files,
                    total_size: total,
                    next_cursor: cursor,
                });
            }
            if may_wait {
                // Withhold the partial group. The cursor must back up to
                // just before its first file, otherwise those rows would be
                // silently lost to the next call.
                let back = files.first().map(|f| f.id.0 - 1).unwrap_or(cursor);
                return Ok(FetchedGroup::empty(back));
            }
            // Retries exhausted: forced compression of whatever there is.
            return Ok(FetchedGroup {
                files,
                total_size: total,
                next_cursor: cursor,
            });
        }
    }

    /// One pending-batch read, halving the limit on transient faults.
    ///
    /// Group forming must not fail the task on a transient read error, so
    /// transient faults retry indefinitely (the store's own bounded retry
    /// sits below this).
    fn fetch_batch_hardened(
        &self,
        set_pk: SetId,
        cursor: i64,
        mut limit: usize,
    ) -> Result<(Vec<PendingFile>, usize)> {
        loop {
            match self.meta.fetch_pending_batch(set_pk, FileId(cursor), limit) {
                Ok(batch) => return Ok((batch, limit)),
                Err(e) if e.is_transient() => {
                    let halved = (limit / 2).max(50);
                    warn!(
                        "pending fetch failed transiently ({e}); retrying with batch {halved}"
                    );
                    limit = halved;
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use tapeback_lib::{FileKind, FileRecord, TaskStatus};
    use tapeback_meta::{SqliteMetaStore, TaskDraft};

    struct Fixture {
        meta: Arc<SqliteMetaStore>,
        task_id: TaskId,
        set_pk: SetId,
    }

    fn fixture() -> Fixture {
        let meta = Arc::new(SqliteMetaStore::open_in_memory().unwrap());
        let template = meta
            .create_template(&TaskDraft::new("t", vec![PathBuf::from("/src")]))
            .unwrap();
        let task_id = meta.create_task_from_template(template).unwrap();
        let task = meta.get_task(task_id).unwrap();
        let set_pk = meta.create_backup_set(&task, None, None).unwrap().id;
        meta.update_task_status(task_id, TaskStatus::Running, None).unwrap();
        Fixture {
            meta,
            task_id,
            set_pk,
        }
    }

    impl Fixture {
        fn insert(&self, sizes: &[u64]) {
            let records: Vec<FileRecord> = sizes
                .iter()
                .enumerate()
                .map(|(i, &size)| {
                    FileRecord::new(PathBuf::from(format!("/src/f{i:04}")), size, FileKind::File)
                })
                .collect();
            self.meta
                .batch_insert_scanned_files(self.set_pk, &records)
                .unwrap();
        }

        fn scan_done(&self) {
            self.meta
                .advance_scan_status(self.task_id, ScanStatus::Completed)
                .unwrap();
        }

        fn builder(&self, target: u64) -> GroupBuilder {
            let tuning = GroupTuning {
                batch: 4, // small batches exercise the paging loop
                ..GroupTuning::for_target(target)
            };
            GroupBuilder::new(self.meta.clone(), tuning)
        }
    }

    #[test]
    fn group_closes_on_the_crossing_append() {
        let fx = fixture();
        fx.insert(&[300, 300, 300, 300, 300]);
        let builder = fx.builder(1000); // min_group 950

        let group = builder
            .fetch_pending_group(fx.set_pk, fx.task_id, true, 0)
            .unwrap();
        // 300+300+300 = 900 <= 950, the fourth crosses and closes.
        assert_eq!(group.files.len(), 4);
        assert_eq!(group.total_size, 1200);
        assert_eq!(group.next_cursor, group.files.last().unwrap().id.0);
    }

    #[test]
    fn giant_file_forms_its_own_group() {
        let fx = fixture();
        fx.insert(&[2000]);
        let builder = fx.builder(1000);

        let group = builder
            .fetch_pending_group(fx.set_pk, fx.task_id, true, 0)
            .unwrap();
        assert_eq!(group.files.len(), 1);
        assert_eq!(group.total_size, 2000);
        assert_eq!(group.next_cursor, group.files[0].id.0);
    }

    #[test]
    fn giant_after_accumulation_closes_group_and_is_reseen() {
        let fx = fixture();
        fx.insert(&[100, 100, 2000, 100]);
        fx.scan_done();
        let builder = fx.builder(1000);

        let first = builder
            .fetch_pending_group(fx.set_pk, fx.task_id, true, 0)
            .unwrap();
        assert_eq!(first.files.len(), 2);
        assert_eq!(first.total_size, 200);

        // Pretend the first group was archived, then re-fetch: the giant
        // must come back on its own.
        mark(&fx, &first.files, 0);
        let second = builder
            .fetch_pending_group(fx.set_pk, fx.task_id, true, first.next_cursor)
            .unwrap();
        assert_eq!(second.files.len(), 1);
        assert_eq!(second.total_size, 2000);
    }

    #[test]
    fn under_target_group_waits_with_backed_up_cursor() {
        let fx = fixture();
        fx.insert(&[100, 100]);
        let builder = fx.builder(1000);

        let group = builder
            .fetch_pending_group(fx.set_pk, fx.task_id, true, 0)
            .unwrap();
        assert!(group.files.is_empty());
        // Cursor backs up to just before the first withheld file.
        let min = fx.meta.min_pending_file_id(fx.set_pk).unwrap().unwrap();
        assert_eq!(group.next_cursor, min.0 - 1);
    }

    #[test]
    fn residual_ships_once_scan_completed() {
        let fx = fixture();
        fx.insert(&[100, 100]);
        fx.scan_done();
        let builder = fx.builder(1000);

        let group = builder
            .fetch_pending_group(fx.set_pk, fx.task_id, true, 0)
            .unwrap();
        assert_eq!(group.files.len(), 2);
        assert_eq!(group.total_size, 200);
    }

    #[test]
    fn exhausted_retries_force_whatever_accumulated() {
        let fx = fixture();
        fx.insert(&[100, 100]);
        let builder = fx.builder(1000);

        let group = builder
            .fetch_pending_group(fx.set_pk, fx.task_id, false, 0)
            .unwrap();
        assert_eq!(group.files.len(), 2);
    }

    #[test]
    fn stale_cursor_resets_to_first_pending() {
        let fx = fixture();
        fx.insert(&[100; 6]);
        fx.scan_done();
        let builder = fx.builder(1000);

        // A cursor way past the pending range must not skip rows.
        let group = builder
            .fetch_pending_group(fx.set_pk, fx.task_id, true, 9_999)
            .unwrap();
        assert_eq!(group.files.len(), 6);
    }

    #[test]
    fn legacy_duplicate_rows_keep_the_smaller_id() {
        let fx = fixture();
        // Fabricate a genuine duplicate pair (no unique constraint on
        // file_path) plus a normal neighbour.
        let winner = fx
            .meta
            .insert_file_row_unchecked(
                fx.set_pk,
                &FileRecord::new(PathBuf::from("/src/dup"), 100, FileKind::File),
            )
            .unwrap();
        let shadow = fx
            .meta
            .insert_file_row_unchecked(
                fx.set_pk,
                &FileRecord::new(PathBuf::from("/src/dup"), 300, FileKind::File),
            )
            .unwrap();
        fx.insert(&[50]);
        fx.scan_done();
        let builder = fx.builder(1000);

        let group = builder
            .fetch_pending_group(fx.set_pk, fx.task_id, true, 0)
            .unwrap();
        let dups: Vec<_> = group
            .files
            .iter()
            .filter(|f| f.path == PathBuf::from("/src/dup"))
            .collect();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].id, winner);
        assert_eq!(dups[0].size, 100);

        // Only the winner receives the copied state; the shadow row is an
        // orphan that is never selected again.
        mark(&fx, &group.files, 0);
        let copied = fx.meta.files_in_chunk(fx.set_pk, 0).unwrap();
        assert!(copied.iter().any(|f| f.id == winner));
        assert!(!copied.iter().any(|f| f.id == shadow));
        let again = builder
            .fetch_pending_group(fx.set_pk, fx.task_id, true, group.next_cursor)
            .unwrap();
        assert!(again.files.is_empty());
    }

    /// Hands the group builder a canned pending batch, so row orderings the
    /// SQLite store can never produce (duplicates arriving larger-id-first)
    /// are coverable.
    struct CannedPending {
        rows: Vec<PendingFile>,
    }

    impl MetaStore for CannedPending {
        fn get_scan_status(&self, _: TaskId) -> tapeback_meta::Result<ScanStatus> {
            Ok(ScanStatus::Completed)
        }

        fn min_pending_file_id(&self, _: SetId) -> tapeback_meta::Result<Option<FileId>> {
            Ok(self.rows.iter().map(|r| r.id).min())
        }

        fn fetch_pending_batch(
            &self,
            _: SetId,
            cursor: FileId,
            limit: usize,
        ) -> tapeback_meta::Result<Vec<PendingFile>> {
            Ok(self
                .rows
                .iter()
                .filter(|r| r.id > cursor)
                .take(limit)
                .cloned()
                .collect())
        }

        fn advance_scan_status(&self, _: TaskId, _: ScanStatus) -> tapeback_meta::Result<()> {
            Ok(())
        }

        // The group builder touches nothing below.
        fn create_template(&self, _: &tapeback_meta::TaskDraft) -> tapeback_meta::Result<TaskId> {
            unimplemented!()
        }
        fn create_task_from_template(&self, _: TaskId) -> tapeback_meta::Result<TaskId> {
            unimplemented!()
        }
        fn get_task(&self, _: TaskId) -> tapeback_meta::Result<tapeback_lib::BackupTask> {
            unimplemented!()
        }
        fn list_tasks(
            &self,
            _: &tapeback_meta::TaskFilter,
        ) -> tapeback_meta::Result<Vec<tapeback_lib::BackupTask>> {
            unimplemented!()
        }
        fn update_task_definition(
            &self,
            _: TaskId,
            _: &tapeback_meta::TaskOverrides,
        ) -> tapeback_meta::Result<()> {
            unimplemented!()
        }
        fn delete_task(&self, _: TaskId) -> tapeback_meta::Result<()> {
            unimplemented!()
        }
        fn update_task_status(
            &self,
            _: TaskId,
            _: TaskStatus,
            _: Option<&str>,
        ) -> tapeback_meta::Result<()> {
            unimplemented!()
        }
        fn update_task_progress(
            &self,
            _: TaskId,
            _: tapeback_meta::TaskProgress,
        ) -> tapeback_meta::Result<()> {
            unimplemented!()
        }
        fn update_task_stage(
            &self,
            _: TaskId,
            _: tapeback_lib::OperationStage,
            _: Option<&str>,
        ) -> tapeback_meta::Result<()> {
            unimplemented!()
        }
        fn update_scan_totals(
            &self,
            _: TaskId,
            _: tapeback_meta::ScanTotals,
        ) -> tapeback_meta::Result<()> {
            unimplemented!()
        }
        fn create_backup_set(
            &self,
            _: &tapeback_lib::BackupTask,
            _: Option<&str>,
            _: Option<chrono::DateTime<chrono::Utc>>,
        ) -> tapeback_meta::Result<tapeback_lib::BackupSet> {
            unimplemented!()
        }
        fn get_backup_set(&self, _: SetId) -> tapeback_meta::Result<tapeback_lib::BackupSet> {
            unimplemented!()
        }
        fn get_backup_set_by_set_id(
            &self,
            _: &str,
        ) -> tapeback_meta::Result<Option<tapeback_lib::BackupSet>> {
            unimplemented!()
        }
        fn find_incomplete_execution(
            &self,
            _: TaskId,
        ) -> tapeback_meta::Result<Option<(tapeback_lib::BackupTask, tapeback_lib::BackupSet)>>
        {
            unimplemented!()
        }
        fn list_backup_sets(
            &self,
            _: &tapeback_meta::SetFilter,
        ) -> tapeback_meta::Result<Vec<tapeback_lib::BackupSet>> {
            unimplemented!()
        }
        fn finalize_backup_set(
            &self,
            _: SetId,
            _: u64,
            _: u64,
            _: u64,
            _: u32,
        ) -> tapeback_meta::Result<()> {
            unimplemented!()
        }
        fn set_backup_set_status(
            &self,
            _: SetId,
            _: tapeback_lib::SetStatus,
        ) -> tapeback_meta::Result<()> {
            unimplemented!()
        }
        fn delete_backup_set(&self, _: SetId) -> tapeback_meta::Result<()> {
            unimplemented!()
        }
        fn upsert_scanned_file(
            &self,
            _: SetId,
            _: &FileRecord,
        ) -> tapeback_meta::Result<FileId> {
            unimplemented!()
        }
        fn batch_insert_scanned_files(
            &self,
            _: SetId,
            _: &[FileRecord],
        ) -> tapeback_meta::Result<tapeback_meta::BatchOutcome> {
            unimplemented!()
        }
        fn mark_files_queued(
            &self,
            _: SetId,
            _: &[PathBuf],
        ) -> tapeback_meta::Result<(usize, u64)> {
            unimplemented!()
        }
        fn mark_files_copied(
            &self,
            _: SetId,
            _: &[PendingFile],
            _: &tapeback_meta::ArchiveInfo,
            _: u32,
        ) -> tapeback_meta::Result<()> {
            unimplemented!()
        }
        fn set_chunk_tape_position(&self, _: SetId, _: u32, _: u64) -> tapeback_meta::Result<()> {
            unimplemented!()
        }
        fn pending_files_count(&self, _: SetId) -> tapeback_meta::Result<u64> {
            unimplemented!()
        }
        fn get_compressed_files_count(&self, _: SetId) -> tapeback_meta::Result<u64> {
            unimplemented!()
        }
        fn count_copied_among(&self, _: SetId, _: &[PathBuf]) -> tapeback_meta::Result<u64> {
            unimplemented!()
        }
        fn count_files_of_kind(
            &self,
            _: SetId,
            _: tapeback_lib::FileKind,
        ) -> tapeback_meta::Result<u64> {
            unimplemented!()
        }
        fn sum_file_bytes(&self, _: SetId) -> tapeback_meta::Result<u64> {
            unimplemented!()
        }
        fn sum_compressed_bytes(&self, _: SetId) -> tapeback_meta::Result<u64> {
            unimplemented!()
        }
        fn clear_backup_files_for_set(&self, _: SetId) -> tapeback_meta::Result<()> {
            unimplemented!()
        }
        fn get_file_by_path(
            &self,
            _: SetId,
            _: &std::path::Path,
        ) -> tapeback_meta::Result<Option<tapeback_lib::BackupFile>> {
            unimplemented!()
        }
        fn files_in_chunk(
            &self,
            _: SetId,
            _: u32,
        ) -> tapeback_meta::Result<Vec<tapeback_lib::BackupFile>> {
            unimplemented!()
        }
        fn max_chunk_number(&self, _: SetId) -> tapeback_meta::Result<Option<u32>> {
            unimplemented!()
        }
    }

    #[test]
    fn out_of_order_duplicate_swaps_in_the_smaller_id() {
        let dup = |id: i64, size: u64| PendingFile {
            id: FileId(id),
            path: PathBuf::from("/src/dup"),
            size,
        };
        // The larger id arrives first; the later, smaller-id record must be
        // swapped in and the group size corrected.
        let meta = Arc::new(CannedPending {
            rows: vec![
                PendingFile {
                    id: FileId(2),
                    path: PathBuf::from("/src/a"),
                    size: 10,
                },
                dup(5, 300),
                dup(3, 40),
            ],
        });
        let builder = GroupBuilder::new(meta, GroupTuning::for_target(1000));

        let group = builder
            .fetch_pending_group(SetId(1), TaskId(1), true, 0)
            .unwrap();
        assert_eq!(group.files.len(), 2);
        let entry = group
            .files
            .iter()
            .find(|f| f.path == PathBuf::from("/src/dup"))
            .unwrap();
        assert_eq!(entry.id, FileId(3));
        assert_eq!(entry.size, 40);
        assert_eq!(group.total_size, 50);
    }

    #[test]
    fn repeated_scanner_emissions_yield_one_group_entry() {
        let fx = fixture();
        // The scanner emitting the same path twice collapses to one row
        // upstream, so a group can never carry a path twice.
        let a = FileRecord::new(PathBuf::from("/src/dup"), 100, FileKind::File);
        let b = FileRecord::new(PathBuf::from("/src/dup"), 300, FileKind::File);
        fx.meta.batch_insert_scanned_files(fx.set_pk, &[a, b]).unwrap();
        fx.insert(&[50]);
        fx.scan_done();
        let builder = fx.builder(1000);

        let group = builder
            .fetch_pending_group(fx.set_pk, fx.task_id, true, 0)
            .unwrap();
        assert_eq!(group.files.len(), 2);
        let dups: Vec<_> = group
            .files
            .iter()
            .filter(|f| f.path == PathBuf::from("/src/dup"))
            .collect();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].size, 300);
    }

    #[test]
    fn crossing_append_closes_even_past_tolerance() {
        let fx = fixture();
        // Two 600-byte files against a 1000-byte target: the second append
        // crosses min_group and closes the group at 1200 bytes. Oversized
        // non-giant appends are accepted; only the crossing matters.
        fx.insert(&[600, 600]);
        fx.scan_done();
        let builder = fx.builder(1000);

        let group = builder
            .fetch_pending_group(fx.set_pk, fx.task_id, true, 0)
            .unwrap();
        assert_eq!(group.files.len(), 2);
        assert_eq!(group.total_size, 1200);
    }

    fn mark(fx: &Fixture, files: &[PendingFile], chunk: u32) {
        fx.meta
            .mark_files_copied(
                fx.set_pk,
                files,
                &tapeback_meta::ArchiveInfo {
                    archive_path: PathBuf::from("/tmp/a"),
                    compressed_size: 1,
                    checksum: "00000000".into(),
                    compression_enabled: true,
                    backup_time: chrono::Utc::now(),
                },
                chunk,
            )
            .unwrap();
    }
}
