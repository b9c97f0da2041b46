//! The tape boundary: a [`TapeDrive`] abstraction over the external device
//! driver, and the [`TapeWriter`] that serializes archive writes onto it.
//!
//! A tape physically cannot do concurrent writes, so every write, queued
//! or direct, funnels through one lease.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, Datelike, Utc};
use crossbeam_channel::{bounded, Sender};
use log::{error, info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use tapeback_lib::SetId;

pub mod dir;
#[cfg(any(test, feature = "test"))]
pub mod mem;

pub use dir::DirDrive;
#[cfg(any(test, feature = "test"))]
pub use mem::MemDrive;

#[derive(Debug, Error)]
pub enum TapeError {
    #[error("tape drive busy")]
    Busy,
    #[error("no writable tape loaded")]
    NoTape,
    #[error("tape writer is shut down")]
    Shutdown,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// Where on tape an archive landed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TapePosition {
    pub block_start: u64,
}

/// The label at the head of a tape.
#[derive(Clone, Debug)]
pub struct TapeLabel {
    pub tape_id: String,
    pub created: Option<DateTime<Utc>>,
}

impl TapeLabel {
    /// Whether the label belongs to the month of `now`.
    ///
    /// Prefers the created timestamp; falls back to the `TAPyymm...` id
    /// convention. An unparseable label is treated as matching; the
    /// operator gets to decide about unlabeled tapes, not the scheduler.
    pub fn matches_month(&self, now: DateTime<Utc>) -> bool {
        if let Some(created) = self.created {
            return created.year() == now.year() && created.month() == now.month();
        }
        let id = self.tape_id.to_ascii_uppercase();
        if let Some(digits) = id.strip_prefix("TAP") {
            if digits.len() >= 4 {
                if let (Ok(yy), Ok(mm)) = (digits[0..2].parse::<i32>(), digits[2..4].parse::<u32>())
                {
                    return 2000 + yy == now.year() && mm == now.month();
                }
            }
        }
        true
    }
}

/// The external tape hardware driver, reduced to what the engine needs.
pub trait TapeDrive: Send + Sync {
    /// Write one archive to the tape, returning its position. Blocks for as
    /// long as the tape takes; the tape is the rate limit, there is no
    /// timeout.
    fn write_archive(&self, path: &Path) -> Result<TapePosition, TapeError>;

    fn read_label(&self) -> Result<Option<TapeLabel>, TapeError>;

    /// Wipe the tape's data while keeping (or refreshing) its label.
    fn erase_preserve_label(&self, use_current_year_month: bool) -> Result<(), TapeError>;
}

/// One queued archive move.
pub struct WriteRequest {
    pub archive_path: PathBuf,
    pub set_pk: SetId,
    pub chunk_number: u32,
    /// Invoked from the writer thread once the write concludes either way.
    pub on_done: Box<dyn FnOnce(Result<TapePosition, TapeError>) + Send>,
}

enum MsgOrExit {
    Msg(WriteRequest),
    Exit,
}

/// Single-consumer serializer in front of the tape device.
///
/// `enqueue` applies backpressure through the bounded queue; the consumer
/// thread processes strictly FIFO. Shutdown drains everything already
/// queued, then refuses new work.
pub struct TapeWriter {
    tx: Sender<MsgOrExit>,
    handle: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    drive: Arc<dyn TapeDrive>,
    lease: Arc<Mutex<()>>,
}

impl TapeWriter {
    pub const DEFAULT_QUEUE_DEPTH: usize = 4;

    pub fn start(drive: Arc<dyn TapeDrive>, queue_depth: usize) -> Self {
        let (tx, rx) = bounded::<MsgOrExit>(queue_depth.max(1));
        let lease = Arc::new(Mutex::new(()));
        let consumer_drive = drive.clone();
        let consumer_lease = lease.clone();
        let handle = std::thread::Builder::new()
            .name("tape-writer".into())
            .spawn(move || {
                for msg in rx.iter() {
                    let req = match msg {
                        MsgOrExit::Exit => break,
                        MsgOrExit::Msg(req) => req,
                    };
                    let path = req.archive_path.clone();
                    info!(
                        "tape write start: set {} chunk {} ({})",
                        req.set_pk,
                        req.chunk_number,
                        path.display()
                    );
                    let result = {
                        let _writing = consumer_lease.lock();
                        consumer_drive.write_archive(&path)
                    };
                    match &result {
                        Ok(pos) => {
                            info!(
                                "tape write complete: set {} chunk {} at block {}",
                                req.set_pk, req.chunk_number, pos.block_start
                            );
                            match std::fs::remove_file(&path) {
                                Ok(()) => info!("staged archive removed: {}", path.display()),
                                Err(e) => {
                                    warn!("could not remove staged archive {}: {e}", path.display())
                                }
                            }
                        }
                        Err(e) => {
                            // Leave the archive where it is for a retry or
                            // operator intervention; never reorder past it.
                            error!(
                                "tape write failed: set {} chunk {}: {e}",
                                req.set_pk, req.chunk_number
                            );
                        }
                    }
                    (req.on_done)(result);
                }
            })
            .expect("spawning tape-writer thread");

        TapeWriter {
            tx,
            handle: Mutex::new(Some(handle)),
            closed: Arc::new(AtomicBool::new(false)),
            drive,
            lease,
        }
    }

    /// Queue an archive move. Blocks while the queue is full; that is the
    /// backpressure the compressor feels when the tape cannot keep up.
    pub fn enqueue_blocking(&self, request: WriteRequest) -> Result<(), TapeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TapeError::Shutdown);
        }
        self.tx
            .send(MsgOrExit::Msg(request))
            .map_err(|_| TapeError::Shutdown)
    }

    /// `enqueue_blocking` moved off the async runtime.
    pub async fn enqueue(&self, request: WriteRequest) -> Result<(), TapeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TapeError::Shutdown);
        }
        let tx = self.tx.clone();
        tokio::task::spawn_blocking(move || {
            tx.send(MsgOrExit::Msg(request)).map_err(|_| TapeError::Shutdown)
        })
        .await
        .map_err(|e| TapeError::Other(format!("enqueue task panicked: {e}")))?
    }

    /// Direct-to-tape path: hold the writer's lease and perform the write
    /// inline, bypassing the queue. The single-writer invariant is shared
    /// with the consumer thread via the same lease.
    pub fn write_serialized(&self, path: &Path) -> Result<TapePosition, TapeError> {
        let _writing = self.lease.lock();
        self.drive.write_archive(path)
    }

    /// Drain the queue and stop the consumer. Safe to call once; later
    /// enqueues fail with [`TapeError::Shutdown`].
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Exit rides the same FIFO queue, so everything already enqueued is
        // written first.
        let _ = self.tx.send(MsgOrExit::Exit);
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("tape-writer thread panicked during shutdown");
            }
        }
    }
}

impl Drop for TapeWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn label_month_prefers_created() {
        let label = TapeLabel {
            tape_id: "TAP260101001".into(),
            created: Some(at(2026, 3)),
        };
        assert!(label.matches_month(at(2026, 3)));
        assert!(!label.matches_month(at(2026, 4)));
    }

    #[test]
    fn label_month_falls_back_to_id_convention() {
        let label = TapeLabel {
            tape_id: "TAP2603xxx".into(),
            created: None,
        };
        assert!(label.matches_month(at(2026, 3)));
        assert!(!label.matches_month(at(2026, 2)));
    }

    #[test]
    fn unparseable_labels_match() {
        let label = TapeLabel {
            tape_id: "SCRATCH-1".into(),
            created: None,
        };
        assert!(label.matches_month(at(2026, 1)));
    }

    #[test]
    fn writer_is_fifo_and_drains_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let drive = Arc::new(MemDrive::new());
        let writer = TapeWriter::start(drive.clone(), 2);

        let done = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5u32 {
            let path = dir.path().join(format!("chunk{i}"));
            std::fs::write(&path, vec![0u8; (i as usize + 1) * 10]).unwrap();
            let done = done.clone();
            writer
                .enqueue_blocking(WriteRequest {
                    archive_path: path,
                    set_pk: SetId(1),
                    chunk_number: i,
                    on_done: Box::new(move |res| {
                        res.unwrap();
                        done.lock().push(i);
                    }),
                })
                .unwrap();
        }
        writer.shutdown();

        assert_eq!(*done.lock(), vec![0, 1, 2, 3, 4]);
        let writes = drive.writes();
        assert_eq!(writes.len(), 5);
        assert!(writes.windows(2).all(|w| w[0].position < w[1].position));

        // After shutdown new work is refused.
        let refused = writer.enqueue_blocking(WriteRequest {
            archive_path: dir.path().join("late"),
            set_pk: SetId(1),
            chunk_number: 9,
            on_done: Box::new(|_| {}),
        });
        assert!(matches!(refused, Err(TapeError::Shutdown)));
    }

    #[test]
    fn failed_write_leaves_archive_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let drive = Arc::new(MemDrive::new());
        drive.fail_next_write();
        let writer = TapeWriter::start(drive.clone(), 1);

        let path = dir.path().join("chunk0");
        std::fs::write(&path, b"payload").unwrap();
        let failed = Arc::new(AtomicBool::new(false));
        let observed = failed.clone();
        let enqueued_path = path.clone();
        writer
            .enqueue_blocking(WriteRequest {
                archive_path: enqueued_path,
                set_pk: SetId(1),
                chunk_number: 0,
                on_done: Box::new(move |res| observed.store(res.is_err(), Ordering::SeqCst)),
            })
            .unwrap();
        writer.shutdown();

        assert!(failed.load(Ordering::SeqCst));
        assert!(path.exists());
        assert!(drive.writes().is_empty());
    }
}
