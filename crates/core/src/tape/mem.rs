//! In-memory tape drive for tests, with a tripwire for concurrent writes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::Mutex;

use super::{TapeDrive, TapeError, TapeLabel, TapePosition};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemWrite {
    pub source: PathBuf,
    pub size: u64,
    pub position: u64,
}

#[derive(Default)]
pub struct MemDrive {
    state: Mutex<MemState>,
    writing: AtomicBool,
    fail_next: AtomicBool,
}

#[derive(Default)]
struct MemState {
    writes: Vec<MemWrite>,
    bytes_written: u64,
    label: Option<TapeLabel>,
}

impl MemDrive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label(tape_id: &str, current_month: bool) -> Self {
        let drive = Self::new();
        drive.state.lock().label = Some(TapeLabel {
            tape_id: tape_id.to_owned(),
            created: current_month.then(Utc::now),
        });
        drive
    }

    pub fn writes(&self) -> Vec<MemWrite> {
        self.state.lock().writes.clone()
    }

    pub fn fail_next_write(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl TapeDrive for MemDrive {
    fn write_archive(&self, path: &Path) -> Result<TapePosition, TapeError> {
        // The device cannot write concurrently; a second writer here means
        // the serialization invariant broke upstream.
        assert!(
            !self.writing.swap(true, Ordering::SeqCst),
            "concurrent tape write detected"
        );
        let result = (|| {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(TapeError::Busy);
            }
            let size = std::fs::metadata(path)?.len();
            let mut state = self.state.lock();
            let position = state.bytes_written;
            state.writes.push(MemWrite {
                source: path.to_owned(),
                size,
                position,
            });
            state.bytes_written += size;
            Ok(TapePosition {
                block_start: position,
            })
        })();
        self.writing.store(false, Ordering::SeqCst);
        result
    }

    fn read_label(&self) -> Result<Option<TapeLabel>, TapeError> {
        Ok(self.state.lock().label.clone())
    }

    fn erase_preserve_label(&self, use_current_year_month: bool) -> Result<(), TapeError> {
        let mut state = self.state.lock();
        state.writes.clear();
        state.bytes_written = 0;
        if use_current_year_month {
            if let Some(label) = &mut state.label {
                label.created = Some(Utc::now());
            }
        }
        Ok(())
    }
}
