//! The tapeback pipeline core: scan → stage → group → compress → write →
//! mark, orchestrated per task execution.
//!
//! Component map:
//! - [`scan`]: walks source roots into [`staging`]'s buffer
//! - [`staging`]: absorbs scanner bursts ahead of the metadata store
//! - [`group`]: assembles archive-sized groups of pending files
//! - [`worker`]: drives fetch → compress → mark → tape handoff
//! - [`tape`]: serializes archive writes onto the (emulated or real) device
//! - [`coordinator`]: one task execution end to end
//! - [`service`]: the typed control surface
//!
//! External collaborators enter through traits: [`compress::Compressor`],
//! [`tape::TapeDrive`], [`scan::Scanner`], [`notify::Notifier`].

pub mod compress;
pub mod coordinator;
pub mod error;
pub mod group;
pub mod notify;
pub mod scan;
pub mod service;
pub mod staging;
pub mod tape;
pub mod worker;

pub use coordinator::{
    ExecutionOutcome, ExecutionReport, RunMode, RunOptions, SchedulePeriod, TaskCoordinator,
};
pub use error::{EngineError, Result};
pub use service::{BackupService, ServiceError};
