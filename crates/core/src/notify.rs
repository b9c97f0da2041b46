use log::{info, warn};

use tapeback_lib::TaskId;

/// Events the engine raises for an external dispatcher.
///
/// Delivery transport (chat webhook, mail, whatever) is not the engine's
/// business; it only names the moments an operator cares about.
#[derive(Debug)]
pub enum Notification<'a> {
    /// The loaded tape's label month does not match the current month.
    TapeChangeRequired { tape_id: &'a str },
    TaskCompleted {
        task_id: TaskId,
        chunks: u32,
        total_bytes: u64,
    },
    TaskFailed { task_id: TaskId, error: &'a str },
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification<'_>);
}

/// Default dispatcher: the log stream.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification<'_>) {
        match notification {
            Notification::TapeChangeRequired { tape_id } => {
                warn!("tape change required: loaded tape {tape_id} is not for the current month")
            }
            Notification::TaskCompleted {
                task_id,
                chunks,
                total_bytes,
            } => info!("task {task_id} completed: {chunks} chunks, {total_bytes} bytes"),
            Notification::TaskFailed { task_id, error } => {
                warn!("task {task_id} failed: {error}")
            }
        }
    }
}
