use mlconsole_client::{BackgroundTask, TaskId};

use super::task_registry::TrackedTask;

/// Lifecycle notifications fanned out to task-list consumers.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Added(TrackedTask),
    /// A poll observed a different non-terminal status.
    StatusChanged(BackgroundTask),
    /// A poll request failed; the task is still being tracked.
    PollFailed {
        id: TaskId,
        attempt: u32,
        error: String,
    },
    Finished(BackgroundTask),
    Cancelled(TaskId),
    /// Tracking stopped without a terminal status (malformed resource, timeout).
    Abandoned { id: TaskId, reason: String },
}

impl TaskEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            TaskEvent::Added(tracked) => &tracked.task.id,
            TaskEvent::StatusChanged(task) | TaskEvent::Finished(task) => &task.id,
            TaskEvent::PollFailed { id, .. }
            | TaskEvent::Cancelled(id)
            | TaskEvent::Abandoned { id, .. } => id,
        }
    }
}
