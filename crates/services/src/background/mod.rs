pub mod events;
pub mod options;
pub mod source;
pub mod task_registry;
pub mod task_tracker;

pub use events::TaskEvent;
pub use options::{DEFAULT_POLL_INTERVAL, PollOptions, TaskKind};
pub use source::TaskSource;
pub use task_registry::{OnComplete, TaskRegistry, TrackedTask};
pub use task_tracker::{Registration, TaskHandle, TaskTracker, TrackError};
