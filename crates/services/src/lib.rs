pub mod background;
pub mod session;

pub use background::{
    PollOptions, Registration, TaskEvent, TaskHandle, TaskKind, TaskSource, TaskTracker,
    TrackError, TrackedTask,
};
pub use session::{Session, SessionError};
