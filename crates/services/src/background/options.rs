use mlconsole_config::TaskSettings;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Kind of long-running backend job. Used to pick the poll interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ContainerBuild,
    DatasetDownload,
    Annotation,
    Inference,
    Training,
    #[default]
    Other,
}

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        TaskKind::ContainerBuild,
        TaskKind::DatasetDownload,
        TaskKind::Annotation,
        TaskKind::Inference,
        TaskKind::Training,
        TaskKind::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::ContainerBuild => "container_build",
            TaskKind::DatasetDownload => "dataset_download",
            TaskKind::Annotation => "annotation",
            TaskKind::Inference => "inference",
            TaskKind::Training => "training",
            TaskKind::Other => "other",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown task kind: {s}"))
    }
}

/// Per call-site polling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub interval: Duration,
    /// Give up on the task after this long. `None` polls until the backend
    /// reports a terminal status.
    pub max_duration: Option<Duration>,
    pub kind: TaskKind,
}

impl PollOptions {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            max_duration: None,
            kind: TaskKind::Other,
        }
    }

    /// Options for a task kind as configured in `tasks.intervals.<kind>`.
    pub fn for_kind(settings: &TaskSettings, kind: TaskKind) -> Self {
        Self {
            interval: settings.interval_for(kind.as_str()),
            max_duration: settings.max_poll_duration(),
            kind,
        }
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }
}

impl Default for PollOptions {
    fn default() -> Self {
        Self::every(DEFAULT_POLL_INTERVAL)
    }
}
