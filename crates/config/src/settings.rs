use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub api: ApiSettings,
    pub auth: AuthSettings,
    pub tasks: TaskSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiSettings {
    pub base_url: String,
    pub timeout_secs: u64,
    /// Fallback task resource path when a trigger response carries no location.
    /// `{id}` is replaced with the task id.
    pub task_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub refresh_path: String,
    pub refresh_skew_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TaskSettings {
    pub default_interval_ms: u64,
    /// Per task-kind poll interval overrides, keyed by kind name.
    #[serde(default)]
    pub intervals: HashMap<String, u64>,
    pub max_poll_secs: Option<u64>,
    pub history_limit: usize,
    pub event_capacity: usize,
}

impl ApiSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn task_path_for(&self, task_id: &str) -> String {
        self.task_path.replace("{id}", task_id)
    }
}

impl AuthSettings {
    pub fn refresh_skew(&self) -> Duration {
        Duration::from_secs(self.refresh_skew_secs)
    }
}

impl TaskSettings {
    pub fn default_interval(&self) -> Duration {
        Duration::from_millis(self.default_interval_ms)
    }

    /// Poll interval for a task kind, falling back to the default interval.
    pub fn interval_for(&self, kind: &str) -> Duration {
        self.intervals
            .get(kind)
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or_else(|| self.default_interval())
    }

    pub fn max_poll_duration(&self) -> Option<Duration> {
        self.max_poll_secs.map(Duration::from_secs)
    }
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            default_interval_ms: 5000,
            intervals: HashMap::from([
                ("annotation".to_string(), 3000),
                ("inference".to_string(), 3000),
            ]),
            max_poll_secs: None,
            history_limit: 50,
            event_capacity: 256,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::default()
                    .separator("__")
                    .prefix("MLCONSOLE"),
            )
            .set_default("api.base_url", "http://localhost:8080/api")?
            .set_default("api.timeout_secs", 30)?
            .set_default("api.task_path", "/tasks/{id}")?
            .set_default("auth.access_token", None::<String>)?
            .set_default("auth.refresh_token", None::<String>)?
            .set_default("auth.refresh_path", "/auth/refresh")?
            .set_default("auth.refresh_skew_secs", 60)?
            .set_default("tasks.default_interval_ms", 5000)?
            .set_default("tasks.intervals.annotation", 3000)?
            .set_default("tasks.intervals.inference", 3000)?
            .set_default("tasks.max_poll_secs", None::<u64>)?
            .set_default("tasks.history_limit", 50)?
            .set_default("tasks.event_capacity", 256)?
            .build()?;

        config.try_deserialize()
    }
}
