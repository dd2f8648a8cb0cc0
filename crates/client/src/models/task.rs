use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Opaque task identifier assigned by the backend.
///
/// Backends hand out either string or numeric ids; both are normalised to a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Result<Self, MalformedTask> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(MalformedTask::EmptyId);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Number(serde_json::Number),
        }

        let raw = match RawId::deserialize(deserializer)? {
            RawId::Text(s) => s,
            RawId::Number(n) => n.to_string(),
        };
        TaskId::new(raw).map_err(serde::de::Error::custom)
    }
}

/// Backend task status. Anything outside the known vocabulary is kept verbatim
/// and treated as still running.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Other(String),
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Other(s) => s,
        }
    }
}

impl From<String> for TaskStatus {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "pending" => TaskStatus::Pending,
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Other(value),
        }
    }
}

impl From<&str> for TaskStatus {
    fn from(value: &str) -> Self {
        TaskStatus::from(value.to_string())
    }
}

impl From<TaskStatus> for String {
    fn from(value: TaskStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MalformedTask {
    #[error("task resource is not a JSON object")]
    NotAnObject,
    #[error("task resource has no id")]
    MissingId,
    #[error("task id is empty")]
    EmptyId,
    #[error("task resource has no status")]
    MissingStatus,
    #[error("task resource describes {found}, expected {expected}")]
    IdMismatch { expected: TaskId, found: TaskId },
    #[error("invalid task resource: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundTask {
    pub id: TaskId,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, alias = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, alias = "payload", skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Job-specific fields the console does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BackgroundTask {
    pub fn new(id: TaskId) -> Self {
        Self {
            id,
            status: TaskStatus::Pending,
            created_at: None,
            location: None,
            result: None,
            extra: Map::new(),
        }
    }

    pub fn with_status(mut self, status: impl Into<TaskStatus>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Parses a task resource fetched from the backend.
    ///
    /// Unlike plain deserialisation, a resource without `status` is rejected: a
    /// polled resource that never reports a status can never resolve.
    pub fn from_resource(value: Value) -> Result<Self, MalformedTask> {
        let object = value.as_object().ok_or(MalformedTask::NotAnObject)?;
        match object.get("id") {
            None | Some(Value::Null) => return Err(MalformedTask::MissingId),
            Some(Value::String(id)) if id.trim().is_empty() => return Err(MalformedTask::EmptyId),
            _ => {}
        }
        match object.get("status") {
            Some(Value::String(_)) => {}
            None | Some(Value::Null) => return Err(MalformedTask::MissingStatus),
            Some(other) => {
                return Err(MalformedTask::Invalid(format!("status is not a string: {other}")));
            }
        }

        serde_json::from_value(value).map_err(|e| MalformedTask::Invalid(e.to_string()))
    }

    /// Like [`BackgroundTask::from_resource`], but also checks the resource is the
    /// task being tracked.
    pub fn from_resource_for(expected: &TaskId, value: Value) -> Result<Self, MalformedTask> {
        let task = Self::from_resource(value)?;
        if &task.id != expected {
            return Err(MalformedTask::IdMismatch {
                expected: expected.clone(),
                found: task.id,
            });
        }
        Ok(task)
    }
}
