use reqwest::{StatusCode, Url};
use serde_json::Value;

use crate::error::{ClientError, ClientResult};
use crate::models::{BackgroundTask, TaskId, TaskStatus};

/// Task handle extracted from the response of a request that started a
/// long-running backend job.
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub task: BackgroundTask,
    /// Absolute URL of the task resource to poll.
    pub location: String,
    pub status: StatusCode,
}

impl TaskSubmission {
    /// Builds a submission from the pieces of a trigger response.
    ///
    /// The task location comes from the `Location` header, then a `location` or
    /// `url` body field, then `fallback_location(id)`. Relative locations are
    /// resolved against `request_url`. The id comes from the body (`id`,
    /// `task_id` or `taskId`), else the last path segment of the location.
    pub fn from_parts(
        status: StatusCode,
        request_url: &Url,
        location_header: Option<&str>,
        body: Option<&Value>,
        fallback_location: impl FnOnce(&TaskId) -> String,
    ) -> ClientResult<Self> {
        let body_location = body.and_then(|b| {
            ["location", "url"]
                .iter()
                .find_map(|key| b.get(*key).and_then(Value::as_str))
        });
        let explicit_location = location_header
            .or(body_location)
            .map(|loc| resolve(request_url, loc))
            .transpose()?;

        let id = body
            .and_then(body_task_id)
            .or_else(|| explicit_location.as_ref().and_then(id_from_location))
            .ok_or_else(|| {
                ClientError::InvalidRequest("response carries no task id".to_string())
            })?;

        let mut task = match body {
            Some(body) if body.get("id").is_some() && body.get("status").is_some() => {
                BackgroundTask::from_resource(body.clone())
                    .map_err(|e| ClientError::InvalidRequest(e.to_string()))?
            }
            _ => {
                let mut task = BackgroundTask::new(id.clone());
                if let Some(status) = body.and_then(|b| b.get("status")).and_then(Value::as_str) {
                    task.status = TaskStatus::from(status);
                }
                task
            }
        };

        let location = match explicit_location {
            Some(url) => url.to_string(),
            None => resolve(request_url, &fallback_location(&task.id))?.to_string(),
        };
        task.location = Some(location.clone());

        Ok(Self {
            task,
            location,
            status,
        })
    }
}

fn resolve(base: &Url, location: &str) -> ClientResult<Url> {
    base.join(location)
        .map_err(|e| ClientError::InvalidRequest(format!("invalid task location {location:?}: {e}")))
}

fn body_task_id(body: &Value) -> Option<TaskId> {
    ["id", "task_id", "taskId"].iter().find_map(|key| {
        let raw = match body.get(*key)? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        TaskId::new(raw).ok()
    })
}

fn id_from_location(url: &Url) -> Option<TaskId> {
    let segment = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    TaskId::new(segment).ok()
}
