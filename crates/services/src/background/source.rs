use async_trait::async_trait;
use mlconsole_client::{ApiClient, ClientError, TaskId};
use serde_json::Value;

/// Where the tracker reads task resources from.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Fetches the raw task resource at `location`.
    async fn fetch_task(&self, location: &str) -> Result<Value, ClientError>;

    /// Location to poll for a task whose trigger response carried none.
    fn location_for(&self, id: &TaskId) -> String;
}

#[async_trait]
impl TaskSource for ApiClient {
    async fn fetch_task(&self, location: &str) -> Result<Value, ClientError> {
        self.fetch_task_resource(location).await
    }

    fn location_for(&self, id: &TaskId) -> String {
        self.url(&self.settings().task_path_for(id.as_str()))
    }
}
