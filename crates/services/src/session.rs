use mlconsole_client::{ApiClient, ClientError, TokenPair};
use mlconsole_config::{Settings, TaskSettings};
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::background::{PollOptions, TaskHandle, TaskKind, TaskTracker, TrackError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Track(#[from] TrackError),
}

/// A logged-in console session: the API client plus the task tracker that lives
/// exactly as long as the session does.
pub struct Session {
    client: ApiClient,
    tracker: TaskTracker,
    tasks: TaskSettings,
}

impl Session {
    pub fn new(client: ApiClient, tasks: TaskSettings) -> Self {
        let tracker = TaskTracker::new(Arc::new(client.clone()), &tasks);
        Self {
            client,
            tracker,
            tasks,
        }
    }

    pub async fn from_settings(settings: &Settings) -> Result<Self, SessionError> {
        let client = ApiClient::from_settings(settings).await?;
        Ok(Self::new(client, settings.tasks.clone()))
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn poll_options(&self, kind: TaskKind) -> PollOptions {
        PollOptions::for_kind(&self.tasks, kind)
    }

    /// Exchanges credentials for a token pair at `path` and keeps it for
    /// subsequent requests.
    pub async fn login(&self, path: &str, credentials: &Value) -> Result<(), SessionError> {
        let pair: TokenPair = self.client.post(path, credentials).await?;
        self.client.tokens().set_tokens(pair).await;
        info!("Console session logged in");
        Ok(())
    }

    /// Starts a long-running backend job and tracks the task it returns.
    pub async fn submit_and_track(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        options: PollOptions,
    ) -> Result<TaskHandle, SessionError> {
        let submission = self.client.submit(method, path, body).await?;
        Ok(self.tracker.track(submission.task, options)?)
    }

    /// Stops all task tracking and forgets the session tokens.
    pub async fn logout(&self) {
        self.tracker.shutdown();
        self.client.tokens().clear().await;
        info!("Console session logged out");
    }
}
