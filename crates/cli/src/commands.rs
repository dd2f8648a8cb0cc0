use anyhow::{Context, bail};
use clap::{Args, Subcommand};
use futures::future::join_all;
use mlconsole_client::{BackgroundTask, TaskStatus};
use mlconsole_services::{PollOptions, Session, TaskEvent, TaskKind};
use reqwest::Method;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Subcommand)]
pub enum Command {
    /// GET an API path and print the JSON response
    Get { path: String },
    /// Start a long-running job and follow its task until it finishes
    Submit {
        path: String,
        #[arg(long, default_value = "POST")]
        method: String,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
        #[command(flatten)]
        poll: PollArgs,
    },
    /// Follow existing tasks by resource location until they finish
    Watch {
        #[arg(required = true)]
        locations: Vec<String>,
        #[command(flatten)]
        poll: PollArgs,
    },
}

#[derive(Debug, Args)]
pub struct PollArgs {
    /// Task kind; selects the configured poll interval
    #[arg(long, default_value = "other")]
    kind: TaskKind,
    /// Poll interval in milliseconds, overriding the configured one
    #[arg(long)]
    interval_ms: Option<u64>,
    /// Stop waiting after this many seconds
    #[arg(long)]
    max_secs: Option<u64>,
}

impl PollArgs {
    fn options(&self, session: &Session) -> PollOptions {
        let mut options = session.poll_options(self.kind);
        if let Some(ms) = self.interval_ms {
            options.interval = Duration::from_millis(ms);
        }
        if let Some(secs) = self.max_secs {
            options = options.with_max_duration(Duration::from_secs(secs));
        }
        options
    }
}

pub async fn run(session: &Session, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Get { path } => {
            let value: Value = session.client().get(&path).await?;
            print_json(&value)
        }
        Command::Submit {
            path,
            method,
            body,
            poll,
        } => {
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .context("invalid HTTP method")?;
            let body = body
                .map(|raw| serde_json::from_str::<Value>(&raw))
                .transpose()
                .context("--body is not valid JSON")?;

            let _progress = ProgressPrinter::spawn(session);
            let handle = session
                .submit_and_track(method, &path, body.as_ref(), poll.options(session))
                .await?;
            info!(task_id = %handle.id(), "Waiting for background task");

            report(vec![handle.await.map_err(anyhow::Error::from)])
        }
        Command::Watch { locations, poll } => {
            let options = poll.options(session);
            let _progress = ProgressPrinter::spawn(session);

            let mut handles = Vec::with_capacity(locations.len());
            for location in &locations {
                let url = session.client().url(location);
                let resource = session
                    .client()
                    .fetch_task_resource(&url)
                    .await
                    .with_context(|| format!("fetching task at {url}"))?;
                let task = BackgroundTask::from_resource(resource)
                    .with_context(|| format!("task at {url}"))?
                    .with_location(url);
                handles.push(session.tracker().track(task, options)?);
            }

            let outcomes = join_all(handles)
                .await
                .into_iter()
                .map(|outcome| outcome.map_err(anyhow::Error::from))
                .collect();
            report(outcomes)
        }
    }
}

/// Runs `command` unless `interrupt` fires first. An interrupted run is an error,
/// so unfinished tasks never exit with status 0.
pub async fn run_until<F, T>(session: &Session, command: Command, interrupt: F) -> anyhow::Result<()>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = interrupt => {
            warn!("Interrupted, cancelling tracked tasks");
            bail!("Interrupted before all tasks finished")
        }
        result = run(session, command) => result,
    }
}

/// Prints every final task to stdout and fails when any did not complete.
fn report(outcomes: Vec<anyhow::Result<BackgroundTask>>) -> anyhow::Result<()> {
    let mut unsuccessful = 0;
    for outcome in outcomes {
        match outcome {
            Ok(task) => {
                if task.status == TaskStatus::Failed {
                    unsuccessful += 1;
                }
                print_json(&serde_json::to_value(&task)?)?;
            }
            Err(e) => {
                unsuccessful += 1;
                warn!(error = %e, "Task tracking ended without a result");
            }
        }
    }
    if unsuccessful > 0 {
        bail!("{unsuccessful} task(s) did not complete successfully");
    }
    Ok(())
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Logs tracker events until dropped.
struct ProgressPrinter(JoinHandle<()>);

impl ProgressPrinter {
    fn spawn(session: &Session) -> Self {
        let mut events = session.tracker().subscribe();
        Self(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TaskEvent::Added(tracked)) => {
                        info!(task_id = %tracked.task.id, location = %tracked.location, "Tracking");
                    }
                    Ok(TaskEvent::StatusChanged(task)) => {
                        info!(task_id = %task.id, status = %task.status, "Status changed");
                    }
                    Ok(TaskEvent::PollFailed { id, attempt, error }) => {
                        warn!(task_id = %id, attempt, %error, "Poll failed");
                    }
                    Ok(TaskEvent::Finished(task)) => {
                        info!(task_id = %task.id, status = %task.status, "Finished");
                    }
                    Ok(TaskEvent::Cancelled(id)) => info!(task_id = %id, "Cancelled"),
                    Ok(TaskEvent::Abandoned { id, reason }) => {
                        warn!(task_id = %id, %reason, "Abandoned");
                    }
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed task events"),
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }
}

impl Drop for ProgressPrinter {
    fn drop(&mut self) {
        self.0.abort();
    }
}
