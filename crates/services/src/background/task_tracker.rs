use chrono::Utc;
use futures::FutureExt;
use mlconsole_client::{BackgroundTask, MalformedTask, TaskId};
use mlconsole_config::TaskSettings;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::events::TaskEvent;
use super::options::PollOptions;
use super::source::TaskSource;
use super::task_registry::{Completion, OnComplete, TaskRegistry, TrackedTask};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TrackError {
    #[error("Task {0} is already being tracked")]
    AlreadyTracked(TaskId),
    #[error("Tracking of task {0} was cancelled")]
    Cancelled(TaskId),
    #[error("Malformed task resource: {0}")]
    Malformed(#[from] MalformedTask),
    #[error("Task {id} did not finish within {elapsed:?}")]
    TimedOut { id: TaskId, elapsed: Duration },
    #[error("Polling task {id} panicked: {message}")]
    PollPanicked { id: TaskId, message: String },
    #[error("Poll interval must be greater than zero")]
    InvalidInterval,
    #[error("Task tracker has been shut down")]
    Shutdown,
}

/// Outcome of [`TaskTracker::add_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Started,
    /// A poll loop for this id already runs; the new continuation was dropped.
    AlreadyTracked,
}

/// Resolves once the tracked task reaches a terminal status, or with the reason
/// tracking stopped without one.
pub struct TaskHandle {
    id: TaskId,
    rx: oneshot::Receiver<Result<BackgroundTask, TrackError>>,
}

impl TaskHandle {
    pub fn id(&self) -> &TaskId {
        &self.id
    }
}

impl Future for TaskHandle {
    type Output = Result<BackgroundTask, TrackError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TrackError::Cancelled(this.id.clone()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct Inner {
    source: Arc<dyn TaskSource>,
    registry: TaskRegistry,
    events: broadcast::Sender<TaskEvent>,
    closed: AtomicBool,
}

/// Observes long-running backend tasks until they reach a terminal status.
///
/// Cloning is cheap; all clones share one registry. Every tracked id owns exactly
/// one poll loop, spawned on the Tokio runtime, which sleeps for the poll
/// interval, fetches the task resource, and only then schedules the next tick, so
/// requests for the same task never overlap.
#[derive(Clone)]
pub struct TaskTracker {
    inner: Arc<Inner>,
}

impl TaskTracker {
    pub fn new(source: Arc<dyn TaskSource>, settings: &TaskSettings) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                source,
                registry: TaskRegistry::new(settings.history_limit),
                events,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Starts tracking `task` and returns without waiting for the first poll.
    ///
    /// `on_complete` runs at most once, with the task in a terminal status. When the
    /// id is already tracked, the existing loop and continuation are kept and
    /// `on_complete` is dropped.
    pub fn add_task(
        &self,
        task: BackgroundTask,
        options: PollOptions,
        on_complete: Option<OnComplete>,
    ) -> Result<Registration, TrackError> {
        self.register(task, options, on_complete.map(Completion::Callback))
    }

    /// Starts tracking `task` and returns a handle that resolves with the final
    /// task. Fails with [`TrackError::AlreadyTracked`] if the id is already tracked.
    pub fn track(&self, task: BackgroundTask, options: PollOptions) -> Result<TaskHandle, TrackError> {
        let id = task.id.clone();
        let (tx, rx) = oneshot::channel();
        match self.register(task, options, Some(Completion::Channel(tx)))? {
            Registration::Started => Ok(TaskHandle { id, rx }),
            Registration::AlreadyTracked => Err(TrackError::AlreadyTracked(id)),
        }
    }

    /// Stops tracking `id`. Any in-flight poll response is discarded and the
    /// continuation never runs. Returns false if the id was not tracked.
    pub fn cancel(&self, id: &TaskId) -> bool {
        let Some(entry) = self.inner.registry.remove(id) else {
            return false;
        };
        if let Some(handle) = entry.poll_handle {
            handle.abort();
        }
        if let Some(completion) = entry.completion {
            completion.abandon(TrackError::Cancelled(id.clone()));
        }
        info!(task_id = %id, "Background task tracking cancelled");
        self.inner.emit(TaskEvent::Cancelled(id.clone()));
        true
    }

    /// Cancels every tracked task and rejects further registrations.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let ids = self.inner.registry.ids();
        let count = ids.len();
        for id in ids {
            if let Some(entry) = self.inner.registry.remove(&id) {
                if let Some(handle) = entry.poll_handle {
                    handle.abort();
                }
                if let Some(completion) = entry.completion {
                    completion.abandon(TrackError::Shutdown);
                }
                self.inner.emit(TaskEvent::Cancelled(id));
            }
        }
        info!(cancelled = count, "Task tracker shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn is_tracked(&self, id: &TaskId) -> bool {
        self.inner.registry.contains(id)
    }

    pub fn get(&self, id: &TaskId) -> Option<TrackedTask> {
        self.inner.registry.get(id)
    }

    pub fn snapshot(&self) -> Vec<TrackedTask> {
        self.inner.registry.snapshot()
    }

    pub fn history(&self) -> Vec<BackgroundTask> {
        self.inner.registry.history()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    fn register(
        &self,
        task: BackgroundTask,
        options: PollOptions,
        completion: Option<Completion>,
    ) -> Result<Registration, TrackError> {
        if self.is_shut_down() {
            return Err(TrackError::Shutdown);
        }
        if options.interval.is_zero() {
            return Err(TrackError::InvalidInterval);
        }

        let id = task.id.clone();
        let location = task
            .location
            .clone()
            .unwrap_or_else(|| self.inner.source.location_for(&id));
        let tracked = TrackedTask {
            task: task.clone(),
            location: location.clone(),
            kind: options.kind,
            interval: options.interval,
            polls: 0,
            failed_polls: 0,
            last_error: None,
            started_at: Utc::now(),
        };

        let generation = match self.inner.registry.insert(tracked.clone(), completion) {
            Ok(generation) => generation,
            Err(rejected) => {
                if rejected.is_some() {
                    debug!(task_id = %id, "Task already tracked, keeping the first continuation");
                }
                return Ok(Registration::AlreadyTracked);
            }
        };

        // A shutdown that ran between the check above and the insert did not see
        // this entry.
        if self.is_shut_down() {
            if let Some(entry) = self.inner.registry.claim(&id, generation) {
                if let Some(completion) = entry.completion {
                    completion.abandon(TrackError::Shutdown);
                }
            }
            return Err(TrackError::Shutdown);
        }

        info!(
            task_id = %id,
            %location,
            kind = %options.kind,
            interval_ms = options.interval.as_millis() as u64,
            "Tracking background task"
        );
        self.inner.emit(TaskEvent::Added(tracked));

        let inner = Arc::clone(&self.inner);
        let loop_id = id.clone();
        let handle = tokio::spawn(async move {
            let id = loop_id;
            let poll = poll_loop(Arc::clone(&inner), task, generation, location, options);
            if let Err(panic) = AssertUnwindSafe(poll).catch_unwind().await {
                let message = panic_message(panic.as_ref());
                error!(task_id = %id, %message, "Poll loop panicked, giving up");
                inner.abandon(&id, generation, TrackError::PollPanicked { id: id.clone(), message });
            }
        });
        self.inner.registry.attach_handle(&id, generation, handle);

        Ok(Registration::Started)
    }
}

impl Inner {
    fn emit(&self, event: TaskEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn finish(&self, generation: u64, task: BackgroundTask) {
        let Some(entry) = self.registry.claim(&task.id, generation) else {
            debug!(task_id = %task.id, "Dropping result for a task no longer tracked");
            return;
        };
        info!(
            task_id = %task.id,
            status = %task.status,
            polls = entry.tracked.polls,
            "Background task finished"
        );
        self.registry.push_history(task.clone());
        self.emit(TaskEvent::Finished(task.clone()));
        if let Some(completion) = entry.completion {
            completion.finish(task);
        }
    }

    fn abandon(&self, id: &TaskId, generation: u64, reason: TrackError) {
        let Some(entry) = self.registry.claim(id, generation) else {
            return;
        };
        self.emit(TaskEvent::Abandoned {
            id: id.clone(),
            reason: reason.to_string(),
        });
        if let Some(completion) = entry.completion {
            completion.abandon(reason);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

async fn poll_loop(
    inner: Arc<Inner>,
    initial: BackgroundTask,
    generation: u64,
    location: String,
    options: PollOptions,
) {
    let id = initial.id.clone();

    if initial.is_terminal() {
        // Completion is never delivered from inside add_task.
        tokio::task::yield_now().await;
        inner.finish(generation, initial);
        return;
    }

    let started = Instant::now();
    let mut consecutive_failures: u32 = 0;

    loop {
        tokio::time::sleep(options.interval).await;

        match inner.source.fetch_task(&location).await {
            Err(err) => {
                consecutive_failures += 1;
                let message = err.to_string();
                warn!(
                    task_id = %id,
                    %location,
                    attempt = consecutive_failures,
                    error = %message,
                    "Polling background task failed, retrying"
                );
                let tracked = inner.registry.update(&id, generation, |t| {
                    t.polls += 1;
                    t.failed_polls += 1;
                    t.last_error = Some(message.clone());
                });
                if !tracked {
                    return;
                }
                inner.emit(TaskEvent::PollFailed {
                    id: id.clone(),
                    attempt: consecutive_failures,
                    error: message,
                });
            }
            Ok(resource) => match BackgroundTask::from_resource_for(&id, resource) {
                Err(malformed) => {
                    error!(task_id = %id, %location, error = %malformed, "Malformed task resource, giving up");
                    inner.abandon(&id, generation, TrackError::Malformed(malformed));
                    return;
                }
                Ok(task) if task.is_terminal() => {
                    inner.finish(generation, task);
                    return;
                }
                Ok(task) => {
                    consecutive_failures = 0;
                    let mut changed = false;
                    let tracked = inner.registry.update(&id, generation, |t| {
                        t.polls += 1;
                        t.last_error = None;
                        changed = t.task.status != task.status;
                        t.task = task.clone();
                    });
                    if !tracked {
                        return;
                    }
                    if changed {
                        debug!(task_id = %id, status = %task.status, "Background task status changed");
                        inner.emit(TaskEvent::StatusChanged(task));
                    }
                }
            },
        }

        if let Some(max_duration) = options.max_duration {
            let elapsed = started.elapsed();
            if elapsed >= max_duration {
                warn!(task_id = %id, ?elapsed, "Background task did not finish in time, giving up");
                inner.abandon(
                    &id,
                    generation,
                    TrackError::TimedOut {
                        id: id.clone(),
                        elapsed,
                    },
                );
                return;
            }
        }
    }
}
