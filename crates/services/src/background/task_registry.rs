use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use mlconsole_client::{BackgroundTask, TaskId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::options::TaskKind;
use super::task_tracker::TrackError;

/// Completion callback. It lives in the shared registry until it runs, so it must
/// be `Sync` as well as `Send`.
pub type OnComplete = Box<dyn FnOnce(BackgroundTask) + Send + Sync + 'static>;

/// Read-only view of a task being tracked, for task-list display.
#[derive(Debug, Clone)]
pub struct TrackedTask {
    /// Last status observed from the backend.
    pub task: BackgroundTask,
    pub location: String,
    pub kind: TaskKind,
    pub interval: Duration,
    pub polls: u32,
    pub failed_polls: u32,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// The single continuation attached to a tracked task.
pub(crate) enum Completion {
    Callback(OnComplete),
    Channel(oneshot::Sender<Result<BackgroundTask, TrackError>>),
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Callback(_) => f.write_str("Completion::Callback"),
            Completion::Channel(_) => f.write_str("Completion::Channel"),
        }
    }
}

impl Completion {
    pub(crate) fn finish(self, task: BackgroundTask) {
        match self {
            Completion::Callback(on_complete) => on_complete(task),
            Completion::Channel(tx) => {
                let _ = tx.send(Ok(task));
            }
        }
    }

    /// Callbacks only ever see terminal tasks, so they are dropped here.
    pub(crate) fn abandon(self, error: TrackError) {
        if let Completion::Channel(tx) = self {
            let _ = tx.send(Err(error));
        }
    }
}

pub(crate) struct Entry {
    pub(crate) tracked: TrackedTask,
    pub(crate) generation: u64,
    pub(crate) completion: Option<Completion>,
    pub(crate) poll_handle: Option<JoinHandle<()>>,
}

/// In-memory registry of tracked tasks plus a bounded history of finished ones.
///
/// Each registration gets a fresh generation number. Poll loops only touch the
/// entry carrying their own generation, so a loop that outlives a cancel or a
/// re-registration of the same id cannot complete or overwrite the newer entry.
pub struct TaskRegistry {
    active: DashMap<TaskId, Entry>,
    history: Mutex<VecDeque<BackgroundTask>>,
    history_limit: usize,
    next_generation: AtomicU64,
}

impl TaskRegistry {
    pub fn new(history_limit: usize) -> Self {
        Self {
            active: DashMap::new(),
            history: Mutex::new(VecDeque::with_capacity(history_limit)),
            history_limit,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Inserts a new entry unless the id is already tracked, in which case the
    /// rejected completion is handed back.
    pub(crate) fn insert(
        &self,
        tracked: TrackedTask,
        completion: Option<Completion>,
    ) -> Result<u64, Option<Completion>> {
        match self.active.entry(tracked.task.id.clone()) {
            MapEntry::Occupied(_) => Err(completion),
            MapEntry::Vacant(slot) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                slot.insert(Entry {
                    tracked,
                    generation,
                    completion,
                    poll_handle: None,
                });
                Ok(generation)
            }
        }
    }

    /// Stores the poll loop handle. If the entry is already gone the loop is
    /// aborted, unless it has already finished on its own.
    pub(crate) fn attach_handle(&self, id: &TaskId, generation: u64, handle: JoinHandle<()>) {
        match self.active.get_mut(id) {
            Some(mut entry) if entry.generation == generation => {
                entry.poll_handle = Some(handle);
            }
            _ => handle.abort(),
        }
    }

    /// Applies `update` to the entry of this generation. Returns false when the
    /// entry no longer exists.
    pub(crate) fn update(
        &self,
        id: &TaskId,
        generation: u64,
        update: impl FnOnce(&mut TrackedTask),
    ) -> bool {
        match self.active.get_mut(id) {
            Some(mut entry) if entry.generation == generation => {
                update(&mut entry.tracked);
                true
            }
            _ => false,
        }
    }

    /// Removes the entry of this generation so its owner can deliver completion.
    pub(crate) fn claim(&self, id: &TaskId, generation: u64) -> Option<Entry> {
        self.active
            .remove_if(id, |_, entry| entry.generation == generation)
            .map(|(_, entry)| entry)
    }

    pub(crate) fn remove(&self, id: &TaskId) -> Option<Entry> {
        self.active.remove(id).map(|(_, entry)| entry)
    }

    pub(crate) fn ids(&self) -> Vec<TaskId> {
        self.active.iter().map(|r| r.key().clone()).collect()
    }

    pub(crate) fn push_history(&self, task: BackgroundTask) {
        if self.history_limit == 0 {
            return;
        }
        let mut history = self.history.lock();
        history.retain(|t| t.id != task.id);
        history.push_front(task);
        history.truncate(self.history_limit);
    }

    pub fn get(&self, id: &TaskId) -> Option<TrackedTask> {
        self.active.get(id).map(|entry| entry.tracked.clone())
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.active.contains_key(id)
    }

    /// Active tasks, oldest registration first.
    pub fn snapshot(&self) -> Vec<TrackedTask> {
        let mut tasks: Vec<TrackedTask> = self
            .active
            .iter()
            .map(|entry| entry.tracked.clone())
            .collect();
        tasks.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.task.id.cmp(&b.task.id)));
        tasks
    }

    /// Finished tasks, newest first.
    pub fn history(&self) -> Vec<BackgroundTask> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
