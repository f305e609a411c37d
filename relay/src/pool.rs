//! Bounded worker pool for one round's tasks.
//!
//! Tasks queue FIFO behind at most `max_workers` scoped threads. Each task gets
//! a fresh repository copy that is discarded once its handoff exists.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;

use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::agents::worker::WorkerAgent;
use crate::core::types::{Actor, Handoff, HandoffStatus, Scope, Task, TaskStatus};
use crate::io::model::ModelBackend;
use crate::io::repo_copy::{RepoCopy, RepoCopyService};
use crate::io::session_log::{SessionLogger, event};
use crate::io::tools::ToolExecutor;

/// Runs one task inside an exclusively owned copy.
pub trait TaskRunner: Sync {
    fn run_task(&self, task: &Task, scope: &Scope, copy: &RepoCopy) -> Handoff;
}

impl<B: ModelBackend, T: ToolExecutor> TaskRunner for WorkerAgent<'_, B, T> {
    fn run_task(&self, task: &Task, scope: &Scope, copy: &RepoCopy) -> Handoff {
        self.execute(task, scope, copy)
    }
}

/// A pending task and the scope it belongs to.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub task: Task,
    pub scope: Scope,
}

/// A task in its terminal status with the handoff it produced.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task: Task,
    pub handoff: Handoff,
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    max_workers: usize,
    log: SessionLogger,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkerPool {
    pub fn new(max_workers: usize, log: SessionLogger) -> Self {
        Self {
            max_workers: max_workers.max(1),
            log,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run every item and block until each has a handoff.
    ///
    /// Results come back in submission order regardless of completion order.
    #[instrument(skip_all, fields(tasks = items.len(), max_workers = self.max_workers))]
    pub fn submit<R, C>(&self, runner: &R, copies: &C, items: Vec<WorkItem>) -> Vec<TaskResult>
    where
        R: TaskRunner,
        C: RepoCopyService,
    {
        let total = items.len();
        if total == 0 {
            return Vec::new();
        }
        let queue = Mutex::new(items.into_iter().enumerate().collect::<VecDeque<_>>());
        let slots: Mutex<Vec<Option<TaskResult>>> = Mutex::new((0..total).map(|_| None).collect());
        let threads = self.max_workers.min(total);

        thread::scope(|scope| {
            for n in 0..threads {
                let (queue, slots) = (&queue, &slots);
                let spawned = thread::Builder::new()
                    .name(format!("relay-worker-{n}"))
                    .spawn_scoped(scope, move || {
                        loop {
                            let next = lock(queue).pop_front();
                            let Some((index, item)) = next else {
                                break;
                            };
                            let result = self.run_one(runner, copies, item);
                            lock(slots)[index] = Some(result);
                        }
                    });
                if let Err(err) = spawned {
                    warn!(error = %err, worker = n, "failed to spawn worker thread");
                }
            }
        });

        // Only reachable when no worker thread could be spawned at all.
        let leftover = queue.into_inner().unwrap_or_else(PoisonError::into_inner);
        let mut slots = slots.into_inner().unwrap_or_else(PoisonError::into_inner);
        for (index, item) in leftover {
            let WorkItem { mut task, .. } = item;
            let handoff = self.failed_without_worker(&task, "no worker thread available");
            self.set_status(&mut task, TaskStatus::Failed);
            slots[index] = Some(TaskResult { task, handoff });
        }
        info!(completed = total, "worker pool drained");
        slots.into_iter().flatten().collect()
    }

    fn run_one<R, C>(&self, runner: &R, copies: &C, item: WorkItem) -> TaskResult
    where
        R: TaskRunner,
        C: RepoCopyService,
    {
        let WorkItem { mut task, scope } = item;
        self.set_status(&mut task, TaskStatus::Assigned);
        let handoff = match copies.create_copy(&task.id) {
            Ok(copy) => {
                self.set_status(&mut task, TaskStatus::Running);
                debug!(task = %task.id, copy = copy.id(), "worker started");
                let handoff = runner.run_task(&task, &scope, &copy);
                let copy_id = copy.id().to_string();
                if let Err(err) = copies.discard(copy) {
                    warn!(
                        task = %task.id,
                        copy = %copy_id,
                        error = %format!("{err:#}"),
                        "failed to discard repository copy"
                    );
                }
                handoff
            }
            Err(err) => self.failed_without_worker(
                &task,
                &format!("could not create a repository copy: {err:#}"),
            ),
        };
        let terminal = if handoff.status() == HandoffStatus::Done {
            TaskStatus::Done
        } else {
            TaskStatus::Failed
        };
        self.set_status(&mut task, terminal);
        TaskResult { task, handoff }
    }

    fn failed_without_worker(&self, task: &Task, reason: &str) -> Handoff {
        warn!(task = %task.id, reason, "task failed before a worker ran");
        let handoff = Handoff::from_worker(
            task,
            HandoffStatus::Failed,
            "task did not run",
            "",
            vec![reason.to_string()],
        );
        self.log
            .record(Actor::Worker, &task.id, event::HANDOFF, &handoff);
        handoff
    }

    fn set_status(&self, task: &mut Task, next: TaskStatus) {
        match task.transition(next) {
            Ok(()) => self.log.record(
                Actor::Controller,
                &task.id,
                event::TASK_STATUS,
                &json!({ "task_id": task.id, "status": next.as_str() }),
            ),
            Err(err) => warn!(task = %task.id, error = %err, "ignored task status change"),
        }
    }
}
