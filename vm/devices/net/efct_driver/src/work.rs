// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A delayed work queue served by a single worker thread.
//!
//! Each [`DelayedWork`] item has the semantics of a kernel delayed work item:
//! scheduling work that is already pending does nothing, the work never runs
//! concurrently with itself, and [`DelayedWork::cancel`] guarantees that the
//! work will not run again once it returns. Items on the same queue run one at
//! a time, in deadline order.

use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

type WorkFn = Box<dyn FnMut() -> Option<Duration> + Send>;

pub(crate) struct WorkQueue {
    name: String,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    state: Mutex<QueueState>,
    cond: Condvar,
}

#[derive(Default)]
struct QueueState {
    items: HashMap<u64, Item>,
    /// Deadlines of pending items. Entries whose item has since been cancelled
    /// or rescheduled are stale and skipped.
    timers: BinaryHeap<Reverse<(Instant, u64)>>,
    next_id: u64,
    shutdown: bool,
}

struct Item {
    /// Taken by the worker while the work runs.
    work: Option<WorkFn>,
    deadline: Option<Instant>,
    running: bool,
    cancelled: bool,
    runs: u64,
}

/// A work item on a [`WorkQueue`].
pub(crate) struct DelayedWork {
    shared: Arc<Shared>,
    id: u64,
}

impl WorkQueue {
    /// Creates the queue. The worker thread is started when the first item is
    /// added.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                cond: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Adds `work` to the queue without scheduling it.
    ///
    /// Each run of `work` returns the delay after which it should run again,
    /// or `None` if it is finished.
    pub fn add<F>(&self, work: F) -> std::io::Result<DelayedWork>
    where
        F: 'static + Send + FnMut() -> Option<Duration>,
    {
        {
            let mut thread = self.thread.lock();
            if thread.is_none() {
                let shared = self.shared.clone();
                let handle = std::thread::Builder::new()
                    .name(self.name.clone())
                    .spawn(move || shared.run())?;
                *thread = Some(handle);
                tracing::debug!(name = self.name.as_str(), "work queue started");
            }
        }

        let mut state = self.shared.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.items.insert(
            id,
            Item {
                work: Some(Box::new(work)),
                deadline: None,
                running: false,
                cancelled: false,
                runs: 0,
            },
        );
        Ok(DelayedWork {
            shared: self.shared.clone(),
            id,
        })
    }

    /// The number of worker threads started.
    #[cfg(test)]
    pub fn threads(&self) -> usize {
        usize::from(self.thread.lock().is_some())
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.cond.notify_all();
        if let Some(thread) = self.thread.get_mut().take() {
            if thread.join().is_err() {
                tracing::error!(name = self.name.as_str(), "work queue worker panicked");
            }
        }
    }
}

impl DelayedWork {
    /// Schedules the work to run after `delay`.
    ///
    /// Returns false if the work was already pending or has been cancelled.
    pub fn schedule(&self, delay: Duration) -> bool {
        let mut state = self.shared.state.lock();
        let Some(item) = state.items.get_mut(&self.id) else {
            return false;
        };
        if item.cancelled || item.deadline.is_some() {
            return false;
        }
        let deadline = Instant::now() + delay;
        item.deadline = Some(deadline);
        state.timers.push(Reverse((deadline, self.id)));
        self.shared.cond.notify_all();
        true
    }

    /// Returns true if the work is scheduled but has not started running.
    pub fn is_pending(&self) -> bool {
        self.with_item(|item| item.deadline.is_some()).unwrap_or(false)
    }

    /// The number of completed runs.
    #[cfg(test)]
    pub fn runs(&self) -> u64 {
        self.with_item(|item| item.runs).unwrap_or(0)
    }

    /// Waits until the work has completed at least `runs` runs or `timeout`
    /// expires. Returns the number of completed runs.
    pub fn wait_for_runs(&self, runs: u64, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            let done = state.items.get(&self.id).map_or(0, |item| item.runs);
            if done >= runs || self.shared.cond.wait_until(&mut state, deadline).timed_out() {
                break state.items.get(&self.id).map_or(0, |item| item.runs);
            }
        }
    }

    /// Cancels any pending run and waits for a running one to finish. The work
    /// will not run again.
    pub fn cancel(&self) {
        let mut state = self.shared.state.lock();
        let Some(item) = state.items.get_mut(&self.id) else {
            return;
        };
        item.cancelled = true;
        item.deadline = None;
        while state.items.get(&self.id).is_some_and(|item| item.running) {
            self.shared.cond.wait(&mut state);
        }
    }

    fn with_item<R>(&self, f: impl FnOnce(&Item) -> R) -> Option<R> {
        self.shared.state.lock().items.get(&self.id).map(f)
    }
}

impl Drop for DelayedWork {
    fn drop(&mut self) {
        self.cancel();
        self.shared.state.lock().items.remove(&self.id);
    }
}

impl Shared {
    fn run(&self) {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                break;
            }
            let Some(&Reverse((deadline, id))) = state.timers.peek() else {
                self.cond.wait(&mut state);
                continue;
            };
            if Instant::now() < deadline {
                self.cond.wait_until(&mut state, deadline);
                continue;
            }
            state.timers.pop();

            let Some(item) = state.items.get_mut(&id) else {
                continue;
            };
            if item.deadline != Some(deadline) {
                continue;
            }
            let Some(mut work) = item.work.take() else {
                continue;
            };
            item.deadline = None;
            item.running = true;

            let next = MutexGuard::unlocked(&mut state, &mut work);

            let Some(item) = state.items.get_mut(&id) else {
                continue;
            };
            item.work = Some(work);
            item.running = false;
            item.runs += 1;
            let requeue = match next {
                Some(delay) if !item.cancelled && item.deadline.is_none() => {
                    let deadline = Instant::now() + delay;
                    item.deadline = Some(deadline);
                    Some(deadline)
                }
                _ => None,
            };
            if let Some(deadline) = requeue {
                state.timers.push(Reverse((deadline, id)));
            }
            self.cond.notify_all();
        }
    }
}
