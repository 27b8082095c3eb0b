//! Multi-producer, single-consumer queue of work destined for the Lua thread.
//!
//! Background workers never touch the interpreter. They wrap whatever they
//! observed into a [`Task`] and push it here; the interpreter thread pops
//! tasks in FIFO order and runs each one to completion before the next.
//!
//! Besides the tasks themselves the queue counts *sources*: handles that may
//! still produce tasks in the future. The consumer only blocks while at least
//! one source is alive, so a script with nothing left to wait for exits
//! instead of hanging.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use mlua::Lua;
use tracing::{debug, trace, warn};

use crate::dispatch::CallbackDispatcher;
use crate::error::BridgeError;

type Job = Box<dyn FnOnce(&Lua, &CallbackDispatcher) -> Result<(), BridgeError> + Send>;

/// One deferred unit of interpreter-thread work.
pub struct Task {
    label: &'static str,
    job: Job,
}

impl Task {
    pub fn new<F>(label: &'static str, job: F) -> Self
    where
        F: FnOnce(&Lua, &CallbackDispatcher) -> Result<(), BridgeError> + Send + 'static,
    {
        Self {
            label,
            job: Box::new(job),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Run on the interpreter thread.
    pub fn run(self, lua: &Lua, dispatcher: &CallbackDispatcher) -> Result<(), BridgeError> {
        (self.job)(lua, dispatcher)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("label", &self.label).finish()
    }
}

/// Proof that a source was added. Consumed by [`EventQueue::remove_source`],
/// so the same source cannot be removed twice.
#[must_use = "dropping a SourceToken leaks an active source"]
#[derive(Debug)]
pub struct SourceToken {
    id: u64,
    name: String,
}

impl SourceToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

struct QueueState {
    pending: VecDeque<Task>,
    active_sources: usize,
    shutdown: bool,
}

/// What a blocking pop produced.
#[derive(Debug)]
pub enum Next {
    Task(Task),
    /// No pending tasks and no active sources.
    Idle,
    /// [`EventQueue::shutdown`] was called.
    Shutdown,
    /// The wait elapsed while sources were still active.
    TimedOut,
}

/// Per-interpreter event queue.
pub struct EventQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    next_source_id: AtomicU64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                active_sources: 0,
                shutdown: false,
            }),
            ready: Condvar::new(),
            next_source_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a handle that will produce tasks asynchronously.
    pub fn add_source(&self, name: impl Into<String>) -> SourceToken {
        let token = SourceToken {
            id: self.next_source_id.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
        };

        let mut state = self.lock();
        state.active_sources += 1;
        trace!(
            target: "bridge",
            "Source added: {} #{} (active: {})",
            token.name,
            token.id,
            state.active_sources
        );
        token
    }

    /// Deregister a source. Wakes the consumer so it can notice it is idle.
    pub fn remove_source(&self, token: SourceToken) {
        let mut state = self.lock();
        debug_assert!(
            state.active_sources > 0,
            "source {} #{} removed with no active sources",
            token.name,
            token.id
        );
        if state.active_sources == 0 {
            warn!(target: "bridge", "Source {} #{} removed with no active sources", token.name, token.id);
        }
        state.active_sources = state.active_sources.saturating_sub(1);
        trace!(
            target: "bridge",
            "Source removed: {} #{} (active: {})",
            token.name,
            token.id,
            state.active_sources
        );
        drop(state);
        self.ready.notify_all();
    }

    /// Enqueue from any thread. Never blocks beyond the queue lock.
    pub fn queue_task(&self, task: Task) {
        let mut state = self.lock();
        trace!(target: "bridge", "Queued task: {}", task.label);
        state.pending.push_back(task);
        drop(state);
        self.ready.notify_one();
    }

    pub fn active_sources(&self) -> usize {
        self.lock().active_sources
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// True while the run loop should keep going.
    pub fn has_work(&self) -> bool {
        let state = self.lock();
        !state.shutdown && (!state.pending.is_empty() || state.active_sources > 0)
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Stop the consumer regardless of pending work or active sources.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if !state.shutdown {
            debug!(
                target: "bridge",
                "Event queue shutting down ({} pending, {} active sources)",
                state.pending.len(),
                state.active_sources
            );
        }
        state.shutdown = true;
        drop(state);
        self.ready.notify_all();
    }

    /// Pop without waiting.
    pub fn try_next(&self) -> Option<Task> {
        let mut state = self.lock();
        if state.shutdown {
            return None;
        }
        state.pending.pop_front()
    }

    /// Pop, waiting while the queue is empty and sources are active.
    pub fn next_task(&self) -> Next {
        self.wait_next(None)
    }

    /// Like [`EventQueue::next_task`], giving up after `timeout`.
    pub fn next_task_timeout(&self, timeout: Duration) -> Next {
        self.wait_next(Some(timeout))
    }

    fn wait_next(&self, timeout: Option<Duration>) -> Next {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return Next::Shutdown;
            }
            if let Some(task) = state.pending.pop_front() {
                return Next::Task(task);
            }
            if state.active_sources == 0 {
                return Next::Idle;
            }

            state = match timeout {
                None => self.ready.wait(state).unwrap_or_else(|e| e.into_inner()),
                Some(timeout) => {
                    let (state, result) = self
                        .ready
                        .wait_timeout(state, timeout)
                        .unwrap_or_else(|e| e.into_inner());
                    if result.timed_out() && state.pending.is_empty() && !state.shutdown {
                        return Next::TimedOut;
                    }
                    state
                }
            };
        }
    }

    /// Run every task that is already queued, without waiting for more.
    ///
    /// Callback errors are logged by the dispatcher and do not stop the
    /// remaining tasks unless the dispatcher is strict.
    pub fn run_pending(
        &self,
        lua: &Lua,
        dispatcher: &CallbackDispatcher,
    ) -> Result<usize, BridgeError> {
        let mut ran = 0;
        while let Some(task) = self.try_next() {
            run_task(task, lua, dispatcher)?;
            ran += 1;
        }
        Ok(ran)
    }

    /// Consume tasks until the queue is idle or shut down.
    pub fn drain(&self, lua: &Lua, dispatcher: &CallbackDispatcher) -> Result<usize, BridgeError> {
        let mut ran = 0;
        loop {
            match self.next_task() {
                Next::Task(task) => {
                    run_task(task, lua, dispatcher)?;
                    ran += 1;
                }
                Next::Idle | Next::Shutdown => return Ok(ran),
                Next::TimedOut => continue,
            }
        }
    }

    /// Like [`EventQueue::drain`], but gives up once `timeout` has elapsed
    /// even if sources are still active.
    pub fn drain_for(
        &self,
        lua: &Lua,
        dispatcher: &CallbackDispatcher,
        timeout: Duration,
    ) -> Result<usize, BridgeError> {
        let deadline = Instant::now() + timeout;
        let mut ran = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(ran);
            }
            match self.next_task_timeout(remaining) {
                Next::Task(task) => {
                    run_task(task, lua, dispatcher)?;
                    ran += 1;
                }
                Next::Idle | Next::Shutdown | Next::TimedOut => return Ok(ran),
            }
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn run_task(task: Task, lua: &Lua, dispatcher: &CallbackDispatcher) -> Result<(), BridgeError> {
    let label = task.label;
    match task.run(lua, dispatcher) {
        Ok(()) => Ok(()),
        Err(BridgeError::Callback(message)) if !dispatcher.is_strict() => {
            trace!(target: "bridge", "Task {} finished with callback error: {}", label, message);
            Ok(())
        }
        Err(err @ BridgeError::Callback(_)) => Err(err),
        Err(err) => {
            warn!(target: "bridge", "Task {} failed: {}", label, err);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::thread;

    fn recording_task(log: &Arc<StdMutex<Vec<u32>>>, value: u32) -> Task {
        let log = log.clone();
        Task::new("record", move |_, _| {
            log.lock().unwrap().push(value);
            Ok(())
        })
    }

    #[test]
    fn test_source_accounting() {
        let queue = EventQueue::new();
        let tokens: Vec<_> = (0..5).map(|i| queue.add_source(format!("s{i}"))).collect();
        assert_eq!(queue.active_sources(), 5);

        let mut tokens = tokens.into_iter();
        for token in tokens.by_ref().take(3) {
            queue.remove_source(token);
        }
        assert_eq!(queue.active_sources(), 2);

        for token in tokens {
            queue.remove_source(token);
        }
        assert_eq!(queue.active_sources(), 0);
        assert!(!queue.has_work());
    }

    #[test]
    fn test_idle_queue_does_not_block() {
        let queue = EventQueue::new();
        assert!(matches!(queue.next_task(), Next::Idle));
    }

    #[test]
    fn test_fifo_order_single_producer() {
        let lua = Lua::new();
        let dispatcher = CallbackDispatcher::new();
        let queue = Arc::new(EventQueue::new());
        let log = Arc::new(StdMutex::new(Vec::new()));

        let token = queue.add_source("producer");
        let producer = {
            let queue = queue.clone();
            let log = log.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    queue.queue_task(recording_task(&log, i));
                }
                queue.remove_source(token);
            })
        };

        let ran = queue.drain(&lua, &dispatcher).unwrap();
        producer.join().unwrap();

        assert_eq!(ran, 100);
        assert_eq!(*log.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_blocked_consumer_wakes_on_remove_source() {
        let queue = Arc::new(EventQueue::new());
        let token = queue.add_source("late");

        let remover = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.remove_source(token);
            })
        };

        assert!(matches!(queue.next_task(), Next::Idle));
        remover.join().unwrap();
    }

    #[test]
    fn test_shutdown_wakes_consumer() {
        let queue = Arc::new(EventQueue::new());
        let token = queue.add_source("forever");

        let stopper = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.shutdown();
            })
        };

        assert!(matches!(queue.next_task(), Next::Shutdown));
        stopper.join().unwrap();
        assert!(!queue.has_work());
        queue.remove_source(token);
    }

    #[test]
    fn test_timeout_with_active_source() {
        let queue = EventQueue::new();
        let token = queue.add_source("quiet");
        assert!(matches!(
            queue.next_task_timeout(Duration::from_millis(10)),
            Next::TimedOut
        ));
        queue.remove_source(token);
    }

    #[test]
    fn test_failing_task_does_not_stop_drain() {
        let lua = Lua::new();
        let dispatcher = CallbackDispatcher::new();
        let queue = EventQueue::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        queue.queue_task(recording_task(&log, 1));
        queue.queue_task(Task::new("broken", |_, _| {
            Err(BridgeError::operation("marshal failed"))
        }));
        queue.queue_task(Task::new("raises", |_, _| {
            Err(BridgeError::Callback("boom".to_string()))
        }));
        queue.queue_task(recording_task(&log, 2));

        assert_eq!(queue.drain(&lua, &dispatcher).unwrap(), 4);
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_strict_dispatcher_stops_on_callback_error() {
        let lua = Lua::new();
        let dispatcher = CallbackDispatcher::strict();
        let queue = EventQueue::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        queue.queue_task(Task::new("raises", |_, _| {
            Err(BridgeError::Callback("boom".to_string()))
        }));
        queue.queue_task(recording_task(&log, 1));

        let err = queue.drain(&lua, &dispatcher).unwrap_err();
        assert!(matches!(err, BridgeError::Callback(_)));
        assert_eq!(queue.pending(), 1);
    }
}
