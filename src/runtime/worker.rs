//! Worker threads, event-bit task scheduling and one-shot timers.
//!
//! A `Worker` owns one OS thread draining a task FIFO and a timer heap.
//! Tasks are signalled with event bits; repeated signals coalesce into a
//! single queue entry with ORed bits. Each loop iteration runs at most one
//! task and fires at most one due timer, so neither side can starve the
//! other.

use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

/// Wait and idle-sleep granularity for worker loops.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Event bits delivered to tasks.
pub mod events {
    pub const NONE: u32 = 0;
    pub const INIT: u32 = 1;
    pub const READ: u32 = 2;
    pub const WRITE: u32 = 4;
    pub const KILL: u32 = 8;
    /// First user-defined bit; anything at or above is application-owned.
    pub const USER: u32 = 16;
}

/// Milliseconds since process start, from a monotonic clock.
pub(crate) fn now_millis() -> i64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    start.elapsed().as_millis() as i64
}

/// A unit of work scheduled on a worker thread.
///
/// Handlers return true to stay alive; false destroys the task. KILL
/// short-circuits every other bit and defaults to destruction.
pub trait Task: Send {
    /// Called once on the spawning thread, before INIT is signalled.
    fn bind(&mut self, _handle: TaskHandle) {}

    fn handle_init(&mut self) -> bool {
        true
    }

    fn handle_read(&mut self) -> bool {
        true
    }

    fn handle_write(&mut self) -> bool {
        true
    }

    fn handle_kill(&mut self) -> bool {
        false
    }

    fn handle_user(&mut self, _events: u32) -> bool {
        true
    }
}

fn dispatch(task: &mut dyn Task, events: u32) -> bool {
    if events & events::KILL != 0 {
        return task.handle_kill();
    }
    if events & events::INIT != 0 && !task.handle_init() {
        return false;
    }
    if events & events::READ != 0 && !task.handle_read() {
        return false;
    }
    if events & events::WRITE != 0 && !task.handle_write() {
        return false;
    }
    if events >= events::USER && !task.handle_user(events) {
        return false;
    }
    true
}

#[derive(Default)]
struct Pending {
    events: u32,
    queued: bool,
}

struct TaskCore {
    pending: Mutex<Pending>,
    logic: Mutex<Option<Box<dyn Task>>>,
    worker: Worker,
}

/// Shared handle to a scheduled task. Signalling is safe from any thread.
#[derive(Clone)]
pub struct TaskHandle {
    core: Arc<TaskCore>,
}

impl TaskHandle {
    /// OR `events` into the pending bitmask and enqueue the task if it is
    /// not already queued.
    pub fn signal(&self, events: u32) {
        let enqueue = {
            let mut pending = self.core.pending.lock().unwrap();
            pending.events |= events;
            if pending.queued {
                false
            } else {
                pending.queued = true;
                true
            }
        };
        if enqueue {
            self.core.worker.enqueue(self.core.clone());
        }
    }

    /// The worker this task runs on.
    pub fn worker(&self) -> &Worker {
        &self.core.worker
    }
}

/// Box a task, bind its handle and signal INIT.
pub fn spawn_task<T: Task + 'static>(worker: &Worker, task: T) -> TaskHandle {
    let core = Arc::new(TaskCore {
        pending: Mutex::new(Pending::default()),
        logic: Mutex::new(Some(Box::new(task))),
        worker: worker.clone(),
    });
    let handle = TaskHandle { core };
    if let Some(task) = handle.core.logic.lock().unwrap().as_mut() {
        task.bind(handle.clone());
    }
    handle.signal(events::INIT);
    handle
}

struct TimerState {
    generation: u64,
}

struct TimerCore {
    worker: Worker,
    state: Mutex<TimerState>,
    callback: Mutex<Box<dyn FnMut(&Timer) + Send>>,
}

/// A one-shot timer bound to a worker. Restartable from its own callback.
#[derive(Clone)]
pub struct Timer {
    core: Arc<TimerCore>,
}

impl Timer {
    pub fn new<F>(worker: &Worker, callback: F) -> Timer
    where
        F: FnMut(&Timer) + Send + 'static,
    {
        Timer {
            core: Arc::new(TimerCore {
                worker: worker.clone(),
                state: Mutex::new(TimerState { generation: 0 }),
                callback: Mutex::new(Box::new(callback)),
            }),
        }
    }

    /// Arm the timer to fire once after `delay_millis`. Restarting an armed
    /// timer replaces the previous deadline.
    pub fn start(&self, delay_millis: i64) {
        static SEQUENCE: AtomicU64 = AtomicU64::new(0);
        let generation = {
            let mut state = self.core.state.lock().unwrap();
            state.generation += 1;
            state.generation
        };
        self.core.worker.add_timer(TimerEntry {
            deadline: now_millis() + delay_millis.max(0),
            seq: SEQUENCE.fetch_add(1, Ordering::Relaxed),
            generation,
            core: self.core.clone(),
        });
    }

    /// Disarm the timer. The heap entry is discarded lazily.
    pub fn cancel(&self) {
        self.core.state.lock().unwrap().generation += 1;
    }
}

struct TimerEntry {
    deadline: i64,
    seq: u64,
    generation: u64,
    core: Arc<TimerCore>,
}

// Earliest deadline first; equal deadlines fire in start order.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

struct WorkerState {
    running: bool,
    queue: VecDeque<Arc<TaskCore>>,
    timers: BinaryHeap<TimerEntry>,
}

struct WorkerShared {
    state: Mutex<WorkerState>,
    wakeup: Condvar,
}

/// Cheap handle to one worker thread.
#[derive(Clone)]
pub struct Worker {
    shared: Arc<WorkerShared>,
}

impl Worker {
    fn enqueue(&self, core: Arc<TaskCore>) {
        let mut state = self.shared.state.lock().unwrap();
        state.queue.push_back(core);
        self.shared.wakeup.notify_one();
    }

    fn add_timer(&self, entry: TimerEntry) {
        let mut state = self.shared.state.lock().unwrap();
        state.timers.push(entry);
        self.shared.wakeup.notify_one();
    }

    fn shutdown(&self) {
        self.shared.state.lock().unwrap().running = false;
        self.shared.wakeup.notify_all();
    }

    fn run(shared: Arc<WorkerShared>) {
        tracing::debug!("worker thread started");
        loop {
            {
                let mut state = shared.state.lock().unwrap();
                while state.running && state.queue.is_empty() && state.timers.is_empty() {
                    let (guard, _) = shared
                        .wakeup
                        .wait_timeout(state, POLL_INTERVAL)
                        .unwrap();
                    state = guard;
                }
                if !state.running {
                    break;
                }
            }

            let task = shared.state.lock().unwrap().queue.pop_front();
            let ran_task = task.is_some();
            if let Some(core) = task {
                Self::run_task(&core);
            }

            if let Some(entry) = Self::pop_due_timer(&shared) {
                let timer = Timer {
                    core: entry.core.clone(),
                };
                (entry.core.callback.lock().unwrap())(&timer);
            }

            if !ran_task {
                thread::sleep(POLL_INTERVAL);
            }
        }

        // Queued tasks are destroyed on shutdown; pending timers are not
        // fired.
        let drained: Vec<_> = {
            let mut state = shared.state.lock().unwrap();
            state.timers.clear();
            state.queue.drain(..).collect()
        };
        for core in drained {
            let logic = core.logic.lock().unwrap().take();
            drop(logic);
        }
        tracing::debug!("worker thread stopped");
    }

    fn run_task(core: &Arc<TaskCore>) {
        let events = {
            let mut pending = core.pending.lock().unwrap();
            pending.queued = false;
            std::mem::take(&mut pending.events)
        };
        let alive = match core.logic.lock().unwrap().as_mut() {
            Some(task) => dispatch(task.as_mut(), events),
            None => true,
        };
        if !alive {
            let logic = core.logic.lock().unwrap().take();
            drop(logic);
        }
    }

    /// Pop the earliest valid timer entry if it is due. Stale entries from
    /// cancelled or restarted timers are discarded along the way.
    fn pop_due_timer(shared: &Arc<WorkerShared>) -> Option<TimerEntry> {
        let mut state = shared.state.lock().unwrap();
        let now = now_millis();
        while let Some(top) = state.timers.peek() {
            let current = top.core.state.lock().unwrap().generation;
            if top.generation != current {
                state.timers.pop();
                continue;
            }
            if top.deadline <= now {
                return state.timers.pop();
            }
            break;
        }
        None
    }
}

/// A pool of worker threads with round-robin assignment.
pub struct WorkerGroup {
    workers: Vec<Worker>,
    handles: Vec<thread::JoinHandle<()>>,
    next: Mutex<usize>,
}

impl WorkerGroup {
    /// Spawn `threads` workers; 0 selects twice the hardware concurrency.
    pub fn new(threads: usize) -> io::Result<WorkerGroup> {
        let count = if threads == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1) * 2
        } else {
            threads
        };

        let mut workers = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let shared = Arc::new(WorkerShared {
                state: Mutex::new(WorkerState {
                    running: true,
                    queue: VecDeque::new(),
                    timers: BinaryHeap::new(),
                }),
                wakeup: Condvar::new(),
            });
            let handle = thread::Builder::new()
                .name(format!("worker-{}", i))
                .spawn({
                    let shared = Arc::clone(&shared);
                    move || Worker::run(shared)
                })?;
            workers.push(Worker { shared });
            handles.push(handle);
        }

        Ok(WorkerGroup {
            workers,
            handles,
            next: Mutex::new(0),
        })
    }

    /// Round-robin worker selection.
    pub fn next(&self) -> Worker {
        let mut next = self.next.lock().unwrap();
        let worker = self.workers[*next % self.workers.len()].clone();
        *next = next.wrapping_add(1);
        worker
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.shutdown();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
