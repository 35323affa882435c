//! # Timer Worker
//!
//! One background thread per engine runs every deadline the engine needs:
//! lease watchdogs, bounded-wait timeouts and reconnect retries. Commands
//! arrive over an unbounded crossbeam channel so arming a timer never blocks,
//! even from inside a timer action.
//!
//! Cancelling only drops the action. Its heap entry is skipped when it
//! surfaces, and the heap is compacted once dead entries outnumber live ones.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::debug;

/// Below this many heap entries dead ones are left to surface on their own.
const COMPACT_MIN: usize = 64;

/// Identifies an armed timer for cancellation.
pub type TimerId = u64;

type Action = Box<dyn FnOnce() + Send>;

enum TimerCommand {
    Arm {
        id: TimerId,
        deadline: Instant,
        action: Action,
    },
    Cancel(TimerId),
    Shutdown,
}

/// Handle to the timer worker thread.
pub struct TimerService {
    tx: Sender<TimerCommand>,
    next_id: AtomicU64,
    armed: Arc<AtomicUsize>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TimerService {
    /// Spawn the worker thread.
    pub fn start(name: &str) -> Self {
        let (tx, rx) = unbounded();
        let armed = Arc::new(AtomicUsize::new(0));
        let worker_armed = armed.clone();
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || timer_worker(rx, worker_armed))
            .expect("failed to spawn timer worker");

        TimerService {
            tx,
            next_id: AtomicU64::new(1),
            armed,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Run `action` on the worker thread after `delay`.
    pub fn schedule(&self, delay: Duration, action: impl FnOnce() + Send + 'static) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(TimerCommand::Arm {
            id,
            deadline: Instant::now() + delay,
            action: Box::new(action),
        });
        id
    }

    /// Disarm a timer. Cancelling a timer that already fired is a no-op.
    pub fn cancel(&self, id: TimerId) {
        let _ = self.tx.send(TimerCommand::Cancel(id));
    }

    /// Timers the worker holds that have neither fired nor been cancelled.
    pub fn armed(&self) -> usize {
        self.armed.load(Ordering::Acquire)
    }

    /// Stop the worker, dropping every unfired action. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.tx.send(TimerCommand::Shutdown);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            // An action may drop the last owner of this service from the
            // worker thread itself; joining there would never return.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_worker(rx: Receiver<TimerCommand>, armed: Arc<AtomicUsize>) {
    let mut deadlines: BinaryHeap<Reverse<(Instant, TimerId)>> = BinaryHeap::new();
    let mut actions: HashMap<TimerId, Action> = HashMap::new();

    loop {
        let next = match deadlines.peek() {
            Some(Reverse((deadline, _))) => {
                rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match next {
            Ok(TimerCommand::Arm {
                id,
                deadline,
                action,
            }) => {
                deadlines.push(Reverse((deadline, id)));
                actions.insert(id, action);
                armed.store(actions.len(), Ordering::Release);
            }
            Ok(TimerCommand::Cancel(id)) => {
                if actions.remove(&id).is_some() {
                    armed.store(actions.len(), Ordering::Release);
                }
                if deadlines.len() > COMPACT_MIN && deadlines.len() > 2 * actions.len() {
                    deadlines.retain(|Reverse((_, id))| actions.contains_key(id));
                }
            }
            Ok(TimerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        while let Some(Reverse((deadline, id))) = deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            deadlines.pop();
            if let Some(action) = actions.remove(&id) {
                armed.store(actions.len(), Ordering::Release);
                action();
            }
        }
    }

    debug!(dropped = actions.len(), "timer worker stopped");
}
