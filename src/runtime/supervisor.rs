//! Idle-timeout supervision.
//!
//! A background thread evicts connections that have gone quiet. Deadlines are
//! tracked in a min-heap of `(deadline, token)` hints: every refresh pushes a
//! new entry in O(log n) and never scans for old ones, so the heap may hold
//! multiple stale entries per token. Heap membership is a trigger, not ground
//! truth; the authoritative check compares the connection's live `last_active`
//! under its own lock at pop time. A connection refreshed after an entry was
//! scheduled simply survives that pop, and the newer entry already pending in
//! the heap performs the real check later.

use crate::runtime::Runtime;
use mio::Token;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// One expiry hint. Ordered soonest-first in the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerItem {
    pub deadline: Instant,
    pub token: Token,
}

// BinaryHeap is a max-heap; reverse the comparison to pop the soonest
// deadline first.
impl Ord for TimerItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.token.0.cmp(&self.token.0))
    }
}

impl PartialOrd for TimerItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Shared scheduling surface of the supervisor. Cloneable into worker threads
/// and the accept path.
#[derive(Clone)]
pub struct SupervisorHandle {
    heap: Arc<Mutex<BinaryHeap<TimerItem>>>,
}

impl SupervisorHandle {
    pub fn new() -> Self {
        Self {
            heap: Arc::new(Mutex::new(BinaryHeap::new())),
        }
    }

    /// Schedule or refresh an expiry hint. Prior entries for the same token
    /// are left in place; the pop-time recheck discards them.
    pub fn schedule(&self, token: Token, deadline: Instant) {
        self.heap.lock().unwrap().push(TimerItem { deadline, token });
    }

    /// Pop the soonest entry if it is due at `now`.
    fn pop_due(&self, now: Instant) -> Option<TimerItem> {
        let mut heap = self.heap.lock().unwrap();
        if heap.peek().map_or(false, |item| item.deadline <= now) {
            heap.pop()
        } else {
            None
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }
}

impl Default for SupervisorHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// The background eviction thread.
pub struct IdleSupervisor {
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl IdleSupervisor {
    /// Start the supervisor thread. It wakes on a fixed cadence, pops every
    /// due hint, and evicts connections that are still idle on the
    /// authoritative recheck.
    pub fn spawn(runtime: Arc<Runtime>, tick: Duration) -> io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let thread = thread::Builder::new()
            .name("idle-supervisor".to_string())
            .spawn(move || {
                debug!(tick_ms = tick.as_millis() as u64, "Supervisor started");
                while flag.load(AtomicOrdering::Relaxed) {
                    thread::sleep(tick);
                    sweep(&runtime);
                }
                debug!("Supervisor stopped");
            })?;

        Ok(Self {
            running,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Signal cancellation and join the thread. Idempotent; the thread exits
    /// within one tick.
    pub fn stop(&self) {
        self.running.store(false, AtomicOrdering::Relaxed);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IdleSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One supervisor wake: drain every hint that has come due.
fn sweep(runtime: &Runtime) {
    let now = Instant::now();
    while let Some(item) = runtime.timers.pop_due(now) {
        // A miss means the connection is already gone; the hint is stale.
        let Some(conn) = runtime.registry.lookup(item.token) else {
            continue;
        };

        // Authoritative check against the live timestamp, under the
        // connection's lock. Honors the per-connection timeout.
        if conn.is_idle_at(now) {
            info!(
                token = item.token.0,
                idle_timeout_ms = conn.idle_timeout().as_millis() as u64,
                "Evicting idle connection"
            );
            runtime.teardown(&conn);
        }
        // Otherwise it was refreshed: a newer entry for this token is already
        // pending and will perform the real check when it pops.
    }
}
