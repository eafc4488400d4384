//! Worker dispatch pool and the per-event echo task.
//!
//! A fixed set of threads drains one FIFO queue guarded by a mutex/condvar
//! pair. `enqueue` is push-and-wake, O(1), and never blocks the producer. On
//! shutdown the pool sets a stop flag and wakes everyone, but workers finish
//! the remaining queue before exiting; pending tasks are never discarded.

use crate::runtime::{Connection, Runtime};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

/// A unit of work: one readiness event on one handle.
type Task = Box<dyn FnOnce() + Send + 'static>;

struct TaskQueue {
    tasks: VecDeque<Task>,
    stop: bool,
}

struct PoolInner {
    queue: Mutex<TaskQueue>,
    available: Condvar,
}

/// Fixed-size worker pool.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` worker threads.
    pub fn spawn(size: usize) -> io::Result<Self> {
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(TaskQueue {
                tasks: VecDeque::new(),
                stop: false,
            }),
            available: Condvar::new(),
        });

        let mut threads = Vec::with_capacity(size);
        for worker_id in 0..size {
            let inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(&inner))?;
            threads.push(handle);
        }

        Ok(Self { inner, threads })
    }

    /// Hand a task to the pool. Push + wake; never blocks the producer.
    pub fn enqueue<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = self.inner.queue.lock().unwrap();
            queue.tasks.push_back(Box::new(task));
        }
        self.inner.available.notify_one();
    }

    /// Stop the pool and join every worker. Remaining queued tasks are
    /// executed before the workers exit.
    pub fn join(self) {
        {
            let mut queue = self.inner.queue.lock().unwrap();
            queue.stop = true;
        }
        self.inner.available.notify_all();
        for handle in self.threads {
            let _ = handle.join();
        }
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let task = {
            let mut queue = inner.queue.lock().unwrap();
            loop {
                // Tasks first: after stop, the queue still drains to empty.
                if let Some(task) = queue.tasks.pop_front() {
                    break Some(task);
                }
                if queue.stop {
                    break None;
                }
                queue = inner.available.wait(queue).unwrap();
            }
        };

        match task {
            Some(task) => task(),
            None => return,
        }
    }
}

/// Service one readiness event: drain the socket, echo each chunk, then rearm
/// or tear down. One-shot dispatch guarantees no other task runs against this
/// connection concurrently.
///
/// Connection-scoped failures never escape this function; they end in a
/// teardown of this connection only.
pub fn service(runtime: &Runtime, conn: &Arc<Connection>) {
    let token = conn.token().0;
    let mut buf = vec![0u8; runtime.buffer_size];

    loop {
        match conn.read(&mut buf) {
            // Orderly peer shutdown. Terminal, not an error.
            Ok(0) => {
                debug!(token, "Peer closed connection");
                runtime.teardown(conn);
                return;
            }
            Ok(n) => {
                let deadline = conn.touch();
                runtime.timers.schedule(conn.token(), deadline);
                trace!(token, bytes = n, "Echoing chunk");

                // Best-effort single write attempt; partial writes are not
                // retried and the remainder is dropped.
                match conn.write(&buf[..n]) {
                    Ok(written) if written < n => {
                        warn!(token, written, expected = n, "Short write, remainder dropped");
                    }
                    Ok(_) => {}
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        warn!(token, expected = n, "Send buffer full, chunk dropped");
                    }
                    Err(e) => {
                        debug!(token, error = %e, "Write failed");
                        runtime.teardown(conn);
                        return;
                    }
                }
            }
            // Drained. Rearm so the next readable event can be delivered; a
            // rearm failure (including the benign peer-closed race) is
            // handled like any other I/O failure.
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if let Err(e) = runtime.reactor.rearm(conn) {
                    debug!(token, error = %e, "Rearm failed");
                    runtime.teardown(conn);
                }
                return;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(token, error = %e, "Read failed");
                runtime.teardown(conn);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_tasks_run_in_fifo_order() {
        let pool = WorkerPool::spawn(1).unwrap();
        let (tx, rx) = mpsc::channel();

        for i in 0..10 {
            let tx = tx.clone();
            pool.enqueue(move || tx.send(i).unwrap());
        }

        let order: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
        pool.join();
    }

    #[test]
    fn test_shutdown_drains_pending_tasks() {
        let pool = WorkerPool::spawn(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        // Park the workers so the queue backs up before the stop flag is set.
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        for _ in 0..2 {
            let gate = Arc::clone(&gate);
            pool.enqueue(move || {
                let (lock, cvar) = &*gate;
                let mut open = lock.lock().unwrap();
                while !*open {
                    open = cvar.wait(open).unwrap();
                }
            });
        }
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.enqueue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        let (lock, cvar) = &*gate;
        *lock.lock().unwrap() = true;
        cvar.notify_all();

        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_enqueue_does_not_block_producer() {
        // No workers at all: pushes must still return immediately.
        let pool = WorkerPool::spawn(0).unwrap();
        for _ in 0..1000 {
            pool.enqueue(|| {});
        }
        assert_eq!(pool.inner.queue.lock().unwrap().tasks.len(), 1000);
        // join() with no workers still drains the stop path cleanly.
        pool.join();
    }
}
