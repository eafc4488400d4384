//! Runtime core: reactor, registry, worker pool, idle supervisor.
//!
//! Three kinds of threads share the set of live connections:
//! - the event-loop thread, which owns the poll and dispatches readiness;
//! - N worker threads, which drain sockets and echo;
//! - the idle-supervisor thread, which evicts quiet connections.
//!
//! Coordination rests on three rules:
//! - One-shot arming: a connection's readiness interest is disabled before its
//!   event is dispatched and only re-enabled by the worker that consumed it,
//!   so at most one task is ever active per handle.
//! - Shared ownership: connections live in `Arc`s held by the registry and by
//!   in-flight tasks; the socket closes when the last holder drops.
//! - Coalesced teardown: every destruction path funnels through
//!   [`Runtime::teardown`], which uses the connection's set-once closed flag
//!   to pick a single winner.

mod connection;
mod reactor;
mod supervisor;
mod worker;

pub use connection::{Connection, ConnectionRegistry};
pub use reactor::{Reactor, ReactorHandle};
pub use supervisor::{IdleSupervisor, SupervisorHandle};
pub use worker::{service, WorkerPool};

use tracing::debug;

/// Shared context handed to workers and the supervisor.
pub struct Runtime {
    pub registry: ConnectionRegistry,
    pub reactor: ReactorHandle,
    pub timers: SupervisorHandle,
    /// Read chunk size for the echo task.
    pub buffer_size: usize,
}

impl Runtime {
    /// Destroy a connection: deregister from the reactor, remove from the
    /// registry. Idempotent; concurrent attempts from a worker, the
    /// supervisor, and the shutdown drain coalesce so exactly one thread
    /// performs the work. The socket itself is released when the last `Arc`
    /// drops.
    pub fn teardown(&self, conn: &Connection) {
        if !conn.mark_closed() {
            return;
        }
        self.reactor.deregister(conn.raw_fd());
        self.registry.remove(conn.token());
        debug!(token = conn.token().0, "Connection closed");
    }
}
