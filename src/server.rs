//! TCP echo server: listener setup, event loop, dispatch, shutdown drain.
//!
//! Single event-loop thread owning the poll, a fixed worker pool executing
//! echo tasks, and an idle supervisor evicting quiet connections. The loop
//! waits with a bounded timeout so the cooperative shutdown flag is observed
//! promptly even with no traffic.

use crate::config::Config;
use crate::runtime::{
    service, Connection, ConnectionRegistry, IdleSupervisor, Reactor, Runtime, SupervisorHandle,
    WorkerPool,
};
use mio::net::TcpListener;
use mio::Token;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Bound on the readiness wait, and therefore on how long a shutdown signal
/// can go unobserved.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

const EVENT_CAPACITY: usize = 1024;

/// Server instance. Bound but not yet serving; `run` consumes it.
pub struct Server {
    config: Config,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind the listening socket with the configured backlog. Failures here
    /// are startup-fatal for the caller.
    pub fn bind(config: Config) -> io::Result<Self> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let listener = create_listener(addr, config.backlog)?;
        let local_addr = listener.local_addr()?;
        let listener = TcpListener::from_std(listener);

        info!(addr = %local_addr, backlog = config.backlog, "Server listening");
        Ok(Self {
            config,
            listener,
            local_addr,
        })
    }

    /// Actual bound address; differs from the configured one when port 0 was
    /// requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the event loop until `shutdown` is set, then drain: stop the
    /// supervisor, join the workers (their queue is finished, not discarded),
    /// and close every remaining connection.
    pub fn run(self, shutdown: Arc<AtomicBool>) -> io::Result<()> {
        let workers = if self.config.workers == 0 {
            num_cpus()
        } else {
            self.config.workers
        };

        let mut reactor = Reactor::new(EVENT_CAPACITY)?;
        let runtime = Arc::new(Runtime {
            registry: ConnectionRegistry::new(),
            reactor: reactor.handle(),
            timers: SupervisorHandle::new(),
            buffer_size: self.config.buffer_size,
        });

        runtime
            .reactor
            .register(self.listener.as_raw_fd(), LISTENER_TOKEN)?;
        let supervisor = IdleSupervisor::spawn(Arc::clone(&runtime), self.config.tick_interval)?;
        let pool = WorkerPool::spawn(workers)?;

        info!(
            workers,
            idle_timeout_ms = self.config.idle_timeout.as_millis() as u64,
            "Runtime started"
        );

        while !shutdown.load(Ordering::Relaxed) {
            reactor.poll(POLL_TIMEOUT)?;

            for event in reactor.events() {
                match event.token() {
                    LISTENER_TOKEN => accept_ready(&self.listener, &runtime, &self.config),
                    token => {
                        // A miss means the connection was torn down while the
                        // event was in flight; drop it silently.
                        let Some(conn) = runtime.registry.lookup(token) else {
                            continue;
                        };
                        // One-shot: disarm before dispatch, so no second task
                        // can be created for this handle until it rearms.
                        runtime.reactor.disarm(conn.raw_fd());
                        let task_runtime = Arc::clone(&runtime);
                        pool.enqueue(move || service(&task_runtime, &conn));
                    }
                }
            }
        }

        info!("Shutdown signal observed, draining");
        supervisor.stop();
        pool.join();

        let remaining = runtime.registry.drain();
        let drained = remaining.len();
        for conn in remaining {
            runtime.reactor.deregister(conn.raw_fd());
            conn.mark_closed();
            // Last Arc drops here; the socket closes with it.
        }
        runtime.reactor.deregister(self.listener.as_raw_fd());

        info!(drained, "Server stopped");
        Ok(())
    }
}

/// Accept until the listener reports no more pending connections
/// (edge-triggered semantics require fully draining the backlog per event).
fn accept_ready(listener: &TcpListener, runtime: &Arc<Runtime>, config: &Config) {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if runtime.registry.len() >= config.max_connections {
                    warn!(peer = %peer_addr, "Connection limit reached, rejecting");
                    continue;
                }

                let token = Token(stream.as_raw_fd() as usize);
                let conn = Arc::new(Connection::new(stream, token, config.idle_timeout));

                runtime.registry.insert(Arc::clone(&conn));
                runtime.timers.schedule(token, conn.idle_deadline());
                if let Err(e) = runtime.reactor.register(conn.raw_fd(), token) {
                    error!(token = token.0, error = %e, "Failed to arm connection");
                    runtime.teardown(&conn);
                    continue;
                }

                debug!(token = token.0, peer = %peer_addr, "Accepted connection");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "Accept error");
                break;
            }
        }
    }
}

/// Create a non-blocking TCP listener with an explicit backlog.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;

    Ok(socket.into())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
