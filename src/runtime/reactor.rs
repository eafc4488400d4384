//! Readiness notification with one-shot semantics.
//!
//! Built on mio (epoll on Linux, kqueue on macOS), which is edge-triggered but
//! has no one-shot interest mode. One-shot is implemented here: the event loop
//! disarms a token before dispatching it, and the consumer must `rearm` before
//! any further notification is possible for that handle. That is what
//! guarantees at most one worker task is active per connection at a time.
//!
//! All arming operations go through raw fds (`SourceFd`), so a cloned
//! `ReactorHandle` can rearm or deregister from worker and supervisor threads
//! while the poll itself stays on the event-loop thread.

use crate::runtime::Connection;
use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Owns the poll instance. Lives on the event-loop thread.
pub struct Reactor {
    poll: Poll,
    events: Events,
    handle: ReactorHandle,
}

impl Reactor {
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let handle = ReactorHandle {
            registry: Arc::new(poll.registry().try_clone()?),
        };
        Ok(Self {
            poll,
            events: Events::with_capacity(event_capacity),
            handle,
        })
    }

    /// Cloneable handle for use from other threads.
    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Wait for readiness with a bounded timeout, so a cooperative shutdown
    /// flag is observed promptly even with no traffic. `Interrupted` is
    /// swallowed; the caller just sees an empty event batch.
    pub fn poll(&mut self, timeout: Duration) -> io::Result<()> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                self.events.clear();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }
}

/// Thread-safe registration surface of the reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    registry: Arc<mio::Registry>,
}

impl ReactorHandle {
    /// Arm a handle with one-shot readable interest.
    pub fn register(&self, fd: RawFd, token: Token) -> io::Result<()> {
        self.registry
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
    }

    /// Disable interest before dispatch: the one-shot half. With the fd out of
    /// the poll set, no second event can be delivered until a rearm. Missing
    /// registrations (already torn down) are ignored.
    pub fn disarm(&self, fd: RawFd) {
        let _ = self.registry.deregister(&mut SourceFd(&fd));
    }

    /// Re-enable one-shot readable interest after a drain.
    ///
    /// Fails if the connection was concurrently closed, or if registration
    /// itself fails. Either way the failure is non-fatal to the event loop;
    /// the caller must tear the connection down.
    pub fn rearm(&self, conn: &Connection) -> io::Result<()> {
        if conn.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed during rearm",
            ));
        }
        self.register(conn.raw_fd(), conn.token())
    }

    /// Remove a handle from the poll set. Safe to call when already removed.
    pub fn deregister(&self, fd: RawFd) {
        let _ = self.registry.deregister(&mut SourceFd(&fd));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::Arc;

    fn test_connection(token: usize) -> (Arc<Connection>, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let conn = Connection::new(
            mio::net::TcpStream::from_std(server),
            Token(token),
            Duration::from_secs(60),
        );
        (Arc::new(conn), client)
    }

    fn poll_tokens(reactor: &mut Reactor, timeout: Duration) -> Vec<Token> {
        reactor.poll(timeout).unwrap();
        reactor.events().map(|e| e.token()).collect()
    }

    #[test]
    fn test_one_notification_per_arm() {
        let mut reactor = Reactor::new(16).unwrap();
        let handle = reactor.handle();
        let (conn, mut client) = test_connection(7);

        handle.register(conn.raw_fd(), conn.token()).unwrap();
        client.write_all(b"hello").unwrap();

        let tokens = poll_tokens(&mut reactor, Duration::from_secs(2));
        assert!(tokens.contains(&Token(7)));

        // Disarmed: new data must not produce another event until rearm.
        handle.disarm(conn.raw_fd());
        client.write_all(b"more").unwrap();
        let tokens = poll_tokens(&mut reactor, Duration::from_millis(100));
        assert!(tokens.is_empty());

        // Rearm: pending unread data is reported again (edge on register).
        handle.rearm(&conn).unwrap();
        client.write_all(b"again").unwrap();
        let tokens = poll_tokens(&mut reactor, Duration::from_secs(2));
        assert!(tokens.contains(&Token(7)));
    }

    #[test]
    fn test_rearm_fails_after_close() {
        let reactor = Reactor::new(16).unwrap();
        let handle = reactor.handle();
        let (conn, _client) = test_connection(8);

        handle.register(conn.raw_fd(), conn.token()).unwrap();
        handle.disarm(conn.raw_fd());

        conn.mark_closed();
        assert!(handle.rearm(&conn).is_err());
    }

    #[test]
    fn test_deregister_idempotent() {
        let reactor = Reactor::new(16).unwrap();
        let handle = reactor.handle();
        let (conn, _client) = test_connection(9);

        handle.register(conn.raw_fd(), conn.token()).unwrap();
        handle.deregister(conn.raw_fd());
        // Second removal of an absent handle must not panic or error out.
        handle.deregister(conn.raw_fd());
    }
}
