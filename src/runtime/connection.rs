//! Per-connection state and the shared connection registry.
//!
//! A `Connection` is shared between the registry entry and whichever worker
//! task currently owns its readiness event (`Arc`), so a connection looked up
//! from the registry stays alive even if a concurrent `remove` races it. The
//! socket itself is released when the last holder drops.

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::Token;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Initial capacity for the per-connection buffers.
const BUFFER_CAPACITY: usize = 4 * 1024;

/// Mutable per-connection fields, guarded by the connection's own lock.
///
/// `last_active` and `closed` are read by the idle supervisor from its own
/// thread, so they must never be observed torn.
struct ConnState {
    /// Bytes read but not yet processed. Reserved for buffered operation;
    /// the baseline echo path writes each chunk back immediately.
    #[allow(dead_code)]
    inbound: BytesMut,
    /// Bytes pending write. Reserved, as above.
    #[allow(dead_code)]
    outbound: BytesMut,
    /// Monotonic timestamp of the last successful read.
    last_active: Instant,
    /// Set exactly once, just before final teardown.
    closed: bool,
}

/// A single client connection.
pub struct Connection {
    token: Token,
    stream: TcpStream,
    idle_timeout: Duration,
    state: Mutex<ConnState>,
}

impl Connection {
    /// Wrap an accepted non-blocking stream. `last_active` starts at now, so
    /// the initial idle deadline is one full timeout away.
    pub fn new(stream: TcpStream, token: Token, idle_timeout: Duration) -> Self {
        Self {
            token,
            stream,
            idle_timeout,
            state: Mutex::new(ConnState {
                inbound: BytesMut::with_capacity(BUFFER_CAPACITY),
                outbound: BytesMut::with_capacity(BUFFER_CAPACITY),
                last_active: Instant::now(),
                closed: false,
            }),
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Idle timeout supplied at registration time. Honored by the supervisor's
    /// eviction check, not just by deadline scheduling.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Non-blocking read; `WouldBlock` means the socket is drained.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    /// Non-blocking write, single attempt. Short writes are the caller's
    /// problem; the baseline echo path does not retry them.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.stream).write(buf)
    }

    /// Update `last_active` to now and return the refreshed idle deadline.
    pub fn touch(&self) -> Instant {
        let mut state = self.state.lock().unwrap();
        state.last_active = Instant::now();
        state.last_active + self.idle_timeout
    }

    /// Current idle deadline (`last_active + idle_timeout`).
    pub fn idle_deadline(&self) -> Instant {
        let state = self.state.lock().unwrap();
        state.last_active + self.idle_timeout
    }

    /// Authoritative idleness check, taken under the connection lock at timer
    /// pop time. A connection that was refreshed (or already torn down) since
    /// the timer entry was scheduled reports not-idle.
    pub fn is_idle_at(&self, now: Instant) -> bool {
        let state = self.state.lock().unwrap();
        !state.closed && state.last_active + self.idle_timeout <= now
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Mark the connection closed. Returns true for exactly one caller;
    /// concurrent teardown attempts coalesce on this.
    pub fn mark_closed(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            false
        } else {
            state.closed = true;
            true
        }
    }
}

/// Shared registry of live connections, keyed by token.
///
/// A token is present iff the connection is still eligible for readiness
/// dispatch; a lookup miss means "being torn down or already gone" and is
/// benign for every caller.
pub struct ConnectionRegistry {
    map: Mutex<HashMap<Token, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, conn: Arc<Connection>) {
        self.map.lock().unwrap().insert(conn.token(), conn);
    }

    /// Look up a live connection. The returned `Arc` keeps it alive even if
    /// `remove` races immediately after.
    pub fn lookup(&self, token: Token) -> Option<Arc<Connection>> {
        self.map.lock().unwrap().get(&token).cloned()
    }

    /// Remove a connection. Returns `None` if it was already removed.
    pub fn remove(&self, token: Token) -> Option<Arc<Connection>> {
        self.map.lock().unwrap().remove(&token)
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().unwrap().is_empty()
    }

    /// Take every remaining connection, leaving the registry empty. Used by
    /// the shutdown drain.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let mut map = self.map.lock().unwrap();
        map.drain().map(|(_, conn)| conn).collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    /// Accept one local connection and wrap the server side.
    fn test_connection(
        token: usize,
        idle_timeout: Duration,
    ) -> (Arc<Connection>, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let conn = Connection::new(TcpStream::from_std(server), Token(token), idle_timeout);
        (Arc::new(conn), client)
    }

    #[test]
    fn test_touch_refreshes_deadline() {
        let (conn, _client) = test_connection(1, Duration::from_millis(50));

        assert!(!conn.is_idle_at(Instant::now()));
        thread::sleep(Duration::from_millis(60));
        assert!(conn.is_idle_at(Instant::now()));

        let deadline = conn.touch();
        assert!(!conn.is_idle_at(Instant::now()));
        assert!(deadline > Instant::now());
    }

    #[test]
    fn test_mark_closed_exactly_once() {
        let (conn, _client) = test_connection(2, Duration::from_secs(60));

        assert!(!conn.is_closed());
        assert!(conn.mark_closed());
        assert!(!conn.mark_closed());
        assert!(conn.is_closed());

        // A closed connection is never idle-evictable again.
        assert!(!conn.is_idle_at(Instant::now() + Duration::from_secs(120)));
    }

    #[test]
    fn test_registry_insert_lookup_remove() {
        let registry = ConnectionRegistry::new();
        let (conn, _client) = test_connection(3, Duration::from_secs(60));

        registry.insert(Arc::clone(&conn));
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(Token(3)).is_some());
        assert!(registry.lookup(Token(99)).is_none());

        let removed = registry.remove(Token(3)).unwrap();
        assert_eq!(removed.token(), Token(3));
        assert!(registry.remove(Token(3)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_lookup_survives_concurrent_remove() {
        let registry = ConnectionRegistry::new();
        let (conn, _client) = test_connection(4, Duration::from_secs(60));
        registry.insert(Arc::clone(&conn));

        let held = registry.lookup(Token(4)).unwrap();
        registry.remove(Token(4));

        // The held Arc is still valid and usable after removal.
        assert_eq!(held.token(), Token(4));
        assert!(!held.is_closed());
    }

    #[test]
    fn test_remove_visible_to_all_threads() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, _client) = test_connection(5, Duration::from_secs(60));
        registry.insert(conn);
        registry.remove(Token(5));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.lookup(Token(5)).is_none())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }
}
