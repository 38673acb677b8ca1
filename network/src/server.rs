//! Listener + connection pool (§4.8), grounded on
//! `cccommon/src/ccserver/{server,connection_manager}.{hpp,cpp}`.
//!
//! The original binds a listener, configures it with a handful of
//! Linux-specific socket options, and maintains at most one outstanding
//! `accept()` at a time, backed by a pool of reusable `Connection`
//! objects. `Service` in the original is the executor/thread-pool layer
//! above that; here it is just the tokio multi-thread runtime sized the
//! same way (`threads_per_server + 20`).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::connection::{ConnState, Connection, Framing};

/// Extra worker threads a [`Service`] adds on top of the caller's requested
/// count, so that handlers which block a worker (e.g. on a `ProcessQueue`
/// condvar) can't deadlock the whole pool.
pub const SERVICE_THREAD_PADDING: usize = 20;

/// Socket-level tuning applied to every accepted or outgoing connection
/// (§4.8). `SO_LINGER`/`TCP_NODELAY`/buffer sizes are portable via
/// `socket2`; `TCP_DEFER_ACCEPT` and `TCP_LINGER2` are Linux-only knobs not
/// exposed by `socket2` and are applied with raw `setsockopt` calls, a
/// no-op everywhere else.
#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    pub so_linger_secs: u16,
    /// Defer the listener's accept completion until data has arrived
    /// (Linux `TCP_DEFER_ACCEPT`), in seconds.
    pub defer_accept_secs: u32,
    /// Shortened `FIN_WAIT_2` timeout for this socket (Linux `TCP_LINGER2`),
    /// in seconds.
    pub linger2_secs: i32,
    /// `TCP_NODELAY`, enabled only for connections the caller intends to
    /// keep open across many small messages.
    pub tcp_nodelay: bool,
    pub recv_buf: Option<usize>,
    pub send_buf: Option<usize>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            so_linger_secs: 15,
            defer_accept_secs: 5,
            linger2_secs: 5,
            tcp_nodelay: false,
            recv_buf: None,
            send_buf: None,
        }
    }
}

/// Applies [`SocketOptions`] to an already-connected or already-accepted
/// stream. Errors here are logged, not propagated — a socket option that
/// the platform or kernel refuses is not a reason to tear down a
/// connection that is otherwise usable.
pub fn apply_socket_options(stream: &TcpStream, opts: &SocketOptions) {
    let sock = socket2::SockRef::from(stream);
    if let Err(e) = sock.set_linger(Some(Duration::from_secs(opts.so_linger_secs as u64))) {
        warn!(error = %e, "server: SO_LINGER failed");
    }
    if let Err(e) = sock.set_nodelay(opts.tcp_nodelay) {
        warn!(error = %e, "server: TCP_NODELAY failed");
    }
    if let Some(n) = opts.recv_buf {
        if let Err(e) = sock.set_recv_buffer_size(n) {
            warn!(error = %e, "server: SO_RCVBUF failed");
        }
    }
    if let Some(n) = opts.send_buf {
        if let Err(e) = sock.set_send_buffer_size(n) {
            warn!(error = %e, "server: SO_SNDBUF failed");
        }
    }
    apply_linux_only_options(stream, opts);
}

#[cfg(target_os = "linux")]
fn apply_linux_only_options(stream: &TcpStream, opts: &SocketOptions) {
    use std::os::unix::io::AsRawFd;
    let fd = stream.as_raw_fd();
    unsafe {
        let defer = opts.defer_accept_secs as libc::c_int;
        if libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_DEFER_ACCEPT,
            &defer as *const _ as *const libc::c_void,
            std::mem::size_of_val(&defer) as libc::socklen_t,
        ) != 0
        {
            warn!(errno = std::io::Error::last_os_error().raw_os_error(), "server: TCP_DEFER_ACCEPT failed");
        }
        let linger2 = opts.linger2_secs as libc::c_int;
        if libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_LINGER2,
            &linger2 as *const _ as *const libc::c_void,
            std::mem::size_of_val(&linger2) as libc::socklen_t,
        ) != 0
        {
            warn!(errno = std::io::Error::last_os_error().raw_os_error(), "server: TCP_LINGER2 failed");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_linux_only_options(_stream: &TcpStream, _opts: &SocketOptions) {}

/// Pool of reusable [`Connection`]s. `maxincoming` caps how many of the
/// pool's connections may be assigned to accepted (rather than
/// outgoing-dialed) sockets at once; once exhausted, [`Server::run`] stops
/// accepting until a connection is returned via [`ConnectionManager::free`].
pub struct ConnectionManager {
    all: Mutex<Vec<Arc<Connection<TcpStream>>>>,
    free: Mutex<Vec<Arc<Connection<TcpStream>>>>,
    maxincoming: usize,
    incoming_count: AtomicUsize,
}

impl ConnectionManager {
    pub fn new(pool_size: usize, maxincoming: usize, framing: Framing) -> Arc<Self> {
        let all: Vec<_> = (0..pool_size)
            .map(|i| Arc::new(Connection::new(format!("conn-{i}"), framing)))
            .collect();
        Arc::new(ConnectionManager {
            free: Mutex::new(all.clone()),
            all: Mutex::new(all),
            maxincoming,
            incoming_count: AtomicUsize::new(0),
        })
    }

    /// Takes a free connection for an outgoing dial (`incoming = false`) or
    /// an accepted socket (`incoming = true`, subject to `maxincoming`).
    /// Returns `None` if the pool has nothing free, or an incoming request
    /// would exceed `maxincoming`.
    pub fn take(&self, incoming: bool) -> Option<Arc<Connection<TcpStream>>> {
        if incoming && self.incoming_count.load(Ordering::SeqCst) >= self.maxincoming {
            return None;
        }
        let conn = self.free.lock().pop()?;
        if incoming {
            self.incoming_count.fetch_add(1, Ordering::SeqCst);
        }
        Some(conn)
    }

    /// Returns a connection to the free list once it has fully stopped.
    /// Safe to call from the connection's own close path.
    pub fn free(&self, conn: Arc<Connection<TcpStream>>, was_incoming: bool) {
        if was_incoming {
            self.incoming_count.fetch_sub(1, Ordering::SeqCst);
        }
        self.free.lock().push(conn);
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub fn all_count(&self) -> usize {
        self.all.lock().len()
    }
}

/// Binds a listener and drives the accept loop: at most one outstanding
/// `accept()`, pausing (not erroring) whenever the manager has no free
/// connection to hand the new socket. `Service`'s thread-pool sizing
/// (`threads_per_server + SERVICE_THREAD_PADDING`) is the caller's
/// responsibility — this just needs to be spawned onto a runtime sized
/// that way; see `cc_node`'s composition root.
pub struct Server {
    addr: SocketAddr,
    manager: Arc<ConnectionManager>,
    opts: SocketOptions,
}

impl Server {
    pub fn new(addr: SocketAddr, manager: Arc<ConnectionManager>, opts: SocketOptions) -> Self {
        Server { addr, manager, opts }
    }

    /// Runs the accept loop until `shutdown` fires. Each accepted socket is
    /// handed to `on_accept` once assigned to a free connection from the
    /// pool; `on_accept` is responsible for eventually calling
    /// [`ConnectionManager::free`] once that connection stops.
    pub async fn run<F>(&self, shutdown: Arc<tokio::sync::Notify>, on_accept: F) -> cc_error::Result<()>
    where
        F: Fn(Arc<Connection<TcpStream>>, TcpStream) + Send + Sync,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(cc_error::Error::Transport)?;
        info!(addr = %self.addr, "server: listening");

        loop {
            // The original pauses acceptance entirely while the pool is
            // exhausted; tokio has no "pause this listener" primitive, so
            // this polls the free count on a short interval instead of
            // calling `accept()` at all until a slot is likely available.
            while self.manager.free_count() == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                    _ = shutdown.notified() => return Ok(()),
                }
            }

            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer_addr) = accepted.map_err(cc_error::Error::Transport)?;
                    apply_socket_options(&socket, &self.opts);
                    let Some(conn) = self.manager.take(true) else {
                        debug!(peer = %peer_addr, "server: pool exhausted between probe and accept, dropping");
                        continue;
                    };
                    debug!(peer = %peer_addr, "server: accepted connection");
                    on_accept(conn, socket);
                }
                _ = shutdown.notified() => return Ok(()),
            }
        }
    }
}
