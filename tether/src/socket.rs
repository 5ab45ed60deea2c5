//! Transport socket allocation and the readiness rendezvous.
//!
//! An [`AllocatedSocket`] is a listening endpoint that accepts exactly one
//! peer. The guest allocates it, hands the peer its [`ReferenceId`], and a
//! consumer later waits for the peer with [`AllocatedSocket::ready`] before
//! taking the connection.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::reference::{ReferenceId, SocketAddr};
use crate::{Error, Result};

/// Fixed budget for a socket's peer to connect.
pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Most sockets one batch may allocate.
pub const MAX_BATCH: usize = 64;

/// A byte-stream connection over either transport.
pub enum Connection {
    /// Local Unix socket.
    Unix(UnixStream),
    /// vsock across the VM boundary.
    #[cfg(target_os = "linux")]
    Vsock(tokio_vsock::VsockStream),
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(_) => f.write_str("Connection::Unix"),
            #[cfg(target_os = "linux")]
            Self::Vsock(_) => f.write_str("Connection::Vsock"),
        }
    }
}

impl From<UnixStream> for Connection {
    fn from(stream: UnixStream) -> Self {
        Self::Unix(stream)
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(target_os = "linux")]
            Self::Vsock(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(target_os = "linux")]
            Self::Vsock(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
            #[cfg(target_os = "linux")]
            Self::Vsock(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(target_os = "linux")]
            Self::Vsock(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A listening endpoint over either transport.
pub enum Listener {
    /// Local Unix socket.
    Unix(UnixListener),
    /// vsock across the VM boundary.
    #[cfg(target_os = "linux")]
    Vsock(tokio_vsock::VsockListener),
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(_) => f.write_str("Listener::Unix"),
            #[cfg(target_os = "linux")]
            Self::Vsock(_) => f.write_str("Listener::Vsock"),
        }
    }
}

impl Listener {
    /// Binds a Unix listener at `path`.
    pub fn bind_unix(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        UnixListener::bind(path).map(Self::Unix)
    }

    /// Binds a vsock listener on `port` for any CID.
    #[cfg(target_os = "linux")]
    pub fn bind_vsock(port: u32) -> io::Result<Self> {
        let addr = tokio_vsock::VsockAddr::new(libc::VMADDR_CID_ANY, port);
        tokio_vsock::VsockListener::bind(addr).map(Self::Vsock)
    }

    /// Accepts the next connection.
    pub async fn accept(&mut self) -> io::Result<Connection> {
        match self {
            Self::Unix(l) => l.accept().await.map(|(s, _)| Connection::Unix(s)),
            #[cfg(target_os = "linux")]
            Self::Vsock(l) => l.accept().await.map(|(s, _)| Connection::Vsock(s)),
        }
    }
}

/// Where new sockets are allocated.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Transport {
    /// Filesystem-path sockets under `dir`.
    Unix {
        /// Directory receiving `sock-<n>.sock` files.
        dir: PathBuf,
    },
    /// Kernel-assigned vsock ports.
    #[cfg(target_os = "linux")]
    Vsock,
}

/// Creates transport sockets.
#[derive(Debug)]
pub struct SocketAllocator {
    transport: Transport,
    next: AtomicU64,
}

impl SocketAllocator {
    /// Creates an allocator, preparing the socket directory if needed.
    pub fn new(transport: Transport) -> io::Result<Self> {
        if let Transport::Unix { dir } = &transport {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self {
            transport,
            next: AtomicU64::new(0),
        })
    }

    /// The transport this allocator binds on.
    pub const fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Allocates one unregistered socket.
    pub fn allocate(&self) -> Result<AllocatedSocket> {
        let (addr, listener) = match &self.transport {
            Transport::Unix { dir } => {
                let n = self.next.fetch_add(1, Ordering::Relaxed);
                let path = dir.join(format!("sock-{n}.sock"));
                let listener = Listener::bind_unix(&path)?;
                (SocketAddr::Unix(path), listener)
            }
            #[cfg(target_os = "linux")]
            Transport::Vsock => {
                let listener = tokio_vsock::VsockListener::bind(tokio_vsock::VsockAddr::new(
                    libc::VMADDR_CID_ANY,
                    libc::VMADDR_PORT_ANY,
                ))?;
                let port = listener.local_addr()?.port();
                (SocketAddr::Vsock(port), Listener::Vsock(listener))
            }
        };
        debug!(socket = %addr, "allocated socket");
        Ok(AllocatedSocket::new(addr, listener))
    }

    /// Allocates `n` sockets in order.
    ///
    /// If any allocation fails, every socket already allocated in this batch
    /// is closed before the error is returned. Batches larger than
    /// [`MAX_BATCH`] are rejected up front.
    pub async fn allocate_many(&self, n: usize) -> Result<Vec<AllocatedSocket>> {
        if n > MAX_BATCH {
            return Err(Error::Protocol(format!(
                "cannot allocate {n} sockets in one batch (at most {MAX_BATCH})"
            )));
        }
        let mut batch = Vec::new();
        for _ in 0..n {
            match self.allocate() {
                Ok(socket) => batch.push(socket),
                Err(e) => {
                    warn!(allocated = batch.len(), requested = n, error = %e, "socket batch failed");
                    for socket in &batch {
                        socket.close().await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(batch)
    }
}

#[derive(Debug)]
struct State {
    listener: Option<Listener>,
    conn: Option<Connection>,
    connected: bool,
}

/// A socket waiting for, or holding, its single peer connection.
#[derive(Debug)]
pub struct AllocatedSocket {
    addr: SocketAddr,
    state: Mutex<State>,
    closed: CancellationToken,
}

impl AllocatedSocket {
    fn new(addr: SocketAddr, listener: Listener) -> Self {
        Self {
            addr,
            state: Mutex::new(State {
                listener: Some(listener),
                conn: None,
                connected: false,
            }),
            closed: CancellationToken::new(),
        }
    }

    /// The socket's transport address.
    pub const fn addr(&self) -> &SocketAddr {
        &self.addr
    }

    /// The reference ID this socket is registered under.
    pub fn reference(&self) -> ReferenceId {
        ReferenceId::Socket(self.addr.clone())
    }

    /// Returns `true` once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Waits up to [`READY_TIMEOUT`] for the peer to connect.
    pub async fn ready(&self, cancel: &CancellationToken) -> Result<()> {
        self.ready_within(READY_TIMEOUT, cancel).await
    }

    /// Waits up to `budget` for the peer to connect.
    ///
    /// Returns immediately if the peer already connected. A timeout or
    /// cancellation leaves the socket open; the caller still owns closing it.
    pub async fn ready_within(&self, budget: Duration, cancel: &CancellationToken) -> Result<()> {
        let mut listener = {
            let mut state = self.state.lock().await;
            if self.is_closed() {
                return Err(self.closed_error());
            }
            if state.connected {
                return Ok(());
            }
            state.listener.take().ok_or_else(|| {
                Error::Protocol(format!("{} already has a readiness wait pending", self.reference()))
            })?
        };

        let outcome = tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled(format!("socket {}", self.reference()))),
            () = self.closed.cancelled() => Err(self.closed_error()),
            () = tokio::time::sleep(budget) => Err(Error::Timeout(format!("socket {}", self.reference()))),
            res = listener.accept() => res.map_err(Error::from),
        };

        let mut state = self.state.lock().await;
        if self.is_closed() {
            return Err(self.closed_error());
        }
        match outcome {
            Ok(conn) => {
                debug!(socket = %self.addr, "peer connected");
                state.conn = Some(conn);
                state.connected = true;
                Ok(())
            }
            Err(e) => {
                state.listener = Some(listener);
                Err(e)
            }
        }
    }

    /// Moves the peer connection out of the socket.
    ///
    /// The returned token is cancelled when the socket is closed; whoever
    /// holds the connection must stop using it at that point.
    pub async fn take_connection(&self) -> Result<(Connection, CancellationToken)> {
        let mut state = self.state.lock().await;
        if self.is_closed() {
            return Err(self.closed_error());
        }
        match state.conn.take() {
            Some(conn) => Ok((conn, self.closed.child_token())),
            None if state.connected => Err(Error::Protocol(format!(
                "{} is already bound",
                self.reference()
            ))),
            None => Err(Error::Protocol(format!(
                "{} has no peer yet",
                self.reference()
            ))),
        }
    }

    /// Releases the transport resource. Idempotent.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        {
            let mut state = self.state.lock().await;
            state.listener = None;
            state.conn = None;
        }
        if let SocketAddr::Unix(path) = &self.addr {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to unlink socket"),
            }
        }
        debug!(socket = %self.addr, "closed socket");
    }

    fn closed_error(&self) -> Error {
        Error::Closed(format!("socket {}", self.reference()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn unix_allocator(dir: &tempfile::TempDir) -> SocketAllocator {
        SocketAllocator::new(Transport::Unix {
            dir: dir.path().to_path_buf(),
        })
        .unwrap()
    }

    fn unix_path(socket: &AllocatedSocket) -> PathBuf {
        match socket.addr() {
            SocketAddr::Unix(path) => path.clone(),
            other => panic!("expected unix socket, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ready_then_take_connection() {
        let dir = tempfile::tempdir().unwrap();
        let socket = unix_allocator(&dir).allocate().unwrap();
        let path = unix_path(&socket);

        let mut peer = UnixStream::connect(&path).await.unwrap();
        socket.ready(&CancellationToken::new()).await.unwrap();
        // A second wait on a connected socket returns at once.
        socket.ready(&CancellationToken::new()).await.unwrap();

        let (mut conn, closed) = socket.take_connection().await.unwrap();
        peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert!(matches!(
            socket.take_connection().await,
            Err(Error::Protocol(_))
        ));

        socket.close().await;
        assert!(closed.is_cancelled());
        assert!(!path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn ready_times_out_after_ten_seconds() {
        let dir = tempfile::tempdir().unwrap();
        let socket = unix_allocator(&dir).allocate().unwrap();

        let started = tokio::time::Instant::now();
        let err = socket.ready(&CancellationToken::new()).await.unwrap_err();
        let waited = started.elapsed();

        assert!(matches!(err, Error::Timeout(_)), "{err}");
        assert!(err.to_string().contains("to become ready"));
        assert!(waited >= READY_TIMEOUT, "{waited:?}");
        assert!(waited < READY_TIMEOUT + Duration::from_secs(1), "{waited:?}");

        // Readiness failure does not close the socket; a late peer still works.
        assert!(!socket.is_closed());
        let _peer = UnixStream::connect(unix_path(&socket)).await.unwrap();
        socket.ready(&CancellationToken::new()).await.unwrap();
        socket.close().await;
    }

    #[tokio::test]
    async fn ready_honours_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let socket = unix_allocator(&dir).allocate().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            socket.ready(&cancel).await,
            Err(Error::Cancelled(_))
        ));
        socket.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_pending_ready() {
        let dir = tempfile::tempdir().unwrap();
        let socket = std::sync::Arc::new(unix_allocator(&dir).allocate().unwrap());

        let waiter = {
            let socket = std::sync::Arc::clone(&socket);
            tokio::spawn(async move { socket.ready(&CancellationToken::new()).await })
        };
        tokio::task::yield_now().await;
        socket.close().await;
        socket.close().await;

        assert!(matches!(waiter.await.unwrap(), Err(Error::Closed(_))));
        assert!(matches!(
            socket.take_connection().await,
            Err(Error::Closed(_))
        ));
    }

    #[tokio::test]
    async fn failed_batch_leaves_nothing_open() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = unix_allocator(&dir);
        // Occupy the path of the third socket so its bind fails.
        std::fs::create_dir(dir.path().join("sock-2.sock")).unwrap();

        let err = allocator.allocate_many(4).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)), "{err}");
        assert!(!dir.path().join("sock-0.sock").exists());
        assert!(!dir.path().join("sock-1.sock").exists());
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected_before_binding() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = unix_allocator(&dir);
        let err = allocator.allocate_many(u32::MAX as usize).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err}");
        let err = allocator.allocate_many(MAX_BATCH + 1).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err}");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let batch = allocator.allocate_many(MAX_BATCH).await.unwrap();
        assert_eq!(batch.len(), MAX_BATCH);
        for socket in &batch {
            socket.close().await;
        }
    }

    #[tokio::test]
    async fn batch_is_returned_in_allocation_order() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = unix_allocator(&dir);
        let batch = allocator.allocate_many(3).await.unwrap();
        let names: Vec<_> = batch
            .iter()
            .map(|s| unix_path(s).file_name().unwrap().to_owned())
            .collect();
        assert_eq!(names, ["sock-0.sock", "sock-1.sock", "sock-2.sock"]);
        for socket in &batch {
            socket.close().await;
        }
    }
}
