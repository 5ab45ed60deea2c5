//! Byte forwarding between local pipes and transport connections.
//!
//! The guest creates OS pipes for a process ([`PipeIo`]), and a
//! [`Forwarder`] pumps each stream through its own socket connection. The
//! host runs the mirror image: its stdio on one side, the dialled sockets on
//! the other. Streams are forwarded independently, each with its own task.

use std::fmt;
use std::io;
use std::os::fd::OwnedFd;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::reference::ReferenceId;
use crate::socket::{Connection, Listener};
use crate::{Error, Result};

/// Size of the buffer used by every copy loop.
pub const COPY_BUFFER: usize = 1024;

/// Which standard streams a process has.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Streams {
    /// Standard input.
    pub stdin: bool,
    /// Standard output.
    pub stdout: bool,
    /// Standard error.
    pub stderr: bool,
}

impl Streams {
    /// Number of requested streams.
    pub fn count(self) -> usize {
        usize::from(self.stdin) + usize::from(self.stdout) + usize::from(self.stderr)
    }
}

/// Socket references bound positionally to stdin, stdout and stderr.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StdioSockets {
    /// Socket carrying stdin.
    pub stdin: Option<ReferenceId>,
    /// Socket carrying stdout.
    pub stdout: Option<ReferenceId>,
    /// Socket carrying stderr.
    pub stderr: Option<ReferenceId>,
}

impl StdioSockets {
    /// Assigns `sockets` in order to the streams present in `streams`.
    pub fn positional(streams: Streams, sockets: &[ReferenceId]) -> Result<Self> {
        if sockets.len() != streams.count() {
            return Err(Error::Protocol(format!(
                "{} sockets for {} streams",
                sockets.len(),
                streams.count()
            )));
        }
        let mut iter = sockets.iter().cloned();
        let mut next = |present: bool| if present { iter.next() } else { None };
        Ok(Self {
            stdin: next(streams.stdin),
            stdout: next(streams.stdout),
            stderr: next(streams.stderr),
        })
    }

    /// All bound references, stdin first.
    pub fn iter(&self) -> impl Iterator<Item = &ReferenceId> {
        [&self.stdin, &self.stdout, &self.stderr]
            .into_iter()
            .flatten()
    }
}

/// The remote side of a forwarded stream.
#[derive(Debug)]
pub enum Link {
    /// Accept connections one after another; a closed connection is
    /// replaced by the next one without restarting the forwarder.
    Accept(Listener),
    /// Copy over one established connection for its lifetime.
    Connected {
        /// The connection.
        conn: Connection,
        /// Fires when the connection's socket is closed.
        closed: CancellationToken,
    },
}

impl Link {
    /// An established connection with no external close signal.
    pub fn connected(conn: Connection) -> Self {
        Self::Connected {
            conn,
            closed: CancellationToken::new(),
        }
    }
}

/// One forwarding task per stream.
#[derive(Debug, Default)]
pub struct Forwarder {
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Forwarder {
    /// Creates a forwarder with no streams.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies bytes arriving on `link` into the local `writer`.
    pub fn inbound<W>(&mut self, stream: &'static str, link: Link, writer: W)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let stop = self.stop.child_token();
        self.tasks
            .push(tokio::spawn(inbound(stream, link, writer, stop)));
    }

    /// Copies bytes read from the local `reader` out through `link`.
    pub fn outbound<R>(&mut self, stream: &'static str, link: Link, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let stop = self.stop.child_token();
        self.tasks
            .push(tokio::spawn(outbound(stream, link, reader, stop)));
    }

    /// Waits for every stream to finish on its own.
    pub async fn wait(&mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "forwarding task failed");
            }
        }
    }

    /// Stops every stream and waits for the tasks to exit.
    pub async fn close(&mut self) {
        self.stop.cancel();
        self.wait().await;
    }
}

/// Copies `r` into `w` until EOF, an error, or `stop`.
async fn copy<R, W>(r: &mut R, w: &mut W, stop: &CancellationToken) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = [0u8; COPY_BUFFER];
    let mut total = 0u64;
    loop {
        let n = tokio::select! {
            () = stop.cancelled() => return Ok(total),
            res = r.read(&mut buf) => res?,
        };
        if n == 0 {
            w.flush().await?;
            return Ok(total);
        }
        tokio::select! {
            () = stop.cancelled() => return Ok(total),
            res = w.write_all(&buf[..n]) => res?,
        }
        total += n as u64;
    }
}

async fn inbound<W>(stream: &'static str, link: Link, mut writer: W, stop: CancellationToken)
where
    W: AsyncWrite + Unpin + Send,
{
    match link {
        Link::Connected { mut conn, closed } => {
            let res = tokio::select! {
                () = closed.cancelled() => Ok(0),
                res = copy(&mut conn, &mut writer, &stop) => res,
            };
            log_copy(stream, res);
        }
        Link::Accept(mut listener) => loop {
            let mut conn = tokio::select! {
                () = stop.cancelled() => break,
                res = listener.accept() => match res {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(stream, error = %e, "accept failed");
                        break;
                    }
                },
            };
            log_copy(stream, copy(&mut conn, &mut writer, &stop).await);
            if stop.is_cancelled() {
                break;
            }
        },
    }
    // Closing the local end delivers EOF to the process.
    let _ = writer.shutdown().await;
}

async fn outbound<R>(stream: &'static str, link: Link, mut reader: R, stop: CancellationToken)
where
    R: AsyncRead + Unpin + Send,
{
    match link {
        Link::Connected { mut conn, closed } => {
            let res = tokio::select! {
                () = closed.cancelled() => Ok(0),
                res = copy(&mut reader, &mut conn, &stop) => res,
            };
            log_copy(stream, res);
            let _ = conn.shutdown().await;
        }
        Link::Accept(listener) => outbound_accepting(stream, listener, reader, stop).await,
    }
}

/// Serves successive connections from one local reader. A chunk that could
/// not be written to a dying connection is delivered to the next one.
async fn outbound_accepting<R>(
    stream: &'static str,
    mut listener: Listener,
    mut reader: R,
    stop: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = [0u8; COPY_BUFFER];
    let mut pending: Vec<u8> = Vec::new();
    let mut eof = false;

    'accept: loop {
        let mut conn = tokio::select! {
            () = stop.cancelled() => break,
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(stream, error = %e, "accept failed");
                    break;
                }
            },
        };
        loop {
            if pending.is_empty() {
                if eof {
                    let _ = conn.shutdown().await;
                    break 'accept;
                }
                tokio::select! {
                    () = stop.cancelled() => break 'accept,
                    res = reader.read(&mut buf) => match res {
                        Ok(0) => eof = true,
                        Ok(n) => pending.extend_from_slice(&buf[..n]),
                        Err(e) => {
                            debug!(stream, error = %e, "local read failed");
                            eof = true;
                        }
                    },
                }
                continue;
            }
            let res = tokio::select! {
                () = stop.cancelled() => break 'accept,
                res = conn.write_all(&pending) => res,
            };
            match res {
                Ok(()) => pending.clear(),
                Err(e) => {
                    debug!(stream, error = %e, "connection dropped, waiting for the next");
                    continue 'accept;
                }
            }
        }
    }
}

fn log_copy(stream: &'static str, res: io::Result<u64>) {
    match res {
        Ok(bytes) => debug!(stream, bytes, "stream finished"),
        Err(e) => debug!(stream, error = %e, "stream ended with error"),
    }
}

/// Child-side pipe ends, handed to the runtime process as its stdio.
#[derive(Debug, Default)]
pub struct ChildStdio {
    /// Read end of the stdin pipe.
    pub stdin: Option<OwnedFd>,
    /// Write end of the stdout pipe.
    pub stdout: Option<OwnedFd>,
    /// Write end of the stderr pipe.
    pub stderr: Option<OwnedFd>,
}

/// Parent-side pipe ends, driven by the forwarder.
#[derive(Debug, Default)]
struct ParentPipes {
    stdin: Option<pipe::Sender>,
    stdout: Option<pipe::Receiver>,
    stderr: Option<pipe::Receiver>,
}

/// OS pipes for a process's standard streams.
#[derive(Debug)]
pub struct PipeIo {
    streams: Streams,
    child: ChildStdio,
    parent: ParentPipes,
}

impl PipeIo {
    /// Creates pipes for the requested streams. Absent streams stay `None`.
    pub fn new(streams: Streams) -> io::Result<Self> {
        let mut child = ChildStdio::default();
        let mut parent = ParentPipes::default();
        if streams.stdin {
            let (r, w) = std::io::pipe()?;
            child.stdin = Some(r.into());
            parent.stdin = Some(pipe::Sender::from_owned_fd(w.into())?);
        }
        if streams.stdout {
            let (r, w) = std::io::pipe()?;
            child.stdout = Some(w.into());
            parent.stdout = Some(pipe::Receiver::from_owned_fd(r.into())?);
        }
        if streams.stderr {
            let (r, w) = std::io::pipe()?;
            child.stderr = Some(w.into());
            parent.stderr = Some(pipe::Receiver::from_owned_fd(r.into())?);
        }
        Ok(Self {
            streams,
            child,
            parent,
        })
    }

    /// The streams these pipes were created for.
    pub const fn streams(&self) -> Streams {
        self.streams
    }
}

/// The remote side of each stream, positionally.
#[derive(Debug, Default)]
pub struct StreamLinks {
    /// Link feeding stdin.
    pub stdin: Option<Link>,
    /// Link receiving stdout.
    pub stdout: Option<Link>,
    /// Link receiving stderr.
    pub stderr: Option<Link>,
}

struct BundleState {
    child: Option<ChildStdio>,
    parent: Option<ParentPipes>,
    sockets: StdioSockets,
    forwarder: Option<Forwarder>,
    closed: bool,
}

impl fmt::Debug for BundleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleState")
            .field("sockets", &self.sockets)
            .field("bound", &self.forwarder.is_some())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// A process's pipe IO as held by the registry.
#[derive(Debug)]
pub struct IoBundle {
    streams: Streams,
    state: Mutex<BundleState>,
}

impl IoBundle {
    /// Wraps freshly created pipes.
    pub fn new(pipes: PipeIo) -> Self {
        Self {
            streams: pipes.streams,
            state: Mutex::new(BundleState {
                child: Some(pipes.child),
                parent: Some(pipes.parent),
                sockets: StdioSockets::default(),
                forwarder: None,
                closed: false,
            }),
        }
    }

    /// The streams this bundle carries.
    pub const fn streams(&self) -> Streams {
        self.streams
    }

    /// Hands out the child-side pipe ends. Only the first call succeeds.
    pub async fn take_child_stdio(&self) -> Result<ChildStdio> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Error::Closed("io bundle".to_owned()));
        }
        state
            .child
            .take()
            .ok_or_else(|| Error::Protocol("io bundle is already attached to a process".to_owned()))
    }

    /// Starts forwarding each stream through its link.
    ///
    /// A bundle binds at most once; its sockets are never reused for another
    /// process.
    pub async fn bind(&self, sockets: StdioSockets, links: StreamLinks) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Error::Closed("io bundle".to_owned()));
        }
        for (name, wanted, present) in [
            ("stdin", self.streams.stdin, links.stdin.is_some()),
            ("stdout", self.streams.stdout, links.stdout.is_some()),
            ("stderr", self.streams.stderr, links.stderr.is_some()),
        ] {
            if present && !wanted {
                return Err(Error::Protocol(format!("io bundle has no {name} pipe")));
            }
        }
        let parent = state
            .parent
            .take()
            .ok_or_else(|| Error::Protocol("io bundle is already bound".to_owned()))?;

        let mut forwarder = Forwarder::new();
        if let (Some(link), Some(pipe)) = (links.stdin, parent.stdin) {
            forwarder.inbound("stdin", link, pipe);
        }
        if let (Some(link), Some(pipe)) = (links.stdout, parent.stdout) {
            forwarder.outbound("stdout", link, pipe);
        }
        if let (Some(link), Some(pipe)) = (links.stderr, parent.stderr) {
            forwarder.outbound("stderr", link, pipe);
        }
        state.sockets = sockets;
        state.forwarder = Some(forwarder);
        Ok(())
    }

    /// Socket references bound to this bundle.
    pub async fn bound_sockets(&self) -> StdioSockets {
        self.state.lock().await.sockets.clone()
    }

    /// Stops forwarding and drops every pipe end. Idempotent.
    ///
    /// Returns the sockets that were bound, for the caller to close and
    /// unregister.
    pub async fn close(&self) -> StdioSockets {
        let mut state = self.state.lock().await;
        if state.closed {
            return StdioSockets::default();
        }
        state.closed = true;
        if let Some(mut forwarder) = state.forwarder.take() {
            forwarder.close().await;
        }
        state.child = None;
        state.parent = None;
        std::mem::take(&mut state.sockets)
    }
}
