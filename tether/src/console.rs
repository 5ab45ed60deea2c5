//! Console sockets and the PTY proxy.
//!
//! The runtime hands a container's PTY master to a [`ConsoleSocket`] via
//! descriptor transfer. From there a [`ConsoleProxy`] carries the terminal
//! across a single byte stream as [`ConsoleFrame`]s: raw data in both
//! directions plus out-of-band [`Control`] messages.
#![allow(unsafe_code)]

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tether_proto::{ConsoleFrame, Control};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::socket::{Connection, READY_TIMEOUT};
use crate::transfer::recv_fd;
use crate::{Error, Result};

/// Name of the listening socket inside a console's directory.
const SOCKET_NAME: &str = "console.sock";

/// Outgoing control messages buffered per proxy.
const CONTROL_QUEUE: usize = 16;

mod sys {
    nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, libc::winsize);
    nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, libc::winsize);
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowSize {
    /// Rows.
    pub rows: u16,
    /// Columns.
    pub cols: u16,
}

/// Reader and writer handles onto a terminal.
///
/// Usually a PTY master and a duplicate of it; on the host, the local
/// terminal's input and output descriptors.
#[derive(Debug)]
pub struct Pty {
    reader: AsyncFd<File>,
    writer: AsyncFd<File>,
}

impl Pty {
    /// Wraps a PTY master, duplicating it for the write side.
    pub fn from_master(master: OwnedFd) -> io::Result<Self> {
        let writer = master.try_clone()?;
        Self::from_fds(master, writer)
    }

    /// Wraps two terminal descriptors. Both are switched to non-blocking.
    pub fn from_fds(reader: OwnedFd, writer: OwnedFd) -> io::Result<Self> {
        set_nonblocking(&reader)?;
        set_nonblocking(&writer)?;
        Ok(Self {
            reader: register(File::from(reader))?,
            writer: register(File::from(writer))?,
        })
    }

    /// Current window size.
    pub fn size(&self) -> io::Result<WindowSize> {
        let mut ws = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCGWINSZ writes one winsize into `ws`.
        unsafe { sys::tiocgwinsz(self.reader.as_raw_fd(), &raw mut ws) }?;
        Ok(WindowSize {
            rows: ws.ws_row,
            cols: ws.ws_col,
        })
    }

    /// Resizes the terminal.
    pub fn set_size(&self, size: WindowSize) -> io::Result<()> {
        let ws = libc::winsize {
            ws_row: size.rows,
            ws_col: size.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCSWINSZ only reads the winsize behind the pointer.
        unsafe { sys::tiocswinsz(self.writer.as_raw_fd(), &raw const ws) }?;
        Ok(())
    }

    /// Reads available bytes. `Ok(0)` means the terminal hung up.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.reader.readable().await?;
            match guard.try_io(|fd| Read::read(&mut fd.get_ref(), buf)) {
                // A PTY master reports EIO once the slave side is gone.
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => return Ok(0),
                Ok(res) => return res,
                Err(_would_block) => {}
            }
        }
    }

    /// Writes all of `data`.
    pub async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let mut guard = self.writer.writable().await?;
            match guard.try_io(|fd| Write::write(&mut fd.get_ref(), data)) {
                Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(Ok(n)) => data = &data[n..],
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => {}
            }
        }
        Ok(())
    }
}

fn register(file: File) -> io::Result<AsyncFd<File>> {
    // SAFETY: the `File` owns its descriptor for as long as the `AsyncFd`
    // holds it.
    unsafe { AsyncFd::register(file) }.map_err(io::Error::from)
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: F_GETFL/F_SETFL on a descriptor we own.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Options for [`ConsoleProxy::start`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyOptions {
    /// Forward local window changes (`SIGWINCH`) to the remote side. The
    /// current size is also sent once at start.
    pub watch_resize: bool,
}

#[derive(Debug, Default)]
struct Shared {
    exit: StdMutex<Option<i32>>,
    env: StdMutex<BTreeMap<String, String>>,
}

/// A streaming console: two pumps between a [`Pty`] and a frame stream.
#[derive(Debug)]
pub struct ConsoleProxy {
    control: mpsc::Sender<Control>,
    stop: CancellationToken,
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsoleProxy {
    /// Starts proxying `pty` over the `reader`/`writer` frame stream.
    pub fn start<R, W>(pty: Pty, reader: R, writer: W, options: ProxyOptions) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pty = Arc::new(pty);
        let stop = CancellationToken::new();
        let shared = Arc::new(Shared::default());
        let (control, queued) = mpsc::channel(CONTROL_QUEUE);

        let local = tokio::spawn(local_pump(
            Arc::clone(&pty),
            writer,
            queued,
            options,
            stop.clone(),
        ));
        let remote = tokio::spawn(remote_pump(pty, reader, Arc::clone(&shared), stop.clone()));

        Self {
            control,
            stop,
            shared,
            tasks: Mutex::new(vec![local, remote]),
        }
    }

    /// Sender for control messages to the remote side.
    pub fn control(&self) -> mpsc::Sender<Control> {
        self.control.clone()
    }

    /// Exit code received from the remote side, if any.
    pub fn exit_code(&self) -> Option<i32> {
        *self.shared.exit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Environment variables announced by the remote side.
    pub fn env(&self) -> BTreeMap<String, String> {
        self.shared
            .env
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns `true` once the proxy is stopping or stopped.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves when the proxy stops: exit received, the stream ended, or
    /// [`close`](Self::close) was called.
    pub async fn wait(&self) {
        self.stop.cancelled().await;
    }

    /// Stops both pumps and waits for them. Idempotent; concurrent callers
    /// all return after the pumps have finished.
    pub async fn close(&self) {
        self.stop.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "console pump failed");
            }
        }
    }
}

/// PTY and queued control messages → stream.
async fn local_pump<W>(
    pty: Arc<Pty>,
    mut writer: W,
    mut queued: mpsc::Receiver<Control>,
    options: ProxyOptions,
    stop: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send,
{
    let mut winch = if options.watch_resize {
        watch_winch(&pty, &mut writer, &stop).await
    } else {
        None
    };
    let mut buf = [0u8; crate::io::COPY_BUFFER];

    loop {
        let frame = tokio::select! {
            () = stop.cancelled() => break,
            Some(control) = queued.recv() => ConsoleFrame::Control(control),
            Some(()) = next_winch(&mut winch) => match pty.size() {
                Ok(size) => resize_frame(size),
                Err(e) => {
                    debug!(error = %e, "local window size unavailable");
                    continue;
                }
            },
            res = pty.read(&mut buf) => match res {
                Ok(0) => {
                    debug!("console hung up");
                    break;
                }
                Ok(n) => ConsoleFrame::Data(buf[..n].to_vec()),
                Err(e) => {
                    warn!(error = %e, "console read failed");
                    let frame = ConsoleFrame::Control(Control::Error {
                        message: e.to_string(),
                    });
                    let _ = send_frame(&mut writer, &frame, &stop).await;
                    break;
                }
            },
        };
        if let Err(e) = send_frame(&mut writer, &frame, &stop).await {
            debug!(error = %e, "console stream closed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn watch_winch<W>(
    pty: &Pty,
    writer: &mut W,
    stop: &CancellationToken,
) -> Option<tokio::signal::unix::Signal>
where
    W: AsyncWrite + Unpin + Send,
{
    let winch = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change()) {
        Ok(signal) => Some(signal),
        Err(e) => {
            warn!(error = %e, "cannot watch window changes");
            None
        }
    };
    if let Ok(size) = pty.size() {
        let _ = send_frame(writer, &resize_frame(size), stop).await;
    }
    winch
}

async fn next_winch(winch: &mut Option<tokio::signal::unix::Signal>) -> Option<()> {
    match winch {
        Some(signal) => signal.recv().await,
        None => std::future::pending().await,
    }
}

const fn resize_frame(size: WindowSize) -> ConsoleFrame {
    ConsoleFrame::Control(Control::Resize {
        rows: size.rows,
        cols: size.cols,
    })
}

async fn send_frame<W>(writer: &mut W, frame: &ConsoleFrame, stop: &CancellationToken) -> io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    tokio::select! {
        () = stop.cancelled() => Err(io::ErrorKind::Interrupted.into()),
        res = tether_proto::send(writer, frame) => res,
    }
}

/// Stream → PTY and control dispatch. Ending this pump stops the proxy.
async fn remote_pump<R>(pty: Arc<Pty>, mut reader: R, shared: Arc<Shared>, stop: CancellationToken)
where
    R: AsyncRead + Unpin + Send,
{
    loop {
        let frame = tokio::select! {
            () = stop.cancelled() => break,
            res = tether_proto::recv_opt::<ConsoleFrame>(&mut reader) => res,
        };
        match frame {
            Ok(None) => {
                debug!("console stream ended");
                break;
            }
            Err(e) => {
                warn!(error = %e, "console stream failed");
                break;
            }
            Ok(Some(ConsoleFrame::Data(data))) => {
                let res = tokio::select! {
                    () = stop.cancelled() => break,
                    res = pty.write_all(&data) => res,
                };
                if let Err(e) = res {
                    warn!(error = %e, "console write failed");
                    break;
                }
            }
            Ok(Some(ConsoleFrame::Control(control))) => match control {
                Control::Resize { rows, cols } => {
                    if let Err(e) = pty.set_size(WindowSize { rows, cols }) {
                        warn!(rows, cols, error = %e, "console resize failed");
                    }
                }
                Control::Env { key, value } => {
                    info!(%key, %value, "console environment");
                    shared
                        .env
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(key, value);
                }
                Control::Exit { code } => {
                    info!(code, "console exit");
                    *shared.exit.lock().unwrap_or_else(PoisonError::into_inner) = Some(code);
                    break;
                }
                Control::Error { message } => warn!(%message, "remote console error"),
            },
        }
    }
    stop.cancel();
}

/// Lifecycle of a console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleState {
    /// Waiting for the runtime to hand over the PTY master.
    Allocated,
    /// A proxy is running.
    Streaming,
    /// Closed, or its proxy has stopped; nothing more can happen.
    Closed,
}

/// A console socket handed to the runtime as `--console-socket`.
///
/// Lives in its own temporary directory, removed on close.
#[derive(Debug)]
pub struct ConsoleSocket {
    path: PathBuf,
    dir: StdMutex<Option<tempfile::TempDir>>,
    listener: Mutex<Option<UnixListener>>,
    state: Arc<StdMutex<ConsoleState>>,
    proxy: Mutex<Option<Arc<ConsoleProxy>>>,
    closed: CancellationToken,
}

impl ConsoleSocket {
    /// Creates a console socket in a fresh directory under `parent`.
    pub fn new(parent: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(parent)?;
        let dir = tempfile::Builder::new()
            .prefix("console-")
            .tempdir_in(parent)?;
        let path = dir.path().join(SOCKET_NAME);
        let listener = UnixListener::bind(&path)?;
        debug!(path = %path.display(), "allocated console socket");
        Ok(Self {
            path,
            dir: StdMutex::new(Some(dir)),
            listener: Mutex::new(Some(listener)),
            state: Arc::new(StdMutex::new(ConsoleState::Allocated)),
            proxy: Mutex::new(None),
            closed: CancellationToken::new(),
        })
    }

    /// Filesystem path the runtime connects to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConsoleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConsoleState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Accepts the runtime's connection and receives the PTY master.
    ///
    /// Bounded by [`READY_TIMEOUT`]. A timed-out or cancelled wait may be
    /// retried; once a master has been received it may not.
    pub async fn receive_master(&self, cancel: &CancellationToken) -> Result<OwnedFd> {
        let listener = self.listener.lock().await.take();
        let Some(listener) = listener else {
            return Err(if self.closed.is_cancelled() {
                self.closed_error()
            } else {
                Error::Protocol(format!(
                    "console {} has already received its master or is waiting for it",
                    self.path.display()
                ))
            });
        };

        let outcome = {
            let receive = async {
                let (conn, _) = listener.accept().await?;
                recv_fd(&conn).await
            };
            tokio::select! {
                () = cancel.cancelled() => Err(Error::Cancelled(format!("console {}", self.path.display()))),
                () = self.closed.cancelled() => Err(self.closed_error()),
                () = tokio::time::sleep(READY_TIMEOUT) => Err(Error::Timeout(format!("console {}", self.path.display()))),
                res = receive => res,
            }
        };
        if matches!(outcome, Err(Error::Timeout(_) | Error::Cancelled(_))) {
            let mut slot = self.listener.lock().await;
            if !self.closed.is_cancelled() {
                *slot = Some(listener);
            }
        }
        outcome
    }

    /// Receives the master and proxies it over `reader`/`writer`.
    pub async fn stream<R, W>(
        &self,
        reader: R,
        writer: W,
        cancel: &CancellationToken,
    ) -> Result<Arc<ConsoleProxy>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pty = Pty::from_master(self.receive_master(cancel).await?)?;
        self.proxy(pty, reader, writer).await
    }

    /// Starts proxying an already received PTY over `reader`/`writer`.
    pub async fn proxy<R, W>(&self, pty: Pty, reader: R, writer: W) -> Result<Arc<ConsoleProxy>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut slot = self.proxy.lock().await;
        if self.closed.is_cancelled() {
            return Err(self.closed_error());
        }
        if slot.is_some() {
            return Err(Error::Protocol(format!(
                "console {} is already streaming",
                self.path.display()
            )));
        }
        let proxy = Arc::new(ConsoleProxy::start(pty, reader, writer, ProxyOptions::default()));
        *slot = Some(Arc::clone(&proxy));
        self.set_state(ConsoleState::Streaming);
        info!(path = %self.path.display(), "console streaming");

        let state = Arc::clone(&self.state);
        let watched = Arc::clone(&proxy);
        tokio::spawn(async move {
            watched.wait().await;
            *state.lock().unwrap_or_else(PoisonError::into_inner) = ConsoleState::Closed;
        });
        Ok(proxy)
    }

    /// Tunnels the console over an allocated socket's connection.
    ///
    /// The proxy is closed when `closed` fires, i.e. when the socket is.
    pub async fn tunnel(
        &self,
        conn: Connection,
        closed: CancellationToken,
        cancel: &CancellationToken,
    ) -> Result<Arc<ConsoleProxy>> {
        let (reader, writer) = tokio::io::split(conn);
        let proxy = self.stream(reader, writer, cancel).await?;
        let watched = Arc::clone(&proxy);
        tokio::spawn(async move {
            tokio::select! {
                () = closed.cancelled() => watched.close().await,
                () = watched.wait() => {}
            }
        });
        Ok(proxy)
    }

    /// Stops any proxy and removes the socket directory. Idempotent.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let proxy = self.proxy.lock().await.take();
        if let Some(proxy) = proxy {
            proxy.close().await;
        }
        self.listener.lock().await.take();
        let dir = self
            .dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dir) = dir {
            if let Err(e) = dir.close() {
                warn!(path = %self.path.display(), error = %e, "failed to remove console directory");
            }
        }
        self.set_state(ConsoleState::Closed);
        debug!(path = %self.path.display(), "closed console");
    }

    fn closed_error(&self) -> Error {
        Error::Closed(format!("console {}", self.path.display()))
    }
}
