//! Serving side of the runtime RPC.
//!
//! Each connection carries alternating [`Request`]/[`Response`] frames.
//! Every request, including the opening half of a stream upgrade, runs in
//! its own task: a panic in a handler is recovered at
//! that boundary and reported to the caller as a domain error naming the
//! operation, and the connection stays usable. Runtime failures travel as
//! [`Response::error`], never as a dropped connection.
//!
//! [`Request::Events`] and [`Request::ConsoleStream`] upgrade the connection:
//! after a successful empty acknowledgement it carries an event stream or
//! console frames until either side closes it.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tether_proto::{Payload, Request, Response};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::console::Pty;
use crate::io::{StdioSockets, Streams};
use crate::reference::ReferenceId;
use crate::registry::Registry;
use crate::runtime::{Runtime, RuntimeExtras};
use crate::socket::Listener;
use crate::{Error, Result};

/// RPC service over a [`Runtime`] and a [`RuntimeExtras`].
#[derive(Debug)]
pub struct Service<R, X> {
    runtime: Arc<R>,
    extras: Arc<X>,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
}

impl<R, X> Clone for Service<R, X> {
    fn clone(&self) -> Self {
        Self {
            runtime: Arc::clone(&self.runtime),
            extras: Arc::clone(&self.extras),
            registry: Arc::clone(&self.registry),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<R, X> Service<R, X>
where
    R: Runtime + 'static,
    X: RuntimeExtras + 'static,
{
    /// Creates a service. Console streams look consoles up in `registry`.
    pub fn new(runtime: Arc<R>, extras: Arc<X>, registry: Arc<Registry>) -> Self {
        Self {
            runtime,
            extras,
            registry,
            shutdown: CancellationToken::new(),
        }
    }

    /// Fires when a client requests shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accepts connections until shutdown is requested.
    pub async fn serve(&self, mut listener: Listener) -> Result<()> {
        loop {
            let conn = tokio::select! {
                () = self.shutdown.cancelled() => {
                    info!("shutdown requested");
                    return Ok(());
                }
                res = listener.accept() => res?,
            };
            let service = self.clone();
            tokio::spawn(async move {
                if let Err(e) = service.session(conn).await {
                    warn!(error = %e, "session ended with error");
                }
            });
        }
    }

    /// Handles one connection: read requests, dispatch, respond.
    pub async fn session<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut r, mut w) = tokio::io::split(stream);
        loop {
            let Some(req) = tether_proto::recv_opt::<Request>(&mut r).await? else {
                debug!("session closed");
                return Ok(());
            };
            debug!(op = req.name(), "request");

            match req {
                Request::Events { id, interval_ms } => {
                    let runtime = Arc::clone(&self.runtime);
                    let opened = recover("Events", async move {
                        runtime.events(&id, Duration::from_millis(interval_ms)).await
                    })
                    .await;
                    match opened {
                        Ok(events) => {
                            tether_proto::send(&mut w, &Response::ok(Payload::Empty)).await?;
                            return stream_events(&mut w, events).await;
                        }
                        Err(message) => tether_proto::send(&mut w, &Response::failed(message)).await?,
                    }
                }
                Request::ConsoleStream { console } => {
                    let registry = Arc::clone(&self.registry);
                    let shutdown = self.shutdown.clone();
                    let opened = recover("ConsoleStream", async move {
                        let console = registry.console(&console.parse()?)?;
                        let master = console.receive_master(&shutdown).await?;
                        let pty = Pty::from_master(master)?;
                        Ok::<_, Error>((console, pty))
                    })
                    .await;
                    match opened {
                        Ok((console, pty)) => {
                            tether_proto::send(&mut w, &Response::ok(Payload::Empty)).await?;
                            let proxy = console.proxy(pty, r, w).await?;
                            proxy.wait().await;
                            proxy.close().await;
                            return Ok(());
                        }
                        Err(message) => tether_proto::send(&mut w, &Response::failed(message)).await?,
                    }
                }
                Request::Shutdown => {
                    tether_proto::send(&mut w, &Response::ok(Payload::Empty)).await?;
                    self.shutdown.cancel();
                    return Ok(());
                }
                req => {
                    let resp = self.dispatch(req).await;
                    tether_proto::send(&mut w, &resp).await?;
                }
            }
        }
    }

    /// Runs one request behind the task boundary.
    async fn dispatch(&self, req: Request) -> Response {
        let op = req.name();
        let runtime = Arc::clone(&self.runtime);
        let extras = Arc::clone(&self.extras);
        match recover(op, async move { handle(&*runtime, &*extras, req).await }).await {
            Ok(payload) => Response::ok(payload),
            Err(message) => Response::failed(message),
        }
    }
}

/// Runs `work` in its own task. A failure, or a panic converted into an
/// error naming `op`, comes back as the message to report.
async fn recover<T, F>(op: &'static str, work: F) -> std::result::Result<T, String>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            debug!(op, error = %e, "request failed");
            Err(e.to_string())
        }
        Err(e) if e.is_panic() => {
            let message = panic_message(&*e.into_panic());
            error!(op, %message, "handler panicked");
            Err(format!("panic in {op}: {message}"))
        }
        Err(e) => Err(format!("{op} was cancelled: {e}")),
    }
}

async fn stream_events<W>(w: &mut W, mut events: crate::runtime::EventStream) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(item) = events.recv().await {
        match item {
            Ok(event) => tether_proto::send(w, &Response::ok(Payload::Event(event))).await?,
            Err(e) => {
                tether_proto::send(w, &Response::failed(e.to_string())).await?;
                return Ok(());
            }
        }
    }
    tether_proto::send(w, &Response::ok(Payload::End)).await?;
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

fn reference(s: &str) -> Result<ReferenceId> {
    s.parse()
}

fn references(ids: &[String]) -> Result<Vec<ReferenceId>> {
    ids.iter().map(|s| reference(s)).collect()
}

fn optional(s: Option<&str>) -> Result<Option<ReferenceId>> {
    s.map(reference).transpose()
}

/// Maps a request onto the runtime.
async fn handle<R, X>(runtime: &R, extras: &X, req: Request) -> Result<Payload>
where
    R: Runtime,
    X: RuntimeExtras,
{
    Ok(match req {
        Request::Ping => Payload::Pong,
        Request::Version => Payload::Version(runtime.version().await?),
        Request::Create(req) => {
            runtime.create(req).await?;
            Payload::Empty
        }
        Request::Start { id } => {
            runtime.start(&id).await?;
            Payload::Empty
        }
        Request::Exec(req) => match runtime.exec(req).await? {
            Some(code) => Payload::Exit(code),
            None => Payload::Empty,
        },
        Request::Kill { id, signal, all } => {
            runtime.kill(&id, signal, all).await?;
            Payload::Empty
        }
        Request::Pause { id } => {
            runtime.pause(&id).await?;
            Payload::Empty
        }
        Request::Resume { id } => {
            runtime.resume(&id).await?;
            Payload::Empty
        }
        Request::Ps { id } => Payload::Pids(runtime.ps(&id).await?),
        Request::Delete { id, force } => {
            runtime.delete(&id, force).await?;
            Payload::Empty
        }
        Request::Update { id, resources } => {
            runtime.update(&id, &resources).await?;
            Payload::Empty
        }
        Request::Checkpoint(req) => {
            runtime.checkpoint(req).await?;
            Payload::Empty
        }
        Request::Restore(req) => Payload::Exit(runtime.restore(req).await?),
        Request::State { id } => Payload::Container(runtime.state(&id).await?),
        Request::List => Payload::Containers(runtime.list().await?),
        Request::Stats { id } => Payload::Stats(runtime.stats(&id).await?),
        Request::Top { id, ps_options } => Payload::Top(runtime.top(&id, &ps_options).await?),
        Request::AllocateSockets { count } => {
            let count = usize::try_from(count).unwrap_or(usize::MAX);
            let ids = extras.allocate_sockets(count).await?;
            Payload::Sockets(ids.iter().map(ToString::to_string).collect())
        }
        Request::AllocateIo {
            stdin,
            stdout,
            stderr,
        } => {
            let id = extras
                .allocate_io(Streams {
                    stdin,
                    stdout,
                    stderr,
                })
                .await?;
            Payload::Io(id.to_string())
        }
        Request::AllocateConsole => Payload::Console(extras.allocate_console().await?.to_string()),
        Request::BindIoToSockets {
            io,
            stdin,
            stdout,
            stderr,
        } => {
            let sockets = StdioSockets {
                stdin: optional(stdin.as_deref())?,
                stdout: optional(stdout.as_deref())?,
                stderr: optional(stderr.as_deref())?,
            };
            extras.bind_io_to_sockets(&reference(&io)?, sockets).await?;
            Payload::Empty
        }
        Request::BindConsoleToSocket { console, socket } => {
            extras
                .bind_console_to_socket(&reference(&console)?, &reference(&socket)?)
                .await?;
            Payload::Empty
        }
        Request::CloseSockets { ids } => {
            extras.close_sockets(&references(&ids)?).await?;
            Payload::Empty
        }
        Request::CloseIo { id } => {
            extras.close_io(&reference(&id)?).await?;
            Payload::Empty
        }
        Request::CloseConsole { id } => {
            extras.close_console(&reference(&id)?).await?;
            Payload::Empty
        }
        Request::Events { .. } | Request::ConsoleStream { .. } | Request::Shutdown => {
            return Err(Error::Protocol(format!(
                "{} is handled by the session",
                req.name()
            )));
        }
    })
}
