//! Host-side client for a tether guest agent.
//!
//! [`Client`] implements [`Runtime`] and [`RuntimeExtras`] over the RPC
//! connection, so host code drives a guest runtime the same way it would a
//! local one. Ordinary calls share one persistent connection behind a
//! `tokio::sync::Mutex`, redialed after a call that did not finish; event
//! and console streams dial their own.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tether_proto::{
    CheckpointReq, Container, CreateReq, ExecReq, Payload, Request, Response, RestoreReq, Stats,
    TopResults, Version,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::console::{ConsoleProxy, ProxyOptions, Pty};
use crate::io::{Forwarder, Link, StdioSockets, Streams};
use crate::reference::{ReferenceId, SocketAddr};
use crate::runtime::{EventStream, Runtime, RuntimeExtras};
use crate::socket::Connection;
use crate::{Error, Result};

/// Buffered events per stream before the reader applies backpressure.
const EVENT_QUEUE: usize = 64;

/// Where the guest agent listens.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Endpoint {
    /// A Unix socket path, e.g. one a VMM maps from a vsock port.
    Unix(PathBuf),
    /// A vsock address.
    #[cfg(target_os = "linux")]
    Vsock {
        /// Context ID of the guest.
        cid: u32,
        /// Agent port.
        port: u32,
    },
}

impl Endpoint {
    async fn connect(&self) -> io::Result<Connection> {
        match self {
            Self::Unix(path) => UnixStream::connect(path).await.map(Connection::Unix),
            #[cfg(target_os = "linux")]
            Self::Vsock { cid, port } => connect_vsock(*cid, *port).await,
        }
    }
}

#[cfg(target_os = "linux")]
async fn connect_vsock(cid: u32, port: u32) -> io::Result<Connection> {
    let addr = tokio_vsock::VsockAddr::new(cid, port);
    tokio_vsock::VsockStream::connect(addr)
        .await
        .map(Connection::Vsock)
}

/// The shared connection and whether a call on it was left unfinished.
#[derive(Debug)]
struct Channel {
    conn: Connection,
    in_flight: bool,
}

/// Async client connection to a guest agent.
#[derive(Debug)]
pub struct Client {
    endpoint: Endpoint,
    channel: Mutex<Channel>,
    vsock_cid: Option<u32>,
}

impl Client {
    /// Connects to the agent at `endpoint`.
    pub async fn connect(endpoint: Endpoint) -> Result<Self> {
        let stream = endpoint.connect().await.map_err(Error::Transport)?;
        #[cfg(target_os = "linux")]
        let vsock_cid = match endpoint {
            Endpoint::Vsock { cid, .. } => Some(cid),
            Endpoint::Unix(_) => None,
        };
        #[cfg(not(target_os = "linux"))]
        let vsock_cid = None;
        debug!(?endpoint, "connected to agent");
        Ok(Self {
            endpoint,
            channel: Mutex::new(Channel {
                conn: stream,
                in_flight: false,
            }),
            vsock_cid,
        })
    }

    /// Sets the guest CID used to dial `socket:vsock:<port>` references.
    ///
    /// Needed when the agent itself is reached over a Unix socket.
    #[must_use]
    pub fn with_vsock_cid(mut self, cid: u32) -> Self {
        self.vsock_cid = Some(cid);
        self
    }

    /// Sends a ping and waits for the pong.
    pub async fn ping(&self) -> Result<()> {
        match self.call(&Request::Ping).await? {
            Payload::Pong => Ok(()),
            other => Err(unexpected("Ping", &other)),
        }
    }

    /// Asks the agent to stop accepting connections.
    pub async fn shutdown(&self) -> Result<()> {
        self.call_empty(&Request::Shutdown).await
    }

    /// One request/response exchange on the shared connection.
    ///
    /// A call dropped between sending and receiving leaves its reply queued
    /// on the connection, so the next call dials a fresh one instead.
    async fn call(&self, req: &Request) -> Result<Payload> {
        let mut channel = self.channel.lock().await;
        if channel.in_flight {
            debug!(op = req.name(), "previous call did not finish, reconnecting");
            channel.conn = self.endpoint.connect().await.map_err(Error::Transport)?;
            channel.in_flight = false;
        }
        channel.in_flight = true;
        tether_proto::send(&mut channel.conn, req)
            .await
            .map_err(Error::Transport)?;
        let resp = tether_proto::recv::<Response>(&mut channel.conn)
            .await
            .map_err(Error::Transport)?;
        channel.in_flight = false;
        payload(resp)
    }

    async fn call_empty(&self, req: &Request) -> Result<()> {
        match self.call(req).await? {
            Payload::Empty => Ok(()),
            other => Err(unexpected(req.name(), &other)),
        }
    }

    /// Dials a dedicated connection and upgrades it with `req`.
    async fn open_stream(&self, req: &Request) -> Result<Connection> {
        let mut conn = self.endpoint.connect().await.map_err(Error::Transport)?;
        tether_proto::send(&mut conn, req)
            .await
            .map_err(Error::Transport)?;
        let resp = tether_proto::recv::<Response>(&mut conn)
            .await
            .map_err(Error::Transport)?;
        match payload(resp)? {
            Payload::Empty => Ok(conn),
            other => Err(unexpected(req.name(), &other)),
        }
    }

    /// Connects to an allocated socket as its peer.
    pub async fn dial(&self, socket: &ReferenceId) -> Result<Connection> {
        let conn = match socket {
            ReferenceId::Socket(SocketAddr::Unix(path)) => {
                UnixStream::connect(path).await.map(Connection::Unix)
            }
            #[cfg(target_os = "linux")]
            ReferenceId::Socket(SocketAddr::Vsock(port)) => {
                let cid = self.vsock_cid.ok_or_else(|| {
                    Error::Protocol(format!("no guest CID known to dial {socket}"))
                })?;
                connect_vsock(cid, *port).await
            }
            other => {
                return Err(Error::Protocol(format!("cannot dial {other}")));
            }
        };
        conn.map_err(Error::Transport)
    }

    /// Upgrades a fresh connection into a console frame stream.
    pub async fn attach_console(&self, console: &ReferenceId) -> Result<Connection> {
        self.open_stream(&Request::ConsoleStream {
            console: console.to_string(),
        })
        .await
    }

    /// Proxies a local terminal to a guest console.
    pub async fn proxy_console(
        &self,
        console: &ReferenceId,
        pty: Pty,
        options: ProxyOptions,
    ) -> Result<ConsoleProxy> {
        let conn = self.attach_console(console).await?;
        let (reader, writer) = tokio::io::split(conn);
        Ok(ConsoleProxy::start(pty, reader, writer, options))
    }

    /// Allocates a guest IO bundle for `stdio` and forwards it.
    ///
    /// Sockets are allocated and dialed first, then bound positionally. On
    /// any failure everything allocated so far is released.
    pub async fn open_io(&self, stdio: HostStdio) -> Result<RemoteIo> {
        let streams = stdio.streams();
        let sockets = self.allocate_sockets(streams.count()).await?;

        let mut conns = Vec::with_capacity(sockets.len());
        for socket in &sockets {
            match self.dial(socket).await {
                Ok(conn) => conns.push(conn),
                Err(e) => {
                    self.release(None, &sockets).await;
                    return Err(e);
                }
            }
        }

        let io = match self.allocate_io(streams).await {
            Ok(io) => io,
            Err(e) => {
                self.release(None, &sockets).await;
                return Err(e);
            }
        };
        let bound = async {
            let positional = StdioSockets::positional(streams, &sockets)?;
            self.bind_io_to_sockets(&io, positional).await
        }
        .await;
        if let Err(e) = bound {
            self.release(Some(&io), &sockets).await;
            return Err(e);
        }

        let mut forwarder = Forwarder::new();
        let mut conns = conns.into_iter();
        if let Some(stdin) = stdio.stdin {
            if let Some(conn) = conns.next() {
                forwarder.outbound("stdin", Link::connected(conn), stdin);
            }
        }
        if let Some(stdout) = stdio.stdout {
            if let Some(conn) = conns.next() {
                forwarder.inbound("stdout", Link::connected(conn), stdout);
            }
        }
        if let Some(stderr) = stdio.stderr {
            if let Some(conn) = conns.next() {
                forwarder.inbound("stderr", Link::connected(conn), stderr);
            }
        }
        debug!(%io, sockets = sockets.len(), "remote io open");
        Ok(RemoteIo {
            io,
            sockets,
            forwarder,
        })
    }

    async fn release(&self, io: Option<&ReferenceId>, sockets: &[ReferenceId]) {
        if let Some(io) = io {
            if let Err(e) = self.close_io(io).await {
                warn!(%io, error = %e, "failed to release io");
            }
        }
        if let Err(e) = self.close_sockets(sockets).await {
            warn!(error = %e, "failed to release sockets");
        }
    }

    async fn events_task(conn: Connection, tx: mpsc::Sender<Result<tether_proto::Event>>) {
        let (mut reader, _writer) = tokio::io::split(conn);
        loop {
            let item = tokio::select! {
                () = tx.closed() => return,
                res = tether_proto::recv::<Response>(&mut reader) => res,
            };
            let event = match item.map_err(Error::Transport).and_then(payload) {
                Ok(Payload::Event(event)) => Ok(event),
                Ok(Payload::End) => return,
                Ok(other) => Err(unexpected("Events", &other)),
                Err(e) => Err(e),
            };
            let last = event.is_err();
            if tx.send(event).await.is_err() || last {
                return;
            }
        }
    }
}

/// Unwraps a response, turning a reported failure into a domain error.
fn payload(resp: Response) -> Result<Payload> {
    match resp.error {
        Some(message) if !message.is_empty() => Err(Error::Domain(message)),
        _ => Ok(resp.payload),
    }
}

fn unexpected(op: &str, payload: &Payload) -> Error {
    Error::Protocol(format!("unexpected reply to {op}: {payload:?}"))
}

fn parse_reference(s: &str) -> Result<ReferenceId> {
    s.parse()
}

impl Runtime for Client {
    async fn create(&self, req: CreateReq) -> Result<()> {
        self.call_empty(&Request::Create(req)).await
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.call_empty(&Request::Start { id: id.to_owned() }).await
    }

    async fn exec(&self, req: ExecReq) -> Result<Option<i32>> {
        match self.call(&Request::Exec(req)).await? {
            Payload::Exit(code) => Ok(Some(code)),
            Payload::Empty => Ok(None),
            other => Err(unexpected("Exec", &other)),
        }
    }

    async fn kill(&self, id: &str, signal: i32, all: bool) -> Result<()> {
        self.call_empty(&Request::Kill {
            id: id.to_owned(),
            signal,
            all,
        })
        .await
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.call_empty(&Request::Pause { id: id.to_owned() }).await
    }

    async fn resume(&self, id: &str) -> Result<()> {
        self.call_empty(&Request::Resume { id: id.to_owned() }).await
    }

    async fn ps(&self, id: &str) -> Result<Vec<i32>> {
        match self.call(&Request::Ps { id: id.to_owned() }).await? {
            Payload::Pids(pids) => Ok(pids),
            other => Err(unexpected("Ps", &other)),
        }
    }

    async fn delete(&self, id: &str, force: bool) -> Result<()> {
        self.call_empty(&Request::Delete {
            id: id.to_owned(),
            force,
        })
        .await
    }

    async fn update(&self, id: &str, resources: &[u8]) -> Result<()> {
        self.call_empty(&Request::Update {
            id: id.to_owned(),
            resources: resources.to_vec(),
        })
        .await
    }

    async fn checkpoint(&self, req: CheckpointReq) -> Result<()> {
        self.call_empty(&Request::Checkpoint(req)).await
    }

    async fn restore(&self, req: RestoreReq) -> Result<i32> {
        match self.call(&Request::Restore(req)).await? {
            Payload::Exit(code) => Ok(code),
            other => Err(unexpected("Restore", &other)),
        }
    }

    async fn state(&self, id: &str) -> Result<Container> {
        match self.call(&Request::State { id: id.to_owned() }).await? {
            Payload::Container(container) => Ok(container),
            other => Err(unexpected("State", &other)),
        }
    }

    async fn list(&self) -> Result<Vec<Container>> {
        match self.call(&Request::List).await? {
            Payload::Containers(containers) => Ok(containers),
            other => Err(unexpected("List", &other)),
        }
    }

    async fn stats(&self, id: &str) -> Result<Stats> {
        match self.call(&Request::Stats { id: id.to_owned() }).await? {
            Payload::Stats(stats) => Ok(stats),
            other => Err(unexpected("Stats", &other)),
        }
    }

    async fn top(&self, id: &str, ps_options: &[String]) -> Result<TopResults> {
        let req = Request::Top {
            id: id.to_owned(),
            ps_options: ps_options.to_vec(),
        };
        match self.call(&req).await? {
            Payload::Top(top) => Ok(top),
            other => Err(unexpected("Top", &other)),
        }
    }

    async fn version(&self) -> Result<Version> {
        match self.call(&Request::Version).await? {
            Payload::Version(version) => Ok(version),
            other => Err(unexpected("Version", &other)),
        }
    }

    async fn events(&self, id: &str, interval: Duration) -> Result<EventStream> {
        let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        let conn = self
            .open_stream(&Request::Events {
                id: id.to_owned(),
                interval_ms,
            })
            .await?;
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        tokio::spawn(Self::events_task(conn, tx));
        Ok(rx)
    }
}

impl RuntimeExtras for Client {
    async fn allocate_sockets(&self, count: usize) -> Result<Vec<ReferenceId>> {
        let count = u32::try_from(count)
            .map_err(|_| Error::Protocol(format!("cannot allocate {count} sockets")))?;
        match self.call(&Request::AllocateSockets { count }).await? {
            Payload::Sockets(ids) => ids.iter().map(|s| parse_reference(s)).collect(),
            other => Err(unexpected("AllocateSockets", &other)),
        }
    }

    async fn allocate_io(&self, streams: Streams) -> Result<ReferenceId> {
        let req = Request::AllocateIo {
            stdin: streams.stdin,
            stdout: streams.stdout,
            stderr: streams.stderr,
        };
        match self.call(&req).await? {
            Payload::Io(id) => parse_reference(&id),
            other => Err(unexpected("AllocateIo", &other)),
        }
    }

    async fn allocate_console(&self) -> Result<ReferenceId> {
        match self.call(&Request::AllocateConsole).await? {
            Payload::Console(id) => parse_reference(&id),
            other => Err(unexpected("AllocateConsole", &other)),
        }
    }

    async fn bind_io_to_sockets(&self, io: &ReferenceId, sockets: StdioSockets) -> Result<()> {
        self.call_empty(&Request::BindIoToSockets {
            io: io.to_string(),
            stdin: sockets.stdin.as_ref().map(ToString::to_string),
            stdout: sockets.stdout.as_ref().map(ToString::to_string),
            stderr: sockets.stderr.as_ref().map(ToString::to_string),
        })
        .await
    }

    async fn bind_console_to_socket(&self, console: &ReferenceId, socket: &ReferenceId) -> Result<()> {
        self.call_empty(&Request::BindConsoleToSocket {
            console: console.to_string(),
            socket: socket.to_string(),
        })
        .await
    }

    async fn close_sockets(&self, ids: &[ReferenceId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.call_empty(&Request::CloseSockets {
            ids: ids.iter().map(ToString::to_string).collect(),
        })
        .await
    }

    async fn close_io(&self, id: &ReferenceId) -> Result<()> {
        self.call_empty(&Request::CloseIo { id: id.to_string() }).await
    }

    async fn close_console(&self, id: &ReferenceId) -> Result<()> {
        self.call_empty(&Request::CloseConsole { id: id.to_string() })
            .await
    }
}

/// Host-side ends of a process's standard streams.
#[derive(Default)]
#[non_exhaustive]
pub struct HostStdio {
    /// Source for the process's stdin.
    pub stdin: Option<Box<dyn AsyncRead + Unpin + Send>>,
    /// Sink for the process's stdout.
    pub stdout: Option<Box<dyn AsyncWrite + Unpin + Send>>,
    /// Sink for the process's stderr.
    pub stderr: Option<Box<dyn AsyncWrite + Unpin + Send>>,
}

impl std::fmt::Debug for HostStdio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostStdio")
            .field("streams", &self.streams())
            .finish()
    }
}

impl HostStdio {
    /// No streams.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the process's stdin from `reader`.
    #[must_use]
    pub fn stdin(mut self, reader: impl AsyncRead + Unpin + Send + 'static) -> Self {
        self.stdin = Some(Box::new(reader));
        self
    }

    /// Collects the process's stdout into `writer`.
    #[must_use]
    pub fn stdout(mut self, writer: impl AsyncWrite + Unpin + Send + 'static) -> Self {
        self.stdout = Some(Box::new(writer));
        self
    }

    /// Collects the process's stderr into `writer`.
    #[must_use]
    pub fn stderr(mut self, writer: impl AsyncWrite + Unpin + Send + 'static) -> Self {
        self.stderr = Some(Box::new(writer));
        self
    }

    /// Which streams are present.
    pub const fn streams(&self) -> Streams {
        Streams {
            stdin: self.stdin.is_some(),
            stdout: self.stdout.is_some(),
            stderr: self.stderr.is_some(),
        }
    }
}

/// A guest IO bundle forwarded to host streams.
#[derive(Debug)]
pub struct RemoteIo {
    io: ReferenceId,
    sockets: Vec<ReferenceId>,
    forwarder: Forwarder,
}

impl RemoteIo {
    /// Reference to pass as `io` in create or exec requests.
    pub const fn io_ref(&self) -> &ReferenceId {
        &self.io
    }

    /// Sockets carrying the streams, in stdin/stdout/stderr order.
    pub fn sockets(&self) -> &[ReferenceId] {
        &self.sockets
    }

    /// Waits until every stream has reached end of file.
    pub async fn wait(&mut self) {
        self.forwarder.wait().await;
    }

    /// Stops forwarding and releases the guest bundle with its sockets.
    pub async fn close(mut self, client: &Client) -> Result<()> {
        self.forwarder.close().await;
        client.close_io(&self.io).await
    }
}
