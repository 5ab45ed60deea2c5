//! Guest-side resource broker.
//!
//! Owns the allocation side of [`RuntimeExtras`]: sockets, pipe IO and
//! console sockets are created here, stored in the [`Registry`], and bound
//! to their peers once those have connected.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::console::ConsoleSocket;
use crate::io::{IoBundle, Link, PipeIo, StdioSockets, StreamLinks, Streams};
use crate::reference::ReferenceId;
use crate::registry::Registry;
use crate::runtime::RuntimeExtras;
use crate::socket::{Connection, SocketAllocator};
use crate::{Error, Result};

/// Implements [`RuntimeExtras`] over a registry and a socket allocator.
#[derive(Debug)]
pub struct Broker {
    registry: Arc<Registry>,
    allocator: SocketAllocator,
    console_dir: PathBuf,
    cancel: CancellationToken,
}

impl Broker {
    /// Creates a broker. Readiness waits are abandoned when `cancel` fires.
    pub fn new(
        registry: Arc<Registry>,
        allocator: SocketAllocator,
        console_dir: impl Into<PathBuf>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            allocator,
            console_dir: console_dir.into(),
            cancel,
        }
    }

    /// The registry this broker stores resources in.
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Waits for a registered socket's peer and takes the connection.
    async fn connect(&self, id: &ReferenceId) -> Result<(Connection, CancellationToken)> {
        let socket = self.registry.socket(id)?;
        socket.ready(&self.cancel).await?;
        socket.take_connection().await
    }

    async fn link(&self, id: &ReferenceId) -> Result<Link> {
        let (conn, closed) = self.connect(id).await?;
        Ok(Link::Connected { conn, closed })
    }

    async fn close_socket_entry(&self, id: &ReferenceId) {
        match self.registry.remove_socket(id) {
            Some(socket) => socket.close().await,
            None => debug!(socket = %id, "socket already closed"),
        }
    }
}

impl RuntimeExtras for Broker {
    async fn allocate_sockets(&self, count: usize) -> Result<Vec<ReferenceId>> {
        let batch = self.allocator.allocate_many(count).await?;
        let ids: Vec<_> = batch
            .into_iter()
            .map(|socket| self.registry.insert_socket(socket))
            .collect();
        debug!(count, "allocated sockets");
        Ok(ids)
    }

    async fn allocate_io(&self, streams: Streams) -> Result<ReferenceId> {
        let pipes = PipeIo::new(streams)?;
        let id = self.registry.insert_io(IoBundle::new(pipes));
        debug!(io = %id, ?streams, "allocated io");
        Ok(id)
    }

    async fn allocate_console(&self) -> Result<ReferenceId> {
        let console = ConsoleSocket::new(&self.console_dir)?;
        let id = self.registry.insert_console(console);
        debug!(console = %id, "allocated console");
        Ok(id)
    }

    async fn bind_io_to_sockets(&self, io: &ReferenceId, sockets: StdioSockets) -> Result<()> {
        let bundle = self.registry.io(io)?;
        let streams = bundle.streams();
        for (name, wanted, socket) in [
            ("stdin", streams.stdin, &sockets.stdin),
            ("stdout", streams.stdout, &sockets.stdout),
            ("stderr", streams.stderr, &sockets.stderr),
        ] {
            if let Some(socket) = socket {
                if !wanted {
                    return Err(Error::Protocol(format!("{io} has no {name} pipe")));
                }
                self.registry.socket(socket)?;
            }
        }

        let mut links = StreamLinks::default();
        if let Some(id) = &sockets.stdin {
            links.stdin = Some(self.link(id).await?);
        }
        if let Some(id) = &sockets.stdout {
            links.stdout = Some(self.link(id).await?);
        }
        if let Some(id) = &sockets.stderr {
            links.stderr = Some(self.link(id).await?);
        }
        bundle.bind(sockets, links).await?;
        info!(io = %io, "io bound");
        Ok(())
    }

    async fn bind_console_to_socket(&self, console: &ReferenceId, socket: &ReferenceId) -> Result<()> {
        let entry = self.registry.console(console)?;
        let (conn, closed) = self.connect(socket).await?;
        entry.tunnel(conn, closed, &self.cancel).await?;
        info!(console = %console, socket = %socket, "console bound");
        Ok(())
    }

    async fn close_sockets(&self, ids: &[ReferenceId]) -> Result<()> {
        if let Some(bad) = ids.iter().find(|id| !matches!(id, ReferenceId::Socket(_))) {
            return Err(Error::UnknownReference(format!("{bad} is not a socket reference")));
        }
        for id in ids {
            self.close_socket_entry(id).await;
        }
        Ok(())
    }

    async fn close_io(&self, id: &ReferenceId) -> Result<()> {
        self.registry.io(id)?;
        let Some(bundle) = self.registry.remove_io(id) else {
            return Ok(());
        };
        let bound = bundle.close().await;
        for socket in bound.iter() {
            self.close_socket_entry(socket).await;
        }
        debug!(io = %id, "closed io");
        Ok(())
    }

    async fn close_console(&self, id: &ReferenceId) -> Result<()> {
        self.registry.console(id)?;
        if let Some(console) = self.registry.remove_console(id) {
            console.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;

    use super::*;
    use crate::reference::SocketAddr;
    use crate::socket::Transport;

    fn broker(dir: &tempfile::TempDir) -> Broker {
        let allocator = SocketAllocator::new(Transport::Unix {
            dir: dir.path().join("sockets"),
        })
        .unwrap();
        Broker::new(
            Arc::new(Registry::new()),
            allocator,
            dir.path().join("consoles"),
            CancellationToken::new(),
        )
    }

    fn unix_path(id: &ReferenceId) -> PathBuf {
        match id {
            ReferenceId::Socket(SocketAddr::Unix(path)) => path.clone(),
            other => panic!("expected a unix socket, got {other}"),
        }
    }

    #[tokio::test]
    async fn stdout_only_bundle_releases_one_socket() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(&dir);
        let registry = Arc::clone(broker.registry());

        let sockets = broker.allocate_sockets(1).await.unwrap();
        let io = broker
            .allocate_io(Streams {
                stdin: false,
                stdout: true,
                stderr: false,
            })
            .await
            .unwrap();
        let mut host = UnixStream::connect(unix_path(&sockets[0])).await.unwrap();
        broker
            .bind_io_to_sockets(
                &io,
                StdioSockets {
                    stdout: Some(sockets[0].clone()),
                    ..StdioSockets::default()
                },
            )
            .await
            .unwrap();

        let child = registry.io(&io).unwrap().take_child_stdio().await.unwrap();
        assert!(child.stdin.is_none() && child.stderr.is_none());
        let mut stdout = std::fs::File::from(child.stdout.unwrap());
        std::io::Write::write_all(&mut stdout, b"out").unwrap();
        drop(stdout);
        let mut got = Vec::new();
        host.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"out");

        assert_eq!(registry.socket_count(), 1);
        broker.close_io(&io).await.unwrap();
        assert_eq!(registry.socket_count(), 0);
        assert_eq!(registry.io_count(), 0);
        assert!(!unix_path(&sockets[0]).exists());
    }

    #[tokio::test]
    async fn stdin_reaches_the_child_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(&dir);
        let sockets = broker.allocate_sockets(1).await.unwrap();
        let io = broker
            .allocate_io(Streams {
                stdin: true,
                ..Streams::default()
            })
            .await
            .unwrap();

        let mut host = UnixStream::connect(unix_path(&sockets[0])).await.unwrap();
        broker
            .bind_io_to_sockets(
                &io,
                StdioSockets::positional(broker.registry().io(&io).unwrap().streams(), &sockets)
                    .unwrap(),
            )
            .await
            .unwrap();
        host.write_all(b"input").await.unwrap();
        host.shutdown().await.unwrap();

        let child = broker
            .registry()
            .io(&io)
            .unwrap()
            .take_child_stdio()
            .await
            .unwrap();
        let stdin = std::fs::File::from(child.stdin.unwrap());
        let got = tokio::task::spawn_blocking(move || {
            let mut buf = Vec::new();
            std::io::Read::read_to_end(&mut &stdin, &mut buf).unwrap();
            buf
        })
        .await
        .unwrap();
        assert_eq!(got, b"input");
        broker.close_io(&io).await.unwrap();
    }

    #[tokio::test]
    async fn binding_an_absent_stream_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(&dir);
        let sockets = broker.allocate_sockets(1).await.unwrap();
        let io = broker.allocate_io(Streams::default()).await.unwrap();
        let err = broker
            .bind_io_to_sockets(
                &io,
                StdioSockets {
                    stderr: Some(sockets[0].clone()),
                    ..StdioSockets::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err}");
    }

    #[tokio::test]
    async fn unknown_references_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(&dir);
        let missing = ReferenceId::Io(99);
        assert!(matches!(
            broker
                .bind_io_to_sockets(&missing, StdioSockets::default())
                .await,
            Err(Error::UnknownReference(_))
        ));
        assert!(matches!(
            broker.close_sockets(&[ReferenceId::Console(1)]).await,
            Err(Error::UnknownReference(_))
        ));
    }

    #[tokio::test]
    async fn failed_batch_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(&dir);
        std::fs::create_dir(dir.path().join("sockets/sock-1.sock")).unwrap();
        assert!(broker.allocate_sockets(3).await.is_err());
        assert_eq!(broker.registry().socket_count(), 0);
        assert!(!dir.path().join("sockets/sock-0.sock").exists());
    }

    #[tokio::test]
    async fn console_close_unregisters() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker(&dir);
        let console = broker.allocate_console().await.unwrap();
        assert_eq!(console, ReferenceId::Console(1));
        broker.close_console(&console).await.unwrap();
        assert_eq!(broker.registry().console_count(), 0);
        assert!(matches!(
            broker.close_console(&console).await,
            Err(Error::UnknownReference(_))
        ));
    }
}
