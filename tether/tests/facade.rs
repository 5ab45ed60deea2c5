//! End-to-end checks of the RPC facade: a [`Client`] talking to a [`Service`]
//! over a Unix socket, with a scripted runtime and a real [`Broker`].
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, missing_docs)]

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::pty::{OpenptyResult, Winsize, openpty};
use nix::sys::termios::{LocalFlags, SetArg, Termios, tcgetattr, tcsetattr};
use tether::{
    Broker, Client, ConsoleSocket, ConsoleState, Endpoint, Error, EventStream, HostStdio,
    Listener, MAX_BATCH, ProxyOptions, Pty, ReferenceId, Registry, Result, Runtime, RuntimeExtras,
    Service, SocketAllocator, StdioSockets, Streams, Transport,
};
use tether_proto::{
    CheckpointReq, ConsoleFrame, Container, Control, CreateReq, Event, ExecReq, Request,
    RestoreReq, Stats, TopResults, Version,
};
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Runtime that keeps container IDs in memory.
#[derive(Debug, Default)]
struct FakeRuntime {
    containers: Mutex<HashSet<String>>,
}

impl FakeRuntime {
    fn known(&self, id: &str) -> Result<()> {
        if self.containers.lock().unwrap().contains(id) {
            Ok(())
        } else {
            Err(Error::Runtime {
                op: "state",
                message: format!("container {id} does not exist"),
            })
        }
    }
}

impl Runtime for FakeRuntime {
    async fn create(&self, req: CreateReq) -> Result<()> {
        if !self.containers.lock().unwrap().insert(req.id.clone()) {
            return Err(Error::Runtime {
                op: "create",
                message: format!("container with id exists: {}", req.id),
            });
        }
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.known(id)
    }

    async fn exec(&self, req: ExecReq) -> Result<Option<i32>> {
        self.known(&req.id)?;
        Ok(if req.detach { None } else { Some(3) })
    }

    async fn kill(&self, id: &str, _signal: i32, _all: bool) -> Result<()> {
        self.known(id)
    }

    async fn pause(&self, _id: &str) -> Result<()> {
        panic!("freezer exploded");
    }

    async fn resume(&self, id: &str) -> Result<()> {
        self.known(id)
    }

    async fn ps(&self, id: &str) -> Result<Vec<i32>> {
        self.known(id)?;
        Ok(vec![1, 42])
    }

    async fn delete(&self, id: &str, _force: bool) -> Result<()> {
        self.known(id)?;
        self.containers.lock().unwrap().remove(id);
        Ok(())
    }

    async fn update(&self, id: &str, _resources: &[u8]) -> Result<()> {
        self.known(id)
    }

    async fn checkpoint(&self, _req: CheckpointReq) -> Result<()> {
        Err(Error::NotImplemented("checkpoint"))
    }

    async fn restore(&self, _req: RestoreReq) -> Result<i32> {
        Err(Error::NotImplemented("restore"))
    }

    async fn state(&self, id: &str) -> Result<Container> {
        self.known(id)?;
        Ok(Container {
            id: id.to_owned(),
            status: "created".to_owned(),
            ..Container::default()
        })
    }

    async fn list(&self) -> Result<Vec<Container>> {
        let mut ids: Vec<_> = self.containers.lock().unwrap().iter().cloned().collect();
        ids.sort();
        Ok(ids
            .into_iter()
            .map(|id| Container {
                id,
                ..Container::default()
            })
            .collect())
    }

    async fn stats(&self, id: &str) -> Result<Stats> {
        self.known(id)?;
        Ok(Stats::default())
    }

    async fn top(&self, id: &str, _ps_options: &[String]) -> Result<TopResults> {
        self.known(id)?;
        Ok(TopResults::default())
    }

    async fn version(&self) -> Result<Version> {
        Ok(Version {
            runtime: "fake".to_owned(),
            ..Version::default()
        })
    }

    async fn events(&self, id: &str, _interval: Duration) -> Result<EventStream> {
        assert_ne!(id, "boom", "event source exploded");
        self.known(id)?;
        let (tx, rx) = mpsc::channel(4);
        for kind in ["stats", "oom"] {
            tx.send(Ok(Event {
                kind: kind.to_owned(),
                id: id.to_owned(),
                stats: None,
            }))
            .await
            .unwrap();
        }
        Ok(rx)
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    registry: Arc<Registry>,
    client: Client,
    sockets_dir: std::path::PathBuf,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let sockets_dir = dir.path().join("sockets");
    let registry = Arc::new(Registry::new());
    let allocator = SocketAllocator::new(Transport::Unix {
        dir: sockets_dir.clone(),
    })
    .unwrap();
    let broker = Broker::new(
        Arc::clone(&registry),
        allocator,
        dir.path().join("consoles"),
        CancellationToken::new(),
    );
    let service = Service::new(
        Arc::new(FakeRuntime::default()),
        Arc::new(broker),
        Arc::clone(&registry),
    );

    let agent = dir.path().join("agent.sock");
    let listener = Listener::bind_unix(&agent).unwrap();
    tokio::spawn(async move { service.serve(listener).await });
    let client = Client::connect(Endpoint::Unix(agent)).await.unwrap();
    Harness {
        _dir: dir,
        registry,
        client,
        sockets_dir,
    }
}

#[tokio::test]
async fn duplicate_create_is_a_domain_error() {
    let h = harness().await;
    h.client.create(CreateReq::new("web", "/bundle")).await.unwrap();
    let err = h
        .client
        .create(CreateReq::new("web", "/bundle"))
        .await
        .unwrap_err();
    assert!(err.is_domain(), "{err:?}");
    assert!(err.to_string().contains("container with id exists: web"), "{err}");

    // The connection survives a domain failure.
    h.client.ping().await.unwrap();
    let listed = h.client.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(h.client.exec(ExecReq::new("web", "{}")).await.unwrap(), Some(3));
}

#[tokio::test]
async fn panicking_handler_reports_the_operation() {
    let h = harness().await;
    let err = h.client.pause("web").await.unwrap_err();
    assert!(err.is_domain(), "{err:?}");
    let message = err.to_string();
    assert!(message.contains("Pause"), "{message}");
    assert!(message.contains("freezer exploded"), "{message}");
    h.client.ping().await.unwrap();
}

#[tokio::test]
async fn dropped_connection_is_a_transport_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.sock");
    let listener = tokio::net::UnixListener::bind(&path).unwrap();
    tokio::spawn(async move {
        let (conn, _) = listener.accept().await.unwrap();
        drop(conn);
    });

    let client = Client::connect(Endpoint::Unix(path)).await.unwrap();
    let err = client.version().await.unwrap_err();
    assert!(err.is_transport(), "{err:?}");
}

#[tokio::test]
async fn stdout_only_io_uses_and_releases_one_socket() {
    let h = harness().await;
    let (sink, mut host_end) = tokio::io::duplex(64);
    let remote = h
        .client
        .open_io(HostStdio::new().stdout(sink))
        .await
        .unwrap();
    assert_eq!(remote.sockets().len(), 1);
    assert_eq!(h.registry.socket_count(), 1);

    let bundle = h.registry.io(remote.io_ref()).unwrap();
    let child = bundle.take_child_stdio().await.unwrap();
    assert!(child.stdin.is_none() && child.stderr.is_none());
    let mut stdout = std::fs::File::from(child.stdout.unwrap());
    std::io::Write::write_all(&mut stdout, b"hello from the guest").unwrap();
    drop(stdout);

    let mut got = Vec::new();
    host_end.read_to_end(&mut got).await.unwrap();
    assert_eq!(got, b"hello from the guest");

    remote.close(&h.client).await.unwrap();
    assert_eq!(h.registry.socket_count(), 0);
    assert_eq!(h.registry.io_count(), 0);
}

#[tokio::test]
async fn failed_socket_batch_leaves_registry_empty() {
    let h = harness().await;
    std::fs::create_dir_all(h.sockets_dir.join("sock-1.sock")).unwrap();
    let err = h.client.allocate_sockets(3).await.unwrap_err();
    assert!(err.is_domain(), "{err:?}");
    assert_eq!(h.registry.socket_count(), 0);
}

#[tokio::test]
async fn unknown_references_are_domain_errors() {
    let h = harness().await;
    let err = h.client.close_io(&ReferenceId::Io(7)).await.unwrap_err();
    assert!(err.is_domain(), "{err:?}");
    assert!(err.to_string().contains("io:7"), "{err}");
}

#[tokio::test]
async fn events_stream_until_the_source_ends() {
    let h = harness().await;
    h.client.create(CreateReq::new("web", "/bundle")).await.unwrap();
    let mut events = h
        .client
        .events("web", Duration::from_secs(5))
        .await
        .unwrap();
    let kinds: Vec<_> = [
        events.recv().await.unwrap().unwrap(),
        events.recv().await.unwrap().unwrap(),
    ]
    .into_iter()
    .map(|e| e.kind)
    .collect();
    assert_eq!(kinds, ["stats", "oom"]);
    assert!(events.recv().await.is_none());

    let err = h
        .client
        .events("missing", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(err.is_domain(), "{err:?}");
}

#[tokio::test]
async fn panicking_event_source_is_a_domain_error() {
    let h = harness().await;
    let err = h
        .client
        .events("boom", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(err.is_domain(), "{err:?}");
    let message = err.to_string();
    assert!(message.contains("panic in Events"), "{message}");
    assert!(message.contains("event source exploded"), "{message}");
    h.client.ping().await.unwrap();
}

#[tokio::test]
async fn oversized_socket_batch_is_refused() {
    let h = harness().await;
    let err = h
        .client
        .allocate_sockets(u32::MAX as usize)
        .await
        .unwrap_err();
    assert!(err.is_domain(), "{err:?}");
    assert!(err.to_string().contains(&format!("at most {MAX_BATCH}")), "{err}");
    assert_eq!(h.registry.socket_count(), 0);
    h.client.ping().await.unwrap();
}

#[tokio::test]
async fn abandoned_call_does_not_leak_its_reply() {
    let h = harness().await;
    h.client.create(CreateReq::new("web", "/bundle")).await.unwrap();
    let sockets = h.client.allocate_sockets(1).await.unwrap();
    let io = h
        .client
        .allocate_io(Streams {
            stdout: true,
            ..Streams::default()
        })
        .await
        .unwrap();

    // Nobody dials the socket, so the guest keeps waiting for its peer.
    let bind = tokio::time::timeout(
        Duration::from_millis(200),
        h.client.bind_io_to_sockets(
            &io,
            StdioSockets {
                stdout: Some(sockets[0].clone()),
                ..StdioSockets::default()
            },
        ),
    )
    .await;
    assert!(bind.is_err());

    let version = h.client.version().await.unwrap();
    assert_eq!(version.runtime, "fake");
    assert_eq!(h.client.ps("web").await.unwrap(), [1, 42]);
}

#[tokio::test]
async fn create_fails_in_transit_when_the_agent_drops_mid_call() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.sock");
    let listener = tokio::net::UnixListener::bind(&path).unwrap();
    tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let req: Request = tether_proto::recv(&mut conn).await.unwrap();
        assert_eq!(req.name(), "Create");
        drop(conn);
    });

    let client = Client::connect(Endpoint::Unix(path)).await.unwrap();
    let err = client
        .create(CreateReq::new("web", "/bundle"))
        .await
        .unwrap_err();
    assert!(err.is_transport(), "{err:?}");
}

/// A PTY whose slave does not echo, so bytes cross each terminal once.
fn quiet_pty() -> OpenptyResult {
    let pty = openpty(None::<&Winsize>, None::<&Termios>).unwrap();
    let mut termios = tcgetattr(&pty.slave).unwrap();
    termios.local_flags.remove(LocalFlags::ECHO);
    tcsetattr(&pty.slave, SetArg::TCSANOW, &termios).unwrap();
    pty
}

/// Plays the runtime: connects to the console socket and hands over `master`.
async fn hand_over_master(h: &Harness, console: &ReferenceId, master: &OwnedFd) {
    let path = h.registry.console(console).unwrap().path().to_path_buf();
    let runtime = UnixStream::connect(path).await.unwrap();
    tether::send_fd(&runtime, master.as_fd()).await.unwrap();
}

async fn read_terminal(slave: &OwnedFd, needle: &'static [u8]) -> Vec<u8> {
    let mut file = File::from(slave.try_clone().unwrap());
    let reader = tokio::task::spawn_blocking(move || {
        let mut seen = Vec::new();
        let mut buf = [0u8; 256];
        while !seen.windows(needle.len()).any(|w| w == needle) {
            let n = file.read(&mut buf).unwrap();
            seen.extend_from_slice(&buf[..n]);
        }
        seen
    });
    tokio::time::timeout(Duration::from_secs(5), reader)
        .await
        .expect("terminal never saw the bytes")
        .unwrap()
}

fn write_terminal(slave: &OwnedFd, data: &[u8]) {
    File::from(slave.try_clone().unwrap()).write_all(data).unwrap();
}

async fn read_frames<S>(conn: &mut S, needle: &[u8])
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !seen.windows(needle.len()).any(|w| w == needle) {
            match tether_proto::recv::<ConsoleFrame>(conn).await.unwrap() {
                ConsoleFrame::Data(data) => seen.extend(data),
                ConsoleFrame::Control(_) => {}
            }
        }
    })
    .await
    .expect("console stream never carried the bytes");
}

async fn wait_for_state(console: &ConsoleSocket, want: ConsoleState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while console.state() != want {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("console never reached {want:?}"));
}

#[tokio::test]
async fn console_stream_carries_the_terminal() {
    let h = harness().await;
    let console = h.client.allocate_console().await.unwrap();
    let guest = quiet_pty();
    hand_over_master(&h, &console, &guest.master).await;

    let mut conn = h.client.attach_console(&console).await.unwrap();
    let entry = h.registry.console(&console).unwrap();
    wait_for_state(&entry, ConsoleState::Streaming).await;

    tether_proto::send(&mut conn, &ConsoleFrame::Data(b"typed\n".to_vec()))
        .await
        .unwrap();
    read_terminal(&guest.slave, b"typed").await;

    write_terminal(&guest.slave, b"printed\n");
    read_frames(&mut conn, b"printed").await;

    tether_proto::send(&mut conn, &ConsoleFrame::Control(Control::Exit { code: 0 }))
        .await
        .unwrap();
    wait_for_state(&entry, ConsoleState::Closed).await;
    h.client.close_console(&console).await.unwrap();

    let err = h
        .client
        .attach_console(&ReferenceId::Console(99))
        .await
        .unwrap_err();
    assert!(err.is_domain(), "{err:?}");
}

#[tokio::test]
async fn local_terminal_is_proxied_to_the_guest_console() {
    let h = harness().await;
    let console = h.client.allocate_console().await.unwrap();
    let guest = quiet_pty();
    hand_over_master(&h, &console, &guest.master).await;

    let local = quiet_pty();
    let proxy = h
        .client
        .proxy_console(
            &console,
            Pty::from_master(local.master.try_clone().unwrap()).unwrap(),
            ProxyOptions::default(),
        )
        .await
        .unwrap();

    write_terminal(&local.slave, b"typed\n");
    read_terminal(&guest.slave, b"typed").await;

    write_terminal(&guest.slave, b"printed\n");
    read_terminal(&local.slave, b"printed").await;

    proxy.close().await;
    h.client.close_console(&console).await.unwrap();
}

#[tokio::test]
async fn console_tunnel_stops_when_its_socket_closes() {
    let h = harness().await;
    let console = h.client.allocate_console().await.unwrap();
    let guest = quiet_pty();
    hand_over_master(&h, &console, &guest.master).await;

    let sockets = h.client.allocate_sockets(1).await.unwrap();
    let mut conn = h.client.dial(&sockets[0]).await.unwrap();
    h.client
        .bind_console_to_socket(&console, &sockets[0])
        .await
        .unwrap();
    let entry = h.registry.console(&console).unwrap();
    assert_eq!(entry.state(), ConsoleState::Streaming);

    tether_proto::send(&mut conn, &ConsoleFrame::Data(b"typed\n".to_vec()))
        .await
        .unwrap();
    read_terminal(&guest.slave, b"typed").await;

    h.client.close_sockets(&sockets).await.unwrap();
    assert_eq!(h.registry.socket_count(), 0);
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match tether_proto::recv_opt::<ConsoleFrame>(&mut conn).await {
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
    })
    .await
    .expect("tunnel outlived its socket");
    wait_for_state(&entry, ConsoleState::Closed).await;
    h.client.close_console(&console).await.unwrap();
}
