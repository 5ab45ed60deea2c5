//! tether guest agent: runs inside a micro-VM next to runc.
//!
//! Serves the tether runtime RPC on the listener named by its configuration
//! (vsock by default). The optional sole argument is a JSON configuration
//! file; without it every setting takes its default.
#![allow(clippy::print_stderr)]

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("tether-guest only runs inside a Linux guest");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
#[tokio::main(flavor = "current_thread")]
async fn main() {
    agent::init_tracing();
    if let Err(e) = agent::run().await {
        tracing::error!(error = %format!("{e:#}"), "fatal");
        std::process::exit(1);
    }
}

#[cfg(target_os = "linux")]
mod agent {
    use std::sync::Arc;

    use anyhow::Context as _;
    use tether::{AgentConfig, Broker, ListenConfig, Listener, Registry, Runc, Service, SocketAllocator};
    use tokio::signal::unix::{SignalKind, signal};
    use tokio_util::sync::CancellationToken;
    use tracing::info;
    use tracing_subscriber::EnvFilter;

    /// Logs to stderr, filtered by `RUST_LOG` (default `info`).
    pub(crate) fn init_tracing() {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_writer(std::io::stderr)
            .init();
    }

    /// Entry point for the guest agent.
    pub(crate) async fn run() -> anyhow::Result<()> {
        let config = match std::env::args_os().nth(1) {
            Some(path) => AgentConfig::load(&path)
                .with_context(|| format!("loading {}", path.to_string_lossy()))?,
            None => AgentConfig::default(),
        };

        let registry = Arc::new(Registry::new());
        let allocator = SocketAllocator::new(config.sockets.transport()?)
            .context("preparing socket directory")?;
        let cancel = CancellationToken::new();
        let broker = Broker::new(
            Arc::clone(&registry),
            allocator,
            &config.console_dir,
            cancel.clone(),
        );
        let runc = Runc::new(config.runc.clone(), Arc::clone(&registry));
        let service = Service::new(Arc::new(runc), Arc::new(broker), registry);

        let listener = match &config.listen {
            ListenConfig::Vsock { port } => {
                info!(port, "listening on vsock");
                Listener::bind_vsock(*port)
            }
            ListenConfig::Unix { path } => {
                info!(path = %path.display(), "listening on unix socket");
                Listener::bind_unix(path)
            }
        }
        .context("binding agent listener")?;

        let shutdown = service.shutdown_token();
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            terminate.recv().await;
            info!("SIGTERM received");
            shutdown.cancel();
        });

        service.serve(listener).await?;
        cancel.cancel();
        info!("agent stopped");
        Ok(())
    }
}
