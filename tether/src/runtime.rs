//! The container runtime surface and its resource-lifecycle extension.
//!
//! [`Runtime`] mirrors a runc-style CLI. [`RuntimeExtras`] covers the
//! resources that cannot cross the transport as handles: they are allocated
//! on the side that owns them and named by [`ReferenceId`] everywhere else.
//! Both traits are implemented by the local runc wrapper and by the RPC
//! client, so callers do not care which side of the boundary they are on.

use std::future::Future;
use std::time::Duration;

use tether_proto::{
    CheckpointReq, Container, CreateReq, Event, ExecReq, RestoreReq, Stats, TopResults, Version,
};
use tokio::sync::mpsc;

use crate::io::{StdioSockets, Streams};
use crate::reference::ReferenceId;
use crate::{Error, Result};

/// Stream of container events; closed when the source ends.
pub type EventStream = mpsc::Receiver<Result<Event>>;

/// Container lifecycle operations.
pub trait Runtime: Send + Sync {
    /// Creates a container. IO and console arrive as references.
    fn create(&self, req: CreateReq) -> impl Future<Output = Result<()>> + Send;

    /// Starts a created container.
    fn start(&self, id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Runs an additional process. Returns its exit status unless detached.
    fn exec(&self, req: ExecReq) -> impl Future<Output = Result<Option<i32>>> + Send;

    /// Signals the init process, or every process when `all` is set.
    fn kill(&self, id: &str, signal: i32, all: bool) -> impl Future<Output = Result<()>> + Send;

    /// Freezes a container.
    fn pause(&self, id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Thaws a paused container.
    fn resume(&self, id: &str) -> impl Future<Output = Result<()>> + Send;

    /// PIDs inside a container.
    fn ps(&self, id: &str) -> impl Future<Output = Result<Vec<i32>>> + Send;

    /// Deletes a container.
    fn delete(&self, id: &str, force: bool) -> impl Future<Output = Result<()>> + Send;

    /// Applies new resource limits (OCI `LinuxResources` JSON).
    fn update(&self, id: &str, resources: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Checkpoints a container.
    fn checkpoint(&self, req: CheckpointReq) -> impl Future<Output = Result<()>> + Send;

    /// Restores a container. Returns the init exit status.
    fn restore(&self, req: RestoreReq) -> impl Future<Output = Result<i32>> + Send;

    /// State of one container.
    fn state(&self, id: &str) -> impl Future<Output = Result<Container>> + Send;

    /// Every known container.
    fn list(&self) -> impl Future<Output = Result<Vec<Container>>> + Send;

    /// One resource-usage sample.
    fn stats(&self, id: &str) -> impl Future<Output = Result<Stats>> + Send;

    /// `ps` output for a container's processes.
    fn top(&self, id: &str, ps_options: &[String]) -> impl Future<Output = Result<TopResults>> + Send;

    /// Runtime version.
    fn version(&self) -> impl Future<Output = Result<Version>> + Send;

    /// Streams events, sampling stats every `interval`.
    fn events(&self, id: &str, interval: Duration) -> impl Future<Output = Result<EventStream>> + Send;
}

/// Allocation, binding and teardown of cross-boundary resources.
pub trait RuntimeExtras: Send + Sync {
    /// Allocates `count` sockets. References come back in allocation order;
    /// a failed batch leaves nothing allocated.
    fn allocate_sockets(&self, count: usize) -> impl Future<Output = Result<Vec<ReferenceId>>> + Send;

    /// Allocates one socket.
    fn allocate_socket(&self) -> impl Future<Output = Result<ReferenceId>> + Send {
        async move {
            self.allocate_sockets(1)
                .await?
                .pop()
                .ok_or_else(|| Error::Protocol("no socket was allocated".to_owned()))
        }
    }

    /// Allocates pipes for the requested streams.
    fn allocate_io(&self, streams: Streams) -> impl Future<Output = Result<ReferenceId>> + Send;

    /// Allocates a console socket.
    fn allocate_console(&self) -> impl Future<Output = Result<ReferenceId>> + Send;

    /// Forwards an IO bundle's pipes through sockets, positionally.
    fn bind_io_to_sockets(
        &self,
        io: &ReferenceId,
        sockets: StdioSockets,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Tunnels a console's PTY through a socket.
    fn bind_console_to_socket(
        &self,
        console: &ReferenceId,
        socket: &ReferenceId,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Closes and unregisters sockets.
    fn close_sockets(&self, ids: &[ReferenceId]) -> impl Future<Output = Result<()>> + Send;

    /// Closes and unregisters one socket.
    fn close_socket(&self, id: &ReferenceId) -> impl Future<Output = Result<()>> + Send {
        self.close_sockets(std::slice::from_ref(id))
    }

    /// Closes and unregisters an IO bundle and every socket bound to it.
    fn close_io(&self, id: &ReferenceId) -> impl Future<Output = Result<()>> + Send;

    /// Closes and unregisters a console.
    fn close_console(&self, id: &ReferenceId) -> impl Future<Output = Result<()>> + Send;
}
