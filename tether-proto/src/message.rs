//! Protocol message types for host↔guest runtime calls.
//!
//! Resources that cannot cross the transport (pipes, sockets, PTY masters)
//! are never carried here. They are named by reference ID strings such as
//! `socket:vsock:2049`, `io:3` or `console:1`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default vsock port for the tether guest agent.
pub const AGENT_PORT: u32 = 1024;

/// Request sent from host to guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Health-check ping.
    Ping,
    /// Report the runtime version.
    Version,
    /// Create a container from an OCI bundle.
    Create(CreateReq),
    /// Start a created container.
    Start {
        /// Container ID.
        id: String,
    },
    /// Execute an additional process inside a running container.
    Exec(ExecReq),
    /// Send a signal to a container's init (or all) processes.
    Kill {
        /// Container ID.
        id: String,
        /// Signal number (e.g. `libc::SIGTERM`).
        signal: i32,
        /// Signal every process in the container.
        all: bool,
    },
    /// Freeze all processes of a container.
    Pause {
        /// Container ID.
        id: String,
    },
    /// Thaw a paused container.
    Resume {
        /// Container ID.
        id: String,
    },
    /// List the PIDs running inside a container.
    Ps {
        /// Container ID.
        id: String,
    },
    /// Delete a container.
    Delete {
        /// Container ID.
        id: String,
        /// Kill the container first if it is still running.
        force: bool,
    },
    /// Update container resource limits.
    Update {
        /// Container ID.
        id: String,
        /// OCI `LinuxResources` as JSON.
        resources: Vec<u8>,
    },
    /// Checkpoint a running container.
    Checkpoint(CheckpointReq),
    /// Restore a container from a checkpoint.
    Restore(RestoreReq),
    /// Query a single container's state.
    State {
        /// Container ID.
        id: String,
    },
    /// List all containers.
    List,
    /// Take a single resource-usage sample.
    Stats {
        /// Container ID.
        id: String,
    },
    /// Run `ps` against a container's processes.
    Top {
        /// Container ID.
        id: String,
        /// Extra `ps` arguments (e.g. `-ef`).
        ps_options: Vec<String>,
    },
    /// Turn this connection into a stream of [`Payload::Event`] responses.
    Events {
        /// Container ID.
        id: String,
        /// Stats sampling interval in milliseconds.
        interval_ms: u64,
    },
    /// Allocate `count` transport sockets; replies with their references.
    AllocateSockets {
        /// Number of sockets to allocate.
        count: u32,
    },
    /// Allocate a pipe IO bundle for a future process.
    AllocateIo {
        /// Open a stdin pipe.
        stdin: bool,
        /// Open a stdout pipe.
        stdout: bool,
        /// Open a stderr pipe.
        stderr: bool,
    },
    /// Allocate a console socket for a future process.
    AllocateConsole,
    /// Bind an IO bundle's pipes to previously allocated sockets.
    BindIoToSockets {
        /// IO reference.
        io: String,
        /// Socket reference for stdin.
        stdin: Option<String>,
        /// Socket reference for stdout.
        stdout: Option<String>,
        /// Socket reference for stderr.
        stderr: Option<String>,
    },
    /// Tunnel a console's PTY bytes through a previously allocated socket.
    BindConsoleToSocket {
        /// Console reference.
        console: String,
        /// Socket reference.
        socket: String,
    },
    /// Close and unregister sockets.
    CloseSockets {
        /// Socket references.
        ids: Vec<String>,
    },
    /// Close and unregister an IO bundle, including its bound sockets.
    CloseIo {
        /// IO reference.
        id: String,
    },
    /// Close and unregister a console.
    CloseConsole {
        /// Console reference.
        id: String,
    },
    /// Turn this connection into a bidirectional [`ConsoleFrame`] stream.
    ConsoleStream {
        /// Console reference.
        console: String,
    },
    /// Request graceful shutdown of the guest agent.
    Shutdown,
}

impl Request {
    /// Operation name, used in logs and recovered-panic errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Ping => "Ping",
            Self::Version => "Version",
            Self::Create(_) => "Create",
            Self::Start { .. } => "Start",
            Self::Exec(_) => "Exec",
            Self::Kill { .. } => "Kill",
            Self::Pause { .. } => "Pause",
            Self::Resume { .. } => "Resume",
            Self::Ps { .. } => "Ps",
            Self::Delete { .. } => "Delete",
            Self::Update { .. } => "Update",
            Self::Checkpoint(_) => "Checkpoint",
            Self::Restore(_) => "Restore",
            Self::State { .. } => "State",
            Self::List => "List",
            Self::Stats { .. } => "Stats",
            Self::Top { .. } => "Top",
            Self::Events { .. } => "Events",
            Self::AllocateSockets { .. } => "AllocateSockets",
            Self::AllocateIo { .. } => "AllocateIo",
            Self::AllocateConsole => "AllocateConsole",
            Self::BindIoToSockets { .. } => "BindIoToSockets",
            Self::BindConsoleToSocket { .. } => "BindConsoleToSocket",
            Self::CloseSockets { .. } => "CloseSockets",
            Self::CloseIo { .. } => "CloseIo",
            Self::CloseConsole { .. } => "CloseConsole",
            Self::ConsoleStream { .. } => "ConsoleStream",
            Self::Shutdown => "Shutdown",
        }
    }
}

/// Container creation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CreateReq {
    /// Container ID.
    pub id: String,
    /// Path to the OCI bundle inside the guest.
    pub bundle: String,
    /// IO reference (`io:<n>`) whose pipes become the init process's stdio.
    pub io: Option<String>,
    /// Console reference (`console:<n>`) receiving the PTY master.
    pub console_socket: Option<String>,
    /// File to write the init PID to.
    pub pid_file: Option<String>,
    /// Do not use `pivot_root`.
    pub no_pivot: bool,
    /// Do not create a new session keyring.
    pub no_new_keyring: bool,
}

impl CreateReq {
    /// Creates a request for the given container ID and bundle path.
    #[must_use]
    pub fn new(id: impl Into<String>, bundle: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            bundle: bundle.into(),
            ..Self::default()
        }
    }

    /// Attaches an IO bundle reference.
    #[must_use]
    pub fn io(mut self, io: impl Into<String>) -> Self {
        self.io = Some(io.into());
        self
    }

    /// Attaches a console socket reference.
    #[must_use]
    pub fn console_socket(mut self, console: impl Into<String>) -> Self {
        self.console_socket = Some(console.into());
        self
    }

    /// Sets the PID file path.
    #[must_use]
    pub fn pid_file(mut self, path: impl Into<String>) -> Self {
        self.pid_file = Some(path.into());
        self
    }
}

/// Additional process execution request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ExecReq {
    /// Container ID.
    pub id: String,
    /// OCI `Process` spec as JSON.
    pub process: Vec<u8>,
    /// IO reference for the new process.
    pub io: Option<String>,
    /// Console reference for the new process.
    pub console_socket: Option<String>,
    /// File to write the process PID to.
    pub pid_file: Option<String>,
    /// Return as soon as the process has started.
    pub detach: bool,
}

impl ExecReq {
    /// Creates an exec request for a container with a JSON process spec.
    #[must_use]
    pub fn new(id: impl Into<String>, process: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            process: process.into(),
            ..Self::default()
        }
    }

    /// Attaches an IO bundle reference.
    #[must_use]
    pub fn io(mut self, io: impl Into<String>) -> Self {
        self.io = Some(io.into());
        self
    }

    /// Attaches a console socket reference.
    #[must_use]
    pub fn console_socket(mut self, console: impl Into<String>) -> Self {
        self.console_socket = Some(console.into());
        self
    }

    /// Returns once the process has started instead of waiting for it.
    #[must_use]
    pub const fn detach(mut self, detach: bool) -> Self {
        self.detach = detach;
        self
    }
}

/// Checkpoint request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CheckpointReq {
    /// Container ID.
    pub id: String,
    /// Directory for the checkpoint image.
    pub image_path: String,
    /// Directory for CRIU work files.
    pub work_path: Option<String>,
    /// Keep the container running after checkpointing.
    pub leave_running: bool,
    /// Allow open TCP connections.
    pub tcp_established: bool,
    /// Allow external unix sockets.
    pub ext_unix_sk: bool,
    /// Allow shell jobs.
    pub shell_job: bool,
    /// Handle file locks.
    pub file_locks: bool,
}

/// Restore request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct RestoreReq {
    /// Container ID.
    pub id: String,
    /// Path to the OCI bundle.
    pub bundle: String,
    /// Directory holding the checkpoint image.
    pub image_path: String,
    /// IO reference for the restored init process.
    pub io: Option<String>,
    /// Console reference for the restored init process.
    pub console_socket: Option<String>,
    /// Return as soon as the container is restored.
    pub detach: bool,
}

/// Response sent from guest to host.
///
/// `error` carries a domain failure reported by the runtime. It is set on an
/// otherwise well-formed reply, so a failed call still leaves the transport
/// usable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Response {
    /// Domain error, if the operation failed.
    pub error: Option<String>,
    /// Operation result; [`Payload::Empty`] on failure.
    pub payload: Payload,
}

impl Response {
    /// A successful response carrying `payload`.
    #[must_use]
    pub const fn ok(payload: Payload) -> Self {
        Self {
            error: None,
            payload,
        }
    }

    /// A failed response carrying a domain error message.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            payload: Payload::Empty,
        }
    }
}

/// Result body of a [`Response`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    /// No result value.
    Empty,
    /// Reply to [`Request::Ping`].
    Pong,
    /// Runtime version.
    Version(Version),
    /// Process exit status (exec without detach, restore).
    Exit(i32),
    /// PIDs of a container.
    Pids(Vec<i32>),
    /// A single container.
    Container(Container),
    /// Several containers.
    Containers(Vec<Container>),
    /// A resource-usage sample.
    Stats(Stats),
    /// `ps` output.
    Top(TopResults),
    /// One item of an event stream.
    Event(Event),
    /// End of an event stream.
    End,
    /// Newly allocated socket references, in allocation order.
    Sockets(Vec<String>),
    /// A newly allocated IO reference.
    Io(String),
    /// A newly allocated console reference.
    Console(String),
}

/// Runtime version triple.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// Runtime version string.
    pub runtime: String,
    /// Source commit.
    pub commit: String,
    /// Supported OCI spec version.
    pub spec: String,
}

/// A container as reported by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Container ID.
    pub id: String,
    /// Init process PID (`0` when not running).
    pub pid: i32,
    /// Status (`created`, `running`, `paused`, `stopped`).
    pub status: String,
    /// Bundle path.
    pub bundle: String,
    /// Root filesystem path.
    pub rootfs: String,
    /// Creation time in RFC 3339.
    pub created: String,
    /// OCI annotations.
    pub annotations: BTreeMap<String, String>,
}

/// A resource-usage sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    /// CPU accounting.
    pub cpu: Cpu,
    /// Memory accounting.
    pub memory: Memory,
    /// PID accounting.
    pub pids: Pids,
    /// Block IO accounting.
    pub blkio: Blkio,
    /// Hugetlb accounting keyed by page size (e.g. `2MB`).
    pub hugetlb: BTreeMap<String, Hugetlb>,
    /// Per-interface network counters.
    pub network_interfaces: Vec<NetworkInterface>,
}

/// CPU accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cpu {
    /// Total CPU time in nanoseconds.
    pub total: u64,
    /// Per-CPU time in nanoseconds.
    pub percpu: Vec<u64>,
    /// Kernel-mode time in nanoseconds.
    pub kernel: u64,
    /// User-mode time in nanoseconds.
    pub user: u64,
    /// CFS periods elapsed.
    pub throttling_periods: u64,
    /// CFS periods throttled.
    pub throttled_periods: u64,
    /// Total throttled time in nanoseconds.
    pub throttled_time: u64,
}

/// A memory counter group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryEntry {
    /// Configured limit in bytes.
    pub limit: u64,
    /// Current usage in bytes.
    pub usage: u64,
    /// Peak usage in bytes.
    pub max: u64,
    /// Number of times the limit was hit.
    pub failcnt: u64,
}

/// Memory accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    /// Page cache in bytes.
    pub cache: u64,
    /// User memory.
    pub usage: MemoryEntry,
    /// Swap.
    pub swap: MemoryEntry,
    /// Kernel memory.
    pub kernel: MemoryEntry,
    /// Kernel TCP buffers.
    pub kernel_tcp: MemoryEntry,
    /// Raw `memory.stat` values.
    pub raw: BTreeMap<String, u64>,
}

/// PID accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pids {
    /// Current number of processes.
    pub current: u64,
    /// Configured limit (`0` for unlimited).
    pub limit: u64,
}

/// One block IO counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlkioEntry {
    /// Device major number.
    pub major: u64,
    /// Device minor number.
    pub minor: u64,
    /// Operation (`Read`, `Write`, ...).
    pub op: String,
    /// Counter value.
    pub value: u64,
}

/// Block IO accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blkio {
    /// Bytes transferred.
    pub io_service_bytes_recursive: Vec<BlkioEntry>,
    /// Operations issued.
    pub io_serviced_recursive: Vec<BlkioEntry>,
    /// Queued operations.
    pub io_queued_recursive: Vec<BlkioEntry>,
    /// Time spent servicing operations.
    pub io_service_time_recursive: Vec<BlkioEntry>,
    /// Time spent waiting.
    pub io_wait_time_recursive: Vec<BlkioEntry>,
    /// Merged operations.
    pub io_merged_recursive: Vec<BlkioEntry>,
    /// Device time.
    pub io_time_recursive: Vec<BlkioEntry>,
    /// Sectors transferred.
    pub sectors_recursive: Vec<BlkioEntry>,
}

/// Hugetlb accounting for one page size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hugetlb {
    /// Current usage in bytes.
    pub usage: u64,
    /// Peak usage in bytes.
    pub max: u64,
    /// Number of allocation failures.
    pub failcnt: u64,
}

/// Network interface counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkInterface {
    /// Interface name.
    pub name: String,
    /// Bytes received.
    pub rx_bytes: u64,
    /// Packets received.
    pub rx_packets: u64,
    /// Receive errors.
    pub rx_errors: u64,
    /// Dropped inbound packets.
    pub rx_dropped: u64,
    /// Bytes sent.
    pub tx_bytes: u64,
    /// Packets sent.
    pub tx_packets: u64,
    /// Transmit errors.
    pub tx_errors: u64,
    /// Dropped outbound packets.
    pub tx_dropped: u64,
}

/// A container event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event kind (`stats`, `oom`, `intelrdt`, ...).
    pub kind: String,
    /// Container ID.
    pub id: String,
    /// Stats sample, for `stats` events.
    pub stats: Option<Stats>,
}

/// `ps` output split into a header row and process rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopResults {
    /// Column headers.
    pub headers: Vec<String>,
    /// One row per process, aligned with `headers`.
    pub processes: Vec<Vec<String>>,
}

/// One message of a console stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsoleFrame {
    /// Raw PTY bytes.
    Data(Vec<u8>),
    /// Out-of-band control message.
    Control(Control),
}

/// Out-of-band console control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Control {
    /// Terminal window size changed.
    Resize {
        /// Rows.
        rows: u16,
        /// Columns.
        cols: u16,
    },
    /// An environment variable for the console session.
    Env {
        /// Variable name.
        key: String,
        /// Variable value.
        value: String,
    },
    /// The process behind the console exited.
    Exit {
        /// Exit status.
        code: i32,
    },
    /// An error occurred on the sending side.
    Error {
        /// Error description.
        message: String,
    },
}
