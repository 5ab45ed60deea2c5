//! Agent configuration, read from a JSON file.
//!
//! Every field has a default, so an empty object (`{}`) is a valid file:
//!
//! ```json
//! {
//!   "listen": { "transport": "vsock", "port": 1024 },
//!   "sockets": { "transport": "unix", "dir": "/run/tether/sockets" },
//!   "console_dir": "/run/tether/consoles",
//!   "runc": { "binary": "runc", "root": "/run/tether/runc", "systemd_cgroup": false }
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::socket::Transport;
use crate::Result;

/// Guest agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Where the RPC service listens.
    pub listen: ListenConfig,
    /// Where allocated sockets are bound.
    pub sockets: SocketConfig,
    /// Parent directory for console socket directories.
    pub console_dir: PathBuf,
    /// runc invocation.
    pub runc: RuncConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            sockets: SocketConfig::default(),
            console_dir: PathBuf::from("/run/tether/consoles"),
            runc: RuncConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Reads a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// RPC listening endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum ListenConfig {
    /// vsock port on any CID.
    Vsock {
        /// Port number.
        port: u32,
    },
    /// Filesystem-path Unix socket.
    Unix {
        /// Socket path.
        path: PathBuf,
    },
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self::Vsock {
            port: tether_proto::AGENT_PORT,
        }
    }
}

/// Transport for allocated sockets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum SocketConfig {
    /// Kernel-assigned vsock ports.
    #[default]
    Vsock,
    /// Unix sockets under `dir`.
    Unix {
        /// Directory for `sock-<n>.sock` files.
        dir: PathBuf,
    },
}

impl SocketConfig {
    /// The allocator transport this configuration selects.
    pub fn transport(&self) -> Result<Transport> {
        match self {
            Self::Unix { dir } => Ok(Transport::Unix { dir: dir.clone() }),
            #[cfg(target_os = "linux")]
            Self::Vsock => Ok(Transport::Vsock),
            #[cfg(not(target_os = "linux"))]
            Self::Vsock => Err(crate::Error::NotImplemented("vsock sockets on this platform")),
        }
    }
}

/// How runc is invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuncConfig {
    /// runc binary, resolved through `PATH` when relative.
    pub binary: PathBuf,
    /// State directory (`--root`).
    pub root: PathBuf,
    /// runc log file (`--log`, JSON formatted).
    pub log: Option<PathBuf>,
    /// Use the systemd cgroup driver (`--systemd-cgroup`).
    pub systemd_cgroup: bool,
}

impl Default for RuncConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("runc"),
            root: PathBuf::from("/run/tether/runc"),
            log: None,
            systemd_cgroup: false,
        }
    }
}
