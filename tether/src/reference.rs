//! Opaque reference IDs naming registry-held resources.
//!
//! The string forms are part of the wire contract and are parsed back by the
//! registry, so the transport and address of a socket never need a side
//! table:
//!
//! ```text
//! socket:vsock:<decimal-port>
//! socket:unix:<absolute-path>
//! console:<decimal-counter>
//! io:<decimal-counter>
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::{Error, Result};

/// Address of an allocated socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SocketAddr {
    /// A vsock port on the guest.
    Vsock(u32),
    /// A filesystem-path Unix socket.
    Unix(PathBuf),
}

/// Reference to a resource held by a [`Registry`](crate::Registry).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ReferenceId {
    /// An allocated socket, named by its address.
    Socket(SocketAddr),
    /// A console socket.
    Console(u64),
    /// A pipe IO bundle.
    Io(u64),
}

impl ReferenceId {
    /// Kind label used in errors and logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Socket(_) => "socket",
            Self::Console(_) => "console",
            Self::Io(_) => "io",
        }
    }
}

impl From<SocketAddr> for ReferenceId {
    fn from(addr: SocketAddr) -> Self {
        Self::Socket(addr)
    }
}

impl fmt::Display for SocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vsock(port) => write!(f, "vsock:{port}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(addr) => write!(f, "socket:{addr}"),
            Self::Console(n) => write!(f, "console:{n}"),
            Self::Io(n) => write!(f, "io:{n}"),
        }
    }
}

impl FromStr for ReferenceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidReference(s.to_owned());
        let (kind, rest) = s.split_once(':').ok_or_else(invalid)?;
        match kind {
            "socket" => match rest.split_once(':').ok_or_else(invalid)? {
                ("vsock", port) => Ok(Self::Socket(SocketAddr::Vsock(
                    parse_decimal(port).ok_or_else(invalid)?,
                ))),
                ("unix", path) if path.starts_with('/') => {
                    Ok(Self::Socket(SocketAddr::Unix(PathBuf::from(path))))
                }
                _ => Err(invalid()),
            },
            "console" => parse_decimal(rest).map(Self::Console).ok_or_else(invalid),
            "io" => parse_decimal(rest).map(Self::Io).ok_or_else(invalid),
            _ => Err(invalid()),
        }
    }
}

/// Parses a plain decimal number: no sign, no whitespace, no leading `+`.
fn parse_decimal<T: FromStr>(s: &str) -> Option<T> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
