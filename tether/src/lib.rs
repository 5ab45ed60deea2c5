//! Cross-boundary resource proxying for container runtimes.
//!
//! A container runtime inside a guest VM needs stdio pipes and PTY masters
//! that live on the guest, while the caller lives on the host. tether keeps
//! those resources where they are created and names them by opaque
//! [`ReferenceId`]s; only bytes cross the boundary, over sockets allocated
//! for the purpose.
//!
//! # Architecture
//!
//! ```text
//! host                                   guest
//! Client (Runtime + RuntimeExtras) ──RPC──▶ Service
//!  ├── RemoteIo  ◀── socket:* ──┐            ├── Runc    (Runtime)
//!  └── ConsoleProxy ◀─ stream ─┐│            └── Broker  (RuntimeExtras)
//!                              ││                 └── Registry
//!                              │└──────────────────── io:*      (PipeIo + Forwarder)
//!                              └───────────────────── console:* (ConsoleSocket + ConsoleProxy)
//! ```

#![cfg(unix)]

mod broker;
mod client;
mod config;
mod console;
mod convert;
mod error;
mod io;
mod reference;
mod registry;
mod runc;
mod runtime;
mod server;
mod socket;
mod transfer;

pub use broker::Broker;
pub use client::{Client, Endpoint, HostStdio, RemoteIo};
pub use config::{AgentConfig, ListenConfig, RuncConfig, SocketConfig};
pub use console::{ConsoleProxy, ConsoleSocket, ConsoleState, ProxyOptions, Pty, WindowSize};
pub use error::{Error, Result};
pub use io::{
    COPY_BUFFER, ChildStdio, Forwarder, IoBundle, Link, PipeIo, StdioSockets, StreamLinks, Streams,
};
pub use reference::{ReferenceId, SocketAddr};
pub use registry::Registry;
pub use runc::Runc;
pub use runtime::{EventStream, Runtime, RuntimeExtras};
pub use server::Service;
pub use socket::{
    AllocatedSocket, Connection, Listener, MAX_BATCH, READY_TIMEOUT, SocketAllocator, Transport,
};
pub use transfer::{recv_fd, send_fd};
