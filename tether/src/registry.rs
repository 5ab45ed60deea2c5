//! Process-wide table of live resources, keyed by [`ReferenceId`].
//!
//! The registry owns every stored resource. Everyone else holds only the
//! reference ID and looks the resource up for the duration of a call.
//! Nothing expires: an entry lives until it is removed explicitly, and the
//! caller that removes it is responsible for closing it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::console::ConsoleSocket;
use crate::io::IoBundle;
use crate::reference::ReferenceId;
use crate::socket::AllocatedSocket;
use crate::{Error, Result};

/// One independently locked table.
#[derive(Debug)]
struct Table<T> {
    entries: Mutex<HashMap<ReferenceId, Arc<T>>>,
}

impl<T> Table<T> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ReferenceId, Arc<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, id: ReferenceId, value: T) {
        self.lock().insert(id, Arc::new(value));
    }

    fn get(&self, id: &ReferenceId) -> Result<Arc<T>> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownReference(id.to_string()))
    }

    fn remove(&self, id: &ReferenceId) -> Option<Arc<T>> {
        self.lock().remove(id)
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Registry of sockets, IO bundles and consoles.
///
/// Construct one per agent and share it by `Arc`; the three tables are
/// locked independently.
#[derive(Debug)]
pub struct Registry {
    sockets: Table<AllocatedSocket>,
    io: Table<IoBundle>,
    consoles: Table<ConsoleSocket>,
    next_io: AtomicU64,
    next_console: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Creates an empty registry with fresh counters.
    pub fn new() -> Self {
        Self {
            sockets: Table::new(),
            io: Table::new(),
            consoles: Table::new(),
            next_io: AtomicU64::new(1),
            next_console: AtomicU64::new(1),
        }
    }

    /// Stores a socket under the reference derived from its address.
    pub fn insert_socket(&self, socket: AllocatedSocket) -> ReferenceId {
        let id = socket.reference();
        self.sockets.insert(id.clone(), socket);
        id
    }

    /// Stores an IO bundle under a fresh `io:<n>` reference.
    pub fn insert_io(&self, bundle: IoBundle) -> ReferenceId {
        let id = ReferenceId::Io(self.next_io.fetch_add(1, Ordering::Relaxed));
        self.io.insert(id.clone(), bundle);
        id
    }

    /// Stores a console under a fresh `console:<n>` reference.
    pub fn insert_console(&self, console: ConsoleSocket) -> ReferenceId {
        let id = ReferenceId::Console(self.next_console.fetch_add(1, Ordering::Relaxed));
        self.consoles.insert(id.clone(), console);
        id
    }

    /// Looks up a live socket.
    pub fn socket(&self, id: &ReferenceId) -> Result<Arc<AllocatedSocket>> {
        expect_kind(id, "socket")?;
        self.sockets.get(id)
    }

    /// Looks up a live IO bundle.
    pub fn io(&self, id: &ReferenceId) -> Result<Arc<IoBundle>> {
        expect_kind(id, "io")?;
        self.io.get(id)
    }

    /// Looks up a live console.
    pub fn console(&self, id: &ReferenceId) -> Result<Arc<ConsoleSocket>> {
        expect_kind(id, "console")?;
        self.consoles.get(id)
    }

    /// Unregisters a socket without closing it.
    pub fn remove_socket(&self, id: &ReferenceId) -> Option<Arc<AllocatedSocket>> {
        self.sockets.remove(id)
    }

    /// Unregisters an IO bundle without closing it.
    pub fn remove_io(&self, id: &ReferenceId) -> Option<Arc<IoBundle>> {
        self.io.remove(id)
    }

    /// Unregisters a console without closing it.
    pub fn remove_console(&self, id: &ReferenceId) -> Option<Arc<ConsoleSocket>> {
        self.consoles.remove(id)
    }

    /// Number of registered sockets.
    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Number of registered IO bundles.
    pub fn io_count(&self) -> usize {
        self.io.len()
    }

    /// Number of registered consoles.
    pub fn console_count(&self) -> usize {
        self.consoles.len()
    }
}

fn expect_kind(id: &ReferenceId, kind: &'static str) -> Result<()> {
    if id.kind() == kind {
        Ok(())
    } else {
        Err(Error::UnknownReference(format!("{id} is not a {kind} reference")))
    }
}
