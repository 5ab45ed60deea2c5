//! Wire protocol for tether host↔guest runtime calls.
//!
//! Messages are postcard-encoded and framed by [`codec`]. A connection
//! normally carries alternating [`Request`]/[`Response`] frames; the
//! [`Request::Events`] and [`Request::ConsoleStream`] calls switch it into a
//! stream of [`Payload::Event`] responses or [`ConsoleFrame`]s respectively.

#![allow(clippy::exhaustive_enums, clippy::exhaustive_structs)]

mod codec;
mod message;

pub use codec::{MAX_FRAME, encode, recv, recv_opt, send};
pub use message::*;
