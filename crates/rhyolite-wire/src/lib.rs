//! # rhyolite-wire: Binary wire protocol for `Rhyolite` replication
//!
//! Typed messages exchanged on the master→replica stream, their postcard
//! encoding, and the length-prefixed framing used to carry them over a byte
//! channel.
//!
//! # Frame Layout
//!
//! ```text
//! ┌────────────────┬──────────────────────────┐
//! │ length (u32 BE)│ postcard-encoded Message │
//! └────────────────┴──────────────────────────┘
//! ```
//!
//! The length covers only the encoded message, not the header itself.
//! Frames larger than [`MAX_FRAME_SIZE`] are rejected on both sides.

mod error;
mod frame;
mod message;
mod version;

pub use error::{WireError, WireResult};
pub use frame::{FRAME_HEADER_SIZE, MAX_FRAME_SIZE, decode_message, encode_message};
pub use message::{
    Entry, HandshakeOutcome, HandshakeRejection, Heartbeat, Message, SyncupVerdict,
};
pub use version::{PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN, negotiate_version};
