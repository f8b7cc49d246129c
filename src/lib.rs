//! Client-side TCP virtual circuit for the Channel Access protocol.
//!
//! A [`Circuit`] is the long-lived, ordered byte pipe between one
//! client and one server, multiplexing many named channels: claims and
//! releases, typed reads and writes with optional completion
//! notification, value subscriptions, and liveness probes. Two
//! background tasks per circuit — a send engine and a receive engine —
//! share the circuit state; user code stages whole messages through
//! the request vocabulary on [`Circuit`] and receives parsed responses
//! through its [`ClientContext`].
//!
//! Name search, the channel registry, and per-operation callback
//! dispatch live above this crate and talk to it through the
//! [`ClientContext`] seam.

mod buffer;
mod channel;
mod circuit;
mod client;
mod error;
mod flags;
mod header;
mod proto;
mod queue;
mod state;
mod watchdog;

pub use buffer::FrameBuf;
pub use channel::ChannelBinding;
pub use circuit::{Circuit, CircuitConfig};
pub use client::{CallbackGuard, ClientContext};
pub use error::CircuitError;
pub use header::MsgHeader;
pub use proto::{
    align8, string_from_padded, Command, FieldType, ProtocolVersion, CONTIG_FRAME_YIELD,
    EXTENSION_BYTES, FLOW_CONTROL_TRIGGER_FRAMES, FLUSH_BLOCK_WAIT, HEADER_BYTES,
    MAJOR_PROTOCOL_REVISION, MAX_TCP_FRAME, MINOR_PROTOCOL_REVISION, PAYLOAD_SIZE_SENTINEL,
};
pub use queue::{RecvQueue, SendMsgMinder, SendQueue, EARLY_FLUSH_BYTES, FLUSH_BLOCK_BYTES};
pub use state::CircuitState;
pub use watchdog::{ReceiveWatchdog, RecvExpiry, SendWatchdog, Watchdog};
