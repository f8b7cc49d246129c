//! The upper-layer collaborator interface.
//!
//! The circuit core does not own the channel registry, callback
//! dispatch, or buffer pools — it talks to all of them through
//! [`ClientContext`]. Inbound dispatch is serialized by the callback
//! mutex, which travels as an explicit [`CallbackGuard`] rather than a
//! thread-local.

use std::sync::Arc;

use bytes::BytesMut;

use crate::channel::ChannelBinding;
use crate::circuit::Circuit;
use crate::header::MsgHeader;
use crate::proto::MAX_TCP_FRAME;

/// Proof that the holder owns the callback mutex.
///
/// Constructed only by the receive engine (and teardown paths) while
/// the mutex is held; upper-layer callbacks receive it by reference so
/// dispatch stays serialized across engines.
pub struct CallbackGuard<'a> {
    _guard: tokio::sync::MutexGuard<'a, ()>,
}

impl<'a> CallbackGuard<'a> {
    pub(crate) fn new(guard: tokio::sync::MutexGuard<'a, ()>) -> Self {
        Self { _guard: guard }
    }
}

/// Everything the circuit needs from the layer above it.
pub trait ClientContext: Send + Sync {
    /// User identity advertised at circuit startup (v4.1+).
    fn user_name(&self) -> String;

    /// Host identity advertised at circuit startup (v4.1+).
    fn host_name(&self) -> String;

    /// The circuit is gone. Delivered at most once per circuit; the
    /// upper layer must resubmit in-flight operations elsewhere.
    fn disconnect_notify(&self, circuit: &Circuit);

    /// One channel is being torn off a dying circuit.
    fn disconnect_channel(&self, guard: &CallbackGuard<'_>, chan: &Arc<ChannelBinding>);

    /// Reap the circuit after both engines have joined. The last
    /// strong reference the core holds is handed over here.
    fn destroy_circuit(&self, circuit: Arc<Circuit>);

    /// Dispatch one parsed inbound message. Return `false` when the
    /// message is structurally malformed — the circuit treats that as
    /// protocol corruption and aborts.
    fn execute_response(
        &self,
        guard: &CallbackGuard<'_>,
        circuit: &Arc<Circuit>,
        header: &MsgHeader,
        body: &[u8],
    ) -> bool;

    // ── Payload-cache allocator ──────────────────────────────────

    /// Capacity of a small message body cache.
    fn small_buffer_size(&self) -> usize {
        MAX_TCP_FRAME
    }

    /// Ceiling for a large message body cache. Inbound payloads above
    /// this are discarded stream-aligned.
    fn large_buffer_size(&self) -> usize {
        1024 * 1024
    }

    fn allocate_small_buffer(&self) -> BytesMut {
        BytesMut::with_capacity(self.small_buffer_size())
    }

    fn release_small_buffer(&self, _buf: BytesMut) {}

    /// May fail under memory pressure; the affected message is then
    /// skipped rather than killing the circuit.
    fn allocate_large_buffer(&self) -> Option<BytesMut> {
        Some(BytesMut::with_capacity(self.large_buffer_size()))
    }

    fn release_large_buffer(&self, _buf: BytesMut) {}
}
