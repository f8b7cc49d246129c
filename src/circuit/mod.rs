//! The virtual circuit: one client-to-server TCP connection
//! multiplexing many channels.
//!
//! The circuit owns the socket, the send queue, the watchdog pair, the
//! flag word and the channel membership list. Two background tasks
//! share that state: the send engine ([`send`]) drains the queue and
//! services housekeeping, the receive engine ([`recv`]) pulls frames
//! off the wire and dispatches them upward. User threads stage whole
//! messages under the circuit mutex and are parked by the flush-block
//! mechanism when the backlog grows.

pub(crate) mod recv;
pub(crate) mod send;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use socket2::SockRef;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::channel::{ChannelBinding, ChannelList};
use crate::client::{CallbackGuard, ClientContext};
use crate::error::CircuitError;
use crate::flags::CircuitFlags;
use crate::proto::{
    align8, Command, FieldType, ProtocolVersion, FLUSH_BLOCK_WAIT, HEADER_BYTES, MAX_TCP_FRAME,
    MINOR_PROTOCOL_REVISION, PAYLOAD_SIZE_SENTINEL,
};
use crate::queue::{SendMsgMinder, SendQueue};
use crate::state::CircuitState;
use crate::watchdog::{ReceiveWatchdog, SendWatchdog};

// ── CircuitConfig ────────────────────────────────────────────────

/// Construction parameters for one circuit.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Remote endpoint handed down by the name-search layer.
    pub address: SocketAddr,
    /// Minor protocol revision the search reply advertised.
    pub minor_version: ProtocolVersion,
    /// Circuit priority, echoed to the server in the version exchange.
    pub priority: u16,
    /// Watchdog period for both the send and receive dogs.
    pub connection_timeout: Duration,
    /// Capacity of the inbound frame buffer.
    pub recv_buffer_capacity: usize,
}

impl CircuitConfig {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            minor_version: ProtocolVersion::CURRENT,
            priority: 0,
            connection_timeout: Duration::from_secs(30),
            recv_buffer_capacity: MAX_TCP_FRAME,
        }
    }

    pub fn with_minor_version(mut self, version: ProtocolVersion) -> Self {
        self.minor_version = version;
        self
    }

    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_recv_buffer_capacity(mut self, capacity: usize) -> Self {
        self.recv_buffer_capacity = capacity;
        self
    }
}

// ── Circuit ──────────────────────────────────────────────────────

pub(crate) struct Inner {
    pub state: CircuitState,
    pub flags: CircuitFlags,
    pub send_queue: SendQueue,
    pub channels: ChannelList,
}

/// One virtual circuit to a server.
pub struct Circuit {
    address: SocketAddr,
    version: ProtocolVersion,
    priority: u16,
    pub(crate) recv_buffer_capacity: usize,
    pub(crate) client: Arc<dyn ClientContext>,
    inner: Mutex<Inner>,
    sock: Mutex<Option<Arc<TcpStream>>>,
    pub(crate) callback_mutex: tokio::sync::Mutex<()>,
    pub(crate) flush_event: Notify,
    pub(crate) flush_block_event: Notify,
    pub(crate) abort_token: CancellationToken,
    pub(crate) recv_dog: ReceiveWatchdog,
    pub(crate) send_dog: SendWatchdog,
    /// Queried (never set) kernel send-buffer size, for the outbound
    /// backlog heuristic.
    pub(crate) send_buffer_size: AtomicUsize,
    pub(crate) oversize_logged: AtomicBool,
}

impl Circuit {
    /// Build a circuit and pre-load the send queue with the version,
    /// user-name and host-name preamble. Nothing touches the network
    /// until [`start`](Circuit::start).
    pub fn new(
        config: CircuitConfig,
        client: Arc<dyn ClientContext>,
    ) -> Result<Arc<Self>, CircuitError> {
        let timeout = config.connection_timeout;
        let circuit = Self {
            address: config.address,
            version: config.minor_version,
            priority: config.priority,
            recv_buffer_capacity: config.recv_buffer_capacity,
            client,
            inner: Mutex::new(Inner {
                state: CircuitState::Connecting,
                flags: CircuitFlags::default(),
                send_queue: SendQueue::new(),
                channels: ChannelList::default(),
            }),
            sock: Mutex::new(None),
            callback_mutex: tokio::sync::Mutex::new(()),
            flush_event: Notify::new(),
            flush_block_event: Notify::new(),
            abort_token: CancellationToken::new(),
            recv_dog: ReceiveWatchdog::new(timeout),
            send_dog: SendWatchdog::new(timeout),
            send_buffer_size: AtomicUsize::new(0x1000),
            oversize_logged: AtomicBool::new(false),
        };

        {
            let mut inner = circuit.lock();
            circuit.version_message_locked(&mut inner, circuit.priority)?;
            circuit.user_name_set_request_locked(&mut inner)?;
            circuit.host_name_set_request_locked(&mut inner)?;
        }

        Ok(Arc::new(circuit))
    }

    /// Launch the receive engine (which connects, then launches the
    /// send engine). Consumes one strong handle; the engines keep the
    /// circuit alive until the send engine hands it to
    /// [`ClientContext::destroy_circuit`].
    pub fn start(self: Arc<Self>) {
        let (handle_tx, handle_rx) = oneshot::channel();
        let handle = tokio::spawn(recv::run(self, handle_rx));
        let _ = handle_tx.send(handle);
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn minor_version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn priority(&self) -> u16 {
        self.priority
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    /// Is the circuit currently asking the peer to pause updates?
    pub fn flow_control_active(&self) -> bool {
        self.lock().flags.flow_control_active
    }

    /// Take the callback mutex. Upper-layer teardown paths need the
    /// guard to call [`remove_all_channels`](Circuit::remove_all_channels).
    pub async fn lock_callbacks(&self) -> CallbackGuard<'_> {
        CallbackGuard::new(self.callback_mutex.lock().await)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Socket cell ──────────────────────────────────────────────

    pub(crate) fn install_stream(&self, stream: TcpStream) -> Arc<TcpStream> {
        let stream = Arc::new(stream);
        *self.sock.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&stream));
        stream
    }

    pub(crate) fn stream(&self) -> Option<Arc<TcpStream>> {
        self.sock.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Orderly write-side half-close: the peer observes EOF, finishes
    /// its side, and the receive engine sees the answering FIN.
    pub(crate) fn shutdown_write(&self) {
        if let Some(stream) = self.stream() {
            if let Err(e) = SockRef::from(&*stream).shutdown(std::net::Shutdown::Write) {
                warn!("clean socket shutdown error: {e}");
            }
        }
    }

    /// Drop the circuit's socket handle. `socket_closed` is monotonic:
    /// the handle is released exactly once.
    pub(crate) fn close_socket(&self) {
        let taken = self.sock.lock().unwrap_or_else(|e| e.into_inner()).take();
        if taken.is_some() {
            self.lock().flags.socket_closed = true;
        }
    }

    // ── State transitions ────────────────────────────────────────

    /// Drain queued writes, then half-close. Driven automatically when
    /// the last channel leaves.
    pub fn initiate_clean_shutdown(&self) {
        let mut inner = self.lock();
        self.initiate_clean_shutdown_locked(&mut inner);
    }

    fn initiate_clean_shutdown_locked(&self, inner: &mut Inner) {
        if inner.state.begin_clean_shutdown() {
            self.flush_event.notify_one();
        }
    }

    /// Discard pending data and jolt both engines out of the kernel.
    /// Driven by protocol corruption, watchdog expiry, or explicit
    /// teardown.
    pub fn initiate_abort_shutdown(&self) {
        let transitioned = {
            let mut inner = self.lock();
            if !inner.flags.discarding_pending_data {
                if let Some(stream) = self.stream() {
                    if let Err(e) = SockRef::from(&*stream).set_linger(Some(Duration::ZERO)) {
                        warn!("socket linger set error: {e}");
                    }
                }
                inner.flags.discarding_pending_data = true;
            }
            inner.state.begin_abort_shutdown()
        };
        if transitioned {
            self.abort_token.cancel();
            self.flush_event.notify_one();
            self.notify_disconnect_once();
        }
    }

    /// The peer closed or an I/O error ended the circuit.
    pub(crate) fn peer_disconnect_notify(&self) {
        let transitioned = {
            let mut inner = self.lock();
            let t = inner.state.disconnect();
            if t {
                self.flush_event.notify_one();
            }
            t
        };
        if transitioned {
            self.abort_token.cancel();
            self.notify_disconnect_once();
        }
    }

    /// The initial connect failed; the circuit never came up.
    pub(crate) fn connect_failed(&self) {
        let mut inner = self.lock();
        if inner.state.disconnect() {
            self.flush_event.notify_one();
        }
    }

    /// Tell the upper layer the circuit is gone — at most once.
    pub(crate) fn notify_disconnect_once(&self) {
        let first = {
            let mut inner = self.lock();
            !std::mem::replace(&mut inner.flags.disconnect_notified, true)
        };
        if first {
            self.client.disconnect_notify(self);
        }
    }

    // ── Channel membership ───────────────────────────────────────

    /// Bind a channel to this circuit: record the search reply, stage
    /// the claim, and ask for a flush.
    pub fn install_channel(
        &self,
        chan: Arc<ChannelBinding>,
        sid: u32,
        field_type: FieldType,
        native_count: u32,
    ) -> Result<(), CircuitError> {
        {
            let mut inner = self.lock();
            inner.channels.add(Arc::clone(&chan));
            chan.search_reply_set_up(sid, field_type, native_count);
            self.create_channel_request_locked(&mut inner, &chan)?;
        }
        self.flush_request();
        Ok(())
    }

    /// Unbind a channel. When the last one leaves, the circuit begins
    /// its clean shutdown.
    pub fn uninstall_channel(&self, cid: u32) {
        let mut inner = self.lock();
        inner.channels.remove(cid);
        if inner.channels.is_empty() {
            self.initiate_clean_shutdown_locked(&mut inner);
        }
    }

    /// Tear every channel off a dying circuit: stage a release for each
    /// still-connected one, then hand each to the upper layer.
    pub fn remove_all_channels(&self, guard: &CallbackGuard<'_>) {
        let drained = {
            let mut inner = self.lock();
            let chans = inner.channels.drain();
            for chan in &chans {
                // an unanswered claim is released when the reply arrives
                // and finds no matching channel
                if chan.connected() {
                    let _ = self.clear_channel_request_locked(&mut inner, chan.sid(), chan.cid());
                }
            }
            chans
        };
        for chan in &drained {
            self.client.disconnect_channel(guard, chan);
        }
    }

    // ── Flush plumbing ───────────────────────────────────────────

    /// Wake the send engine if anything is staged.
    pub fn flush_request(&self) {
        if self.lock().send_queue.occupied_bytes() > 0 {
            self.flush_event.notify_one();
        }
    }

    /// Wake the send engine once the early threshold is crossed.
    pub fn flush_request_if_above_early_threshold(&self) {
        let mut inner = self.lock();
        self.poke_if_early(&mut inner, 0);
    }

    fn poke_if_early(&self, inner: &mut Inner, extra: usize) {
        if !inner.flags.early_flush && inner.send_queue.flush_early_threshold(extra) {
            inner.flags.early_flush = true;
            self.flush_event.notify_one();
        }
    }

    /// During inbound processing the upper layer may ask for a flush as
    /// soon as the parser next defers.
    pub fn request_recv_process_postponed_flush(&self) {
        self.lock().flags.recv_process_postponed_flush = true;
    }

    pub(crate) fn flush_if_recv_process_requested(&self) {
        let wanted = {
            let mut inner = self.lock();
            std::mem::replace(&mut inner.flags.recv_process_postponed_flush, false)
        };
        if wanted {
            self.flush_request();
        }
    }

    /// Ask the send engine to emit a liveness probe before its next
    /// drain. Returns `true` when the probe will be an echo, `false`
    /// when the peer is too old and gets a version message instead.
    pub fn set_echo_request_pending(&self) -> bool {
        self.lock().flags.echo_pending = true;
        self.flush_event.notify_one();
        self.version.v43()
    }

    /// Park the caller until the send backlog drops below the blocking
    /// threshold, with a 30-second rearm tick. Wakes early on drain
    /// progress and on any exit from the connected state.
    pub async fn block_until_send_backlog_reasonable(&self) {
        {
            let mut inner = self.lock();
            inner.flags.blocking_writers += 1;
        }
        loop {
            let keep_waiting = {
                let inner = self.lock();
                inner.send_queue.flush_block_threshold(0) && inner.state.is_connected()
            };
            if !keep_waiting {
                break;
            }
            let _ = tokio::time::timeout(FLUSH_BLOCK_WAIT, self.flush_block_event.notified()).await;
        }
        let last = {
            let mut inner = self.lock();
            inner.flags.blocking_writers -= 1;
            inner.flags.blocking_writers == 0
        };
        if last {
            self.flush_block_event.notify_waiters();
        }
    }

    // ── Request staging ──────────────────────────────────────────

    fn max_payload_bytes(&self) -> usize {
        if self.version.v49() {
            self.client.large_buffer_size()
        } else {
            MAX_TCP_FRAME
        }
    }

    fn max_elements_for(&self, field_type: FieldType) -> u32 {
        let size = field_type.byte_size();
        ((self.max_payload_bytes() - size) / size) as u32
    }

    /// Fire-and-forget typed write.
    pub fn write_request(
        &self,
        chan: &ChannelBinding,
        data_type: u16,
        element_count: u32,
        value: &[u8],
    ) -> Result<(), CircuitError> {
        if !chan.connected() {
            return Err(CircuitError::NotConnected);
        }
        let postsize = align8(value.len());
        let mut inner = self.lock();
        self.poke_if_early(&mut inner, HEADER_BYTES + postsize);
        let mut minder = SendMsgMinder::new(&mut inner.send_queue);
        minder.insert_request_header(
            Command::Write as u16,
            postsize as u32,
            data_type,
            element_count,
            chan.sid(),
            chan.cid(),
            self.version.v49(),
        )?;
        minder.push_bytes(value);
        minder.push_zeros(postsize - value.len());
        minder.commit();
        Ok(())
    }

    /// Typed write with completion notification (v4.1+).
    pub fn write_notify_request(
        &self,
        chan: &ChannelBinding,
        data_type: u16,
        element_count: u32,
        io_id: u32,
        value: &[u8],
    ) -> Result<(), CircuitError> {
        if !chan.connected() {
            return Err(CircuitError::NotConnected);
        }
        if !self.version.v41() {
            return Err(CircuitError::UnsupportedByService);
        }
        let postsize = align8(value.len());
        let mut inner = self.lock();
        self.poke_if_early(&mut inner, HEADER_BYTES + postsize);
        let mut minder = SendMsgMinder::new(&mut inner.send_queue);
        minder.insert_request_header(
            Command::WriteNotify as u16,
            postsize as u32,
            data_type,
            element_count,
            chan.sid(),
            io_id,
            self.version.v49(),
        )?;
        minder.push_bytes(value);
        minder.push_zeros(postsize - value.len());
        minder.commit();
        Ok(())
    }

    /// Typed read with completion notification.
    pub fn read_notify_request(
        &self,
        chan: &ChannelBinding,
        data_type: u16,
        element_count: u32,
        io_id: u32,
    ) -> Result<(), CircuitError> {
        if !chan.connected() {
            return Err(CircuitError::NotConnected);
        }
        let field_type = FieldType::try_from(data_type)?;
        if element_count > chan.native_count() {
            return Err(CircuitError::OutOfBounds);
        }
        if element_count > self.max_elements_for(field_type) {
            return Err(CircuitError::MsgBodyCacheTooSmall);
        }
        let mut inner = self.lock();
        self.poke_if_early(&mut inner, HEADER_BYTES);
        let mut minder = SendMsgMinder::new(&mut inner.send_queue);
        minder.insert_request_header(
            Command::ReadNotify as u16,
            0,
            data_type,
            element_count,
            chan.sid(),
            io_id,
            self.version.v49(),
        )?;
        minder.commit();
        Ok(())
    }

    /// Register a value subscription. Silently skipped when the channel
    /// is not connected: the claim machinery resubscribes on reconnect.
    pub fn subscription_request(
        &self,
        chan: &ChannelBinding,
        data_type: u16,
        element_count: u32,
        mask: u32,
        subscription_id: u32,
    ) -> Result<(), CircuitError> {
        if !chan.connected() {
            return Ok(());
        }
        let Ok(field_type) = FieldType::try_from(data_type) else {
            warn!("skipped subscription with unknown data type {data_type}");
            return Ok(());
        };
        let mask = if mask > u16::MAX as u32 {
            warn!("truncated unusual event select mask {mask:#x}");
            (mask & 0xFFFF) as u16
        } else {
            mask as u16
        };
        if element_count > self.max_elements_for(field_type) {
            return Err(CircuitError::MsgBodyCacheTooSmall);
        }
        let mut inner = self.lock();
        self.poke_if_early(&mut inner, HEADER_BYTES + 16);
        let mut minder = SendMsgMinder::new(&mut inner.send_queue);
        minder.insert_request_header(
            Command::EventAdd as u16,
            16,
            data_type,
            element_count,
            chan.sid(),
            subscription_id,
            self.version.v49(),
        )?;
        // low / high / timeout deadband floats are vestigial: zero
        minder.push_f32(0.0);
        minder.push_f32(0.0);
        minder.push_f32(0.0);
        minder.push_u16(mask);
        minder.push_u16(0);
        minder.commit();
        Ok(())
    }

    /// Cancel a value subscription.
    pub fn subscription_cancel_request(
        &self,
        chan: &ChannelBinding,
        data_type: u16,
        element_count: u32,
        subscription_id: u32,
    ) -> Result<(), CircuitError> {
        let mut inner = self.lock();
        self.poke_if_early(&mut inner, HEADER_BYTES);
        let mut minder = SendMsgMinder::new(&mut inner.send_queue);
        minder.insert_request_header(
            Command::EventCancel as u16,
            0,
            data_type,
            element_count,
            chan.sid(),
            subscription_id,
            self.version.v49(),
        )?;
        minder.commit();
        Ok(())
    }

    fn create_channel_request_locked(
        &self,
        inner: &mut Inner,
        chan: &ChannelBinding,
    ) -> Result<(), CircuitError> {
        let (identity, name) = if self.version.v44() {
            (chan.cid(), Some(chan.name().to_owned()))
        } else {
            (chan.sid(), None)
        };
        let name_len = name.as_ref().map_or(0, |n| n.len() + 1);
        let postsize = align8(name_len);
        if postsize >= PAYLOAD_SIZE_SENTINEL as usize {
            return Err(CircuitError::UnsupportedByService);
        }
        self.poke_if_early(inner, HEADER_BYTES + postsize);
        let mut minder = SendMsgMinder::new(&mut inner.send_queue);
        // the second parameter carries the minor revision since v4.1
        minder.insert_request_header(
            Command::CreateChan as u16,
            postsize as u32,
            0,
            0,
            identity,
            MINOR_PROTOCOL_REVISION as u32,
            self.version.v49(),
        )?;
        if let Some(name) = name {
            minder.push_string(&name, postsize);
        }
        minder.commit();
        Ok(())
    }

    fn clear_channel_request_locked(
        &self,
        inner: &mut Inner,
        sid: u32,
        cid: u32,
    ) -> Result<(), CircuitError> {
        self.poke_if_early(inner, HEADER_BYTES);
        let mut minder = SendMsgMinder::new(&mut inner.send_queue);
        minder.insert_request_header(
            Command::ClearChannel as u16,
            0,
            0,
            0,
            sid,
            cid,
            self.version.v49(),
        )?;
        minder.commit();
        Ok(())
    }

    fn version_message_locked(&self, inner: &mut Inner, priority: u16) -> Result<(), CircuitError> {
        self.poke_if_early(inner, HEADER_BYTES);
        let mut minder = SendMsgMinder::new(&mut inner.send_queue);
        // priority rides the data-type slot, our revision the count slot
        minder.insert_request_header(
            Command::Version as u16,
            0,
            priority,
            MINOR_PROTOCOL_REVISION as u32,
            0,
            0,
            self.version.v49(),
        )?;
        minder.commit();
        Ok(())
    }

    fn user_name_set_request_locked(&self, inner: &mut Inner) -> Result<(), CircuitError> {
        if !self.version.v41() {
            return Ok(());
        }
        let name = self.client.user_name();
        self.identity_message_locked(inner, Command::ClientName, &name)
    }

    fn host_name_set_request_locked(&self, inner: &mut Inner) -> Result<(), CircuitError> {
        if !self.version.v41() {
            return Ok(());
        }
        let name = self.client.host_name();
        self.identity_message_locked(inner, Command::HostName, &name)
    }

    fn identity_message_locked(
        &self,
        inner: &mut Inner,
        command: Command,
        name: &str,
    ) -> Result<(), CircuitError> {
        let postsize = align8(name.len() + 1);
        if postsize >= PAYLOAD_SIZE_SENTINEL as usize {
            return Err(CircuitError::UnsupportedByService);
        }
        self.poke_if_early(inner, HEADER_BYTES + postsize);
        let mut minder = SendMsgMinder::new(&mut inner.send_queue);
        minder.insert_request_header(
            command as u16,
            postsize as u32,
            0,
            0,
            0,
            0,
            self.version.v49(),
        )?;
        minder.push_string(name, postsize);
        minder.commit();
        Ok(())
    }

    pub(crate) fn echo_request_locked(&self, inner: &mut Inner) -> Result<(), CircuitError> {
        self.poke_if_early(inner, HEADER_BYTES);
        let mut minder = SendMsgMinder::new(&mut inner.send_queue);
        minder.insert_request_header(Command::Echo as u16, 0, 0, 0, 0, 0, self.version.v49())?;
        minder.commit();
        Ok(())
    }

    pub(crate) fn version_probe_locked(&self, inner: &mut Inner) -> Result<(), CircuitError> {
        self.version_message_locked(inner, self.priority)
    }

    /// Ask the server to pause subscription updates (`EventsOff`).
    pub(crate) fn enable_flow_control_locked(&self, inner: &mut Inner) -> Result<(), CircuitError> {
        self.poke_if_early(inner, HEADER_BYTES);
        let mut minder = SendMsgMinder::new(&mut inner.send_queue);
        minder.insert_request_header(Command::EventsOff as u16, 0, 0, 0, 0, 0, self.version.v49())?;
        minder.commit();
        Ok(())
    }

    /// Ask the server to resume subscription updates (`EventsOn`).
    pub(crate) fn disable_flow_control_locked(
        &self,
        inner: &mut Inner,
    ) -> Result<(), CircuitError> {
        self.poke_if_early(inner, HEADER_BYTES);
        let mut minder = SendMsgMinder::new(&mut inner.send_queue);
        minder.insert_request_header(Command::EventsOn as u16, 0, 0, 0, 0, 0, self.version.v49())?;
        minder.commit();
        Ok(())
    }

    pub(crate) fn is_v43(&self) -> bool {
        self.version.v43()
    }

    pub(crate) fn is_peer_loss(kind: std::io::ErrorKind) -> bool {
        use std::io::ErrorKind::*;
        matches!(
            kind,
            BrokenPipe | ConnectionReset | TimedOut | ConnectionAborted | NotConnected
        )
    }

    #[cfg(test)]
    pub(crate) fn drain_staged_bytes(&self) -> Vec<u8> {
        let mut inner = self.lock();
        let mut out = Vec::new();
        while let Some(buf) = inner.send_queue.pop_next_buffer_to_send() {
            out.extend_from_slice(buf.occupied_slice());
        }
        out
    }
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Circuit")
            .field("address", &self.address)
            .field("version", &self.version)
            .field("state", &inner.state)
            .field("channels", &inner.channels.len())
            .field("staged_bytes", &inner.send_queue.occupied_bytes())
            .field("busy_detected", &inner.flags.busy_detected)
            .field("flow_control_active", &inner.flags.flow_control_active)
            .finish()
    }
}

#[cfg(test)]
mod tests;
