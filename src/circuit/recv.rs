//! The receive engine.
//!
//! A dedicated task that connects the circuit, launches the send
//! engine, then pulls frames off the wire into the receive queue and
//! feeds the streaming protocol parser. Inbound dispatch runs under the
//! callback mutex; the engine yields it every few contiguous frames so
//! other callback work can interleave. Saturation observations arm the
//! flow-control handshake; inbound silence is escalated through the
//! receive watchdog.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::BytesMut;
use socket2::SockRef;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::buffer::FrameBuf;
use crate::client::CallbackGuard;
use crate::error::CircuitError;
use crate::proto::{CONTIG_FRAME_YIELD, EXTENSION_BYTES};
use crate::queue::RecvQueue;
use crate::state::CircuitState;
use crate::watchdog::RecvExpiry;

use super::{send, Circuit};

pub(crate) async fn run(
    circuit: Arc<Circuit>,
    recv_handle_rx: oneshot::Receiver<JoinHandle<()>>,
) {
    connect(&circuit).await;

    // the send engine runs even when the connect failed: it owns the
    // shared teardown sequence
    tokio::spawn(send::run(Arc::clone(&circuit), recv_handle_rx));

    if circuit.state() != CircuitState::Connected {
        circuit.notify_disconnect_once();
        return;
    }

    // release the preamble staged at construction
    circuit.flush_request();

    let Some(stream) = circuit.stream() else {
        circuit.notify_disconnect_once();
        return;
    };

    let cap = circuit.recv_buffer_capacity;
    let mut parser = Parser::new(&circuit);
    let mut buf = FrameBuf::with_capacity(cap);

    'outer: while circuit.state().sendable() {
        let first_fill = match read_frame(&circuit, &stream, &mut buf).await {
            ReadOutcome::Data(n) => n,
            ReadOutcome::Retry => continue,
            ReadOutcome::Exit => break,
        };

        circuit.recv_dog.message_arrival_notify();

        // only one task at a time may run upper-layer callbacks
        let guard = CallbackGuard::new(circuit.callback_mutex.lock().await);

        let mut contiguous = 0u32;
        let mut fill = first_fill;
        loop {
            let busy_changed = circuit.lock().flags.note_fill(fill, cap);
            if busy_changed {
                circuit.flush_event.notify_one();
            }

            parser.recv_que.push_frame(buf.occupied_slice());
            buf.reset();

            if let Err(e) = parser.process_incoming(&circuit, &guard) {
                warn!("{e}; aborting circuit to {}", circuit.address());
                circuit.initiate_abort_shutdown();
                break 'outer;
            }

            contiguous += 1;
            if contiguous >= CONTIG_FRAME_YIELD {
                break;
            }

            // keep the callback mutex only while the OS already holds
            // more bytes for us
            match stream.try_read(buf.spare_mut()) {
                Ok(0) => {
                    circuit.peer_disconnect_notify();
                    break;
                }
                Ok(n) => {
                    buf.extend_filled(n);
                    fill = n;
                    circuit.recv_dog.message_arrival_notify();
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::Interrupted =>
                {
                    break;
                }
                Err(e) => {
                    if Circuit::is_peer_loss(e.kind()) {
                        circuit.peer_disconnect_notify();
                    } else {
                        warn!(
                            "unexpected problem with circuit to {}: {e} - disconnecting",
                            circuit.address()
                        );
                        circuit.initiate_abort_shutdown();
                    }
                    break;
                }
            }
        }
    }

    parser.release(&circuit);
}

/// Establish the TCP connection under the send watchdog and apply the
/// circuit's socket options.
async fn connect(circuit: &Arc<Circuit>) {
    circuit.send_dog.start();

    let address = circuit.address();
    let attempt = async move {
        let socket = match address {
            std::net::SocketAddr::V4(_) => TcpSocket::new_v4()?,
            std::net::SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.connect(address).await
    };

    let result = tokio::select! {
        biased;
        _ = circuit.abort_token.cancelled() => None,
        r = timeout(circuit.send_dog.remaining(), attempt) => Some(r),
    };
    circuit.send_dog.cancel();

    match result {
        Some(Ok(Ok(stream))) => {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("problems setting socket option TCP_NODELAY: {e}");
            }
            {
                let sock = SockRef::from(&stream);
                if let Err(e) = sock.set_keepalive(true) {
                    warn!("problems setting socket option SO_KEEPALIVE: {e}");
                }
                match sock.send_buffer_size() {
                    Ok(n) => circuit.send_buffer_size.store(n, Ordering::Relaxed),
                    Err(e) => warn!("problems getting socket option SO_SNDBUF: {e}"),
                }
            }
            circuit.install_stream(stream);

            let connected = circuit.lock().state.connect_ok();
            if connected {
                circuit.recv_dog.connect_notify();
                info!(
                    "circuit to {} up at {}",
                    circuit.address(),
                    circuit.minor_version()
                );
            }
        }
        Some(Ok(Err(e))) => {
            warn!("unable to connect to {}: {e}", circuit.address());
            circuit.connect_failed();
        }
        Some(Err(_elapsed)) => {
            warn!("connect to {} timed out", circuit.address());
            circuit.connect_failed();
        }
        None => {
            circuit.connect_failed();
        }
    }
}

enum ReadOutcome {
    /// `n` fresh bytes are in the frame buffer.
    Data(usize),
    /// Nothing read; re-check the state and try again.
    Retry,
    /// The engine is done.
    Exit,
}

/// Read up to one frame buffer of bytes, bounded by the receive
/// watchdog and interruptible by abort shutdown.
async fn read_frame(
    circuit: &Arc<Circuit>,
    stream: &TcpStream,
    buf: &mut FrameBuf,
) -> ReadOutcome {
    loop {
        if !circuit.state().sendable() {
            return ReadOutcome::Exit;
        }

        tokio::select! {
            biased;
            _ = circuit.abort_token.cancelled() => return ReadOutcome::Exit,
            ready = timeout(circuit.recv_dog.remaining(), stream.readable()) => match ready {
                Err(_elapsed) => match circuit.recv_dog.on_expire() {
                    RecvExpiry::Probe => {
                        circuit.set_echo_request_pending();
                    }
                    RecvExpiry::Dead => {
                        warn!("circuit to {} went silent; disconnecting", circuit.address());
                        circuit.initiate_abort_shutdown();
                        return ReadOutcome::Exit;
                    }
                },
                Ok(Err(e)) => {
                    if Circuit::is_peer_loss(e.kind()) {
                        circuit.peer_disconnect_notify();
                        return ReadOutcome::Retry;
                    }
                    warn!(
                        "unexpected problem with circuit to {}: {e} - disconnecting",
                        circuit.address()
                    );
                    circuit.initiate_abort_shutdown();
                    return ReadOutcome::Exit;
                }
                Ok(Ok(())) => match stream.try_read(buf.spare_mut()) {
                    Ok(0) => {
                        circuit.peer_disconnect_notify();
                        return ReadOutcome::Retry;
                    }
                    Ok(n) => {
                        buf.extend_filled(n);
                        return ReadOutcome::Data(n);
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        if Circuit::is_peer_loss(e.kind()) {
                            circuit.peer_disconnect_notify();
                            return ReadOutcome::Retry;
                        }
                        warn!(
                            "unexpected problem with circuit to {}: {e} - disconnecting",
                            circuit.address()
                        );
                        circuit.initiate_abort_shutdown();
                        return ReadOutcome::Exit;
                    }
                },
            }
        }
    }
}

// ── Parser ───────────────────────────────────────────────────────

/// Streaming protocol parser over the receive queue.
///
/// Holds the sticky header state and the partially filled message body
/// cache between reads; every "not enough bytes" point defers back to
/// the engine and resumes where it left off.
pub(crate) struct Parser {
    pub recv_que: RecvQueue,
    hdr: Option<crate::header::MsgHeader>,
    ext_pending: bool,
    cache: BytesMut,
    cache_max: usize,
    cache_is_large: bool,
    skipped: usize,
}

impl Parser {
    pub fn new(circuit: &Arc<Circuit>) -> Self {
        Self {
            recv_que: RecvQueue::new(),
            hdr: None,
            ext_pending: false,
            cache: circuit.client.allocate_small_buffer(),
            cache_max: circuit.client.small_buffer_size(),
            cache_is_large: false,
            skipped: 0,
        }
    }

    /// Hand the body cache back to the allocator.
    pub fn release(self, circuit: &Arc<Circuit>) {
        if self.cache_is_large {
            circuit.client.release_large_buffer(self.cache);
        } else {
            circuit.client.release_small_buffer(self.cache);
        }
    }

    /// Drain complete messages out of the receive queue into the
    /// dispatcher. `Ok` covers both "queue empty" and "mid-message,
    /// need more bytes"; `Err` is protocol corruption and the engine
    /// aborts the circuit.
    pub fn process_incoming(
        &mut self,
        circuit: &Arc<Circuit>,
        guard: &CallbackGuard<'_>,
    ) -> Result<(), CircuitError> {
        loop {
            // fetch a complete message header
            if self.hdr.is_none() {
                let Some(hdr) = self.recv_que.pop_header() else {
                    circuit.flush_if_recv_process_requested();
                    return Ok(());
                };
                self.ext_pending = hdr.has_extension_sentinel();
                self.hdr = Some(hdr);
            }
            if self.ext_pending {
                if self.recv_que.occupied_bytes() < EXTENSION_BYTES {
                    circuit.flush_if_recv_process_requested();
                    return Ok(());
                }
                let size = self.recv_que.pop_u32();
                let count = self.recv_que.pop_u32();
                let (Some(size), Some(count), Some(hdr)) = (size, count, self.hdr.as_mut())
                else {
                    return Err(CircuitError::ProtocolViolation("truncated header extension"));
                };
                hdr.apply_extension(size, count);
                self.ext_pending = false;
            }
            let Some(hdr) = self.hdr else {
                return Err(CircuitError::ProtocolViolation("lost message header"));
            };
            let postsize = hdr.payload_size as usize;

            // make sure the message body cache is large enough
            if postsize > self.cache_max && !self.cache_is_large {
                if circuit.client.large_buffer_size() >= postsize {
                    match circuit.client.allocate_large_buffer() {
                        Some(large) => {
                            let small = std::mem::replace(&mut self.cache, large);
                            circuit.client.release_small_buffer(small);
                            self.cache_max = circuit.client.large_buffer_size();
                            self.cache_is_large = true;
                        }
                        None => {
                            warn!("not enough memory for message body cache (ignoring response)");
                        }
                    }
                }
            }

            if postsize <= self.cache_max {
                if postsize > 0 {
                    let want = postsize - self.cache.len();
                    self.recv_que.copy_out_bytes(&mut self.cache, want);
                    if self.cache.len() < postsize {
                        circuit.flush_if_recv_process_requested();
                        return Ok(());
                    }
                }
                let ok = circuit.client.execute_response(
                    guard,
                    circuit,
                    &hdr,
                    &self.cache[..postsize],
                );
                if !ok {
                    return Err(CircuitError::ProtocolViolation("malformed response message"));
                }
            } else {
                // drain the body without dispatching; the stream stays
                // aligned because the declared size covers the padding
                if !circuit.oversize_logged.swap(true, Ordering::Relaxed) {
                    warn!(
                        "response with payload size={postsize} exceeds the body cache ceiling; \
                         discarding"
                    );
                }
                self.skipped += self.recv_que.skip_bytes(postsize - self.skipped);
                if self.skipped < postsize {
                    circuit.flush_if_recv_process_requested();
                    return Ok(());
                }
            }

            self.hdr = None;
            self.cache.clear();
            self.skipped = 0;
        }
    }
}
