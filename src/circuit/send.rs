//! The send engine.
//!
//! A dedicated task that drains the send queue onto the socket and
//! services protocol housekeeping on each pass: reconciling the
//! flow-control flags the receive engine toggles, and emitting liveness
//! probes the watchdog requests. On exit it owns the circuit's
//! destructor sequence — final flush, half-close, writer wakeup, engine
//! join, hand-off to the upper layer.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::state::CircuitState;

use super::Circuit;

pub(crate) async fn run(
    circuit: Arc<Circuit>,
    recv_handle_rx: oneshot::Receiver<JoinHandle<()>>,
) {
    loop {
        circuit.flush_event.notified().await;

        if circuit.state() != CircuitState::Connected {
            break;
        }

        {
            let mut inner = circuit.lock();

            if inner.flags.busy_detected != inner.flags.flow_control_active {
                if inner.flags.flow_control_active {
                    let _ = circuit.disable_flow_control_locked(&mut inner);
                    inner.flags.flow_control_active = false;
                    debug!("fc off");
                } else {
                    let _ = circuit.enable_flow_control_locked(&mut inner);
                    inner.flags.flow_control_active = true;
                    debug!("fc on");
                }
            }

            if std::mem::replace(&mut inner.flags.echo_pending, false) {
                if circuit.is_v43() {
                    let _ = circuit.echo_request_locked(&mut inner);
                } else {
                    let _ = circuit.version_probe_locked(&mut inner);
                }
            }
        }

        if !flush(&circuit).await {
            break;
        }
    }

    if circuit.state() == CircuitState::CleanShutdown {
        flush(&circuit).await;
        // the peer answers our EOF by closing its side
        circuit.shutdown_write();
    }

    circuit.send_dog.cancel();

    // wake user threads parked on the backlog and wait until none are
    // still using this circuit
    circuit.flush_block_event.notify_waiters();
    loop {
        if circuit.lock().flags.blocking_writers == 0 {
            break;
        }
        circuit.flush_block_event.notify_waiters();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    if let Ok(recv_handle) = recv_handle_rx.await {
        let _ = recv_handle.await;
    }

    circuit.close_socket();
    let client = Arc::clone(&circuit.client);
    client.destroy_circuit(circuit);
}

/// Drain the send queue. Buffers are popped under the circuit mutex
/// and written outside it; cumulative unacknowledged bytes feed the
/// receive watchdog's backlog heuristic. A write failure discards
/// everything still queued. Returns `false` when the circuit is done
/// sending.
pub(crate) async fn flush(circuit: &Arc<Circuit>) -> bool {
    let mut success = true;
    let mut just_sent = 0usize;

    loop {
        let (buf, unacked) = {
            let mut inner = circuit.lock();
            // accounted here so the tally is mutex-guarded yet reflects
            // bytes already on the wire
            if just_sent > 0 {
                inner.flags.unacked_send_bytes += just_sent;
                just_sent = 0;
            }
            let unacked = inner.flags.unacked_send_bytes;
            (inner.send_queue.pop_next_buffer_to_send(), unacked)
        };

        // rearming the receive dog can block briefly; never do it with
        // the circuit mutex held
        if unacked > circuit.send_buffer_size.load(Ordering::Relaxed) {
            circuit.recv_dog.send_backlog_progress_notify();
        }

        let Some(buf) = buf else {
            break;
        };
        just_sent = buf.occupied();

        if !send_bytes(circuit, buf.occupied_slice()).await {
            success = false;
            circuit.lock().send_queue.clear();
            break;
        }
    }

    circuit.lock().flags.early_flush = false;
    circuit.flush_block_event.notify_waiters();
    success
}

/// Write one buffer to the socket under the send watchdog.
///
/// `Interrupted` and `WouldBlock` retry; a zero-length write and the
/// usual peer-loss errnos are a silent disconnect; anything else is
/// logged with the OS reason before disconnecting. Watchdog expiry
/// interrupts the blocked send and aborts the circuit.
async fn send_bytes(circuit: &Arc<Circuit>, mut remaining: &[u8]) -> bool {
    let Some(stream) = circuit.stream() else {
        return false;
    };

    circuit.send_dog.start();
    let mut ok = true;

    while !remaining.is_empty() {
        if !circuit.state().sendable() {
            ok = false;
            break;
        }

        tokio::select! {
            biased;
            _ = circuit.abort_token.cancelled() => {
                ok = false;
                break;
            }
            ready = timeout(circuit.send_dog.remaining(), stream.writable()) => {
                match ready {
                    Err(_elapsed) => {
                        warn!("send timed out; aborting circuit to {}", circuit.address());
                        circuit.initiate_abort_shutdown();
                        ok = false;
                        break;
                    }
                    Ok(Err(e)) => {
                        if !Circuit::is_peer_loss(e.kind()) {
                            warn!("unexpected TCP send error: {e}");
                        }
                        circuit.peer_disconnect_notify();
                        ok = false;
                        break;
                    }
                    Ok(Ok(())) => match stream.try_write(remaining) {
                        Ok(0) => {
                            // the peer closed its read side
                            circuit.peer_disconnect_notify();
                            ok = false;
                            break;
                        }
                        Ok(n) => {
                            remaining = &remaining[n..];
                            circuit.send_dog.progress_notify();
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            if !Circuit::is_peer_loss(e.kind()) {
                                warn!("unexpected TCP send error: {e}");
                            }
                            circuit.peer_disconnect_notify();
                            ok = false;
                            break;
                        }
                    },
                }
            }
        }
    }

    circuit.send_dog.cancel();
    ok
}
