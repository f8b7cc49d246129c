//! Staging-vocabulary tests: every request is staged into the send
//! queue and decoded back off it, without touching the network.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Buf;

use super::*;
use crate::channel::ChannelBinding;
use crate::client::{CallbackGuard, ClientContext};
use crate::header::MsgHeader;

#[derive(Default)]
struct StubClient {
    chan_disconnects: AtomicU32,
}

impl ClientContext for StubClient {
    fn user_name(&self) -> String {
        "operator".into()
    }

    fn host_name(&self) -> String {
        "console7".into()
    }

    fn disconnect_notify(&self, _circuit: &Circuit) {}

    fn disconnect_channel(&self, _guard: &CallbackGuard<'_>, _chan: &Arc<ChannelBinding>) {
        self.chan_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    fn destroy_circuit(&self, _circuit: Arc<Circuit>) {}

    fn execute_response(
        &self,
        _guard: &CallbackGuard<'_>,
        _circuit: &Arc<Circuit>,
        _header: &MsgHeader,
        _body: &[u8],
    ) -> bool {
        true
    }
}

fn test_circuit(version: ProtocolVersion) -> (Arc<Circuit>, Arc<StubClient>) {
    let client = Arc::new(StubClient::default());
    let config = CircuitConfig::new("127.0.0.1:5064".parse().unwrap()).with_minor_version(version);
    let circuit = Circuit::new(config, Arc::clone(&client) as Arc<dyn ClientContext>).unwrap();
    (circuit, client)
}

fn connected_channel(cid: u32, sid: u32) -> ChannelBinding {
    let chan = ChannelBinding::new(cid, "test:pv");
    chan.search_reply_set_up(sid, FieldType::Double, 16);
    chan.set_connected(true);
    chan
}

/// Split a drained byte stream back into (header, body) frames.
fn decode_frames(bytes: &[u8]) -> Vec<(MsgHeader, Vec<u8>)> {
    let mut src = bytes;
    let mut out = Vec::new();
    while !src.is_empty() {
        let mut hdr = MsgHeader::decode(&mut src).unwrap();
        if hdr.has_extension_sentinel() {
            let size = src.get_u32();
            let count = src.get_u32();
            hdr.apply_extension(size, count);
        }
        let n = hdr.payload_size as usize;
        out.push((hdr, src[..n].to_vec()));
        src.advance(n);
    }
    out
}

// ── Preamble ─────────────────────────────────────────────────────

#[test]
fn preamble_stages_version_then_identity() {
    let (circuit, _) = test_circuit(ProtocolVersion::CURRENT);
    let frames = decode_frames(&circuit.drain_staged_bytes());

    assert_eq!(frames.len(), 3);

    let (version, _) = &frames[0];
    assert_eq!(version.command, Command::Version as u16);
    assert_eq!(version.element_count, MINOR_PROTOCOL_REVISION as u32);
    assert_eq!(version.payload_size, 0);

    let (user, user_body) = &frames[1];
    assert_eq!(user.command, Command::ClientName as u16);
    assert_eq!(user.payload_size as usize, align8("operator".len() + 1));
    assert_eq!(&user_body[..8], b"operator");
    assert!(user_body[8..].iter().all(|&b| b == 0));

    let (host, host_body) = &frames[2];
    assert_eq!(host.command, Command::HostName as u16);
    assert_eq!(&host_body[..8], b"console7");
}

#[test]
fn preamble_priority_rides_data_type_slot() {
    let client = Arc::new(StubClient::default());
    let config = CircuitConfig::new("127.0.0.1:5064".parse().unwrap()).with_priority(42);
    let circuit = Circuit::new(config, client as Arc<dyn ClientContext>).unwrap();
    let frames = decode_frames(&circuit.drain_staged_bytes());
    assert_eq!(frames[0].0.data_type, 42);
}

#[test]
fn identity_messages_skipped_below_v41() {
    let (circuit, _) = test_circuit(ProtocolVersion(0));
    let frames = decode_frames(&circuit.drain_staged_bytes());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0.command, Command::Version as u16);
}

// ── Writes ───────────────────────────────────────────────────────

#[test]
fn write_request_stages_padded_value() {
    let (circuit, _) = test_circuit(ProtocolVersion::CURRENT);
    circuit.drain_staged_bytes();

    let chan = connected_channel(5, 0x9A);
    circuit
        .write_request(&chan, FieldType::Double as u16, 1, &[0x11; 10])
        .unwrap();

    let frames = decode_frames(&circuit.drain_staged_bytes());
    assert_eq!(frames.len(), 1);
    let (hdr, body) = &frames[0];
    assert_eq!(hdr.command, Command::Write as u16);
    assert_eq!(hdr.payload_size, 16);
    assert_eq!(hdr.data_type, FieldType::Double as u16);
    assert_eq!(hdr.element_count, 1);
    assert_eq!(hdr.param1, 0x9A);
    assert_eq!(hdr.param2, 5);
    assert_eq!(&body[..10], &[0x11; 10]);
    assert_eq!(&body[10..], &[0, 0, 0, 0, 0, 0]);
}

#[test]
fn write_request_rejects_unconnected_channel() {
    let (circuit, _) = test_circuit(ProtocolVersion::CURRENT);
    circuit.drain_staged_bytes();

    let chan = ChannelBinding::new(5, "test:pv");
    let err = circuit
        .write_request(&chan, FieldType::Long as u16, 1, &[0; 4])
        .unwrap_err();
    assert!(matches!(err, CircuitError::NotConnected));
    assert!(circuit.drain_staged_bytes().is_empty());
}

#[test]
fn write_notify_carries_io_id_and_needs_v41() {
    let (circuit, _) = test_circuit(ProtocolVersion::CURRENT);
    circuit.drain_staged_bytes();
    let chan = connected_channel(5, 0x9A);

    circuit
        .write_notify_request(&chan, FieldType::Long as u16, 1, 777, &[0; 4])
        .unwrap();
    let frames = decode_frames(&circuit.drain_staged_bytes());
    assert_eq!(frames[0].0.command, Command::WriteNotify as u16);
    assert_eq!(frames[0].0.param2, 777);

    let (old, _) = test_circuit(ProtocolVersion(0));
    old.drain_staged_bytes();
    let err = old
        .write_notify_request(&chan, FieldType::Long as u16, 1, 777, &[0; 4])
        .unwrap_err();
    assert!(matches!(err, CircuitError::UnsupportedByService));
}

#[test]
fn oversize_write_uses_extended_form() {
    let (circuit, _) = test_circuit(ProtocolVersion::CURRENT);
    circuit.drain_staged_bytes();
    let chan = connected_channel(5, 0x9A);

    let value = vec![0xEE; 0xFFFF];
    circuit
        .write_request(&chan, FieldType::Char as u16, value.len() as u32, &value)
        .unwrap();

    let bytes = circuit.drain_staged_bytes();
    // size slot carries the sentinel, extension the aligned size
    assert_eq!(&bytes[2..4], &[0xFF, 0xFF]);
    let frames = decode_frames(&bytes);
    assert_eq!(frames[0].0.payload_size as usize, align8(0xFFFF));
    assert_eq!(frames[0].1.len(), align8(0xFFFF));
}

#[test]
fn oversize_write_on_old_peer_rolls_back() {
    let (circuit, _) = test_circuit(ProtocolVersion(3));
    circuit.drain_staged_bytes();
    let chan = connected_channel(5, 0x9A);

    let value = vec![0xEE; 0x10000];
    let err = circuit
        .write_request(&chan, FieldType::Char as u16, value.len() as u32, &value)
        .unwrap_err();
    assert!(matches!(err, CircuitError::UnsupportedByService));
    // the minder rolled the partial message back out of the queue
    assert!(circuit.drain_staged_bytes().is_empty());
}

// ── Reads ────────────────────────────────────────────────────────

#[test]
fn read_notify_validates_before_staging() {
    let (circuit, _) = test_circuit(ProtocolVersion::CURRENT);
    circuit.drain_staged_bytes();
    let chan = connected_channel(5, 0x9A);

    assert!(matches!(
        circuit.read_notify_request(&chan, 99, 1, 1),
        Err(CircuitError::BadType)
    ));
    assert!(matches!(
        circuit.read_notify_request(&chan, FieldType::Double as u16, 17, 1),
        Err(CircuitError::OutOfBounds)
    ));

    let unconnected = ChannelBinding::new(6, "other:pv");
    assert!(matches!(
        circuit.read_notify_request(&unconnected, FieldType::Double as u16, 1, 1),
        Err(CircuitError::NotConnected)
    ));

    circuit
        .read_notify_request(&chan, FieldType::Double as u16, 16, 321)
        .unwrap();
    let frames = decode_frames(&circuit.drain_staged_bytes());
    assert_eq!(frames.len(), 1);
    let (hdr, body) = &frames[0];
    assert_eq!(hdr.command, Command::ReadNotify as u16);
    assert_eq!(hdr.payload_size, 0);
    assert_eq!(hdr.element_count, 16);
    assert_eq!(hdr.param1, 0x9A);
    assert_eq!(hdr.param2, 321);
    assert!(body.is_empty());
}

#[test]
fn read_notify_respects_body_cache_ceiling() {
    let (circuit, _) = test_circuit(ProtocolVersion::CURRENT);
    circuit.drain_staged_bytes();
    let chan = ChannelBinding::new(5, "big:pv");
    chan.search_reply_set_up(0x9A, FieldType::Double, u32::MAX);
    chan.set_connected(true);

    let err = circuit
        .read_notify_request(&chan, FieldType::Double as u16, 10_000_000, 1)
        .unwrap_err();
    assert!(matches!(err, CircuitError::MsgBodyCacheTooSmall));
}

// ── Subscriptions ────────────────────────────────────────────────

#[test]
fn subscription_payload_layout() {
    let (circuit, _) = test_circuit(ProtocolVersion::CURRENT);
    circuit.drain_staged_bytes();
    let chan = connected_channel(5, 0x9A);

    circuit
        .subscription_request(&chan, FieldType::Double as u16, 4, 0x0005, 888)
        .unwrap();

    let frames = decode_frames(&circuit.drain_staged_bytes());
    let (hdr, body) = &frames[0];
    assert_eq!(hdr.command, Command::EventAdd as u16);
    assert_eq!(hdr.payload_size, 16);
    assert_eq!(hdr.param1, 0x9A);
    assert_eq!(hdr.param2, 888);
    // three vestigial floats, then the mask and its pad
    assert_eq!(&body[..12], &[0u8; 12]);
    assert_eq!(&body[12..14], &[0x00, 0x05]);
    assert_eq!(&body[14..16], &[0x00, 0x00]);
}

#[test]
fn subscription_on_unconnected_channel_is_silent() {
    let (circuit, _) = test_circuit(ProtocolVersion::CURRENT);
    circuit.drain_staged_bytes();

    let chan = ChannelBinding::new(5, "test:pv");
    circuit
        .subscription_request(&chan, FieldType::Double as u16, 1, 1, 888)
        .unwrap();
    assert!(circuit.drain_staged_bytes().is_empty());
}

#[test]
fn subscription_with_unknown_type_is_skipped() {
    let (circuit, _) = test_circuit(ProtocolVersion::CURRENT);
    circuit.drain_staged_bytes();

    let chan = connected_channel(5, 0x9A);
    circuit.subscription_request(&chan, 99, 1, 1, 888).unwrap();
    assert!(circuit.drain_staged_bytes().is_empty());
}

#[test]
fn subscription_cancel_layout() {
    let (circuit, _) = test_circuit(ProtocolVersion::CURRENT);
    circuit.drain_staged_bytes();
    let chan = connected_channel(5, 0x9A);

    circuit
        .subscription_cancel_request(&chan, FieldType::Double as u16, 4, 888)
        .unwrap();
    let frames = decode_frames(&circuit.drain_staged_bytes());
    let (hdr, body) = &frames[0];
    assert_eq!(hdr.command, Command::EventCancel as u16);
    assert_eq!(hdr.payload_size, 0);
    assert_eq!(hdr.element_count, 4);
    assert_eq!(hdr.param2, 888);
    assert!(body.is_empty());
}

// ── Channel membership ───────────────────────────────────────────

#[test]
fn install_channel_stages_claim_with_cid_and_name() {
    let (circuit, _) = test_circuit(ProtocolVersion::CURRENT);
    circuit.drain_staged_bytes();

    let chan = Arc::new(ChannelBinding::new(0xC1D, "ai:flow"));
    circuit
        .install_channel(Arc::clone(&chan), 0x51D, FieldType::Float, 1)
        .unwrap();

    assert_eq!(circuit.channel_count(), 1);
    assert_eq!(chan.sid(), 0x51D);
    assert_eq!(chan.field_type(), FieldType::Float);

    let frames = decode_frames(&circuit.drain_staged_bytes());
    let (hdr, body) = &frames[0];
    assert_eq!(hdr.command, Command::CreateChan as u16);
    assert_eq!(hdr.param1, 0xC1D);
    assert_eq!(hdr.param2, MINOR_PROTOCOL_REVISION as u32);
    assert_eq!(hdr.payload_size as usize, align8("ai:flow".len() + 1));
    assert_eq!(&body[..7], b"ai:flow");
    assert_eq!(body[7], 0);
}

#[test]
fn install_channel_pre_v44_claims_by_sid_without_name() {
    let (circuit, _) = test_circuit(ProtocolVersion(3));
    circuit.drain_staged_bytes();

    let chan = Arc::new(ChannelBinding::new(0xC1D, "ai:flow"));
    circuit
        .install_channel(chan, 0x51D, FieldType::Float, 1)
        .unwrap();

    let frames = decode_frames(&circuit.drain_staged_bytes());
    let (hdr, body) = &frames[0];
    assert_eq!(hdr.param1, 0x51D);
    assert_eq!(hdr.payload_size, 0);
    assert!(body.is_empty());
}

#[test]
fn uninstalling_last_channel_begins_clean_shutdown() {
    let (circuit, _) = test_circuit(ProtocolVersion::CURRENT);
    circuit.lock().state.connect_ok();

    let a = Arc::new(ChannelBinding::new(1, "a"));
    let b = Arc::new(ChannelBinding::new(2, "b"));
    circuit
        .install_channel(a, 10, FieldType::Long, 1)
        .unwrap();
    circuit
        .install_channel(b, 11, FieldType::Long, 1)
        .unwrap();

    circuit.uninstall_channel(1);
    assert_eq!(circuit.state(), CircuitState::Connected);

    circuit.uninstall_channel(2);
    assert_eq!(circuit.state(), CircuitState::CleanShutdown);
}

#[tokio::test]
async fn remove_all_channels_clears_connected_ones() {
    let (circuit, client) = test_circuit(ProtocolVersion::CURRENT);
    circuit.drain_staged_bytes();

    let claimed = Arc::new(ChannelBinding::new(1, "claimed:pv"));
    let pending = Arc::new(ChannelBinding::new(2, "pending:pv"));
    circuit
        .install_channel(Arc::clone(&claimed), 10, FieldType::Long, 1)
        .unwrap();
    circuit
        .install_channel(Arc::clone(&pending), 11, FieldType::Long, 1)
        .unwrap();
    claimed.set_connected(true);
    circuit.drain_staged_bytes();

    let guard = circuit.lock_callbacks().await;
    circuit.remove_all_channels(&guard);
    drop(guard);

    assert_eq!(circuit.channel_count(), 0);
    assert_eq!(client.chan_disconnects.load(Ordering::Relaxed), 2);

    // only the claimed channel got a release on the wire
    let frames = decode_frames(&circuit.drain_staged_bytes());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0.command, Command::ClearChannel as u16);
    assert_eq!(frames[0].0.param1, 10);
    assert_eq!(frames[0].0.param2, 1);
}

// ── Probes and backlog ───────────────────────────────────────────

#[test]
fn echo_probe_style_follows_version() {
    let (new, _) = test_circuit(ProtocolVersion::CURRENT);
    assert!(new.set_echo_request_pending());

    let (old, _) = test_circuit(ProtocolVersion(0));
    assert!(!old.set_echo_request_pending());
}

#[tokio::test]
async fn backlog_wait_returns_at_once_when_not_connected() {
    let (circuit, _) = test_circuit(ProtocolVersion::CURRENT);
    // still Connecting: the wait must not park
    circuit.block_until_send_backlog_reasonable().await;
    assert_eq!(circuit.lock().flags.blocking_writers, 0);
}
