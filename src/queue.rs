//! Send and receive queues.
//!
//! The send queue is the producer/consumer ring between user threads
//! (staging whole messages under the circuit mutex) and the send engine
//! (popping buffers to drain onto the socket). Staging is transactional:
//! a [`SendMsgMinder`] rolls back every byte staged in its scope unless
//! `commit()` is called, so a mid-construction failure never puts a
//! truncated header on the stream.
//!
//! The receive queue is the symmetric ingress structure: buffers arrive
//! whole from the socket and the protocol parser pops typed fields and
//! body bytes out of it, deferring whenever it runs dry.

use std::collections::VecDeque;

use bytes::{Buf, BytesMut};

use crate::buffer::FrameBuf;
use crate::error::CircuitError;
use crate::header::MsgHeader;
use crate::proto::{HEADER_BYTES, MAX_TCP_FRAME};

/// Staged bytes that trigger an early drain by the send engine.
pub const EARLY_FLUSH_BYTES: usize = MAX_TCP_FRAME;

/// Staged bytes past which producers must park until the engine drains.
pub const FLUSH_BLOCK_BYTES: usize = 16 * MAX_TCP_FRAME;

const NIL_BYTES: [u8; 8] = [0u8; 8];

// ── SendQueue ────────────────────────────────────────────────────

/// Ordered frame buffers awaiting transmission.
pub struct SendQueue {
    bufs: VecDeque<FrameBuf>,
    occupied: usize,
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            bufs: VecDeque::new(),
            occupied: 0,
        }
    }

    /// Total staged bytes not yet handed to the socket.
    pub fn occupied_bytes(&self) -> usize {
        self.occupied
    }

    /// Would adding `extra` bytes cross the early-flush threshold?
    pub fn flush_early_threshold(&self, extra: usize) -> bool {
        self.occupied + extra >= EARLY_FLUSH_BYTES
    }

    /// Would adding `extra` bytes cross the producer-blocking threshold?
    pub fn flush_block_threshold(&self, extra: usize) -> bool {
        self.occupied + extra >= FLUSH_BLOCK_BYTES
    }

    /// Stage raw bytes, spanning buffer boundaries as needed.
    pub fn push_bytes(&mut self, mut src: &[u8]) {
        while !src.is_empty() {
            let need_fresh = self.bufs.back().map_or(true, FrameBuf::is_full);
            if need_fresh {
                self.bufs.push_back(FrameBuf::new());
            }
            let back = self.bufs.back_mut().expect("buffer just ensured");
            let n = back.push_bytes(src);
            src = &src[n..];
            self.occupied += n;
        }
    }

    pub fn push_u8(&mut self, v: u8) {
        self.push_bytes(&[v]);
    }

    pub fn push_u16(&mut self, v: u16) {
        self.push_bytes(&v.to_be_bytes());
    }

    pub fn push_u32(&mut self, v: u32) {
        self.push_bytes(&v.to_be_bytes());
    }

    pub fn push_f32(&mut self, v: f32) {
        self.push_bytes(&v.to_be_bytes());
    }

    /// Stage `n` zero bytes (payload alignment padding).
    pub fn push_zeros(&mut self, mut n: usize) {
        while n > 0 {
            let k = n.min(NIL_BYTES.len());
            self.push_bytes(&NIL_BYTES[..k]);
            n -= k;
        }
    }

    /// Stage a string with its terminating NUL, zero-padded out to
    /// `padded_len` (an 8-byte multiple the caller computed).
    pub fn push_string(&mut self, s: &str, padded_len: usize) {
        debug_assert!(padded_len >= s.len() + 1);
        self.push_bytes(s.as_bytes());
        self.push_zeros(padded_len - s.len());
    }

    /// Stage a request header in the compact or extended form.
    ///
    /// The extended form needs protocol v4.9; staging an oversized
    /// header on an older circuit is refused rather than silently
    /// corrupting the stream.
    pub fn insert_request_header(
        &mut self,
        command: u16,
        payload_size: u32,
        data_type: u16,
        element_count: u32,
        param1: u32,
        param2: u32,
        v49: bool,
    ) -> Result<(), CircuitError> {
        let hdr = MsgHeader::new(
            command,
            payload_size,
            data_type,
            element_count,
            param1,
            param2,
        );
        if hdr.needs_extension() && !v49 {
            return Err(CircuitError::UnsupportedByService);
        }
        let mut scratch = [0u8; HEADER_BYTES + 8];
        let mut cursor = &mut scratch[..];
        hdr.encode_into(&mut cursor);
        let written = hdr.wire_len();
        self.push_bytes(&scratch[..written]);
        Ok(())
    }

    /// Hand the next buffer to the send engine.
    pub fn pop_next_buffer_to_send(&mut self) -> Option<FrameBuf> {
        let buf = self.bufs.pop_front()?;
        self.occupied -= buf.occupied();
        Some(buf)
    }

    /// Discard everything still staged (the circuit is dead).
    pub fn clear(&mut self) {
        self.bufs.clear();
        self.occupied = 0;
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ── SendMsgMinder ────────────────────────────────────────────────

/// Transactional staging scope over the send queue.
///
/// Created at the start of message construction (with the circuit mutex
/// held), dereferences to the queue for staging, and rolls back to the
/// acquisition mark on drop unless [`commit`](SendMsgMinder::commit) was
/// called.
pub struct SendMsgMinder<'a> {
    queue: &'a mut SendQueue,
    mark_bufs: usize,
    mark_last_occupied: usize,
    committed: bool,
}

impl<'a> SendMsgMinder<'a> {
    pub fn new(queue: &'a mut SendQueue) -> Self {
        let mark_bufs = queue.bufs.len();
        let mark_last_occupied = queue.bufs.back().map_or(0, FrameBuf::occupied);
        Self {
            queue,
            mark_bufs,
            mark_last_occupied,
            committed: false,
        }
    }

    /// Make everything staged in this scope visible to the send engine.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl std::ops::Deref for SendMsgMinder<'_> {
    type Target = SendQueue;

    fn deref(&self) -> &SendQueue {
        self.queue
    }
}

impl std::ops::DerefMut for SendMsgMinder<'_> {
    fn deref_mut(&mut self) -> &mut SendQueue {
        self.queue
    }
}

impl Drop for SendMsgMinder<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        while self.queue.bufs.len() > self.mark_bufs {
            let buf = self.queue.bufs.pop_back().expect("length just checked");
            self.queue.occupied -= buf.occupied();
        }
        if let Some(last) = self.queue.bufs.back_mut() {
            self.queue.occupied -= last.occupied() - self.mark_last_occupied;
            last.truncate(self.mark_last_occupied);
        }
    }
}

// ── RecvQueue ────────────────────────────────────────────────────

/// Ingress byte accumulation feeding the protocol parser.
pub struct RecvQueue {
    buf: BytesMut,
}

impl RecvQueue {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(2 * MAX_TCP_FRAME),
        }
    }

    pub fn occupied_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Append one received frame.
    pub fn push_frame(&mut self, frame: &[u8]) {
        self.buf.extend_from_slice(frame);
    }

    /// Pop a compact message header, or defer if not enough bytes.
    pub fn pop_header(&mut self) -> Option<MsgHeader> {
        if self.buf.len() < HEADER_BYTES {
            return None;
        }
        MsgHeader::decode(&mut self.buf).ok()
    }

    pub fn pop_u16(&mut self) -> Option<u16> {
        if self.buf.len() < 2 {
            return None;
        }
        Some(self.buf.get_u16())
    }

    pub fn pop_u32(&mut self) -> Option<u32> {
        if self.buf.len() < 4 {
            return None;
        }
        Some(self.buf.get_u32())
    }

    /// Move up to `want` bytes into `dst`; returns the number moved.
    pub fn copy_out_bytes(&mut self, dst: &mut BytesMut, want: usize) -> usize {
        let n = want.min(self.buf.len());
        dst.extend_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        n
    }

    /// Drop up to `n` bytes (oversize payload discard); returns the
    /// number dropped.
    pub fn skip_bytes(&mut self, n: usize) -> usize {
        let k = n.min(self.buf.len());
        self.buf.advance(k);
        k
    }
}

impl Default for RecvQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_and_pop_preserve_order() {
        let mut q = SendQueue::new();
        q.push_bytes(b"abc");
        q.push_u16(0x0102);
        assert_eq!(q.occupied_bytes(), 5);

        let buf = q.pop_next_buffer_to_send().unwrap();
        assert_eq!(buf.occupied_slice(), &[b'a', b'b', b'c', 0x01, 0x02]);
        assert_eq!(q.occupied_bytes(), 0);
        assert!(q.pop_next_buffer_to_send().is_none());
    }

    #[test]
    fn staging_spans_buffers() {
        let mut q = SendQueue::new();
        let big = vec![0xAB; MAX_TCP_FRAME + 100];
        q.push_bytes(&big);
        assert_eq!(q.occupied_bytes(), MAX_TCP_FRAME + 100);

        let first = q.pop_next_buffer_to_send().unwrap();
        assert_eq!(first.occupied(), MAX_TCP_FRAME);
        let second = q.pop_next_buffer_to_send().unwrap();
        assert_eq!(second.occupied(), 100);
    }

    #[test]
    fn minder_commit_keeps_bytes() {
        let mut q = SendQueue::new();
        let mut minder = SendMsgMinder::new(&mut q);
        minder
            .insert_request_header(4, 8, 6, 1, 10, 20, true)
            .unwrap();
        minder.push_zeros(8);
        minder.commit();
        assert_eq!(q.occupied_bytes(), HEADER_BYTES + 8);
    }

    #[test]
    fn minder_drop_rolls_back() {
        let mut q = SendQueue::new();
        q.push_bytes(b"keepme");
        {
            let mut minder = SendMsgMinder::new(&mut q);
            minder
                .insert_request_header(4, 8, 6, 1, 10, 20, true)
                .unwrap();
            minder.push_zeros(8);
            // dropped without commit
        }
        assert_eq!(q.occupied_bytes(), 6);
        let buf = q.pop_next_buffer_to_send().unwrap();
        assert_eq!(buf.occupied_slice(), b"keepme");
    }

    #[test]
    fn minder_rollback_across_buffer_boundary() {
        let mut q = SendQueue::new();
        q.push_bytes(&vec![1u8; MAX_TCP_FRAME - 4]);
        {
            let mut minder = SendMsgMinder::new(&mut q);
            minder.push_bytes(&vec![2u8; 64]); // spills into a second buffer
        }
        assert_eq!(q.occupied_bytes(), MAX_TCP_FRAME - 4);
        let buf = q.pop_next_buffer_to_send().unwrap();
        assert_eq!(buf.occupied(), MAX_TCP_FRAME - 4);
        assert!(q.pop_next_buffer_to_send().is_none());
    }

    #[test]
    fn thresholds() {
        let mut q = SendQueue::new();
        assert!(!q.flush_early_threshold(0));
        assert!(q.flush_early_threshold(EARLY_FLUSH_BYTES));

        q.push_bytes(&vec![0u8; EARLY_FLUSH_BYTES]);
        assert!(q.flush_early_threshold(0));
        assert!(!q.flush_block_threshold(0));

        q.push_bytes(&vec![0u8; FLUSH_BLOCK_BYTES - EARLY_FLUSH_BYTES]);
        assert!(q.flush_block_threshold(0));
    }

    #[test]
    fn extended_header_staging_needs_v49() {
        let mut q = SendQueue::new();
        let err = q
            .insert_request_header(4, 0x10000, 6, 1, 0, 0, false)
            .unwrap_err();
        assert!(matches!(err, CircuitError::UnsupportedByService));
        assert_eq!(q.occupied_bytes(), 0);

        q.insert_request_header(4, 0x10000, 6, 1, 0, 0, true)
            .unwrap();
        assert_eq!(q.occupied_bytes(), HEADER_BYTES + 8);
    }

    #[test]
    fn push_string_pads_with_zeros() {
        let mut q = SendQueue::new();
        q.push_string("host7", 8);
        let buf = q.pop_next_buffer_to_send().unwrap();
        assert_eq!(buf.occupied_slice(), b"host7\0\0\0");
        assert_eq!(crate::proto::string_from_padded(buf.occupied_slice()), "host7");
    }

    #[test]
    fn recv_queue_typed_pops() {
        let mut q = RecvQueue::new();
        q.push_frame(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(q.pop_u16(), Some(0x0102));
        assert_eq!(q.pop_u32(), Some(0x03040506));
        assert_eq!(q.pop_u16(), None);
    }

    #[test]
    fn recv_queue_defers_short_header() {
        let mut q = RecvQueue::new();
        q.push_frame(&[0u8; HEADER_BYTES - 1]);
        assert!(q.pop_header().is_none());
        q.push_frame(&[0u8; 1]);
        let hdr = q.pop_header().unwrap();
        assert_eq!(hdr.command, 0);
        assert_eq!(q.occupied_bytes(), 0);
    }

    #[test]
    fn recv_queue_copy_out_and_skip() {
        let mut q = RecvQueue::new();
        q.push_frame(b"0123456789");

        let mut dst = BytesMut::new();
        assert_eq!(q.copy_out_bytes(&mut dst, 4), 4);
        assert_eq!(&dst[..], b"0123");

        assert_eq!(q.skip_bytes(3), 3);
        assert_eq!(q.skip_bytes(100), 3);
        assert_eq!(q.occupied_bytes(), 0);
    }
}
