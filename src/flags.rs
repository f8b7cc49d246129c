//! The circuit flag word.
//!
//! Every field is guarded by the circuit mutex. The send engine owns
//! `flow_control_active`; the receive engine owns `busy_detected` and
//! the contiguous-frame counter behind it; the send engine reconciles
//! the two on each pass.

use crate::proto::FLOW_CONTROL_TRIGGER_FRAMES;

#[derive(Debug, Default)]
pub(crate) struct CircuitFlags {
    /// Receive engine has observed sustained inbound saturation.
    pub busy_detected: bool,
    /// We are currently asking the peer to pause subscription updates.
    pub flow_control_active: bool,
    /// A liveness probe must go out before the next flush.
    pub echo_pending: bool,
    /// The send queue crossed the early-flush threshold.
    pub early_flush: bool,
    /// Abort shutdown started; socket linger is zeroed.
    pub discarding_pending_data: bool,
    /// The socket handle is gone. Monotonic: never cleared once set.
    pub socket_closed: bool,
    /// The upper layer has received its (single) disconnect notice.
    pub disconnect_notified: bool,
    /// The upper layer asked for a flush once inbound parsing defers.
    pub recv_process_postponed_flush: bool,
    /// User threads parked waiting for the send queue to drain.
    pub blocking_writers: u32,
    /// Bytes handed to the kernel since the peer last showed life.
    pub unacked_send_bytes: usize,
    /// Contiguous inbound reads that filled the whole frame buffer.
    pub contig_recv_frames: u32,
}

impl CircuitFlags {
    /// Account one inbound read of `len` bytes into a buffer of
    /// `capacity`. Sustained full reads arm `busy_detected`; any
    /// partial read disarms it. Returns `true` when `busy_detected`
    /// changed, so the caller can poke the send engine.
    pub fn note_fill(&mut self, len: usize, capacity: usize) -> bool {
        let was_busy = self.busy_detected;
        if len == capacity {
            if self.contig_recv_frames >= FLOW_CONTROL_TRIGGER_FRAMES {
                self.busy_detected = true;
            } else {
                self.contig_recv_frames += 1;
            }
        } else {
            self.contig_recv_frames = 0;
            self.busy_detected = false;
        }
        // the peer is alive and sending; outbound silence is excused
        self.unacked_send_bytes = 0;
        self.busy_detected != was_busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_arms_after_trigger_count() {
        let mut flags = CircuitFlags::default();
        // 16 full frames only wind the counter up
        for _ in 0..FLOW_CONTROL_TRIGGER_FRAMES {
            assert!(!flags.note_fill(512, 512));
            assert!(!flags.busy_detected);
        }
        // the 17th arms busy detection
        assert!(flags.note_fill(512, 512));
        assert!(flags.busy_detected);
        // further full frames report no change
        assert!(!flags.note_fill(512, 512));
    }

    #[test]
    fn partial_read_disarms() {
        let mut flags = CircuitFlags::default();
        for _ in 0..=FLOW_CONTROL_TRIGGER_FRAMES {
            flags.note_fill(512, 512);
        }
        assert!(flags.busy_detected);

        assert!(flags.note_fill(100, 512));
        assert!(!flags.busy_detected);
        assert_eq!(flags.contig_recv_frames, 0);
    }

    #[test]
    fn fill_clears_unacked_send_bytes() {
        let mut flags = CircuitFlags::default();
        flags.unacked_send_bytes = 9000;
        flags.note_fill(10, 512);
        assert_eq!(flags.unacked_send_bytes, 0);
    }
}
