//! The circuit's two watchdog timers.
//!
//! Both are deadline timers of identical construction with distinct
//! semantics:
//!
//! - the **receive watchdog** converts inbound silence into a liveness
//!   probe and, failing that, a declared-dead circuit;
//! - the **send watchdog** bounds each socket send (and the initial
//!   connect); expiry interrupts the blocked operation and aborts the
//!   circuit.
//!
//! The engines do not block *in* the watchdog; they bound their own
//! socket waits with [`remaining`](Watchdog::remaining) and consult the
//! dog when the bound elapses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A one-shot rearm/cancel deadline timer.
#[derive(Debug)]
pub struct Watchdog {
    period: Duration,
    deadline: Mutex<Option<Instant>>,
}

impl Watchdog {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            deadline: Mutex::new(None),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Push the deadline a full period into the future.
    pub fn rearm(&self) {
        *self.lock() = Some(Instant::now() + self.period);
    }

    /// Disarm entirely.
    pub fn cancel(&self) {
        *self.lock() = None;
    }

    pub fn armed(&self) -> bool {
        self.lock().is_some()
    }

    /// Time left before expiry; a disarmed dog reports a full period so
    /// callers always have a finite wait bound.
    pub fn remaining(&self) -> Duration {
        match *self.lock() {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => self.period,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.deadline.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── ReceiveWatchdog ──────────────────────────────────────────────

/// Verdict when the receive watchdog's deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvExpiry {
    /// First silent period: send a liveness probe and wait one more.
    Probe,
    /// The probe went unanswered. The circuit is dead.
    Dead,
}

/// Connection-activity watchdog on the inbound side.
#[derive(Debug)]
pub struct ReceiveWatchdog {
    dog: Watchdog,
    probe_outstanding: AtomicBool,
}

impl ReceiveWatchdog {
    pub fn new(period: Duration) -> Self {
        Self {
            dog: Watchdog::new(period),
            probe_outstanding: AtomicBool::new(false),
        }
    }

    /// Arm when the circuit reaches the connected state.
    pub fn connect_notify(&self) {
        self.probe_outstanding.store(false, Ordering::Relaxed);
        self.dog.rearm();
    }

    /// Any successful inbound read proves the peer alive.
    pub fn message_arrival_notify(&self) {
        self.probe_outstanding.store(false, Ordering::Relaxed);
        self.dog.rearm();
    }

    /// A large outbound backlog is being ACKed by the peer's TCP stack,
    /// so inbound silence is not yet proof of death. Defers the
    /// deadline without settling an outstanding probe.
    pub fn send_backlog_progress_notify(&self) {
        self.dog.rearm();
    }

    pub fn remaining(&self) -> Duration {
        self.dog.remaining()
    }

    pub fn cancel(&self) {
        self.dog.cancel();
    }

    /// Called when a bounded wait elapsed with no inbound traffic.
    pub fn on_expire(&self) -> RecvExpiry {
        if self.probe_outstanding.swap(true, Ordering::Relaxed) {
            RecvExpiry::Dead
        } else {
            self.dog.rearm();
            RecvExpiry::Probe
        }
    }
}

// ── SendWatchdog ─────────────────────────────────────────────────

/// Progress watchdog armed around each socket send and the initial
/// connect.
#[derive(Debug)]
pub struct SendWatchdog {
    dog: Watchdog,
}

impl SendWatchdog {
    pub fn new(period: Duration) -> Self {
        Self {
            dog: Watchdog::new(period),
        }
    }

    pub fn start(&self) {
        self.dog.rearm();
    }

    /// Progress was made; restart the clock.
    pub fn progress_notify(&self) {
        self.dog.rearm();
    }

    pub fn cancel(&self) {
        self.dog.cancel();
    }

    pub fn remaining(&self) -> Duration {
        self.dog.remaining()
    }

    pub fn period(&self) -> Duration {
        self.dog.period()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rearm_and_cancel() {
        let dog = Watchdog::new(Duration::from_secs(10));
        assert!(!dog.armed());
        assert_eq!(dog.remaining(), Duration::from_secs(10));

        dog.rearm();
        assert!(dog.armed());
        let left = dog.remaining();
        assert!(left <= Duration::from_secs(10));
        assert!(left > Duration::from_secs(9));

        dog.cancel();
        assert!(!dog.armed());
    }

    #[test]
    fn expired_deadline_reports_zero() {
        let dog = Watchdog::new(Duration::from_millis(1));
        dog.rearm();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(dog.remaining(), Duration::ZERO);
    }

    #[test]
    fn receive_dog_probes_once_then_declares_dead() {
        let dog = ReceiveWatchdog::new(Duration::from_secs(1));
        dog.connect_notify();

        assert_eq!(dog.on_expire(), RecvExpiry::Probe);
        assert_eq!(dog.on_expire(), RecvExpiry::Dead);
    }

    #[test]
    fn message_arrival_settles_outstanding_probe() {
        let dog = ReceiveWatchdog::new(Duration::from_secs(1));
        dog.connect_notify();

        assert_eq!(dog.on_expire(), RecvExpiry::Probe);
        dog.message_arrival_notify();
        assert_eq!(dog.on_expire(), RecvExpiry::Probe);
    }

    #[test]
    fn backlog_progress_defers_without_settling() {
        let dog = ReceiveWatchdog::new(Duration::from_secs(1));
        dog.connect_notify();

        assert_eq!(dog.on_expire(), RecvExpiry::Probe);
        dog.send_backlog_progress_notify();
        // deadline moved but the probe is still unanswered
        assert_eq!(dog.on_expire(), RecvExpiry::Dead);
    }
}
