//! Circuit connection state machine.
//!
//! Models the full lifecycle of one virtual circuit with validated
//! transitions. A transition method returns `true` when it applied and
//! `false` when the event is not legal from the current state; callers
//! treat `false` as "someone else already moved the state" and do not
//! repeat side effects.
//!
//! ```text
//!  Connecting ──► Connected ──► CleanShutdown
//!      │              │              │
//!      │              ├──────────────┼─────► AbortShutdown
//!      ▼              ▼              ▼            │
//!  Disconnected ◄─────┴──────────────┴────────────┘
//! ```

use std::fmt;

/// The current phase of a virtual circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    /// TCP connection initiated but not yet established.
    #[default]
    Connecting,

    /// Link is up; requests and responses flow.
    Connected,

    /// Draining queued writes before an orderly write-side half-close.
    CleanShutdown,

    /// Discarding pending data; engines are being jolted out of the
    /// kernel.
    AbortShutdown,

    /// Terminal. The upper layer reaps the circuit from here.
    Disconnected,
}

impl CircuitState {
    /// Fully established and ready for protocol traffic.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// May bytes still be placed on / taken off the socket?
    pub fn sendable(self) -> bool {
        matches!(self, Self::Connected | Self::CleanShutdown)
    }

    /// No further transitions except teardown.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected)
    }

    // ── Transitions ──────────────────────────────────────────────

    /// The initial `connect` completed.
    ///
    /// Valid from: `Connecting`.
    pub fn connect_ok(&mut self) -> bool {
        if *self == Self::Connecting {
            *self = Self::Connected;
            true
        } else {
            false
        }
    }

    /// The last channel left, or the user asked for an orderly close.
    ///
    /// Valid from: `Connected`.
    pub fn begin_clean_shutdown(&mut self) -> bool {
        if *self == Self::Connected {
            *self = Self::CleanShutdown;
            true
        } else {
            false
        }
    }

    /// Protocol corruption, watchdog expiry, or explicit teardown.
    ///
    /// Valid from anything that is not already `AbortShutdown` or
    /// `Disconnected`.
    pub fn begin_abort_shutdown(&mut self) -> bool {
        match *self {
            Self::AbortShutdown | Self::Disconnected => false,
            _ => {
                *self = Self::AbortShutdown;
                true
            }
        }
    }

    /// The peer closed, connect failed, or an I/O error ended the
    /// circuit.
    ///
    /// Valid from: `Connecting`, `Connected`, `CleanShutdown`.
    /// `AbortShutdown` stays put — its teardown path owns the exit.
    pub fn disconnect(&mut self) -> bool {
        match *self {
            Self::Connecting | Self::Connected | Self::CleanShutdown => {
                *self = Self::Disconnected;
                true
            }
            Self::AbortShutdown | Self::Disconnected => false,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::CleanShutdown => "CleanShutdown",
            Self::AbortShutdown => "AbortShutdown",
            Self::Disconnected => "Disconnected",
        };
        f.write_str(name)
    }
}
