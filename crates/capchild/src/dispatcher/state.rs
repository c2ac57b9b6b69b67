//! Session state shared between the reader thread and its observers.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use tracing::warn;

use super::DISPATCH_TARGET;

/// Lifecycle of a capture session.
///
/// States only move forward: `Init`, `AwaitingFirstSignal`, `Running`,
/// `Stopping`, then one of the terminal states `Stopped` or `Failed`. Any
/// state may jump ahead, for example straight to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Nothing has been launched yet.
    Init,
    /// The worker is starting; no capture file has been announced.
    AwaitingFirstSignal,
    /// The worker announced its first capture file.
    Running,
    /// A stop was requested; messages are still being delivered.
    Stopping,
    /// The worker finished and every message was delivered.
    Stopped,
    /// The session ended through an error.
    Failed,
}

impl SessionState {
    const fn rank(self) -> u8 {
        match self {
            Self::Init => 0,
            Self::AwaitingFirstSignal => 1,
            Self::Running => 2,
            Self::Stopping => 3,
            Self::Stopped | Self::Failed => 4,
        }
    }

    const fn code(self) -> u8 {
        match self {
            Self::Init => 0,
            Self::AwaitingFirstSignal => 1,
            Self::Running => 2,
            Self::Stopping => 3,
            Self::Stopped => 4,
            Self::Failed => 5,
        }
    }

    const fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Init,
            1 => Self::AwaitingFirstSignal,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::Failed,
        }
    }

    /// Whether the session has ended.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether moving from `self` to `next` goes forward.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// Stable name used in logs and output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::AwaitingFirstSignal => "awaiting_first_signal",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct StatusCells {
    state: AtomicU8,
    packets: AtomicU64,
    drops: AtomicU64,
}

/// Live view of a session: its state and counters.
///
/// Clones share the same cells. Only the dispatcher writes them.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    cells: Arc<StatusCells>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStatus {
    /// A status in [`SessionState::Init`] with zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cells: Arc::new(StatusCells {
                state: AtomicU8::new(SessionState::Init.code()),
                packets: AtomicU64::new(0),
                drops: AtomicU64::new(0),
            }),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from_code(self.cells.state.load(Ordering::Acquire))
    }

    /// Packets reported since the session started.
    #[must_use]
    pub fn packets(&self) -> u64 {
        self.cells.packets.load(Ordering::Acquire)
    }

    /// Most recent drop count.
    #[must_use]
    pub fn drops(&self) -> u64 {
        self.cells.drops.load(Ordering::Acquire)
    }

    /// Moves to `next` if that goes forward. Returns whether the state changed.
    pub(crate) fn advance(&self, next: SessionState) -> bool {
        let result = self
            .cells
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |code| {
                SessionState::from_code(code)
                    .can_advance_to(next)
                    .then_some(next.code())
            });
        match result {
            Ok(_) => true,
            Err(code) => {
                let current = SessionState::from_code(code);
                if current != next {
                    warn!(
                        target: DISPATCH_TARGET,
                        from = %current,
                        to = %next,
                        "ignoring backwards session state transition"
                    );
                }
                false
            }
        }
    }

    pub(crate) fn add_packets(&self, count: u64) -> u64 {
        let previous = self
            .cells
            .packets
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                Some(total.saturating_add(count))
            })
            .unwrap_or_else(|total| total);
        previous.saturating_add(count)
    }

    pub(crate) fn set_drops(&self, count: u64) {
        self.cells.drops.store(count, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(SessionState::Init, SessionState::AwaitingFirstSignal, true)]
    #[case(SessionState::AwaitingFirstSignal, SessionState::Failed, true)]
    #[case(SessionState::Running, SessionState::Stopped, true)]
    #[case(SessionState::Stopping, SessionState::Running, false)]
    #[case(SessionState::Running, SessionState::Running, false)]
    #[case(SessionState::Stopped, SessionState::Failed, false)]
    #[case(SessionState::Failed, SessionState::Stopped, false)]
    fn transitions_only_move_forward(
        #[case] from: SessionState,
        #[case] to: SessionState,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_advance_to(to), allowed);
    }

    #[rstest]
    fn status_ignores_backwards_moves() {
        let status = SessionStatus::new();
        assert!(status.advance(SessionState::Running));
        assert!(!status.advance(SessionState::AwaitingFirstSignal));
        assert_eq!(status.state(), SessionState::Running);
        assert!(status.advance(SessionState::Stopped));
        assert!(!status.advance(SessionState::Failed));
        assert_eq!(status.state(), SessionState::Stopped);
    }

    #[rstest]
    fn counters_are_shared_between_clones() {
        let status = SessionStatus::new();
        let observer = status.clone();
        assert_eq!(status.add_packets(40), 40);
        assert_eq!(status.add_packets(2), 42);
        status.set_drops(3);
        assert_eq!(observer.packets(), 42);
        assert_eq!(observer.drops(), 3);
    }
}
