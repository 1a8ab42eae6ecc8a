use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Lifecycle state of a managed thread.
///
/// `Init` and `Exited` are entered automatically and cannot be requested.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum State {
    /// Not started, or "no pending request" when used as a requested state.
    #[default]
    Invalid = 0,
    /// Started but has not yet reached its first checkpoint.
    Init = 1,
    /// Parked inside a checkpoint until another state is requested.
    Idle = 2,
    /// Cycling through checkpoints.
    Go = 3,
    Exiting = 4,
    Exited = 5,
}

impl State {
    pub(crate) const COUNT: usize = 6;

    #[inline]
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => State::Init,
            2 => State::Idle,
            3 => State::Go,
            4 => State::Exiting,
            5 => State::Exited,
            _ => State::Invalid,
        }
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }

    /// True for `Exiting` and `Exited`.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Exiting | State::Exited)
    }

    /// Whether the state may be passed to `request_state`.
    #[inline]
    pub fn is_requestable(self) -> bool {
        matches!(self, State::Idle | State::Go | State::Exiting)
    }

    /// Renders `Invalid` as `invalid_str`, every other state by name.
    pub fn name_or(self, invalid_str: &'static str) -> &'static str {
        match self {
            State::Invalid => invalid_str,
            other => other.name(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            State::Invalid => "Invalid",
            State::Init => "Initializing",
            State::Idle => "Idle",
            State::Go => "Go",
            State::Exiting => "Exiting",
            State::Exited => "Exited",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How long a checkpoint sleeps when no state change is pending.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleWait {
    /// The period is the total time between consecutive checkpoints; body
    /// execution time is subtracted from the sleep.
    #[default]
    Absolute,
    /// Always sleep the full period regardless of body execution time.
    Relative,
    /// Sleep until woken; cycles are stepped manually via `run_n_cycles`.
    Indefinite,
}

impl fmt::Display for CycleWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleWait::Absolute => f.write_str("Absolute"),
            CycleWait::Relative => f.write_str("Relative"),
            CycleWait::Indefinite => f.write_str("Indefinite"),
        }
    }
}

/// Signal returned by `checkpoint` to the thread body's loop.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CheckpointResult {
    /// Execute the next cycle.
    Continue,
    /// Leave the loop and return from the body.
    Exit,
}

impl CheckpointResult {
    #[inline]
    pub fn is_continue(self) -> bool {
        self == CheckpointResult::Continue
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Blocking {
    On,
    Off,
}

/// How long a request or wait may block.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WaitMode {
    /// Return right after submitting.
    NoWait,
    /// Block at most this long.
    For(Duration),
    /// Block until satisfied.
    Forever,
}

impl WaitMode {
    #[inline]
    pub fn is_blocking(self) -> bool {
        self != WaitMode::NoWait
    }
}

impl From<Blocking> for WaitMode {
    fn from(block: Blocking) -> Self {
        match block {
            Blocking::On => WaitMode::Forever,
            Blocking::Off => WaitMode::NoWait,
        }
    }
}

/// `Duration::ZERO` means "don't block" and `Duration::MAX` means "block forever".
impl From<Duration> for WaitMode {
    fn from(timeout: Duration) -> Self {
        if timeout.is_zero() {
            WaitMode::NoWait
        } else if timeout == Duration::MAX {
            WaitMode::Forever
        } else {
            WaitMode::For(timeout)
        }
    }
}

/// Handle returned by listener registration.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Consistent snapshot of a managed thread, captured under its state lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadStatus {
    pub name: String,
    pub started: bool,
    pub state: State,
    pub requested_state: State,
    pub prev_state: State,
    pub cycle_count: u64,
    pub cycle_wait: CycleWait,
    pub cycle_wait_period: Duration,
    pub is_paused: bool,
    pub pause_pending: bool,
    pub cycle_skip_remaining: u64,
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.name.is_empty() {
            "(none)"
        } else {
            self.name.as_str()
        };
        let initialized = match (self.started, self.state) {
            (false, _) => "no",
            (true, State::Invalid) => "(invalid state)",
            (true, State::Init) => "in progress",
            (true, _) => "yes",
        };
        write!(
            f,
            "name = {name}, initialized = {initialized}, current state = \"{}\", \
             pending state = \"{}\", cycle count = {}, cycle wait type = \"{}\", \
             cycle wait period = {} us, paused = {}",
            self.state,
            self.requested_state.name_or("(none)"),
            self.cycle_count,
            self.cycle_wait,
            self.cycle_wait_period.as_micros(),
            self.is_paused,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            State::Invalid,
            State::Init,
            State::Idle,
            State::Go,
            State::Exiting,
            State::Exited,
        ] {
            assert_eq!(State::from_u8(state as u8), state);
        }
        assert_eq!(State::from_u8(42), State::Invalid);
    }

    #[test]
    fn only_idle_go_exiting_are_requestable() {
        assert!(State::Go.is_requestable());
        assert!(State::Idle.is_requestable());
        assert!(State::Exiting.is_requestable());
        assert!(!State::Init.is_requestable());
        assert!(!State::Exited.is_requestable());
        assert!(!State::Invalid.is_requestable());
    }

    #[test]
    fn wait_mode_from_duration_sentinels() {
        assert_eq!(WaitMode::from(Duration::ZERO), WaitMode::NoWait);
        assert_eq!(WaitMode::from(Duration::MAX), WaitMode::Forever);
        assert_eq!(
            WaitMode::from(Duration::from_millis(5)),
            WaitMode::For(Duration::from_millis(5))
        );
        assert_eq!(WaitMode::from(Blocking::On), WaitMode::Forever);
        assert!(!WaitMode::from(Blocking::Off).is_blocking());
    }

    #[test]
    fn status_renders_pending_none() {
        let status = ThreadStatus {
            name: "w".into(),
            started: true,
            state: State::Idle,
            requested_state: State::Invalid,
            prev_state: State::Init,
            cycle_count: 1,
            cycle_wait: CycleWait::Relative,
            cycle_wait_period: Duration::from_millis(2),
            is_paused: false,
            pause_pending: false,
            cycle_skip_remaining: 0,
        };
        let text = status.to_string();
        assert!(text.contains("pending state = \"(none)\""));
        assert!(text.contains("cycle wait period = 2000 us"));
        assert!(text.contains("initialized = yes"));
    }
}
