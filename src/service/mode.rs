//! # Controller modes and states.
//!
//! ```text
//!                 ┌──────────── retry / mode change ─────────────┐
//!                 ▼                                               │
//! NEW ──► DOWN ──► START_REQUESTED ──► STARTING ──► UP      START_FAILED
//!          ▲  ▲                            │         │            ▲
//!          │  └──── start failed ──────────┼─────────┼────────────┘
//!          │                               │         ▼
//!          └──────── STOPPING ◄──── STOP_REQUESTED ◄─┘
//!          │
//!          └──► REMOVING ──► REMOVED          NEW ──► CANCELLED (install undone)
//! ```

use std::fmt;

/// What a controller wants to do with its service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    /// Always start; demand dependencies.
    #[default]
    Active,
    /// Start when demanded or when all required dependencies are up.
    Passive,
    /// Start only while demanded.
    OnDemand,
    /// Start when first demanded, then stay up.
    Lazy,
    /// Never start.
    Never,
    /// Stop and remove.
    Remove,
}

impl Mode {
    pub fn as_label(&self) -> &'static str {
        match self {
            Mode::Active => "ACTIVE",
            Mode::Passive => "PASSIVE",
            Mode::OnDemand => "ON_DEMAND",
            Mode::Lazy => "LAZY",
            Mode::Never => "NEVER",
            Mode::Remove => "REMOVE",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    New,
    Down,
    StartRequested,
    Starting,
    Up,
    StopRequested,
    Stopping,
    StartFailed,
    Removing,
    Removed,
    Cancelled,
}

impl State {
    pub fn as_label(&self) -> &'static str {
        match self {
            State::New => "NEW",
            State::Down => "DOWN",
            State::StartRequested => "START_REQUESTED",
            State::Starting => "STARTING",
            State::Up => "UP",
            State::StopRequested => "STOP_REQUESTED",
            State::Stopping => "STOPPING",
            State::StartFailed => "START_FAILED",
            State::Removing => "REMOVING",
            State::Removed => "REMOVED",
            State::Cancelled => "CANCELLED",
        }
    }

    /// States a stability monitor waits for.
    pub fn is_stable(&self) -> bool {
        matches!(
            self,
            State::Down | State::Up | State::StartFailed | State::Removed | State::Cancelled
        )
    }

    /// The controller is no longer part of the live graph.
    pub fn is_gone(&self) -> bool {
        matches!(self, State::Removed | State::Cancelled)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_states() {
        let stable: Vec<State> = [
            State::New,
            State::Down,
            State::StartRequested,
            State::Starting,
            State::Up,
            State::StopRequested,
            State::Stopping,
            State::StartFailed,
            State::Removing,
            State::Removed,
            State::Cancelled,
        ]
        .into_iter()
        .filter(State::is_stable)
        .collect();
        assert_eq!(
            stable,
            [
                State::Down,
                State::Up,
                State::StartFailed,
                State::Removed,
                State::Cancelled
            ]
        );
    }

    #[test]
    fn labels() {
        assert_eq!(Mode::OnDemand.to_string(), "ON_DEMAND");
        assert_eq!(State::StopRequested.to_string(), "STOP_REQUESTED");
        assert_eq!(Mode::default(), Mode::Active);
    }
}
