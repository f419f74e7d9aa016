use std::time::Duration;

use talkback_core::types::SessionState;

/// What the presentation layer should do after an observation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeUp {
    /// Re-run the observation cycle after this delay.
    After(Duration),
    /// Don't schedule anything; wait for the next user action.
    Idle,
}

impl WakeUp {
    pub fn delay(self) -> Option<Duration> {
        match self {
            WakeUp::After(d) => Some(d),
            WakeUp::Idle => None,
        }
    }
}

/// Decides the refresh cadence of a polling front end.
///
/// Holds only its two intervals; every decision is a pure function of the inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingScheduler {
    live_interval: Duration,
    drain_interval: Duration,
}

impl Default for PollingScheduler {
    fn default() -> Self {
        Self {
            live_interval: Self::LIVE_INTERVAL,
            drain_interval: Self::DRAIN_INTERVAL,
        }
    }
}

impl PollingScheduler {
    pub const LIVE_INTERVAL: Duration = Duration::from_millis(500);
    pub const DRAIN_INTERVAL: Duration = Duration::from_millis(100);

    pub fn new(live_interval: Duration, drain_interval: Duration) -> Self {
        Self {
            live_interval,
            drain_interval,
        }
    }

    pub fn next_wakeup(&self, state: SessionState, pending_messages: usize) -> WakeUp {
        if state.is_running() {
            // Bounds transcript staleness during a live session.
            WakeUp::After(self.live_interval)
        } else if pending_messages > 0 {
            // Flush what the worker left behind right after it exits.
            WakeUp::After(self.drain_interval)
        } else {
            WakeUp::Idle
        }
    }
}
