//! Deterministic replay clock and wake-up timer bookkeeping
//!
//! During replay `now_ms` follows the recorded event timestamps; live batches
//! follow the wall clock. Time never moves backwards.

use chrono::Utc;

/// Reserved prefix for the executor's own wake-up timers
///
/// A wake-up timer exists only to make the service schedule a workflow task
/// when the program can progress again; its fired event is dropped rather
/// than delivered to the program.
pub const WAKE_TIMER_ID_PREFIX: &str = "force-immediate-workflow-task";

/// Errors from wake-up reconciliation
#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    /// The program asked to wake up in the past
    #[error("next wake-up time {wake_at_ms} is before the current replay time {now_ms}")]
    NegativeDelay { wake_at_ms: i64, now_ms: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct WakeTimer {
    timer_id: String,
    wake_at_ms: i64,
}

/// Deterministic clock for one workflow run
#[derive(Debug)]
pub struct ReplayClock {
    current_time_ms: i64,
    replaying: bool,
    active_wake: Option<WakeTimer>,
    wake_counter: u64,
}

impl Default for ReplayClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayClock {
    pub fn new() -> Self {
        Self {
            current_time_ms: 0,
            replaying: true,
            active_wake: None,
            wake_counter: 0,
        }
    }

    /// Current workflow time in epoch milliseconds
    pub fn now_ms(&self) -> i64 {
        self.current_time_ms
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    pub fn set_replaying(&mut self, replaying: bool) {
        self.replaying = replaying;
    }

    /// Advance to the given time; earlier times are ignored
    pub fn advance_to(&mut self, time_ms: i64) {
        if time_ms > self.current_time_ms {
            self.current_time_ms = time_ms;
        }
    }

    /// Advance to the wall clock (live batches only)
    pub fn advance_to_wall_clock(&mut self) {
        self.advance_to(Utc::now().timestamp_millis());
    }

    /// Check whether a timer id belongs to the executor's wake machinery
    pub fn is_wake_timer(timer_id: &str) -> bool {
        timer_id.starts_with(WAKE_TIMER_ID_PREFIX)
    }

    /// Wake-at time of the active wake timer, if one is scheduled
    pub fn active_wake_at_ms(&self) -> Option<i64> {
        self.active_wake.as_ref().map(|w| w.wake_at_ms)
    }

    /// Drop the active wake timer if it no longer matches the requested
    /// wake-up time, returning its id so the caller can cancel it
    pub fn take_stale_wake(&mut self, next_wake_up_ms: i64) -> Option<String> {
        match &self.active_wake {
            Some(active) if next_wake_up_ms == 0 || active.wake_at_ms != next_wake_up_ms => {
                self.active_wake.take().map(|w| w.timer_id)
            }
            _ => None,
        }
    }

    /// Register a wake timer for the given wake-up time
    ///
    /// Returns the deterministic timer id and the remaining delay. A wake-up
    /// time in the past is a program-logic bug.
    pub fn register_wake(
        &mut self,
        next_wake_up_ms: i64,
    ) -> Result<(String, std::time::Duration), ClockError> {
        let delay_ms = next_wake_up_ms - self.current_time_ms;
        if delay_ms < 0 {
            return Err(ClockError::NegativeDelay {
                wake_at_ms: next_wake_up_ms,
                now_ms: self.current_time_ms,
            });
        }
        self.wake_counter += 1;
        let timer_id = format!("{WAKE_TIMER_ID_PREFIX}-{}", self.wake_counter);
        self.active_wake = Some(WakeTimer {
            timer_id: timer_id.clone(),
            wake_at_ms: next_wake_up_ms,
        });
        Ok((timer_id, std::time::Duration::from_millis(delay_ms as u64)))
    }

    /// Clear the active wake timer after its fired event was observed
    pub fn clear_wake(&mut self, timer_id: &str) {
        if self
            .active_wake
            .as_ref()
            .is_some_and(|w| w.timer_id == timer_id)
        {
            self.active_wake = None;
        }
    }
}
