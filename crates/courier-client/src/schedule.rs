//! Validation of user-requested send times.

use courier_shared::constants::{BOARD_SCHEDULE_MAX_DELAY_MS, MESSAGE_SCHEDULE_MAX_DELAY_MS};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleRejection {
    #[error("scheduled time is not in the future")]
    PastTime,

    #[error("scheduled time is more than {max_delay_ms} ms ahead")]
    TooFarAhead { max_delay_ms: i64 },
}

/// Accepts send times within `(now, now + max_delay_ms]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleGate {
    pub max_delay_ms: i64,
}

impl ScheduleGate {
    /// Regular messages: up to 365 days ahead.
    pub const MESSAGE: ScheduleGate = ScheduleGate {
        max_delay_ms: MESSAGE_SCHEDULE_MAX_DELAY_MS,
    };

    /// Board posts: up to 7 days ahead.
    pub const BOARD_POST: ScheduleGate = ScheduleGate {
        max_delay_ms: BOARD_SCHEDULE_MAX_DELAY_MS,
    };

    pub const fn new(max_delay_ms: i64) -> Self {
        Self { max_delay_ms }
    }

    pub fn clamp(&self, requested_at: i64, now: i64) -> Result<i64, ScheduleRejection> {
        if requested_at <= now {
            return Err(ScheduleRejection::PastTime);
        }
        if requested_at.saturating_sub(now) > self.max_delay_ms {
            return Err(ScheduleRejection::TooFarAhead {
                max_delay_ms: self.max_delay_ms,
            });
        }
        Ok(requested_at)
    }
}
