//! Opt-in client-side rate limiting.
//!
//! `Throttle` is a token bucket holding `calls` tokens and regaining one every
//! `period / calls`. Callers over the limit sleep until a token frees up;
//! nothing is ever rejected.
//!
//! The long-run rate is `calls` per `period`, but a full bucket lets a burst
//! through on top of the steady refill: any single window of length `period`
//! can see up to `2 * calls - 1` requests.

use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tracing::warn;

use crate::error::{OrionError, Result};

/// Blocking limiter averaging `calls` requests per `period`, with bursts of
/// up to `calls`.
pub struct Throttle {
    limiter: DefaultDirectRateLimiter,
    clock: DefaultClock,
    calls: u32,
    period: Duration,
}

impl Throttle {
    pub fn new(calls: u32, period: Duration) -> Result<Self> {
        let invalid = || OrionError::InvalidRateLimit {
            calls,
            period_ms: period.as_millis(),
        };
        let burst = NonZeroU32::new(calls).ok_or_else(invalid)?;
        let quota = Quota::with_period(period / calls)
            .ok_or_else(invalid)?
            .allow_burst(burst);
        Ok(Self {
            limiter: RateLimiter::direct(quota),
            clock: DefaultClock::default(),
            calls,
            period,
        })
    }

    /// Take one token, sleeping the current thread until one is available.
    pub fn acquire(&self) {
        while let Err(not_until) = self.limiter.check() {
            let wait = not_until
                .wait_time_from(self.clock.now())
                .min(self.replenish_interval());
            warn!(wait_ms = wait.as_millis() as u64, "rate limit reached, sleeping");
            std::thread::sleep(wait);
        }
    }

    fn replenish_interval(&self) -> Duration {
        self.period / self.calls
    }

    /// Take one token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

impl fmt::Debug for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttle")
            .field("calls", &self.calls)
            .field("period", &self.period)
            .finish()
    }
}
