//! # Block Throttle
//!
//! `eth_getLogs` cost is bounded by the response payload, not by the number of
//! blocks requested. The throttle turns "how many logs came back last time"
//! into "how many blocks to ask for next", aiming at a fixed number of logs per
//! round trip.
//!
//! - Below the setpoint the window grows additively, so it never shrinks after
//!   a quiet window.
//! - Above the setpoint the window is scaled down proportionally toward the
//!   setpoint, which absorbs bursts of dense blocks without oscillating.

use crate::settings::ThrottleSettings;

/// Per-worker feedback controller for the `eth_getLogs` block window.
#[derive(Debug, Clone)]
pub struct BlockThrottle {
    current: f64,
    setpoint: f64,
    additive_increase: f64,
}

impl BlockThrottle {
    pub fn new(setpoint: f64, additive_increase: f64, initial: f64) -> Self {
        Self {
            current: initial.max(1.0),
            setpoint: setpoint.max(1.0),
            additive_increase: additive_increase.max(0.0),
        }
    }

    pub fn from_settings(settings: &ThrottleSettings) -> Self {
        Self::new(
            settings.setpoint,
            settings.additive_increase,
            settings.initial_window,
        )
    }

    /// Window (in blocks) for the next fetch, clamped to `[min, max]`.
    ///
    /// The internal estimate is clamped too, so time spent saturated at `max`
    /// does not have to be unwound before a decrease takes effect.
    pub fn next_window(&mut self, min: u64, max: u64) -> u64 {
        let lo = min.max(1) as f64;
        let hi = (max as f64).max(lo);
        self.current = self.current.clamp(lo, hi);
        (self.current.round() as u64).clamp(lo as u64, hi as u64)
    }

    /// Feeds back the number of logs the last fetch returned.
    pub fn observe(&mut self, observed: usize) {
        let observed = observed as f64;
        if observed < self.setpoint {
            self.current += self.additive_increase;
        } else if observed > self.setpoint {
            self.current = (self.current * self.setpoint / observed).max(1.0);
        }
    }

    pub fn current(&self) -> f64 {
        self.current
    }
}
