//! Converts variable frame delta-time into discrete advances.
//!
//! Every "do X each K milliseconds" behaviour in the crate runs on a
//! [`FrameAccumulator`]: texture frame switching, drift steps and the demo
//! host's routine cycling. A long stall produces several catch-up advances in
//! one `update` instead of being dropped, and the remainder always carries
//! over to the next frame.

use crate::error::{RenderError, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct FrameAccumulator {
    threshold_millis: f64,
    accumulated_millis: f64,
    total_advances: u64,
}

impl FrameAccumulator {
    /// Fails with `InvalidConfiguration` unless `threshold_millis` is finite
    /// and positive.
    pub fn new(threshold_millis: f64) -> Result<Self> {
        validate_threshold(threshold_millis)?;
        Ok(Self {
            threshold_millis,
            accumulated_millis: 0.0,
            total_advances: 0,
        })
    }

    /// Starts with `accumulated_millis` already banked; anything at or above
    /// the threshold is folded into advances immediately (not reported).
    pub fn with_accumulated(threshold_millis: f64, accumulated_millis: f64) -> Result<Self> {
        let mut accumulator = Self::new(threshold_millis)?;
        accumulator.accumulated_millis = sanitize_delta(accumulated_millis) % threshold_millis;
        Ok(accumulator)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold_millis
    }

    pub fn accumulated(&self) -> f64 {
        self.accumulated_millis
    }

    pub fn total_advances(&self) -> u64 {
        self.total_advances
    }

    /// Changes the threshold, keeping the accumulated remainder below it.
    pub fn set_threshold(&mut self, threshold_millis: f64) -> Result<u32> {
        validate_threshold(threshold_millis)?;
        self.threshold_millis = threshold_millis;
        Ok(self.update(0.0))
    }

    pub fn reset(&mut self) {
        self.accumulated_millis = 0.0;
    }

    /// Whether feeding `delta_millis` would produce at least one advance.
    pub fn will_advance(&self, delta_millis: f64) -> bool {
        self.accumulated_millis + sanitize_delta(delta_millis) >= self.threshold_millis
    }

    /// Adds `delta_millis` and returns how many advances it produced,
    /// saturating at `u32::MAX`.
    pub fn update(&mut self, delta_millis: f64) -> u32 {
        saturate(self.accumulate(delta_millis))
    }

    /// Adds `delta_millis`, invoking `on_advance` once per threshold crossed.
    ///
    /// Negative and non-finite deltas count as zero. Like [`Self::update`]
    /// the count saturates, and `on_advance` fires the saturated number of
    /// times.
    pub fn update_with(&mut self, delta_millis: f64, mut on_advance: impl FnMut()) -> u32 {
        let advances = saturate(self.accumulate(delta_millis));
        for _ in 0..advances {
            on_advance();
        }
        advances
    }

    fn accumulate(&mut self, delta_millis: f64) -> u64 {
        let total = self.accumulated_millis + sanitize_delta(delta_millis);
        if total < self.threshold_millis {
            self.accumulated_millis = total;
            return 0;
        }
        let remainder = total % self.threshold_millis;
        // Float to int casts saturate.
        let crossed = ((total - remainder) / self.threshold_millis).round() as u64;
        self.accumulated_millis = remainder;
        self.total_advances = self.total_advances.saturating_add(crossed);
        crossed
    }
}

fn saturate(advances: u64) -> u32 {
    u32::try_from(advances).unwrap_or(u32::MAX)
}

fn validate_threshold(threshold_millis: f64) -> Result<()> {
    if threshold_millis.is_finite() && threshold_millis > 0.0 {
        Ok(())
    } else {
        Err(RenderError::InvalidConfiguration(format!(
            "accumulator threshold must be a positive number of milliseconds, got {threshold_millis}"
        )))
    }
}

fn sanitize_delta(delta_millis: f64) -> f64 {
    if delta_millis.is_finite() {
        delta_millis.max(0.0)
    } else {
        0.0
    }
}
