//! Randomized continuous drift for rotation angles and color channels.
//!
//! A [`Drift`] moves its value toward a random target in fixed-size steps,
//! one step per accumulator advance. Once the target is reached it waits,
//! resuming toward a fresh target with a fixed probability per step, which
//! gives the irregular stop-and-go motion the demo routines use.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::accumulator::FrameAccumulator;
use crate::error::{RenderError, Result};

/// Chance per step that a waiting drift picks a new target.
pub const DEFAULT_RESUME_PROBABILITY: f64 = 1.0 / 256.0;

pub const DEFAULT_STEP_MILLIS: f64 = 10.0;

#[derive(Clone, Debug, PartialEq)]
pub struct DriftConfig {
    pub step_millis: f64,
    /// Largest change applied per step.
    pub speed: f32,
    pub min: f32,
    pub max: f32,
    /// Wrap around `[min, max)` and take the short way to the target.
    pub wrap: bool,
    pub resume_probability: f64,
}

impl DriftConfig {
    /// Angle in degrees, wrapping at 360.
    pub fn rotation(speed_degrees: f32) -> Self {
        Self {
            step_millis: DEFAULT_STEP_MILLIS,
            speed: speed_degrees,
            min: 0.0,
            max: 360.0,
            wrap: true,
            resume_probability: DEFAULT_RESUME_PROBABILITY,
        }
    }

    /// Normalised color channel in `[0, 1]`.
    pub fn color(speed: f32) -> Self {
        Self {
            step_millis: DEFAULT_STEP_MILLIS,
            speed,
            min: 0.0,
            max: 1.0,
            wrap: false,
            resume_probability: DEFAULT_RESUME_PROBABILITY,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(RenderError::InvalidConfiguration(reason));
        if !(self.speed.is_finite() && self.speed > 0.0) {
            return invalid(format!("drift speed must be positive, got {}", self.speed));
        }
        if !(self.min.is_finite() && self.max.is_finite() && self.min < self.max) {
            return invalid(format!(
                "drift range must satisfy min < max, got [{}, {}]",
                self.min, self.max
            ));
        }
        if !(0.0..=1.0).contains(&self.resume_probability) {
            return invalid(format!(
                "resume probability must be within [0, 1], got {}",
                self.resume_probability
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriftPhase {
    Moving,
    Waiting,
}

#[derive(Clone, Debug)]
pub struct Drift {
    config: DriftConfig,
    value: f32,
    target: f32,
    phase: DriftPhase,
    clock: FrameAccumulator,
    rng: StdRng,
}

impl Drift {
    /// Starts at a random value moving toward a random target.
    pub fn new(config: DriftConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let clock = FrameAccumulator::new(config.step_millis)?;
        let mut rng = StdRng::seed_from_u64(seed);
        let value = rng.gen_range(config.min..config.max);
        let target = rng.gen_range(config.min..config.max);
        Ok(Self {
            config,
            value,
            target,
            phase: DriftPhase::Moving,
            clock,
            rng,
        })
    }

    /// Starts at `value` (clamped or wrapped into range).
    pub fn starting_at(config: DriftConfig, seed: u64, value: f32) -> Result<Self> {
        let mut drift = Self::new(config, seed)?;
        drift.value = drift.normalize(value);
        Ok(drift)
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn phase(&self) -> DriftPhase {
        self.phase
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    /// Feeds frame time; returns how many steps were taken.
    pub fn update(&mut self, delta_millis: f64) -> u32 {
        let steps = self.clock.update(delta_millis);
        for _ in 0..steps {
            self.step();
        }
        steps
    }

    fn step(&mut self) {
        match self.phase {
            DriftPhase::Waiting => {
                if self.rng.gen_bool(self.config.resume_probability) {
                    self.target = self.rng.gen_range(self.config.min..self.config.max);
                    self.phase = DriftPhase::Moving;
                }
            }
            DriftPhase::Moving => {
                let remaining = self.distance_to_target();
                if remaining.abs() <= self.config.speed {
                    self.value = self.target;
                    self.phase = DriftPhase::Waiting;
                } else {
                    let moved = self.value + self.config.speed * remaining.signum();
                    self.value = self.normalize(moved);
                }
            }
        }
    }

    fn distance_to_target(&self) -> f32 {
        let diff = self.target - self.value;
        if self.config.wrap {
            let span = self.config.max - self.config.min;
            (diff + span / 2.0).rem_euclid(span) - span / 2.0
        } else {
            diff
        }
    }

    fn normalize(&self, value: f32) -> f32 {
        if self.config.wrap {
            let span = self.config.max - self.config.min;
            self.config.min + (value - self.config.min).rem_euclid(span)
        } else {
            value.clamp(self.config.min, self.config.max)
        }
    }
}

/// `N` independent drifts sharing one configuration (RGB, XYZ, ...).
#[derive(Clone, Debug)]
pub struct DriftSet<const N: usize> {
    drifts: Vec<Drift>,
}

impl<const N: usize> DriftSet<N> {
    pub fn new(config: DriftConfig, seed: u64) -> Result<Self> {
        let drifts = (0..N)
            .map(|axis| Drift::new(config.clone(), seed.wrapping_add(axis as u64)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { drifts })
    }

    pub fn update(&mut self, delta_millis: f64) {
        for drift in &mut self.drifts {
            drift.update(delta_millis);
        }
    }

    pub fn values(&self) -> [f32; N] {
        std::array::from_fn(|axis| self.drifts[axis].value())
    }

    pub fn drift(&self, axis: usize) -> Option<&Drift> {
        self.drifts.get(axis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_configuration() {
        let mut config = DriftConfig::color(0.01);
        config.resume_probability = 1.5;
        assert!(Drift::new(config, 1).is_err());

        let mut config = DriftConfig::rotation(1.0);
        config.max = config.min;
        assert!(Drift::new(config, 1).is_err());

        let mut config = DriftConfig::rotation(1.0);
        config.step_millis = 0.0;
        assert!(matches!(
            Drift::new(config, 1),
            Err(RenderError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn color_drift_stays_in_range() {
        let mut drift = Drift::new(DriftConfig::color(0.05), 7).unwrap();
        for _ in 0..2_000 {
            drift.update(16.0);
            assert!((0.0..=1.0).contains(&drift.value()));
        }
    }

    #[test]
    fn rotation_wraps_and_takes_short_way() {
        let mut config = DriftConfig::rotation(5.0);
        config.resume_probability = 0.0;
        let mut drift = Drift::starting_at(config, 3, 355.0).unwrap();
        drift.target = 10.0;
        drift.update(10.0);
        assert_eq!(drift.value(), 0.0);
        drift.update(10.0);
        assert_eq!(drift.value(), 5.0);
        drift.update(10.0);
        assert_eq!(drift.value(), 10.0);
        assert_eq!(drift.phase(), DriftPhase::Waiting);
    }

    #[test]
    fn zero_probability_waits_forever() {
        let mut config = DriftConfig::color(1.0);
        config.resume_probability = 0.0;
        let mut drift = Drift::new(config, 11).unwrap();
        drift.update(10.0);
        assert_eq!(drift.phase(), DriftPhase::Waiting);
        let parked = drift.value();
        drift.update(10_000.0);
        assert_eq!(drift.phase(), DriftPhase::Waiting);
        assert_eq!(drift.value(), parked);
    }

    #[test]
    fn certain_resume_moves_again_next_step() {
        let mut config = DriftConfig::color(1.0);
        config.resume_probability = 1.0;
        let mut drift = Drift::new(config, 5).unwrap();
        drift.update(10.0);
        assert_eq!(drift.phase(), DriftPhase::Waiting);
        drift.update(10.0);
        assert_eq!(drift.phase(), DriftPhase::Moving);
    }

    #[test]
    fn same_seed_same_path() {
        let mut a = DriftSet::<3>::new(DriftConfig::rotation(2.0), 99).unwrap();
        let mut b = DriftSet::<3>::new(DriftConfig::rotation(2.0), 99).unwrap();
        for _ in 0..100 {
            a.update(33.0);
            b.update(33.0);
        }
        assert_eq!(a.values(), b.values());
        assert!(a.drift(3).is_none());
    }
}
