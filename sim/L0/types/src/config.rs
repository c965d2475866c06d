//! Configuration types for simulation.
//!
//! These control how an entity is stepped: substep size, gravity, the
//! micro-contact solver, sleep thresholds and the worker pool.

use crate::dynamics::Gravity;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Main configuration for a simulation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SimulationConfig {
    /// Largest substep (seconds). Longer frame steps are split.
    pub max_time_step: f64,
    /// Gravity configuration.
    pub gravity: Gravity,
    /// Constraint solver configuration.
    pub solver: SolverConfig,
    /// Sleep/awake thresholds.
    pub sleep: SleepConfig,
    /// Velocity damping per second, applied to every body and joint axis.
    pub damping: f64,
    /// Frames whose linear or angular speed exceeds this are rolled back.
    pub max_velocity: f64,
    /// Worker pool configuration.
    pub parallel: ParallelConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            max_time_step: 0.02,
            gravity: Gravity::earth(),
            solver: SolverConfig::default(),
            sleep: SleepConfig::default(),
            damping: 0.0,
            max_velocity: 200.0,
            parallel: ParallelConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// Default config with the given substep size.
    #[must_use]
    pub fn with_max_time_step(max_time_step: f64) -> Self {
        Self {
            max_time_step,
            ..Default::default()
        }
    }

    /// Fine substeps and a stricter solver.
    #[must_use]
    pub fn high_fidelity() -> Self {
        Self {
            max_time_step: 1.0 / 240.0,
            solver: SolverConfig::high_accuracy(),
            ..Default::default()
        }
    }

    /// Coarse substeps, fewer solver iterations, eager sleeping.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            max_time_step: 1.0 / 30.0,
            solver: SolverConfig::fast(),
            sleep: SleepConfig::eager(),
            ..Default::default()
        }
    }

    /// Set the gravity.
    #[must_use]
    pub fn gravity(mut self, gravity: Gravity) -> Self {
        self.gravity = gravity;
        self
    }

    /// Disable gravity.
    #[must_use]
    pub fn zero_gravity(mut self) -> Self {
        self.gravity = Gravity::zero();
        self
    }

    /// Set the solver configuration.
    #[must_use]
    pub fn solver(mut self, solver: SolverConfig) -> Self {
        self.solver = solver;
        self
    }

    /// Set the sleep configuration.
    #[must_use]
    pub fn sleep(mut self, sleep: SleepConfig) -> Self {
        self.sleep = sleep;
        self
    }

    /// Set velocity damping.
    #[must_use]
    pub fn damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    /// Set the worker pool configuration.
    #[must_use]
    pub fn parallel(mut self, parallel: ParallelConfig) -> Self {
        self.parallel = parallel;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if !self.max_time_step.is_finite() || self.max_time_step <= 0.0 {
            return Err(crate::SimError::InvalidTimestep(self.max_time_step));
        }
        if self.max_time_step > 1.0 {
            return Err(crate::SimError::invalid_config(
                "max_time_step > 1 second is likely an error",
            ));
        }
        if !self.gravity.acceleration.iter().all(|x| x.is_finite()) {
            return Err(crate::SimError::invalid_config("gravity must be finite"));
        }
        if self.damping < 0.0 || !self.damping.is_finite() {
            return Err(crate::SimError::invalid_config(
                "damping must be finite and non-negative",
            ));
        }
        if self.max_velocity <= 0.0 {
            return Err(crate::SimError::invalid_config(
                "max_velocity must be positive",
            ));
        }
        self.solver.validate()?;
        self.sleep.validate()?;
        Ok(())
    }

    /// Number of equal substeps a frame of length `dt` is split into.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn substeps(&self, dt: f64) -> usize {
        if dt <= 0.0 {
            return 0;
        }
        ((dt / self.max_time_step).ceil() as usize).max(1)
    }
}

/// Configuration for the micro-contact (constraint) solver.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SolverConfig {
    /// Gauss-Seidel sweeps per attempt.
    pub iterations: usize,
    /// Largest acceptable constraint velocity error (m/s or rad/s).
    pub tolerance: f64,
    /// Number of times the tolerance is doubled before the resolve is
    /// declared non-convergent.
    pub widen_steps: usize,
    /// Angular rows whose response is below this fraction of the body's
    /// inverse mass are skipped.
    pub min_response_ratio: f64,
    /// Cap on the separation velocity used to push out penetration.
    pub max_unproj_vel: f64,
    /// Fraction of penetration depth removed per second of step time.
    pub penetration_rate: f64,
    /// Angular band (rad) around a limit inside which the axis counts as
    /// at the limit, and the overshoot allowed during integration.
    pub limit_tolerance: f64,
    /// Minimum penetration treated as a real contact.
    pub contact_tolerance: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            iterations: 40,
            tolerance: 1e-4,
            widen_steps: 3,
            min_response_ratio: 0.1,
            max_unproj_vel: 2.5,
            penetration_rate: 0.3,
            limit_tolerance: 0.01,
            contact_tolerance: 1e-3,
        }
    }
}

impl SolverConfig {
    /// More sweeps, tighter tolerances.
    #[must_use]
    pub fn high_accuracy() -> Self {
        Self {
            iterations: 100,
            tolerance: 1e-6,
            limit_tolerance: 0.002,
            contact_tolerance: 1e-4,
            ..Default::default()
        }
    }

    /// Fewer sweeps, looser tolerances.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            iterations: 12,
            tolerance: 1e-3,
            widen_steps: 2,
            limit_tolerance: 0.03,
            ..Default::default()
        }
    }

    /// Set the sweep count.
    #[must_use]
    pub fn iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    /// Set the convergence tolerance.
    #[must_use]
    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Validate the solver configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.iterations == 0 {
            return Err(crate::SimError::invalid_config(
                "iterations must be at least 1",
            ));
        }
        if self.tolerance <= 0.0 {
            return Err(crate::SimError::invalid_config("tolerance must be positive"));
        }
        if !(0.0..=1.0).contains(&self.min_response_ratio) {
            return Err(crate::SimError::invalid_config(
                "min_response_ratio must be between 0 and 1",
            ));
        }
        if self.max_unproj_vel < 0.0 || self.penetration_rate < 0.0 {
            return Err(crate::SimError::invalid_config(
                "unprojection parameters cannot be negative",
            ));
        }
        if self.limit_tolerance < 0.0 || self.contact_tolerance < 0.0 {
            return Err(crate::SimError::invalid_config(
                "tolerances cannot be negative",
            ));
        }
        Ok(())
    }
}

/// Energy thresholds and counters driving the sleep/awake state machine.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SleepConfig {
    /// Whether entities may fall asleep at all.
    pub enabled: bool,
    /// Kinetic energy per unit mass (J/kg) below which a joint is calm.
    pub min_energy: f64,
    /// Threshold multiplier while lying (many resting contacts).
    pub lying_factor: f64,
    /// Resting contacts needed to enter lying mode.
    pub lying_contacts: usize,
    /// Threshold multiplier while in free fall (no contacts).
    pub freefall_factor: f64,
    /// Consecutive calm frames before sleeping.
    pub sleep_frames: u32,
    /// An entity with at least this many contacts against other dynamic
    /// entities stays awake.
    pub max_dynamic_contacts: usize,
}

impl Default for SleepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_energy: 0.002,
            lying_factor: 0.4,
            lying_contacts: 4,
            freefall_factor: 10.0,
            sleep_frames: 10,
            max_dynamic_contacts: 3,
        }
    }
}

impl SleepConfig {
    /// Never sleep.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Higher threshold and a shorter countdown.
    #[must_use]
    pub fn eager() -> Self {
        Self {
            min_energy: 0.01,
            sleep_frames: 4,
            ..Default::default()
        }
    }

    /// Set the number of calm frames before sleeping.
    #[must_use]
    pub fn sleep_frames(mut self, frames: u32) -> Self {
        self.sleep_frames = frames;
        self
    }

    /// Set the energy threshold.
    #[must_use]
    pub fn min_energy(mut self, min_energy: f64) -> Self {
        self.min_energy = min_energy;
        self
    }

    /// Energy threshold adjusted for the current contact situation.
    #[must_use]
    pub fn threshold(&self, resting_contacts: usize) -> f64 {
        if resting_contacts == 0 {
            self.min_energy * self.freefall_factor
        } else if resting_contacts >= self.lying_contacts {
            self.min_energy * self.lying_factor
        } else {
            self.min_energy
        }
    }

    /// Validate the sleep configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.min_energy < 0.0 || self.lying_factor < 0.0 || self.freefall_factor < 0.0 {
            return Err(crate::SimError::invalid_config(
                "sleep thresholds cannot be negative",
            ));
        }
        if self.enabled && self.sleep_frames == 0 {
            return Err(crate::SimError::invalid_config(
                "sleep_frames must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Configuration for the worker pool stepping entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ParallelConfig {
    /// Worker threads; 0 lets rayon pick from the available cores.
    pub worker_threads: usize,
    /// Fewer awake entities than this are stepped on the calling thread.
    pub min_entities_for_parallel: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            min_entities_for_parallel: 2,
        }
    }
}

impl ParallelConfig {
    /// One worker, never parallel.
    #[must_use]
    pub const fn sequential() -> Self {
        Self {
            worker_threads: 1,
            min_entities_for_parallel: usize::MAX,
        }
    }

    /// Set the worker count.
    #[must_use]
    pub const fn with_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Set the parallel threshold.
    #[must_use]
    pub const fn with_min_entities(mut self, min: usize) -> Self {
        self.min_entities_for_parallel = min;
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_default_config() {
        let config = SimulationConfig::default();
        assert!(config.validate().is_ok());
        assert_relative_eq!(config.max_time_step, 0.02, epsilon = 1e-10);
        assert!(config.sleep.enabled);
    }

    #[test]
    fn test_config_presets() {
        assert!(SimulationConfig::high_fidelity().validate().is_ok());
        let fast = SimulationConfig::fast();
        assert!(fast.validate().is_ok());
        assert_eq!(fast.solver.iterations, 12);
        assert_eq!(fast.sleep.sleep_frames, 4);
    }

    #[test]
    fn test_config_builder() {
        let config = SimulationConfig::with_max_time_step(0.005)
            .zero_gravity()
            .damping(0.1)
            .sleep(SleepConfig::disabled())
            .parallel(ParallelConfig::sequential());

        assert_relative_eq!(config.gravity.acceleration.norm(), 0.0);
        assert_relative_eq!(config.damping, 0.1);
        assert!(!config.sleep.enabled);
        assert_eq!(config.parallel.worker_threads, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SimulationConfig::default();
        config.max_time_step = -0.01;
        assert!(config.validate().is_err());

        config.max_time_step = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = SimulationConfig::default();
        config.solver.iterations = 0;
        assert!(config.validate().unwrap_err().is_config_error());

        let mut config = SimulationConfig::default();
        config.sleep.sleep_frames = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_substeps() {
        let config = SimulationConfig::with_max_time_step(0.01);
        assert_eq!(config.substeps(0.0), 0);
        assert_eq!(config.substeps(0.005), 1);
        assert_eq!(config.substeps(0.01), 1);
        assert_eq!(config.substeps(0.025), 3);
    }

    #[test]
    fn test_sleep_threshold_modes() {
        let sleep = SleepConfig::default();
        assert_relative_eq!(sleep.threshold(0), sleep.min_energy * sleep.freefall_factor);
        assert_relative_eq!(sleep.threshold(1), sleep.min_energy);
        assert_relative_eq!(
            sleep.threshold(sleep.lying_contacts),
            sleep.min_energy * sleep.lying_factor
        );
    }
}
