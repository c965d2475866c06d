//! Error types for simulation operations.

use thiserror::Error;

/// Errors that can occur while configuring or building a simulation.
///
/// Runtime numeric trouble (near-singular matrices, tiny masses) is handled
/// locally with epsilon floors and never surfaces here; these variants are
/// the caller-visible configuration failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SimError {
    /// Invalid timestep.
    #[error("invalid timestep: {0} (must be positive and finite)")]
    InvalidTimestep(f64),

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// Invalid mass properties.
    #[error("invalid mass properties: {reason}")]
    InvalidMassProperties {
        /// Description of what's wrong.
        reason: String,
    },

    /// Geometry rejected at attach time.
    #[error("invalid geometry for part {part}: {reason}")]
    InvalidGeometry {
        /// Part that was rejected.
        part: i32,
        /// Description of what's wrong.
        reason: String,
    },
}

impl SimError {
    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create an invalid mass properties error.
    #[must_use]
    pub fn invalid_mass(reason: impl Into<String>) -> Self {
        Self::InvalidMassProperties {
            reason: reason.into(),
        }
    }

    /// Create an invalid geometry error for a part.
    #[must_use]
    pub fn invalid_geometry(part: i32, reason: impl Into<String>) -> Self {
        Self::InvalidGeometry {
            part,
            reason: reason.into(),
        }
    }

    /// Check if this is a configuration error.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. }
                | Self::InvalidGeometry { .. }
                | Self::InvalidMassProperties { .. }
                | Self::InvalidTimestep(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SimError::InvalidTimestep(-0.5);
        assert!(err.to_string().contains("-0.5"));

        let err = SimError::invalid_geometry(7, "non-positive volume");
        let text = err.to_string();
        assert!(text.contains("part 7"));
        assert!(text.contains("volume"));
    }

    #[test]
    fn test_error_predicates() {
        let err = SimError::invalid_config("bad value");
        assert!(err.is_config_error());
        assert!(SimError::invalid_mass("negative").is_config_error());

        assert!(SimError::invalid_geometry(1, "x").is_config_error());
    }
}
