use thiserror::Error;

use crate::{adaptivity::PassReport, floating_type_mod::FT};

/// Outcome of a single split or merge that could not be committed as proposed.
///
/// Only [`AdaptationError::BufferExhausted`] stops the refinement of a body; all other
/// kinds are recorded per particle and the pass carries on.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdaptationError {
    #[error("buffer exhausted while splitting particle {parent}: all {capacity} reserve slots are in use")]
    BufferExhausted { parent: usize, capacity: usize },

    #[error("density correction did not converge after {iterations} iterations (residual {residual:.3e})")]
    DensityCorrectionDidNotConverge { iterations: usize, residual: FT },

    #[error("merge group seeded at particle {seed} is degenerate ({size} members, total mass {total_mass:.3e})")]
    DegenerateMergeGroup { seed: usize, size: usize, total_mass: FT },

    #[error("no admissible child position for particle {particle} after {samples} samples")]
    InvalidCandidatePosition { particle: usize, samples: usize },

    #[error("merge group seeded at particle {seed} would reach volume {volume:.3e} > maximum {maximum:.3e}")]
    MergeVolumeExceeded { seed: usize, volume: FT, maximum: FT },

    #[error("refinement of this body was halted by an earlier buffer exhaustion")]
    RefinementHalted,
}

impl AdaptationError {
    /// Capacity errors invalidate the configuration of the body, everything else is local to one particle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AdaptationError::BufferExhausted { .. } | AdaptationError::RefinementHalted
        )
    }
}

/// A pass that stopped early. `report` holds the splits and merges committed before the stop.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("refinement pass aborted: {error}")]
pub struct PassError {
    #[source]
    pub error: AdaptationError,
    pub report: PassReport,
}

impl From<AdaptationError> for PassError {
    fn from(error: AdaptationError) -> Self {
        PassError {
            error,
            report: PassReport::default(),
        }
    }
}

/// Slot claim failure reported by the buffer pool.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no free buffer slot left (capacity {capacity})")]
pub struct BufferExhausted {
    pub capacity: usize,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}
