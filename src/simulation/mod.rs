pub mod adaptivity;
pub mod concurrency;
pub mod error;
pub mod field_channels;
pub mod neighborhood_search;
pub mod particle_buffer;
pub mod particles;
pub mod region;
pub mod simulation_parameters;
pub mod sph_kernels;

#[cfg(feature = "double-precision")]
pub mod floating_type_mod {
    pub type FT = f64;
    pub use std::f64::consts::{FRAC_1_PI, PI, TAU};
}

#[cfg(not(feature = "double-precision"))]
pub mod floating_type_mod {
    pub type FT = f32;
    pub use std::f32::consts::{FRAC_1_PI, PI, TAU};
}

use std::fmt::Display;

use floating_type_mod::FT;

use nalgebra::{SVector, Vector3};
use num_traits::Float;

#[allow(dead_code)]
pub type V<FT, const D: usize> = SVector<FT, D>;

pub type VF<const D: usize> = V<FT, D>;

pub type V2 = V<FT, 2>;
pub type V3 = V<FT, 3>;

/// Guards divisions by squared gradient norms and densities that may vanish.
pub const TINY_REAL: FT = 1.0e-15;

pub fn vec2f(x: FT, y: FT) -> V<FT, 2> {
    [x, y].into()
}

pub fn vec3f(x: FT, y: FT, z: FT) -> V<FT, 3> {
    [x, y, z].into()
}

/// Embeds a 2D/3D vector into 3D space (missing components are zero).
pub fn embed3<const D: usize>(v: VF<D>) -> V3 {
    Vector3::from_iterator((0..3).map(|d| if d < D { v[d] } else { 0. }))
}

/// Inverse of [`embed3`], drops components beyond `D`.
pub fn project3<const D: usize>(v: V3) -> VF<D> {
    VF::<D>::from_iterator((0..D).map(|d| v[d]))
}

pub fn is_ft_approx_eq<FT: Float>(a: FT, b: FT, tolerance: FT) -> bool {
    assert!(!a.is_nan());
    assert!(!b.is_nan());
    b <= a + tolerance && b >= a - tolerance
}

pub fn assert_ft_approx_eq<FT: Float + Display>(a: FT, b: FT, tolerance: FT, s: impl FnOnce() -> String) {
    if !is_ft_approx_eq(a, b, tolerance) {
        panic!(
            "{} value not equal with a tolerance of {}:\n\ta={}\n\tb={}\n",
            s(),
            tolerance,
            a,
            b
        );
    }
}

pub use adaptivity::{ParticleAdaptation, PassReport, StepInfo};
pub use error::{AdaptationError, ConfigError, PassError};
pub use field_channels::{ChannelId, FieldChannels};
pub use neighborhood_search::{BoundaryContact, NeighborEntry, NeighborhoodCache, NeighborhoodProvider};
pub use particle_buffer::{BufferPool, LifeState};
pub use particles::{ParticleBody, ParticleVec};
pub use region::{BoundingBox, Region, RegionPredicate};
pub use simulation_parameters::{AdaptationParams, MergeVariant, SplitVariant};
