/*!
Adaptive particle refinement for SPH bodies: particles inside a refinement region
are split into smaller ones, small particles outside of it are merged back.
*/

mod simulation;

pub use simulation::*;
