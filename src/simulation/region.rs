use serde::{Deserialize, Serialize};

use crate::{floating_type_mod::FT, VF};

/// Spatial predicate marking where finer resolution is wanted.
pub trait RegionPredicate<const D: usize>: Sync {
    /**
     * Whether a particle at `position` with the given `volume` lies inside. A volume of
     * zero tests the point only.
     */
    fn contains(&self, position: VF<D>, volume: FT) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox<const D: usize> {
    pub min: VF<D>,
    pub max: VF<D>,
}

impl<const D: usize> BoundingBox<D> {
    pub fn new(min: VF<D>, max: VF<D>) -> Self {
        for d in 0..D {
            assert!(min[d] <= max[d], "bounding box with min > max in dimension {}", d);
        }
        BoundingBox { min, max }
    }

    /// Particle footprint (half its spacing) has to fit between the bounds.
    pub fn contains_with_margin(&self, position: VF<D>, margin: FT) -> bool {
        (0..D).all(|d| position[d] - margin >= self.min[d] && position[d] + margin <= self.max[d])
    }
}

/// Plane `dir · x + delta = 0`; the side with negative values is inside.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HalfSpace<const D: usize> {
    pub dir: VF<D>,
    pub delta: FT,
}

impl<const D: usize> HalfSpace<D> {
    pub fn new(dir: VF<D>, delta: FT) -> Self {
        let len = dir.norm();
        assert!(len > 0., "half space needs a non-zero normal");
        HalfSpace {
            dir: dir / len,
            delta: delta / len,
        }
    }

    /** Signed distance, positive outside */
    pub fn probe(&self, x: VF<D>) -> FT {
        self.dir.dot(&x) + self.delta
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Region<const D: usize> {
    Everywhere,
    Nowhere,
    Box(BoundingBox<D>),
    Sphere { center: VF<D>, radius: FT },
    // intersection of all half spaces
    Convex(Vec<HalfSpace<D>>),
}

/// Half the edge length of a cube with this volume.
fn footprint<const D: usize>(volume: FT) -> FT {
    if volume <= 0. {
        0.
    } else {
        0.5 * volume.powf(1. / D as FT)
    }
}

impl<const D: usize> RegionPredicate<D> for Region<D> {
    fn contains(&self, position: VF<D>, volume: FT) -> bool {
        let margin = footprint::<D>(volume);
        match self {
            Region::Everywhere => true,
            Region::Nowhere => false,
            Region::Box(bounds) => bounds.contains_with_margin(position, margin),
            Region::Sphere { center, radius } => (position - center).norm() + margin <= *radius,
            Region::Convex(planes) => planes.iter().all(|plane| plane.probe(position) + margin <= 0.),
        }
    }
}
