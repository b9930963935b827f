use std::marker::PhantomData;

use rstar::{primitives::GeomWithData, Point, RTree};

use crate::{
    concurrency::par_iter_mut1,
    floating_type_mod::FT,
    particles::ParticleVec,
    sph_kernels::{pair_smoothing_length, smoothing_length_from_ratio, DimensionUtils},
    VF,
};

const MAX_NEIGHBOR_COUNT: usize = 20000;

/// One neighbor `j` of a particle `i`: kernel weight `W_ij` and its gradient `∇_i W_ij`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborEntry<const D: usize> {
    pub j: usize,
    pub w: FT,
    pub dw: VF<D>,
}

/**
 * Source of neighborhoods for the adaptivity. The lists are snapshots of the particle
 * configuration at the start of a pass and are never modified by the adaptivity;
 * after a pass changed the topology the caller has to rebuild them.
 */
pub trait NeighborhoodProvider<const D: usize>: Sync {
    /** Neighbors of `i`, excluding `i` itself */
    fn neighbors(&self, i: usize) -> &[NeighborEntry<D>];
}

#[derive(Debug, PartialEq, Clone, Copy)]
struct CustomRTreePoint<const D: usize> {
    p: VF<D>,
}

impl<const D: usize> Point for CustomRTreePoint<D> {
    type Scalar = FT;

    const DIMENSIONS: usize = D;

    fn generate(mut generator: impl FnMut(usize) -> Self::Scalar) -> Self {
        CustomRTreePoint {
            p: VF::<D>::from_iterator((0..D).map(|d| generator(d))),
        }
    }

    fn nth(&self, index: usize) -> Self::Scalar {
        self.p[index]
    }

    fn nth_mut(&mut self, index: usize) -> &mut Self::Scalar {
        &mut self.p[index]
    }
}

impl<const D: usize> From<VF<D>> for CustomRTreePoint<D> {
    fn from(p: VF<D>) -> Self {
        CustomRTreePoint { p }
    }
}

type CustomRTreeElem<const D: usize> = GeomWithData<CustomRTreePoint<D>, usize>;

fn build_rtree<const D: usize>(positions: impl Iterator<Item = (usize, VF<D>)>) -> RTree<CustomRTreeElem<D>> {
    let rtree_elems: Vec<_> = positions
        .map(|(idx, pos)| CustomRTreeElem::new(CustomRTreePoint::from(pos), idx))
        .collect();
    RTree::<CustomRTreeElem<D>>::bulk_load(rtree_elems)
}

/**
 * Reference implementation of [`NeighborhoodProvider`] for one body with variable
 * smoothing lengths (`h_i = h_ref / h_ratio_i`). Two live particles are neighbors if
 * their distance is below the support radius of the symmetrized smoothing length.
 * Retired and reserved slots get empty lists and never appear as neighbors.
 */
pub struct NeighborhoodCache<const D: usize> {
    neighs: Vec<Vec<NeighborEntry<D>>>,
}

impl<const D: usize> NeighborhoodCache<D> {
    pub fn new(num_particles: usize) -> Self {
        NeighborhoodCache {
            neighs: (0..num_particles).map(|_| Vec::new()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.neighs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighs.is_empty()
    }

    pub fn neighbor_count(&self, i: usize) -> usize {
        self.neighs[i].len()
    }

    pub fn iter(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        self.neighs[i].iter().map(|n| n.j)
    }

    pub fn build<DU: DimensionUtils<D>>(particles: &ParticleVec<D>, reference_h: FT) -> Self {
        let mut cache = NeighborhoodCache::new(particles.len());
        cache.rebuild::<DU>(particles, reference_h);
        cache
    }

    pub fn rebuild<DU: DimensionUtils<D>>(&mut self, particles: &ParticleVec<D>, reference_h: FT) {
        let num_particles = particles.len();
        self.neighs.resize_with(num_particles, Vec::new);

        let position = &particles.position;
        let is_live = |i: usize| particles.life_state[i].is_live();
        let h = |i: usize| smoothing_length_from_ratio(reference_h, particles.h_ratio[i]);

        let h_max = (0..num_particles)
            .filter(|&i| is_live(i))
            .map(h)
            .fold(0., FT::max);
        let support_length_by_smoothing_length = DU::support_radius_by_smoothing_length();
        let max_support_radius = h_max * support_length_by_smoothing_length;

        let rtree = build_rtree((0..num_particles).filter(|&i| is_live(i)).map(|i| (i, position[i])));

        par_iter_mut1(&mut self.neighs, |i, p_neighs| {
            p_neighs.clear();
            if !is_live(i) {
                return;
            }

            let xi = position[i];
            for neigh_point in
                rtree.locate_within_distance(CustomRTreePoint::from(xi), max_support_radius * max_support_radius)
            {
                let j = neigh_point.data;
                if j == i {
                    continue;
                }

                let xij = xi - position[j];
                let hij = pair_smoothing_length(h(i), h(j));
                let sr_ij = hij * support_length_by_smoothing_length;
                if xij.norm_squared() >= sr_ij * sr_ij {
                    continue;
                }

                if p_neighs.len() == MAX_NEIGHBOR_COUNT {
                    panic!("exceeded maximum allowed number of {} neighbors", MAX_NEIGHBOR_COUNT);
                }
                p_neighs.push(NeighborEntry {
                    j,
                    w: DU::kernelh(xij, hij),
                    dw: DU::kernel_derivh(xij, hij),
                });
            }

            p_neighs.sort_unstable_by_key(|n| n.j);
        });
    }
}

impl<const D: usize> NeighborhoodProvider<D> for NeighborhoodCache<D> {
    fn neighbors(&self, i: usize) -> &[NeighborEntry<D>] {
        &self.neighs[i]
    }
}

/**
 * Fixed wall particles of another body. They contribute their volume to densities
 * of the adapted body but are never moved, split or merged.
 */
pub struct BoundaryContact<DU: DimensionUtils<D>, const D: usize> {
    positions: Vec<VF<D>>,
    pub volumes: Vec<FT>,
    pub smoothing_length: FT,

    // wall particles never move, so the tree is built once
    rtree: RTree<CustomRTreeElem<D>>,

    // this vector has an entry for every particle of the adapted body
    fluid_boundary_neighs: Vec<Vec<NeighborEntry<D>>>,

    _marker: PhantomData<DU>,
}

impl<DU: DimensionUtils<D>, const D: usize> BoundaryContact<DU, D> {
    pub fn new(positions: Vec<VF<D>>, volumes: Vec<FT>, smoothing_length: FT) -> Self {
        assert_eq!(positions.len(), volumes.len());
        let rtree = build_rtree(positions.iter().cloned().enumerate());
        BoundaryContact {
            positions,
            rtree,
            volumes,
            smoothing_length,
            fluid_boundary_neighs: Vec::new(),
            _marker: PhantomData::default(),
        }
    }

    pub fn num_boundary_particles(&self) -> usize {
        self.positions.len()
    }

    pub fn positions(&self) -> &[VF<D>] {
        &self.positions
    }

    /** Boundary neighbors of particle `i` of the adapted body (weights use the pair smoothing length) */
    pub fn contact_neighbors(&self, i: usize) -> &[NeighborEntry<D>] {
        self.fluid_boundary_neighs.get(i).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Boundary particles within the support of a particle at `x` with smoothing length `h`.
    pub fn for_each_near(&self, x: VF<D>, h: FT, mut f: impl FnMut(usize, VF<D>, FT)) {
        let hb = pair_smoothing_length(h, self.smoothing_length);
        let sr = hb * DU::support_radius_by_smoothing_length();
        for neigh_point in self.rtree.locate_within_distance(CustomRTreePoint::from(x), sr * sr) {
            let b = neigh_point.data;
            let xab = x - self.positions[b];
            if xab.norm_squared() < sr * sr {
                f(b, xab, hb);
            }
        }
    }

    pub fn update_contact_neighborhood(&mut self, particles: &ParticleVec<D>, reference_h: FT) {
        let num_particles = particles.len();
        self.fluid_boundary_neighs.resize_with(num_particles, Vec::new);

        let support_length_by_smoothing_length = DU::support_radius_by_smoothing_length();
        let hb = self.smoothing_length;
        let boundary_positions = &self.positions;
        let rtree = &self.rtree;

        par_iter_mut1(&mut self.fluid_boundary_neighs, |i, p_neighs| {
            p_neighs.clear();
            if !particles.life_state[i].is_live() {
                return;
            }

            let xi = particles.position[i];
            let hi = smoothing_length_from_ratio(reference_h, particles.h_ratio[i]);
            let hib = pair_smoothing_length(hi, hb);
            let sr = hib * support_length_by_smoothing_length;
            for neigh_point in rtree.locate_within_distance(CustomRTreePoint::from(xi), sr * sr) {
                let b = neigh_point.data;
                let xib = xi - boundary_positions[b];
                p_neighs.push(NeighborEntry {
                    j: b,
                    w: DU::kernelh(xib, hib),
                    dw: DU::kernel_derivh(xib, hib),
                });
            }
            p_neighs.sort_unstable_by_key(|n| n.j);
        });
    }
}
