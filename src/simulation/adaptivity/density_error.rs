use crate::{
    adaptivity::PassContext,
    error::AdaptationError,
    floating_type_mod::FT,
    sph_kernels::{pair_smoothing_length, smoothing_length_from_ratio, DimensionUtils},
    TINY_REAL, VF,
};

/// Particle that a split or merge would create, not yet stored in the body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewParticle<const D: usize> {
    pub position: VF<D>,
    pub mass: FT,
    pub volume: FT,
    pub h_ratio: FT,
}

/**
 * Replacement of the particles `original_indices` by `new_particles`. For a split the
 * originals are the parent, for a merge the whole group.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedChange<const D: usize> {
    pub original_indices: Vec<usize>,
    pub new_particles: Vec<NewParticle<D>>,
}

/// Relative density errors caused by a proposed change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DensityErrorField {
    pub new_particles: Vec<FT>,
    // (index, error) of every neighbor of the originals
    pub neighbors: Vec<(usize, FT)>,
}

impl DensityErrorField {
    pub fn max_abs_error(&self) -> FT {
        self.new_particles
            .iter()
            .chain(self.neighbors.iter().map(|(_, e)| e))
            .fold(0., |acc, e| acc.max(e.abs()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionOutcome<const D: usize> {
    pub positions: Vec<VF<D>>,
    pub iterations: usize,
    pub residual: FT,
    pub converged: bool,
}

impl<const D: usize> CorrectionOutcome<D> {
    pub fn status(&self) -> Result<(), AdaptationError> {
        if self.converged {
            Ok(())
        } else {
            Err(AdaptationError::DensityCorrectionDidNotConverge {
                iterations: self.iterations,
                residual: self.residual,
            })
        }
    }
}

/**
 * Scales `displacement` so that its length lies in `[min_distance, max_distance]`.
 * The direction is kept; a zero displacement has no direction and is returned as is.
 */
pub fn position_limitation<const D: usize>(displacement: VF<D>, min_distance: FT, max_distance: FT) -> VF<D> {
    assert!(min_distance <= max_distance);
    let norm = displacement.norm();
    if norm <= FT::MIN_POSITIVE {
        return displacement;
    }
    let limited = norm.clamp(min_distance, max_distance);
    displacement * (limited / norm)
}

struct AffectedNeighbor<const D: usize> {
    index: usize,
    position: VF<D>,
    mass: FT,
    h: FT,
    // kernel density before the change
    base_density: FT,
    // contribution of the originals to `base_density`
    removed_density: FT,
}

/// Everything about a change that does not depend on the new positions.
pub struct PreparedChange<const D: usize> {
    new_h: Vec<FT>,
    neighbors: Vec<AffectedNeighbor<D>>,
    reference_density: FT,
}

impl<const D: usize> PreparedChange<D> {
    /** Mass-weighted kernel density of the originals, the target for the new particles */
    pub fn reference_density(&self) -> FT {
        self.reference_density
    }

    pub fn neighbor_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.neighbors.iter().map(|n| n.index)
    }
}

/**
 * Density error of new particles and of their neighborhood, and the iterative
 * placement that minimizes it.
 *
 * Densities are kernel summations over the snapshot of the pass. Wall particles
 * (if the pass has a boundary contact) contribute `rest_density * V_b * W`.
 *
 * Suffixes:
 *
 * o = original particle
 * s = new particle
 * k = affected neighbor
 * b = boundary particle
 */
pub struct DensityErrorEstimator<'c, 'a, DU: DimensionUtils<D>, const D: usize> {
    ctx: &'c PassContext<'a, DU, D>,
}

impl<'c, 'a, DU: DimensionUtils<D>, const D: usize> DensityErrorEstimator<'c, 'a, DU, D> {
    pub fn new(ctx: &'c PassContext<'a, DU, D>) -> Self {
        DensityErrorEstimator { ctx }
    }

    pub fn kernel_density(&self, i: usize) -> FT {
        let particles = self.ctx.particles;
        let h_i = self.ctx.smoothing_length(i);

        let mut density = particles.mass[i] * DU::kernelh(VF::<D>::zeros(), h_i);
        for neigh in self.ctx.neighs.neighbors(i) {
            density += particles.mass[neigh.j] * neigh.w;
        }
        if let Some(contact) = self.ctx.contact {
            for neigh in contact.contact_neighbors(i) {
                density += self.ctx.params.rest_density * contact.volumes[neigh.j] * neigh.w;
            }
        }
        density
    }

    fn wall_density(&self, x: VF<D>, h: FT) -> FT {
        let mut density = 0.;
        if let Some(contact) = self.ctx.contact {
            let rest_density = self.ctx.params.rest_density;
            contact.for_each_near(x, h, |b, xab, hab| {
                density += rest_density * contact.volumes[b] * DU::kernelh(xab, hab);
            });
        }
        density
    }

    fn wall_density_gradient(&self, x: VF<D>, h: FT) -> VF<D> {
        let mut gradient = VF::<D>::zeros();
        if let Some(contact) = self.ctx.contact {
            let rest_density = self.ctx.params.rest_density;
            contact.for_each_near(x, h, |b, xab, hab| {
                gradient += DU::kernel_derivh(xab, hab) * (rest_density * contact.volumes[b]);
            });
        }
        gradient
    }

    pub fn prepare(&self, change: &ProposedChange<D>) -> PreparedChange<D> {
        let particles = self.ctx.particles;
        let originals = &change.original_indices;

        let mut affected: Vec<usize> = originals
            .iter()
            .flat_map(|&o| self.ctx.neighs.neighbors(o).iter().map(|n| n.j))
            .filter(|j| !originals.contains(j) && particles.life_state[*j].is_live())
            .collect();
        affected.sort_unstable();
        affected.dedup();

        let neighbors = affected
            .into_iter()
            .map(|k| {
                let x_k = particles.position[k];
                let h_k = self.ctx.smoothing_length(k);
                let removed_density: FT = originals
                    .iter()
                    .map(|&o| {
                        let h_ko = pair_smoothing_length(h_k, self.ctx.smoothing_length(o));
                        particles.mass[o] * DU::kernelh(x_k - particles.position[o], h_ko)
                    })
                    .sum();
                AffectedNeighbor {
                    index: k,
                    position: x_k,
                    mass: particles.mass[k],
                    h: h_k,
                    base_density: self.kernel_density(k).max(TINY_REAL),
                    removed_density,
                }
            })
            .collect();

        let (weighted_density, total_mass) = originals.iter().fold((0. as FT, 0. as FT), |(rho, m), &o| {
            (rho + particles.mass[o] * self.kernel_density(o), m + particles.mass[o])
        });
        let reference_density = if total_mass > 0. {
            weighted_density / total_mass
        } else {
            self.ctx.params.rest_density
        };

        PreparedChange {
            new_h: change
                .new_particles
                .iter()
                .map(|s| smoothing_length_from_ratio(self.ctx.params.smoothing_length, s.h_ratio))
                .collect(),
            neighbors,
            reference_density,
        }
    }

    /// Kernel density at new particle `n` if the new particles sit at `positions`.
    pub fn compute_new_generated_particle_density(
        &self,
        prepared: &PreparedChange<D>,
        change: &ProposedChange<D>,
        positions: &[VF<D>],
        n: usize,
    ) -> FT {
        let x_n = positions[n];
        let h_n = prepared.new_h[n];

        let mut density = 0.;
        for (s, new_particle) in change.new_particles.iter().enumerate() {
            let h_ns = pair_smoothing_length(h_n, prepared.new_h[s]);
            density += new_particle.mass * DU::kernelh(x_n - positions[s], h_ns);
        }
        for neigh in &prepared.neighbors {
            let h_nk = pair_smoothing_length(h_n, neigh.h);
            density += neigh.mass * DU::kernelh(x_n - neigh.position, h_nk);
        }
        density + self.wall_density(x_n, h_n)
    }

    /// Gradient of the density at new particle `n` with respect to its own position.
    fn new_particle_density_gradient(
        &self,
        prepared: &PreparedChange<D>,
        change: &ProposedChange<D>,
        positions: &[VF<D>],
        n: usize,
    ) -> VF<D> {
        let x_n = positions[n];
        let h_n = prepared.new_h[n];

        let mut gradient = VF::<D>::zeros();
        for (s, new_particle) in change.new_particles.iter().enumerate() {
            if s == n {
                continue;
            }
            let h_ns = pair_smoothing_length(h_n, prepared.new_h[s]);
            gradient += DU::kernel_derivh(x_n - positions[s], h_ns) * new_particle.mass;
        }
        for neigh in &prepared.neighbors {
            let h_nk = pair_smoothing_length(h_n, neigh.h);
            gradient += DU::kernel_derivh(x_n - neigh.position, h_nk) * neigh.mass;
        }
        gradient + self.wall_density_gradient(x_n, h_n)
    }

    pub fn density_error_of_new_generated_particles(
        &self,
        prepared: &PreparedChange<D>,
        change: &ProposedChange<D>,
        positions: &[VF<D>],
    ) -> Vec<FT> {
        let reference = prepared.reference_density;
        (0..change.new_particles.len())
            .map(|n| (self.compute_new_generated_particle_density(prepared, change, positions, n) - reference) / reference)
            .collect()
    }

    pub fn density_error_of_neighbor_particles(
        &self,
        prepared: &PreparedChange<D>,
        change: &ProposedChange<D>,
        positions: &[VF<D>],
    ) -> Vec<(usize, FT)> {
        prepared
            .neighbors
            .iter()
            .map(|neigh| {
                let added_density: FT = change
                    .new_particles
                    .iter()
                    .enumerate()
                    .map(|(s, new_particle)| {
                        let h_ks = pair_smoothing_length(neigh.h, prepared.new_h[s]);
                        new_particle.mass * DU::kernelh(neigh.position - positions[s], h_ks)
                    })
                    .sum();
                (neigh.index, (added_density - neigh.removed_density) / neigh.base_density)
            })
            .collect()
    }

    pub fn density_error_field(
        &self,
        prepared: &PreparedChange<D>,
        change: &ProposedChange<D>,
        positions: &[VF<D>],
    ) -> DensityErrorField {
        DensityErrorField {
            new_particles: self.density_error_of_new_generated_particles(prepared, change, positions),
            neighbors: self.density_error_of_neighbor_particles(prepared, change, positions),
        }
    }

    /// Gauss-Newton displacement of new particle `n` over every error it influences.
    fn displacement_from_density_error(
        &self,
        prepared: &PreparedChange<D>,
        change: &ProposedChange<D>,
        positions: &[VF<D>],
        errors: &DensityErrorField,
        n: usize,
    ) -> VF<D> {
        let x_n = positions[n];
        let h_n = prepared.new_h[n];
        let mass_n = change.new_particles[n].mass;
        let reference = prepared.reference_density;

        let mut weighted_gradient = VF::<D>::zeros();
        let mut gradient_norm2 = 0.;
        let mut add = |g: VF<D>, e: FT| {
            weighted_gradient += g * e;
            gradient_norm2 += g.norm_squared();
        };

        add(
            self.new_particle_density_gradient(prepared, change, positions, n) / reference,
            errors.new_particles[n],
        );
        for s in 0..change.new_particles.len() {
            if s == n {
                continue;
            }
            let h_ns = pair_smoothing_length(h_n, prepared.new_h[s]);
            add(
                DU::kernel_derivh(x_n - positions[s], h_ns) * (mass_n / reference),
                errors.new_particles[s],
            );
        }
        for (neigh, &(_, e_k)) in prepared.neighbors.iter().zip(errors.neighbors.iter()) {
            let h_nk = pair_smoothing_length(h_n, neigh.h);
            add(
                DU::kernel_derivh(x_n - neigh.position, h_nk) * (mass_n / neigh.base_density),
                e_k,
            );
        }

        -weighted_gradient / (gradient_norm2 + TINY_REAL)
    }

    /**
     * Moves the new particles of `change` until the maximum relative density error drops
     * below the tolerance. The displacement of particle `n` from `anchors[n]` is limited
     * to `[min_distance, max_distance]` after every step.
     *
     * Returns the best positions found. They are the converged ones unless the iteration
     * budget ran out.
     */
    pub fn get_position_from_density_error(
        &self,
        change: &ProposedChange<D>,
        anchors: &[VF<D>],
        min_distance: FT,
        max_distance: FT,
    ) -> CorrectionOutcome<D> {
        assert_eq!(anchors.len(), change.new_particles.len());

        let prepared = self.prepare(change);
        let tolerance = self.ctx.params.density_error_tolerance;
        let max_iters = self.ctx.params.density_correction_max_iters;

        let mut positions: Vec<VF<D>> = change
            .new_particles
            .iter()
            .zip(anchors)
            .map(|(s, &anchor)| anchor + position_limitation(s.position - anchor, min_distance, max_distance))
            .collect();
        let mut best_positions = positions.clone();
        let mut best_residual = FT::INFINITY;

        for iteration in 1..=max_iters {
            let errors = self.density_error_field(&prepared, change, &positions);
            let residual = errors.max_abs_error();

            if residual < best_residual {
                best_residual = residual;
                best_positions.clone_from(&positions);
            }
            if residual < tolerance {
                return CorrectionOutcome {
                    positions,
                    iterations: iteration,
                    residual,
                    converged: true,
                };
            }
            if iteration == max_iters {
                break;
            }

            positions = (0..positions.len())
                .map(|n| {
                    let step = self.displacement_from_density_error(&prepared, change, &positions, &errors, n);
                    let step = position_limitation(step, 0., max_distance);
                    anchors[n] + position_limitation(positions[n] + step - anchors[n], min_distance, max_distance)
                })
                .collect();
        }

        CorrectionOutcome {
            positions: best_positions,
            iterations: max_iters,
            residual: best_residual,
            converged: false,
        }
    }
}
