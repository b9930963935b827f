use std::{
    cmp::Ordering,
    sync::atomic::{self, AtomicU32},
};

use crate::{
    adaptivity::{
        density_error::{position_limitation, NewParticle, ProposedChange},
        PassContext,
    },
    embed3,
    error::AdaptationError,
    field_channels::{ChannelId, ChannelSample, ChannelValue, ChannelVisitor},
    floating_type_mod::FT,
    particle_buffer::LifeState,
    particles::{ParticleBody, ParticleVec},
    project3,
    region::RegionPredicate,
    simulation_parameters::{AdaptationParams, MergeVariant},
    sph_kernels::{h_ratio_from_volume, DimensionUtils},
    V3, VF,
};

pub const MERGE_CLAIM_AVAILABLE: u32 = u32::MAX;

/**
 * Ownership markers for one pass. A particle belongs to at most one merge group: the
 * group's seed claims each member with a compare-exchange, so concurrent group searches
 * can never share a member.
 */
pub struct MergeClaims {
    owner: Vec<AtomicU32>,
}

impl MergeClaims {
    pub fn new(num_particles: usize) -> Self {
        let mut claims = MergeClaims { owner: Vec::new() };
        claims.reset(num_particles);
        claims
    }

    pub fn reset(&mut self, num_particles: usize) {
        assert!(num_particles < MERGE_CLAIM_AVAILABLE as usize);
        self.owner.clear();
        self.owner
            .resize_with(num_particles, || AtomicU32::new(MERGE_CLAIM_AVAILABLE));
    }

    pub fn try_claim(&self, j: usize, seed: usize) -> bool {
        self.owner[j]
            .compare_exchange(
                MERGE_CLAIM_AVAILABLE,
                seed as u32,
                atomic::Ordering::SeqCst,
                atomic::Ordering::SeqCst,
            )
            .is_ok()
    }

    /** Only the seed that owns `j` can release it */
    pub fn release(&self, j: usize, seed: usize) {
        let _ = self.owner[j].compare_exchange(
            seed as u32,
            MERGE_CLAIM_AVAILABLE,
            atomic::Ordering::SeqCst,
            atomic::Ordering::SeqCst,
        );
    }

    pub fn owner(&self, j: usize) -> Option<usize> {
        match self.owner[j].load(atomic::Ordering::SeqCst) {
            MERGE_CLAIM_AVAILABLE => None,
            seed => Some(seed as usize),
        }
    }

    pub fn is_claimed(&self, j: usize) -> bool {
        self.owner(j).is_some()
    }
}

/// The particle that replaces a merge group. It is written into the slot of the
/// lowest group index; the other members are retired.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeParameters<const D: usize> {
    pub representative: usize,
    pub retired: Vec<usize>,
    pub mass: FT,
    pub volume: FT,
    pub density: FT,
    pub h_ratio: FT,
    pub position: VF<D>,
    pub velocity: VF<D>,
    pub channel_values: Vec<(ChannelId, ChannelSample<D>)>,
    // set if the density correction ran out of iterations
    pub unconverged: Option<AdaptationError>,
}

pub trait MergeDynamicsTrait<const D: usize> {
    fn check_merge<DU: DimensionUtils<D>>(&self, ctx: &PassContext<DU, D>, i: usize) -> bool;

    /// Merge-eligible neighbors of `i`, nearest first (ties by index).
    fn merge_candidates<DU: DimensionUtils<D>>(&self, ctx: &PassContext<DU, D>, i: usize) -> Vec<usize>;

    /**
     * Claims `i` and as many `candidates` as the group limits allow. Returns the sorted
     * group, or an empty group (with every claim released) if no partner was available.
     */
    fn claim_group<DU: DimensionUtils<D>>(
        &self,
        ctx: &PassContext<DU, D>,
        i: usize,
        candidates: &[usize],
        claims: &MergeClaims,
    ) -> Vec<usize>;

    fn computing_merge<DU: DimensionUtils<D>>(
        &self,
        ctx: &PassContext<DU, D>,
        group: &[usize],
    ) -> Result<MergeParameters<D>, AdaptationError>;

    fn find_merge_group<DU: DimensionUtils<D>>(
        &self,
        ctx: &PassContext<DU, D>,
        i: usize,
        claims: &MergeClaims,
    ) -> Vec<usize> {
        let candidates = self.merge_candidates(ctx, i);
        self.claim_group(ctx, i, &candidates, claims)
    }
}

fn mass_weighted_average<T: ChannelValue<D>, const D: usize>(
    values: &[T],
    group: &[usize],
    masses: &[FT],
    total_mass: FT,
) -> T {
    group
        .iter()
        .zip(masses)
        .fold(T::zero(), |acc, (&k, &m)| acc + values[k] * m)
        * (1. / total_mass)
}

struct MassWeightedAverage<'g, const D: usize> {
    group: &'g [usize],
    masses: &'g [FT],
    total_mass: FT,
    values: Vec<(ChannelId, ChannelSample<D>)>,
}

impl<'g, const D: usize> ChannelVisitor<D> for MassWeightedAverage<'g, D> {
    fn visit<T: ChannelValue<D>>(&mut self, id: ChannelId, _name: &str, values: &[T]) {
        let average = mass_weighted_average::<T, D>(values, self.group, self.masses, self.total_mass);
        self.values.push((id, average.into_sample()));
    }
}

/**
 * Merges small particles outside the refinement region into groups of nearby small
 * particles. Every attribute of the merged particle is the mass-weighted average of the
 * group, so mass and linear momentum are conserved exactly.
 */
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticleMergeWithPrescribedArea {
    pub merge_volume_threshold: FT,
    pub maximum_volume: FT,
    pub search_radius: FT,
    pub max_group_size: usize,
}

impl ParticleMergeWithPrescribedArea {
    pub fn from_params<const D: usize>(params: &AdaptationParams) -> Self {
        ParticleMergeWithPrescribedArea {
            merge_volume_threshold: params.merge_volume_threshold::<D>(),
            maximum_volume: params.maximum_volume::<D>(),
            search_radius: params.merge_search_radius(),
            max_group_size: params.max_merge_group_size,
        }
    }
}

impl<const D: usize> MergeDynamicsTrait<D> for ParticleMergeWithPrescribedArea {
    fn check_merge<DU: DimensionUtils<D>>(&self, ctx: &PassContext<DU, D>, i: usize) -> bool {
        let particles = ctx.particles;
        particles.life_state[i] == LifeState::Active
            && particles.volume[i] < self.merge_volume_threshold
            && !ctx.region.contains(particles.position[i], 0.)
    }

    fn merge_candidates<DU: DimensionUtils<D>>(&self, ctx: &PassContext<DU, D>, i: usize) -> Vec<usize> {
        let position = &ctx.particles.position;
        let max_dist2 = self.search_radius * self.search_radius;

        let mut candidates: Vec<(FT, usize)> = ctx
            .neighs
            .neighbors(i)
            .iter()
            .map(|n| n.j)
            .filter(|&j| j != i && self.check_merge(ctx, j))
            .map(|j| ((position[j] - position[i]).norm_squared(), j))
            .filter(|&(dist2, _)| dist2 <= max_dist2)
            .collect();
        candidates.sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal).then(a.1.cmp(&b.1)));
        candidates.into_iter().map(|(_, j)| j).collect()
    }

    fn claim_group<DU: DimensionUtils<D>>(
        &self,
        ctx: &PassContext<DU, D>,
        i: usize,
        candidates: &[usize],
        claims: &MergeClaims,
    ) -> Vec<usize> {
        if !claims.try_claim(i, i) {
            // already a member of an earlier group
            return Vec::new();
        }

        let volume = &ctx.particles.volume;
        let mut group = vec![i];
        let mut group_volume = volume[i];
        for &j in candidates {
            if group.len() >= self.max_group_size {
                break;
            }
            if group_volume + volume[j] > self.maximum_volume {
                continue;
            }
            if claims.try_claim(j, i) {
                group.push(j);
                group_volume += volume[j];
            }
        }

        if group.len() < 2 {
            claims.release(i, i);
            return Vec::new();
        }

        group.sort_unstable();
        group
    }

    fn computing_merge<DU: DimensionUtils<D>>(
        &self,
        ctx: &PassContext<DU, D>,
        group: &[usize],
    ) -> Result<MergeParameters<D>, AdaptationError> {
        let particles = ctx.particles;
        let seed = group.first().cloned().unwrap_or(0);

        let masses: Vec<FT> = group.iter().map(|&k| particles.mass[k]).collect();
        let total_mass: FT = masses.iter().sum();
        // zero relative to the mass of a reference particle
        let negligible_mass = FT::EPSILON * ctx.params.rest_density * ctx.reference_volume();
        if group.len() < 2 || total_mass <= negligible_mass {
            return Err(AdaptationError::DegenerateMergeGroup {
                seed,
                size: group.len(),
                total_mass,
            });
        }

        let volume: FT = group.iter().map(|&k| particles.volume[k]).sum();
        if volume > self.maximum_volume {
            return Err(AdaptationError::MergeVolumeExceeded {
                seed,
                volume,
                maximum: self.maximum_volume,
            });
        }

        let mut channels = MassWeightedAverage {
            group,
            masses: &masses,
            total_mass,
            values: Vec::with_capacity(ctx.fields.num_channels()),
        };
        ctx.fields.visit(&mut channels);

        let representative = group.iter().cloned().min().unwrap_or(seed);
        Ok(MergeParameters {
            representative,
            retired: group.iter().cloned().filter(|&k| k != representative).collect(),
            mass: total_mass,
            volume,
            density: total_mass / volume,
            h_ratio: h_ratio_from_volume::<D>(ctx.reference_volume(), volume),
            position: mass_weighted_average::<VF<D>, D>(&particles.position, group, &masses, total_mass),
            velocity: mass_weighted_average::<VF<D>, D>(&particles.velocity, group, &masses, total_mass),
            channel_values: channels.values,
            unconverged: None,
        })
    }
}

/// Rescales `velocity` so that the merged particle carries the kinetic energy of the group.
pub fn kinetic_energy_conservation<const D: usize>(
    particles: &ParticleVec<D>,
    group: &[usize],
    mass: FT,
    velocity: VF<D>,
) -> VF<D> {
    let group_energy: FT = group
        .iter()
        .map(|&k| 0.5 * particles.mass[k] * particles.velocity[k].norm_squared())
        .sum();
    let merged_energy = 0.5 * mass * velocity.norm_squared();
    // zero relative to the speeds of the members
    let speed_scale = momentum_scale(particles, group) / mass;
    if velocity.norm_squared() <= FT::EPSILON * speed_scale * speed_scale || merged_energy <= 0. {
        return velocity;
    }
    velocity * (group_energy / merged_energy).sqrt()
}

/// `Σ m_k |v_k|` of the group, the magnitude below which a momentum counts as zero.
fn momentum_scale<const D: usize>(particles: &ParticleVec<D>, group: &[usize]) -> FT {
    group
        .iter()
        .map(|&k| particles.mass[k] * particles.velocity[k].norm())
        .sum()
}

/**
 * Moves `position` so that the merged particle carries the angular momentum of the
 * group about `centroid`. Of all positions with the right angular momentum the one
 * closest to `position` is taken; the shift is limited to `max_shift`.
 */
pub fn angular_momentum_conservation<const D: usize>(
    particles: &ParticleVec<D>,
    group: &[usize],
    centroid: VF<D>,
    mass: FT,
    position: VF<D>,
    velocity: VF<D>,
    max_shift: FT,
) -> VF<D> {
    let angular_momentum = group.iter().fold(V3::zeros(), |acc, &k| {
        acc + embed3(particles.position[k] - centroid).cross(&embed3(particles.velocity[k])) * particles.mass[k]
    });

    let momentum = embed3(velocity) * mass;
    let momentum2 = momentum.norm_squared();
    let scale = momentum_scale(particles, group);
    if momentum2 <= FT::EPSILON * scale * scale {
        // a resting particle has no angular momentum about any point
        return position;
    }

    let r = embed3(position - centroid);
    let l_perp = angular_momentum - momentum * (angular_momentum.dot(&momentum) / momentum2);
    let target = momentum.cross(&l_perp) / momentum2 + momentum * (r.dot(&momentum) / momentum2);

    position + position_limitation(project3::<D>(target - r), 0., max_shift)
}

/**
 * Aggregation as in [`ParticleMergeWithPrescribedArea`], then the merged particle is
 * moved to minimize the density error in its neighborhood. Optionally the velocity is
 * rescaled to keep the kinetic energy and the position is corrected to keep the
 * angular momentum of the group.
 */
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeWithMinimumDensityError {
    pub base: ParticleMergeWithPrescribedArea,
    pub conserve_angular_momentum: bool,
    pub conserve_kinetic_energy: bool,
}

impl<const D: usize> MergeDynamicsTrait<D> for MergeWithMinimumDensityError {
    fn check_merge<DU: DimensionUtils<D>>(&self, ctx: &PassContext<DU, D>, i: usize) -> bool {
        self.base.check_merge(ctx, i)
    }

    fn merge_candidates<DU: DimensionUtils<D>>(&self, ctx: &PassContext<DU, D>, i: usize) -> Vec<usize> {
        self.base.merge_candidates(ctx, i)
    }

    fn claim_group<DU: DimensionUtils<D>>(
        &self,
        ctx: &PassContext<DU, D>,
        i: usize,
        candidates: &[usize],
        claims: &MergeClaims,
    ) -> Vec<usize> {
        self.base.claim_group(ctx, i, candidates, claims)
    }

    fn computing_merge<DU: DimensionUtils<D>>(
        &self,
        ctx: &PassContext<DU, D>,
        group: &[usize],
    ) -> Result<MergeParameters<D>, AdaptationError> {
        let mut merge = self.base.computing_merge(ctx, group)?;
        let centroid = merge.position;

        let change = ProposedChange {
            original_indices: group.to_vec(),
            new_particles: vec![NewParticle {
                position: centroid,
                mass: merge.mass,
                volume: merge.volume,
                h_ratio: merge.h_ratio,
            }],
        };
        let outcome =
            ctx.estimator()
                .get_position_from_density_error(&change, &[centroid], 0., 0.5 * self.base.search_radius);
        merge.position = outcome.positions[0];
        merge.unconverged = outcome.status().err();

        if self.conserve_kinetic_energy {
            merge.velocity = kinetic_energy_conservation(ctx.particles, group, merge.mass, merge.velocity);
        }
        if self.conserve_angular_momentum {
            merge.position = angular_momentum_conservation(
                ctx.particles,
                group,
                centroid,
                merge.mass,
                merge.position,
                merge.velocity,
                self.base.search_radius,
            );
        }

        Ok(merge)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MergeDynamics {
    ParticleMergeWithPrescribedArea(ParticleMergeWithPrescribedArea),
    MergeWithMinimumDensityError(MergeWithMinimumDensityError),
}

impl MergeDynamics {
    pub fn from_params<const D: usize>(params: &AdaptationParams) -> Self {
        let base = ParticleMergeWithPrescribedArea::from_params::<D>(params);
        match params.merge_variant {
            MergeVariant::PrescribedArea => MergeDynamics::ParticleMergeWithPrescribedArea(base),
            MergeVariant::MinimumDensityError => MergeDynamics::MergeWithMinimumDensityError(MergeWithMinimumDensityError {
                base,
                conserve_angular_momentum: params.conserve_angular_momentum,
                conserve_kinetic_energy: params.conserve_kinetic_energy,
            }),
        }
    }
}

impl<const D: usize> MergeDynamicsTrait<D> for MergeDynamics {
    fn check_merge<DU: DimensionUtils<D>>(&self, ctx: &PassContext<DU, D>, i: usize) -> bool {
        match self {
            MergeDynamics::ParticleMergeWithPrescribedArea(x) => x.check_merge(ctx, i),
            MergeDynamics::MergeWithMinimumDensityError(x) => x.check_merge(ctx, i),
        }
    }

    fn merge_candidates<DU: DimensionUtils<D>>(&self, ctx: &PassContext<DU, D>, i: usize) -> Vec<usize> {
        match self {
            MergeDynamics::ParticleMergeWithPrescribedArea(x) => x.merge_candidates(ctx, i),
            MergeDynamics::MergeWithMinimumDensityError(x) => x.merge_candidates(ctx, i),
        }
    }

    fn claim_group<DU: DimensionUtils<D>>(
        &self,
        ctx: &PassContext<DU, D>,
        i: usize,
        candidates: &[usize],
        claims: &MergeClaims,
    ) -> Vec<usize> {
        match self {
            MergeDynamics::ParticleMergeWithPrescribedArea(x) => x.claim_group(ctx, i, candidates, claims),
            MergeDynamics::MergeWithMinimumDensityError(x) => x.claim_group(ctx, i, candidates, claims),
        }
    }

    fn computing_merge<DU: DimensionUtils<D>>(
        &self,
        ctx: &PassContext<DU, D>,
        group: &[usize],
    ) -> Result<MergeParameters<D>, AdaptationError> {
        match self {
            MergeDynamics::ParticleMergeWithPrescribedArea(x) => x.computing_merge(ctx, group),
            MergeDynamics::MergeWithMinimumDensityError(x) => x.computing_merge(ctx, group),
        }
    }
}

/// Writes the merged particle into its representative slot and retires the other members.
/// The retired slots are handed back to the buffer by the caller once the pass is done.
pub fn exec_merge<const D: usize>(body: &mut ParticleBody<D>, merge: &MergeParameters<D>) {
    let r = merge.representative;
    let particles = &mut body.particles;
    particles.mass[r] = merge.mass;
    particles.volume[r] = merge.volume;
    particles.density[r] = merge.density;
    particles.h_ratio[r] = merge.h_ratio;
    particles.position[r] = merge.position;
    particles.velocity[r] = merge.velocity;
    particles.life_state[r] = LifeState::Active;

    for &(id, sample) in &merge.channel_values {
        let written = body.fields.set(id, r, sample);
        debug_assert!(written, "channel {} changed its type during the pass", body.fields.name(id));
    }

    for &k in &merge.retired {
        body.particles.life_state[k] = LifeState::Merged;
    }
}
