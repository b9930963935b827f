use rand::{rngs::StdRng, Rng};

use crate::{
    adaptivity::{
        density_error::{NewParticle, ProposedChange},
        PassContext,
    },
    error::AdaptationError,
    floating_type_mod::{FT, TAU},
    particle_buffer::LifeState,
    particles::ParticleBody,
    region::RegionPredicate,
    simulation_parameters::{AdaptationParams, SplitVariant},
    sph_kernels::{h_ratio_from_volume, DimensionUtils},
    VF,
};

/// Displacements of the children from the parent position. Child 0 reuses the parent slot.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitParameters<const D: usize> {
    pub shifts: Vec<VF<D>>,
    // set if the density correction ran out of iterations, the shifts are then its best candidate
    pub unconverged: Option<AdaptationError>,
}

pub trait SplitDynamicsTrait<const D: usize> {
    fn check_split<DU: DimensionUtils<D>>(&self, ctx: &PassContext<DU, D>, i: usize) -> bool;

    /// Child placement for particle `i`, evaluated on the snapshot only.
    fn exec_first_split<DU: DimensionUtils<D>>(
        &self,
        ctx: &PassContext<DU, D>,
        i: usize,
        rng: &mut StdRng,
    ) -> Result<SplitParameters<D>, AdaptationError>;
}

fn standard_normal(rng: &mut StdRng) -> FT {
    // Box-Muller
    let u1: FT = rng.gen::<FT>().max(FT::MIN_POSITIVE);
    let u2: FT = rng.gen();
    (-2. * u1.ln()).sqrt() * (TAU * u2).cos()
}

/**
 * Splits particles inside the refinement region into `num_children` equal parts that
 * are scattered randomly around the parent.
 */
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefinementInPrescribedRegion {
    pub split_volume_threshold: FT,
    pub num_children: usize,
    pub displacement_factor: FT,
    pub retry_budget: usize,
}

impl RefinementInPrescribedRegion {
    pub fn from_params<const D: usize>(params: &AdaptationParams) -> Self {
        RefinementInPrescribedRegion {
            split_volume_threshold: params.split_volume_threshold::<D>(),
            num_children: params.split_children,
            displacement_factor: params.split_displacement_factor,
            retry_budget: params.split_retry_budget,
        }
    }

    pub fn child_spacing<DU: DimensionUtils<D>, const D: usize>(&self, parent_volume: FT) -> FT {
        DU::volume_to_spacing(parent_volume / self.num_children as FT)
    }

    /**
     * Draws normally distributed displacements with zero mean until every child lands
     * inside the region or the retry budget is used up.
     */
    pub fn sample_shifts<DU: DimensionUtils<D>, const D: usize>(
        &self,
        ctx: &PassContext<DU, D>,
        i: usize,
        rng: &mut StdRng,
    ) -> Result<Vec<VF<D>>, AdaptationError> {
        let x = ctx.particles.position[i];
        let sigma = self.displacement_factor * self.child_spacing::<DU, D>(ctx.particles.volume[i]);
        let n = self.num_children;

        for _ in 0..self.retry_budget {
            let mut shifts: Vec<VF<D>> = (0..n)
                .map(|_| VF::<D>::from_iterator((0..D).map(|_| standard_normal(rng) * sigma)))
                .collect();
            let mean = shifts.iter().fold(VF::<D>::zeros(), |acc, s| acc + s) / n as FT;
            for shift in &mut shifts {
                *shift -= mean;
            }

            if shifts.iter().all(|shift| ctx.region.contains(x + shift, 0.)) {
                return Ok(shifts);
            }
        }

        Err(AdaptationError::InvalidCandidatePosition {
            particle: i,
            samples: self.retry_budget,
        })
    }
}

impl<const D: usize> SplitDynamicsTrait<D> for RefinementInPrescribedRegion {
    fn check_split<DU: DimensionUtils<D>>(&self, ctx: &PassContext<DU, D>, i: usize) -> bool {
        let volume = ctx.particles.volume[i];
        ctx.particles.life_state[i] == LifeState::Active
            && volume > self.split_volume_threshold
            && ctx.region.contains(ctx.particles.position[i], volume)
    }

    fn exec_first_split<DU: DimensionUtils<D>>(
        &self,
        ctx: &PassContext<DU, D>,
        i: usize,
        rng: &mut StdRng,
    ) -> Result<SplitParameters<D>, AdaptationError> {
        Ok(SplitParameters {
            shifts: self.sample_shifts(ctx, i, rng)?,
            unconverged: None,
        })
    }
}

/**
 * Random placement as in [`RefinementInPrescribedRegion`], then the children are moved
 * to minimize the density error of themselves and of the parent's neighbors. Every
 * child stays between 0.1 and 1 child spacings away from the parent.
 */
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitWithMinimumDensityError {
    pub base: RefinementInPrescribedRegion,
}

impl<const D: usize> SplitDynamicsTrait<D> for SplitWithMinimumDensityError {
    fn check_split<DU: DimensionUtils<D>>(&self, ctx: &PassContext<DU, D>, i: usize) -> bool {
        self.base.check_split(ctx, i)
    }

    fn exec_first_split<DU: DimensionUtils<D>>(
        &self,
        ctx: &PassContext<DU, D>,
        i: usize,
        rng: &mut StdRng,
    ) -> Result<SplitParameters<D>, AdaptationError> {
        let shifts = self.base.sample_shifts(ctx, i, rng)?;

        let particles = ctx.particles;
        let x = particles.position[i];
        let n = self.base.num_children as FT;
        let child_volume = particles.volume[i] / n;
        let child_spacing = self.base.child_spacing::<DU, D>(particles.volume[i]);
        let h_ratio = h_ratio_from_volume::<D>(ctx.reference_volume(), child_volume);

        let change = ProposedChange {
            original_indices: vec![i],
            new_particles: shifts
                .iter()
                .map(|shift| NewParticle {
                    position: x + shift,
                    mass: particles.mass[i] / n,
                    volume: child_volume,
                    h_ratio,
                })
                .collect(),
        };
        let anchors = vec![x; shifts.len()];
        let outcome =
            ctx.estimator()
                .get_position_from_density_error(&change, &anchors, 0.1 * child_spacing, child_spacing);

        let corrected: Vec<VF<D>> = outcome.positions.iter().map(|p| p - x).collect();
        let shifts = if corrected.iter().all(|shift| ctx.region.contains(x + shift, 0.)) {
            corrected
        } else {
            shifts
        };

        Ok(SplitParameters {
            shifts,
            unconverged: outcome.status().err(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SplitDynamics {
    RefinementInPrescribedRegion(RefinementInPrescribedRegion),
    SplitWithMinimumDensityError(SplitWithMinimumDensityError),
}

impl SplitDynamics {
    pub fn from_params<const D: usize>(params: &AdaptationParams) -> Self {
        let base = RefinementInPrescribedRegion::from_params::<D>(params);
        match params.split_variant {
            SplitVariant::RefinementInPrescribedRegion => SplitDynamics::RefinementInPrescribedRegion(base),
            SplitVariant::MinimumDensityError => {
                SplitDynamics::SplitWithMinimumDensityError(SplitWithMinimumDensityError { base })
            }
        }
    }
}

impl<const D: usize> SplitDynamicsTrait<D> for SplitDynamics {
    fn check_split<DU: DimensionUtils<D>>(&self, ctx: &PassContext<DU, D>, i: usize) -> bool {
        match self {
            SplitDynamics::RefinementInPrescribedRegion(x) => x.check_split(ctx, i),
            SplitDynamics::SplitWithMinimumDensityError(x) => x.check_split(ctx, i),
        }
    }

    fn exec_first_split<DU: DimensionUtils<D>>(
        &self,
        ctx: &PassContext<DU, D>,
        i: usize,
        rng: &mut StdRng,
    ) -> Result<SplitParameters<D>, AdaptationError> {
        match self {
            SplitDynamics::RefinementInPrescribedRegion(x) => x.exec_first_split(ctx, i, rng),
            SplitDynamics::SplitWithMinimumDensityError(x) => x.exec_first_split(ctx, i, rng),
        }
    }
}

/**
 * Materializes the children of `i` into claimed buffer slots. Mass and volume are
 * divided equally; the parent slot keeps the remainder so that the sums are exact.
 * Every other attribute (velocity, density, channels) is copied from the parent.
 *
 * If the pool runs dry, the slots claimed so far are released and the body is left
 * untouched.
 */
pub fn exec_other_split<const D: usize>(
    body: &mut ParticleBody<D>,
    i: usize,
    split_parameters: &SplitParameters<D>,
    reference_volume: FT,
) -> Result<Vec<usize>, AdaptationError> {
    let num_children = split_parameters.shifts.len();
    assert!(num_children >= 2);

    let mut slots = Vec::with_capacity(num_children - 1);
    for _ in 1..num_children {
        match body.buffer.claim_slot() {
            Ok(slot) => slots.push(slot),
            Err(e) => {
                for &slot in slots.iter().rev() {
                    body.buffer.release_slot(slot);
                }
                return Err(AdaptationError::BufferExhausted {
                    parent: i,
                    capacity: e.capacity,
                });
            }
        }
    }

    let orig_position = body.particles.position[i];
    let orig_mass = body.particles.mass[i];
    let orig_volume = body.particles.volume[i];

    let child_mass = orig_mass / num_children as FT;
    let child_volume = orig_volume / num_children as FT;
    let child_h_ratio = h_ratio_from_volume::<D>(reference_volume, child_volume);

    for (child_id, &slot) in slots.iter().enumerate() {
        body.copy_particle(i, slot);
        let particles = &mut body.particles;
        particles.position[slot] = orig_position + split_parameters.shifts[child_id + 1];
        particles.mass[slot] = child_mass;
        particles.volume[slot] = child_volume;
        particles.h_ratio[slot] = child_h_ratio;
        particles.life_state[slot] = LifeState::Active;
    }

    let num_others = slots.len() as FT;
    let particles = &mut body.particles;
    particles.position[i] = orig_position + split_parameters.shifts[0];
    particles.mass[i] = orig_mass - child_mass * num_others;
    particles.volume[i] = orig_volume - child_volume * num_others;
    particles.h_ratio[i] = child_h_ratio;
    particles.life_state[i] = LifeState::Active;

    Ok(slots)
}
