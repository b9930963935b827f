/*!
Particle splitting and merging.

One refinement pass works on a snapshot of the body: eligibility, child placement,
merge group search and aggregation are evaluated in parallel on the snapshot, then
the results are committed. New children and retired particles only become visible
to the next pass, so the caller has to rebuild neighborhoods after every pass.
*/

use std::marker::PhantomData;

use log::{debug, error, info, warn};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    assert_ft_approx_eq,
    concurrency::{par_filter_map, par_map},
    error::{AdaptationError, ConfigError, PassError},
    field_channels::FieldChannels,
    floating_type_mod::FT,
    neighborhood_search::{BoundaryContact, NeighborhoodProvider},
    particle_buffer::LifeState,
    particles::{ParticleBody, ParticleVec},
    region::Region,
    simulation_parameters::AdaptationParams,
    sph_kernels::{smoothing_length_from_ratio, DimensionUtils},
    TINY_REAL,
};

use self::{
    density_error::DensityErrorEstimator,
    particle_merging::{exec_merge, MergeClaims, MergeDynamics, MergeDynamicsTrait},
    splitting::{exec_other_split, SplitDynamics, SplitDynamicsTrait},
};

pub mod density_error;
pub mod particle_merging;
pub mod splitting;

/// Time of the step that triggers a pass, passed explicitly instead of a global clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepInfo {
    pub time: FT,
    pub dt: FT,
    pub step_number: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    pub time: FT,
    pub dt: FT,
    pub splits: usize,
    pub new_particles: usize,
    pub merges: usize,
    pub retired_particles: usize,
    // per particle failures that did not stop the pass
    pub failures: Vec<(usize, AdaptationError)>,
}

/**
 * Read-only view of a body for the parallel phases of a pass.
 */
pub struct PassContext<'a, DU: DimensionUtils<D>, const D: usize> {
    pub particles: &'a ParticleVec<D>,
    pub fields: &'a FieldChannels<D>,
    pub neighs: &'a dyn NeighborhoodProvider<D>,
    pub contact: Option<&'a BoundaryContact<DU, D>>,
    pub region: &'a Region<D>,
    pub params: AdaptationParams,
}

impl<'a, DU: DimensionUtils<D>, const D: usize> PassContext<'a, DU, D> {
    pub fn new(
        body: &'a ParticleBody<D>,
        neighs: &'a dyn NeighborhoodProvider<D>,
        contact: Option<&'a BoundaryContact<DU, D>>,
        region: &'a Region<D>,
        params: AdaptationParams,
    ) -> Self {
        PassContext {
            particles: &body.particles,
            fields: &body.fields,
            neighs,
            contact,
            region,
            params,
        }
    }

    #[inline(always)]
    pub fn smoothing_length(&self, i: usize) -> FT {
        smoothing_length_from_ratio(self.params.smoothing_length, self.particles.h_ratio[i])
    }

    pub fn reference_volume(&self) -> FT {
        self.params.reference_volume::<D>()
    }

    pub fn estimator(&self) -> DensityErrorEstimator<'_, 'a, DU, D> {
        DensityErrorEstimator::new(self)
    }
}

/// Every particle draws from its own generator so parallel sampling stays reproducible.
pub fn particle_rng(seed: u64, pass_number: u64, i: usize) -> StdRng {
    StdRng::seed_from_u64(
        seed ^ pass_number.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (i as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F),
    )
}

/**
 * Split and merge dynamics of one body.
 */
pub struct ParticleAdaptation<DU: DimensionUtils<D>, const D: usize> {
    params: AdaptationParams,
    region: Region<D>,
    split_dynamics: SplitDynamics,
    merge_dynamics: MergeDynamics,
    claims: MergeClaims,
    pass_number: u64,
    halted: bool,
    _marker: PhantomData<DU>,
}

impl<DU: DimensionUtils<D>, const D: usize> ParticleAdaptation<DU, D> {
    pub fn new(params: AdaptationParams, refinement_region: Region<D>) -> Result<Self, ConfigError> {
        params.validate()?;
        Ok(ParticleAdaptation {
            params,
            region: refinement_region,
            split_dynamics: SplitDynamics::from_params::<D>(&params),
            merge_dynamics: MergeDynamics::from_params::<D>(&params),
            claims: MergeClaims::new(0),
            pass_number: 0,
            halted: false,
            _marker: PhantomData::default(),
        })
    }

    pub fn params(&self) -> &AdaptationParams {
        &self.params
    }

    pub fn region(&self) -> &Region<D> {
        &self.region
    }

    pub fn split_dynamics(&self) -> &SplitDynamics {
        &self.split_dynamics
    }

    pub fn merge_dynamics(&self) -> &MergeDynamics {
        &self.merge_dynamics
    }

    /** Set after a buffer exhaustion; no further passes are run for this body */
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn pass_number(&self) -> u64 {
        self.pass_number
    }

    /// Resets the per-pass state for a body with `num_particles` slots.
    pub fn setup_dynamics(&mut self, num_particles: usize, dt: FT) {
        self.claims.reset(num_particles);
        self.pass_number += 1;
        debug!("refinement pass {} (dt={}) over {} slots", self.pass_number, dt, num_particles);
    }

    /**
     * Runs a pass if `step` falls on the configured cadence. Returns `Ok(None)` for
     * skipped steps.
     */
    pub fn update(
        &mut self,
        body: &mut ParticleBody<D>,
        neighs: &dyn NeighborhoodProvider<D>,
        contact: Option<&BoundaryContact<DU, D>>,
        step: StepInfo,
    ) -> Result<Option<PassReport>, PassError> {
        if step.step_number % self.params.adaptation_interval != 0 {
            return Ok(None);
        }
        self.run_pass(body, neighs, contact, step).map(Some)
    }

    /**
     * One split/merge pass. A buffer exhaustion halts the body; the returned
     * [`PassError`] then still carries the report of what was committed before.
     */
    pub fn run_pass(
        &mut self,
        body: &mut ParticleBody<D>,
        neighs: &dyn NeighborhoodProvider<D>,
        contact: Option<&BoundaryContact<DU, D>>,
        step: StepInfo,
    ) -> Result<PassReport, PassError> {
        if self.halted {
            return Err(AdaptationError::RefinementHalted.into());
        }

        self.setup_dynamics(body.len(), step.dt);

        let total_mass_before = body.total_mass();
        let total_volume_before = body.total_volume();
        let mut report = PassReport {
            time: step.time,
            dt: step.dt,
            ..PassReport::default()
        };

        let live = body.live_indices();

        let (merge_groups, merge_results, split_proposals) = {
            let ctx = PassContext::new(body, neighs, contact, &self.region, self.params);
            let merge_dynamics = &self.merge_dynamics;
            let split_dynamics = &self.split_dynamics;
            let claims = &self.claims;

            let candidates = par_filter_map(&live, |i| {
                if merge_dynamics.check_merge(&ctx, i) {
                    Some((i, merge_dynamics.merge_candidates(&ctx, i)))
                } else {
                    None
                }
            });

            // claims are resolved in ascending seed order, so lower indices win ties
            let merge_groups: Vec<Vec<usize>> = candidates
                .iter()
                .map(|(i, candidates)| merge_dynamics.claim_group(&ctx, *i, candidates, claims))
                .filter(|group| group.len() >= 2)
                .collect();

            let merge_results = par_map(&merge_groups, |group| merge_dynamics.computing_merge(&ctx, group));

            let seed = self.params.random_seed;
            let pass_number = self.pass_number;
            let split_proposals = par_filter_map(&live, |i| {
                if claims.is_claimed(i) || !split_dynamics.check_split(&ctx, i) {
                    return None;
                }
                let mut rng = particle_rng(seed, pass_number, i);
                Some((i, split_dynamics.exec_first_split(&ctx, i, &mut rng)))
            });

            (merge_groups, merge_results, split_proposals)
        };

        // ---------------------------------------------------------------------------
        // commit merges
        let mut retired_slots = Vec::new();
        for (group, result) in merge_groups.iter().zip(merge_results) {
            match result {
                Ok(merge_parameters) => {
                    if let Some(e) = &merge_parameters.unconverged {
                        warn!("merge into particle {}: {}", merge_parameters.representative, e);
                        report.failures.push((merge_parameters.representative, e.clone()));
                    }
                    debug!(
                        "merge particles {:?} into {}",
                        merge_parameters.retired, merge_parameters.representative
                    );
                    exec_merge(body, &merge_parameters);
                    report.merges += 1;
                    report.retired_particles += merge_parameters.retired.len();
                    retired_slots.extend(merge_parameters.retired.iter().cloned());
                }
                Err(e) => {
                    debug!("merge group {:?} rejected: {}", group, e);
                    report.failures.push((group[0], e));
                }
            }
        }

        // ---------------------------------------------------------------------------
        // commit splits
        for (i, proposal) in &split_proposals {
            if proposal.is_ok() {
                body.particles.life_state[*i] = LifeState::PendingSplit;
            }
        }

        let reference_volume = self.params.reference_volume::<D>();
        let mut exhaustion = None;
        for (i, proposal) in split_proposals {
            let split_parameters = match proposal {
                Ok(split_parameters) => split_parameters,
                Err(e) => {
                    warn!("particle {} skipped this pass: {}", i, e);
                    report.failures.push((i, e));
                    continue;
                }
            };

            if exhaustion.is_some() {
                body.particles.life_state[i] = LifeState::Active;
                continue;
            }

            match exec_other_split(body, i, &split_parameters, reference_volume) {
                Ok(children) => {
                    if let Some(e) = split_parameters.unconverged {
                        warn!("split of particle {}: {}", i, e);
                        report.failures.push((i, e));
                    }
                    debug!("split particle {} into slots {:?}", i, children);
                    report.splits += 1;
                    report.new_particles += children.len();
                }
                Err(e) => {
                    error!("refinement halted: {}", e);
                    body.particles.life_state[i] = LifeState::Active;
                    exhaustion = Some(e);
                }
            }
        }

        // retired slots stay readable until the pass is complete
        retired_slots.sort_unstable_by(|a, b| b.cmp(a));
        for slot in retired_slots {
            body.buffer.release_slot(slot);
        }

        let total_mass_after = body.total_mass();
        assert_ft_approx_eq(
            total_mass_before,
            total_mass_after,
            FT::EPSILON.sqrt() * total_mass_before.abs().max(TINY_REAL),
            || "mass sum".to_string(),
        );
        assert_ft_approx_eq(
            total_volume_before,
            body.total_volume(),
            FT::EPSILON.sqrt() * total_volume_before.abs().max(TINY_REAL),
            || "volume sum".to_string(),
        );

        info!(
            "refinement pass {} at t={}: {} splits (+{} particles), {} merges (-{} particles), {} failures, {} live particles",
            self.pass_number,
            step.time,
            report.splits,
            report.new_particles,
            report.merges,
            report.retired_particles,
            report.failures.len(),
            body.num_live_particles()
        );

        if let Some(error) = exhaustion {
            self.halted = true;
            return Err(PassError { error, report });
        }

        Ok(report)
    }
}
