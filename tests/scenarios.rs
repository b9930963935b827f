use adaptive_refinement::{
    adaptivity::density_error::{NewParticle, ProposedChange},
    adaptivity::PassContext,
    floating_type_mod::FT,
    sph_kernels::{h_ratio_from_volume, DimensionUtils2d, DimensionUtils3d},
    vec2f, vec3f, AdaptationError, AdaptationParams, BoundaryContact, BoundingBox, FieldChannels, LifeState,
    MergeVariant, NeighborhoodCache, ParticleAdaptation, ParticleBody, ParticleVec, PassError, PassReport, Region,
    SplitVariant, StepInfo, VF,
};

type Adaptation = ParticleAdaptation<DimensionUtils2d, 2>;

fn params() -> AdaptationParams {
    AdaptationParams {
        rest_density: 1000.,
        reference_spacing: 0.1,
        smoothing_length: 0.13,
        ..AdaptationParams::default()
    }
}

fn unit_box() -> Region<2> {
    Region::Box(BoundingBox::new(vec2f(0., 0.), vec2f(1., 1.)))
}

fn body_from(
    positions: &[VF<2>],
    volume: FT,
    params: &AdaptationParams,
    buffer_width: usize,
) -> ParticleBody<2> {
    let mut particles = ParticleVec::<2>::default(positions.len());
    for (i, &x) in positions.iter().enumerate() {
        particles.position[i] = x;
        particles.velocity[i] = vec2f(x.y, -x.x);
        particles.volume[i] = volume;
        particles.mass[i] = volume * params.rest_density;
        particles.density[i] = params.rest_density;
        particles.h_ratio[i] = h_ratio_from_volume::<2>(params.reference_volume::<2>(), volume);
    }
    let mut fields = FieldChannels::new(positions.len());
    let phi = fields.register_scalar("Phi", 0.);
    let u = fields.register_vector("Displacement", VF::<2>::zeros());
    for i in 0..positions.len() {
        fields.scalar_mut(phi).unwrap()[i] = i as FT;
        fields.vector_mut(u).unwrap()[i] = vec2f(1., i as FT);
    }
    ParticleBody::new(particles, fields, buffer_width)
}

fn lattice(nx: usize, ny: usize, params: &AdaptationParams) -> Vec<VF<2>> {
    let spacing = params.reference_spacing;
    (0..nx * ny)
        .map(|i| vec2f((i % nx) as FT * spacing, (i / nx) as FT * spacing))
        .collect()
}

fn step(step_number: usize) -> StepInfo {
    StepInfo {
        time: step_number as FT * 1e-3,
        dt: 1e-3,
        step_number,
    }
}

fn run_pass(adaptation: &mut Adaptation, body: &mut ParticleBody<2>, step_number: usize) -> Result<PassReport, PassError> {
    let neighs = NeighborhoodCache::build::<DimensionUtils2d>(&body.particles, adaptation.params().smoothing_length);
    adaptation.run_pass(body, &neighs, None, step(step_number))
}

fn assert_close(a: FT, b: FT, tolerance: FT) {
    assert!((a - b).abs() <= tolerance, "{} != {} (tolerance {})", a, b, tolerance);
}

#[test]
fn scenario_a_split_into_two_halves() {
    let params = params();
    let volume = params.reference_volume::<2>();
    let mut body = body_from(&[vec2f(0.5, 0.5)], volume, &params, 1);
    let mass = body.particles.mass[0];
    let mut adaptation = Adaptation::new(params, unit_box()).unwrap();

    let report = run_pass(&mut adaptation, &mut body, 1).unwrap();

    assert_eq!(report.splits, 1);
    assert_eq!(report.new_particles, 1);
    assert!(report.failures.is_empty());
    assert_eq!(body.num_live_particles(), 2);
    for i in 0..2 {
        assert_eq!(body.state_of(i), LifeState::Active);
        assert_close(body.particles.mass[i], mass / 2., 1e-12);
        assert_close(body.particles.volume[i], volume / 2., 1e-15);
        assert_eq!(body.particles.velocity[i], vec2f(0.5, -0.5));
    }
    // center of mass stays at the parent position
    let center = (body.particles.position[0] + body.particles.position[1]) / 2.;
    assert!((center - vec2f(0.5, 0.5)).norm() < 1e-12);
    assert!(body.particles.position[0] != body.particles.position[1]);
    assert_eq!(body.buffer.available(), 0);
}

#[test]
fn scenario_b_merge_three_into_one() {
    let params = params();
    let volume = 0.5 * params.reference_volume::<2>();
    let positions = [vec2f(0., 0.), vec2f(0.01, 0.), vec2f(0., 0.01)];
    let mut body = body_from(&positions, volume, &params, 0);
    let mass = body.total_mass();
    let momentum = body.total_momentum();
    let mut adaptation = Adaptation::new(params, Region::Nowhere).unwrap();

    let report = run_pass(&mut adaptation, &mut body, 1).unwrap();

    assert_eq!(report.merges, 1);
    assert_eq!(report.retired_particles, 2);
    assert_eq!(body.state_of(0), LifeState::Active);
    assert_eq!(body.state_of(1), LifeState::Merged);
    assert_eq!(body.state_of(2), LifeState::Merged);
    assert_eq!(body.num_live_particles(), 1);
    assert_close(body.particles.mass[0], mass, 1e-12);
    assert_close(body.particles.volume[0], 3. * volume, 1e-15);
    assert!((body.total_momentum() - momentum).norm() < 1e-9);
    // both retired slots are back in the free list
    assert_eq!(body.buffer.available(), 2);

    let phi = body.fields.id_of("Phi").unwrap();
    assert_close(body.fields.scalar(phi).unwrap()[0], 1., 1e-12);
}

#[test]
fn scenario_c_empty_reserve_halts_refinement() {
    let params = params();
    let mut body = body_from(&[vec2f(0.5, 0.5)], params.reference_volume::<2>(), &params, 0);
    let before_position = body.particles.position[0];
    let before_mass = body.particles.mass[0];
    let mut adaptation = Adaptation::new(params, unit_box()).unwrap();

    let result = run_pass(&mut adaptation, &mut body, 1).map_err(|e| e.error);

    assert_eq!(
        result,
        Err(AdaptationError::BufferExhausted {
            parent: 0,
            capacity: 0
        })
    );
    assert!(result.unwrap_err().is_fatal());
    assert_eq!(body.len(), 1);
    assert_eq!(body.num_live_particles(), 1);
    assert_eq!(body.state_of(0), LifeState::Active);
    assert_eq!(body.particles.position[0], before_position);
    assert_eq!(body.particles.mass[0], before_mass);

    assert!(adaptation.is_halted());
    assert_eq!(
        run_pass(&mut adaptation, &mut body, 2).map_err(|e| e.error),
        Err(AdaptationError::RefinementHalted)
    );
}

#[test]
fn aborted_pass_reports_committed_merges() {
    let params = params();
    // particle 0 splits, the three others are small and far outside the refinement box
    let positions = [vec2f(0.5, 0.5), vec2f(3., 3.), vec2f(3.01, 3.), vec2f(3., 3.01)];
    let mut body = body_from(&positions, params.reference_volume::<2>(), &params, 0);
    let small = 0.5 * params.reference_volume::<2>();
    for k in 1..4 {
        body.particles.volume[k] = small;
        body.particles.mass[k] = small * params.rest_density;
        body.particles.h_ratio[k] = h_ratio_from_volume::<2>(params.reference_volume::<2>(), small);
    }
    let mass = body.total_mass();
    let mut adaptation = Adaptation::new(params, unit_box()).unwrap();

    let err = run_pass(&mut adaptation, &mut body, 1).unwrap_err();

    assert_eq!(
        err.error,
        AdaptationError::BufferExhausted {
            parent: 0,
            capacity: 0
        }
    );
    assert_eq!(err.report.merges, 1);
    assert_eq!(err.report.retired_particles, 2);
    assert_eq!(err.report.splits, 0);
    assert_eq!(err.report.time, step(1).time);
    assert_eq!(body.num_live_particles(), 2);
    assert_eq!(body.state_of(0), LifeState::Active);
    assert_close(body.total_mass(), mass, 1e-9);
    // the merged slots were still released
    assert_eq!(body.buffer.available(), 2);
    assert!(adaptation.is_halted());
}

#[test]
fn scenario_d_zero_error_candidate_is_kept() {
    let params = params();
    let mut body = body_from(&lattice(5, 5, &params), params.reference_volume::<2>(), &params, 0);
    for i in 0..body.len() {
        body.particles.velocity[i] = VF::<2>::zeros();
    }
    let neighs = NeighborhoodCache::build::<DimensionUtils2d>(&body.particles, params.smoothing_length);
    let region = Region::Everywhere;
    let ctx = PassContext::<DimensionUtils2d, 2>::new(&body, &neighs, None, &region, params);

    let i = 12;
    let p = &body.particles;
    let change = ProposedChange {
        original_indices: vec![i],
        new_particles: vec![NewParticle {
            position: p.position[i],
            mass: p.mass[i],
            volume: p.volume[i],
            h_ratio: p.h_ratio[i],
        }],
    };
    let outcome = ctx
        .estimator()
        .get_position_from_density_error(&change, &[p.position[i]], 0., 0.1);

    assert!(outcome.converged);
    assert_eq!(outcome.iterations, 1);
    assert_eq!(outcome.positions, vec![p.position[i]]);
}

#[test]
fn ineligible_particles_are_left_unchanged() {
    let params = params();
    let reference_volume = params.reference_volume::<2>();
    // 0: outside the region with the reference volume, 1: inside the region but small
    let mut body = body_from(&[vec2f(5., 5.), vec2f(0.5, 0.5)], reference_volume, &params, 4);
    body.particles.volume[1] = 0.5 * reference_volume;
    body.particles.mass[1] = 0.5 * reference_volume * params.rest_density;

    let snapshot = |body: &ParticleBody<2>, i: usize| {
        let p = &body.particles;
        (
            p.position[i],
            p.velocity[i],
            p.mass[i],
            p.volume[i],
            p.density[i],
            p.h_ratio[i],
            p.life_state[i],
            body.fields.get(body.fields.id_of("Phi").unwrap(), i),
            body.fields.get(body.fields.id_of("Displacement").unwrap(), i),
        )
    };
    let before: Vec<_> = (0..2).map(|i| snapshot(&body, i)).collect();

    let mut adaptation = Adaptation::new(params, unit_box()).unwrap();
    let report = run_pass(&mut adaptation, &mut body, 1).unwrap();

    assert_eq!(report, PassReport { time: 1e-3, dt: 1e-3, ..PassReport::default() });
    let after: Vec<_> = (0..2).map(|i| snapshot(&body, i)).collect();
    assert_eq!(before, after);
    assert_eq!(body.buffer.available(), 4);
}

#[test]
fn refine_then_coarsen_conserves_mass_and_momentum() {
    let params = params();
    let positions = lattice(10, 10, &params);
    let mut body = body_from(&positions, params.reference_volume::<2>(), &params, 100);
    let mass = body.total_mass();
    let volume = body.total_volume();
    let momentum = body.total_momentum();

    // the columns x <= 0.4 fit into the region including their footprint
    let region = Region::Box(BoundingBox::new(vec2f(-1., -1.), vec2f(0.47, 2.)));
    let mut refine = Adaptation::new(params, region).unwrap();
    let report = run_pass(&mut refine, &mut body, 1).unwrap();

    assert_eq!(report.splits, 50);
    assert_eq!(body.num_live_particles(), 150);
    assert_close(body.total_mass(), mass, 1e-9 * mass);
    assert_close(body.total_volume(), volume, 1e-9 * volume);
    assert!((body.total_momentum() - momentum).norm() < 1e-9 * mass);

    // children are neither large enough to split again nor outside the region
    let report = run_pass(&mut refine, &mut body, 2).unwrap();
    assert_eq!((report.splits, report.merges), (0, 0));

    // the region moved away: every child is merged back
    let mut coarsen = Adaptation::new(params, Region::Nowhere).unwrap();
    let report = run_pass(&mut coarsen, &mut body, 3).unwrap();
    assert!(report.merges > 0);
    assert!(body.num_live_particles() < 150);
    assert_eq!(body.buffer.available(), 50 + report.retired_particles);
    assert_close(body.total_mass(), mass, 1e-9 * mass);
    assert_close(body.total_volume(), volume, 1e-9 * volume);
    assert!((body.total_momentum() - momentum).norm() < 1e-9 * mass);
    for i in 0..body.len() {
        if body.is_live(i) {
            assert!(body.particles.volume[i] <= params.maximum_volume::<2>() + 1e-15);
        }
    }
}

#[test]
fn merged_slots_are_recycled_by_later_splits() {
    let params = params();
    let volume = 0.5 * params.reference_volume::<2>();
    let mut body = body_from(&[vec2f(0., 0.), vec2f(0.01, 0.), vec2f(0., 0.01)], volume, &params, 0);

    let mut coarsen = Adaptation::new(params, Region::Nowhere).unwrap();
    run_pass(&mut coarsen, &mut body, 1).unwrap();
    assert_eq!(body.num_live_particles(), 1);

    let mut refine = Adaptation::new(params, Region::Everywhere).unwrap();
    let report = run_pass(&mut refine, &mut body, 2).unwrap();

    assert_eq!(report.splits, 1);
    assert_eq!(body.num_live_particles(), 2);
    assert_eq!(body.state_of(1), LifeState::Active);
    assert_eq!(body.state_of(2), LifeState::Merged);
    assert_close(body.total_volume(), 3. * volume, 1e-15);
}

#[test]
fn passes_follow_the_configured_cadence() {
    let mut params = params();
    params.adaptation_interval = 2;
    let mut body = body_from(&[vec2f(0.5, 0.5)], params.reference_volume::<2>(), &params, 4);
    let mut adaptation = Adaptation::new(params, unit_box()).unwrap();
    let neighs = NeighborhoodCache::build::<DimensionUtils2d>(&body.particles, params.smoothing_length);

    assert_eq!(adaptation.update(&mut body, &neighs, None, step(1)), Ok(None));
    assert_eq!(body.num_live_particles(), 1);
    assert_eq!(adaptation.pass_number(), 0);

    let report = adaptation.update(&mut body, &neighs, None, step(2)).unwrap().unwrap();
    assert_eq!(report.splits, 1);
    assert_eq!(adaptation.pass_number(), 1);
}

#[test]
fn same_seed_gives_the_same_children() {
    let params = params();
    let run = || {
        let mut body = body_from(&lattice(4, 4, &params), params.reference_volume::<2>(), &params, 16);
        let mut adaptation = Adaptation::new(params, Region::Everywhere).unwrap();
        run_pass(&mut adaptation, &mut body, 1).unwrap();
        body.particles.position.clone()
    };
    assert_eq!(run(), run());
}

#[test]
fn minimum_density_error_variants_near_a_wall() {
    let mut params = params();
    params.split_variant = SplitVariant::MinimumDensityError;
    params.merge_variant = MergeVariant::MinimumDensityError;

    let mut wall = BoundaryContact::<DimensionUtils2d, 2>::new(
        (0..12).map(|i| vec2f(i as FT * 0.05 - 0.05, -0.1)).collect(),
        vec![0.0025; 12],
        0.065,
    );

    let mut body = body_from(&lattice(5, 3, &params), params.reference_volume::<2>(), &params, 20);
    let mass = body.total_mass();
    let momentum = body.total_momentum();

    let mut refine = Adaptation::new(params, Region::Everywhere).unwrap();
    let neighs = NeighborhoodCache::build::<DimensionUtils2d>(&body.particles, params.smoothing_length);
    wall.update_contact_neighborhood(&body.particles, params.smoothing_length);
    let report = refine.run_pass(&mut body, &neighs, Some(&wall), step(1)).unwrap();

    assert_eq!(report.splits, 15);
    assert_eq!(body.num_live_particles(), 30);
    assert_close(body.total_mass(), mass, 1e-9 * mass);
    assert!((body.total_momentum() - momentum).norm() < 1e-9 * mass);
    // unconverged corrections are reported, never fatal
    assert!(report
        .failures
        .iter()
        .all(|(_, e)| matches!(e, AdaptationError::DensityCorrectionDidNotConverge { .. })));
    for i in 0..body.len() {
        if body.is_live(i) {
            assert!(body.particles.position[i].iter().all(|x| x.is_finite()));
        }
    }

    let mut coarsen = Adaptation::new(params, Region::Nowhere).unwrap();
    let neighs = NeighborhoodCache::build::<DimensionUtils2d>(&body.particles, params.smoothing_length);
    wall.update_contact_neighborhood(&body.particles, params.smoothing_length);
    let report = coarsen.run_pass(&mut body, &neighs, Some(&wall), step(2)).unwrap();

    assert!(report.merges > 0);
    assert_close(body.total_mass(), mass, 1e-9 * mass);
    assert_eq!(wall.num_boundary_particles(), 12);
}

#[test]
fn invalid_configuration_is_rejected() {
    let mut params = params();
    params.max_merge_group_size = 1;
    assert!(Adaptation::new(params, Region::Everywhere).is_err());
}

fn body_3d(positions: &[VF<3>], volume: FT, params: &AdaptationParams, buffer_width: usize) -> ParticleBody<3> {
    let mut particles = ParticleVec::<3>::default(positions.len());
    for (i, &x) in positions.iter().enumerate() {
        particles.position[i] = x;
        particles.velocity[i] = vec3f(x.y, -x.x, 0.1);
        particles.volume[i] = volume;
        particles.mass[i] = volume * params.rest_density;
        particles.density[i] = params.rest_density;
        particles.h_ratio[i] = h_ratio_from_volume::<3>(params.reference_volume::<3>(), volume);
    }
    let mut fields = FieldChannels::new(positions.len());
    let phi = fields.register_scalar("Phi", 0.);
    for i in 0..positions.len() {
        fields.scalar_mut(phi).unwrap()[i] = i as FT;
    }
    ParticleBody::new(particles, fields, buffer_width)
}

fn run_pass_3d(
    adaptation: &mut ParticleAdaptation<DimensionUtils3d, 3>,
    body: &mut ParticleBody<3>,
) -> Result<PassReport, PassError> {
    let neighs = NeighborhoodCache::build::<DimensionUtils3d>(&body.particles, adaptation.params().smoothing_length);
    adaptation.run_pass(body, &neighs, None, step(1))
}

#[test]
fn scenario_a_in_three_dimensions() {
    let params = params();
    let volume = params.reference_volume::<3>();
    let mut body = body_3d(&[vec3f(0.5, 0.5, 0.5)], volume, &params, 1);
    let mass = body.particles.mass[0];
    let unit_cube = Region::Box(BoundingBox::new(vec3f(0., 0., 0.), vec3f(1., 1., 1.)));
    let mut adaptation = ParticleAdaptation::<DimensionUtils3d, 3>::new(params, unit_cube).unwrap();

    let report = run_pass_3d(&mut adaptation, &mut body).unwrap();

    assert_eq!(report.splits, 1);
    assert_eq!(body.num_live_particles(), 2);
    for i in 0..2 {
        assert_eq!(body.state_of(i), LifeState::Active);
        assert_close(body.particles.mass[i], mass / 2., 1e-12);
        assert_close(body.particles.volume[i], volume / 2., 1e-15);
        assert_close(body.particles.h_ratio[i], (2. as FT).powf(1. / 3.), 1e-12);
        assert_eq!(body.particles.velocity[i], vec3f(0.5, -0.5, 0.1));
    }
    let center = (body.particles.position[0] + body.particles.position[1]) / 2.;
    assert!((center - vec3f(0.5, 0.5, 0.5)).norm() < 1e-12);
    assert!((body.particles.position[0] - body.particles.position[1]).z != 0.);
}

#[test]
fn scenario_b_in_three_dimensions() {
    let params = params();
    let volume = 0.5 * params.reference_volume::<3>();
    let positions = [vec3f(0., 0., 0.), vec3f(0.01, 0., 0.), vec3f(0., 0., 0.01)];
    let mut body = body_3d(&positions, volume, &params, 0);
    let mass = body.total_mass();
    let momentum = body.total_momentum();
    let mut adaptation = ParticleAdaptation::<DimensionUtils3d, 3>::new(params, Region::Nowhere).unwrap();

    let report = run_pass_3d(&mut adaptation, &mut body).unwrap();

    assert_eq!(report.merges, 1);
    assert_eq!(report.retired_particles, 2);
    assert_eq!(body.num_live_particles(), 1);
    assert_close(body.particles.mass[0], mass, 1e-12);
    assert_close(body.particles.volume[0], 3. * volume, 1e-15);
    assert_close(body.particles.h_ratio[0], (2. / 3. as FT).powf(1. / 3.), 1e-12);
    assert!((body.total_momentum() - momentum).norm() < 1e-12);
    assert!((body.particles.position[0] - vec3f(0.01 / 3., 0., 0.01 / 3.)).norm() < 1e-12);
    assert_eq!(body.buffer.available(), 2);

    let phi = body.fields.id_of("Phi").unwrap();
    assert_close(body.fields.scalar(phi).unwrap()[0], 1., 1e-12);
}
