use crate::{
    floating_type_mod::{FT, PI},
    V2, V3, VF,
};

/**
 * Cubic spline on the normalized distance q = r / (2h), so the support radius is 2h.
 */
pub fn cubic_kernel_unnormalized(q: FT) -> FT {
    if q < 0.5 {
        6. * (q * q * q - q * q) + 1.
    } else if q < 1. {
        let v = 1. - q;
        2. * (v * v * v)
    } else {
        0.
    }
}

pub fn cubic_kernel_unnormalized_deriv(q: FT) -> FT {
    if q < 0.5 {
        18. * q * q - 12. * q
    } else if q < 1. {
        let v = 1. - q;
        -6. * v * v
    } else {
        0.
    }
}

/**
 * r is the distance to the center.
 * h is the smoothing length.
 */
pub fn cubic_kernel_2d(r: FT, h: FT) -> FT {
    let norm_factor = 10. / (7. * PI * (h * h));
    norm_factor * cubic_kernel_unnormalized(r / (2. * h))
}

pub fn cubic_kernel_3d(r: FT, h: FT) -> FT {
    let norm_factor = 1. / (PI * (h * h * h));
    norm_factor * cubic_kernel_unnormalized(r / (2. * h))
}

/**
 * Calculate the derivative dW/dx where W=kernel(|x-y|/h) and x-y=diff.
 */
pub fn cubic_kernel_2d_deriv(mut diff: V2, h: FT) -> V2 {
    let r = diff.norm();
    let q: FT = r / (2. * h);
    if q <= 1.0e-5 {
        return V2::zeros();
    }
    diff.unscale_mut(r);

    let norm_factor = 10. / (7. * PI * (h * h));
    norm_factor * cubic_kernel_unnormalized_deriv(q) / (2. * h) * diff
}

/**
 * Calculate the derivative dW/dx where W=kernel(|x-y|/h) and x-y=diff.
 */
pub fn cubic_kernel_3d_deriv(mut diff: V3, h: FT) -> V3 {
    let r = diff.norm();
    let q: FT = r / (2. * h);
    if q <= 1.0e-5 {
        return V3::zeros();
    }
    diff.unscale_mut(r);

    let norm_factor = 1. / (PI * (h * h * h));
    norm_factor * cubic_kernel_unnormalized_deriv(q) / (2. * h) * diff
}

// Sync is needed since we use this trait inside parallel iterators
pub trait DimensionUtils<const D: usize>: Sync + Send {
    fn kernelh(diff: VF<D>, h: FT) -> FT;
    fn kernel_derivh(diff: VF<D>, h: FT) -> VF<D>;

    fn support_radius_by_smoothing_length() -> FT;

    /// Edge length of a cube (square in 2D) with the given volume.
    fn volume_to_spacing(volume: FT) -> FT {
        volume.powf(1. / D as FT)
    }
}

#[allow(dead_code)]
pub enum DimensionUtils2d {}
impl DimensionUtils<2> for DimensionUtils2d {
    fn kernelh(diff: VF<2>, h: FT) -> FT {
        cubic_kernel_2d(diff.norm(), h)
    }

    fn kernel_derivh(diff: VF<2>, h: FT) -> VF<2> {
        cubic_kernel_2d_deriv(diff, h)
    }

    fn support_radius_by_smoothing_length() -> FT {
        2.
    }
}

#[allow(dead_code)]
pub enum DimensionUtils3d {}
impl DimensionUtils<3> for DimensionUtils3d {
    fn kernelh(diff: VF<3>, h: FT) -> FT {
        cubic_kernel_3d(diff.norm(), h)
    }

    fn kernel_derivh(diff: VF<3>, h: FT) -> VF<3> {
        cubic_kernel_3d_deriv(diff, h)
    }

    fn support_radius_by_smoothing_length() -> FT {
        2.
    }
}

/** Smoothing length of a particle with the given ratio (ratio > 1 means finer than the reference) */
#[inline(always)]
pub fn smoothing_length_from_ratio(reference_h: FT, h_ratio: FT) -> FT {
    reference_h / h_ratio
}

/** Symmetrized smoothing length of an interacting pair */
#[inline(always)]
pub fn pair_smoothing_length(h_a: FT, h_b: FT) -> FT {
    (h_a + h_b) * 0.5
}

/** Smoothing-length ratio that belongs to a particle volume */
#[inline(always)]
pub fn h_ratio_from_volume<const D: usize>(reference_volume: FT, volume: FT) -> FT {
    (reference_volume / volume).powf(1. / D as FT)
}

#[test]
fn cubic_kernel_2d_integration_test() {
    use crate::vec2f;

    let h = 5.;
    let support_radius = 2.0 * h;
    let grid_size = 200;
    let square_len = 2. * support_radius / grid_size as FT;
    let square_area = square_len * square_len;

    let mut integral = 0.;

    for y in 0..grid_size {
        for x in 0..grid_size {
            let integration_point = vec2f(
                (x as FT + 0.5) * square_len - support_radius,
                (y as FT + 0.5) * square_len - support_radius,
            );
            integral += cubic_kernel_2d(integration_point.norm(), h) * square_area;
        }
    }

    let allow_deviation = 1.0001;
    assert!(1.0 / allow_deviation <= integral);
    assert!(integral <= allow_deviation / 1.0);
}

#[test]
fn cubic_kernel_2d_derivative_test() {
    use crate::vec2f;

    let h = 5.;
    let support_radius = 2. * h;
    let test_grid_size = 40;
    let diff = support_radius * 1e-3;
    let diff_half = diff * 0.5;

    let probe_offset = 2. * support_radius / test_grid_size as FT;

    for y in 0..=test_grid_size {
        for x in 0..=test_grid_size {
            let probe_point = vec2f(
                (x as FT + 0.5) * probe_offset - support_radius,
                (y as FT + 0.5) * probe_offset - support_radius,
            );

            let analytical_deriv = cubic_kernel_2d_deriv(probe_point, h);

            let x_neg: FT = cubic_kernel_2d((probe_point + vec2f(-diff_half, 0.)).norm(), h);
            let x_pos: FT = cubic_kernel_2d((probe_point + vec2f(diff_half, 0.)).norm(), h);
            let y_neg: FT = cubic_kernel_2d((probe_point + vec2f(0., -diff_half)).norm(), h);
            let y_pos: FT = cubic_kernel_2d((probe_point + vec2f(0., diff_half)).norm(), h);

            let approx_deriv = vec2f((x_pos - x_neg) / diff, (y_pos - y_neg) / diff);
            let absolute_error = analytical_deriv - approx_deriv;

            assert!(absolute_error.x.abs() < 0.001);
            assert!(absolute_error.y.abs() < 0.001);
        }
    }
}

#[test]
fn h_ratio_follows_volume() {
    crate::assert_ft_approx_eq(h_ratio_from_volume::<2>(1., 0.25), 2., 1e-6, || "h_ratio 2d".into());
    crate::assert_ft_approx_eq(h_ratio_from_volume::<3>(1., 0.125), 2., 1e-6, || "h_ratio 3d".into());
    crate::assert_ft_approx_eq(smoothing_length_from_ratio(0.1, 2.), 0.05, 1e-9, || "h".into());
}

#[test]
fn cubic_kernel_3d_integration_test() {
    use crate::vec3f;

    let h = 5.;
    let support_radius = 2.0 * h;
    let grid_size = 100;
    let cube_len = 2. * support_radius / grid_size as FT;
    let cube_volume = cube_len * cube_len * cube_len;

    let mut integral = 0.;

    for z in 0..grid_size {
        for y in 0..grid_size {
            for x in 0..grid_size {
                let integration_point = vec3f(
                    (x as FT + 0.5) * cube_len - support_radius,
                    (y as FT + 0.5) * cube_len - support_radius,
                    (z as FT + 0.5) * cube_len - support_radius,
                );
                integral += cubic_kernel_3d(integration_point.norm(), h) * cube_volume;
            }
        }
    }

    let allow_deviation = 1.001;
    assert!(1.0 / allow_deviation <= integral);
    assert!(integral <= allow_deviation / 1.0);
}

#[test]
fn cubic_kernel_3d_derivative_test() {
    use crate::vec3f;

    let h = 5.;
    let support_radius = 2. * h;
    let test_grid_size = 20;
    let diff = support_radius * 1e-3;
    let diff_half = diff * 0.5;

    let sample_offset = 2. * support_radius / test_grid_size as FT;
    let axes = [vec3f(1., 0., 0.), vec3f(0., 1., 0.), vec3f(0., 0., 1.)];

    for z in 0..=test_grid_size {
        for y in 0..=test_grid_size {
            for x in 0..=test_grid_size {
                let sample_point = vec3f(
                    (x as FT + 0.5) * sample_offset - support_radius,
                    (y as FT + 0.5) * sample_offset - support_radius,
                    (z as FT + 0.5) * sample_offset - support_radius,
                );

                let analytical_deriv = cubic_kernel_3d_deriv(sample_point, h);

                for (d, axis) in axes.iter().enumerate() {
                    let neg: FT = cubic_kernel_3d((sample_point - axis * diff_half).norm(), h);
                    let pos: FT = cubic_kernel_3d((sample_point + axis * diff_half).norm(), h);
                    let approx_deriv = (pos - neg) / diff;

                    assert!((analytical_deriv[d] - approx_deriv).abs() < 1e-7);
                }
            }
        }
    }
}

#[test]
fn dimension_utils_use_their_own_kernel() {
    use crate::{vec2f, vec3f};

    let h = 0.1;
    let x2 = vec2f(0.03, -0.04);
    let x3 = vec3f(0.03, -0.04, 0.12);

    assert_eq!(DimensionUtils2d::kernelh(x2, h), cubic_kernel_2d(x2.norm(), h));
    assert_eq!(DimensionUtils2d::kernel_derivh(x2, h), cubic_kernel_2d_deriv(x2, h));
    assert_eq!(DimensionUtils3d::kernelh(x3, h), cubic_kernel_3d(x3.norm(), h));
    assert_eq!(DimensionUtils3d::kernel_derivh(x3, h), cubic_kernel_3d_deriv(x3, h));

    crate::assert_ft_approx_eq(
        DimensionUtils3d::kernelh(V3::zeros(), h),
        1. / (PI * h * h * h),
        1e-9,
        || "3d kernel at the center".into(),
    );
    crate::assert_ft_approx_eq(DimensionUtils3d::volume_to_spacing(0.001), 0.1, 1e-12, || "3d spacing".into());
}
