use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, floating_type_mod::FT};

#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum SplitVariant {
    // random child placement inside the refinement region
    RefinementInPrescribedRegion,
    // random placement followed by the density error correction
    MinimumDensityError,
}

#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum MergeVariant {
    // mass-weighted aggregation only
    PrescribedArea,
    // density error correction plus angular momentum/kinetic energy matching
    MinimumDensityError,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptationParams {
    pub rest_density: FT,

    // smoothing length of a particle with `h_ratio == 1`
    pub smoothing_length: FT,
    // spacing of a particle at the base (coarse) resolution, its volume is `spacing^D`
    pub reference_spacing: FT,

    // ---------------------
    // splitting
    pub split_variant: SplitVariant,
    // split inside the refinement region if `volume > split_volume_ratio * reference volume`
    pub split_volume_ratio: FT,
    pub split_children: usize,
    // standard deviation of the child displacement, in child spacings
    pub split_displacement_factor: FT,
    // tuned empirically, kept configurable
    pub split_retry_budget: usize,

    // ---------------------
    // merging
    pub merge_variant: MergeVariant,
    // merge outside the refinement region if `volume < merge_volume_ratio * reference volume`
    pub merge_volume_ratio: FT,
    // merged particles must not exceed `maximum_volume_ratio * reference volume`
    pub maximum_volume_ratio: FT,
    // merge partners are searched within `merge_search_radius_factor * reference_spacing`, tuned empirically
    pub merge_search_radius_factor: FT,
    pub max_merge_group_size: usize,
    pub conserve_angular_momentum: bool,
    pub conserve_kinetic_energy: bool,

    // ---------------------
    // density error correction
    pub density_error_tolerance: FT,
    pub density_correction_max_iters: usize,

    // ---------------------
    // scheduling
    // a refinement pass runs every `adaptation_interval` steps
    pub adaptation_interval: usize,
    pub random_seed: u64,
}

impl Default for AdaptationParams {
    fn default() -> Self {
        AdaptationParams {
            rest_density: 1000.,
            smoothing_length: 0.013,
            reference_spacing: 0.01,

            split_variant: SplitVariant::RefinementInPrescribedRegion,
            split_volume_ratio: 0.75,
            split_children: 2,
            split_displacement_factor: 0.25,
            split_retry_budget: 50,

            merge_variant: MergeVariant::PrescribedArea,
            merge_volume_ratio: 0.75,
            maximum_volume_ratio: 2.,
            merge_search_radius_factor: 1.5,
            max_merge_group_size: 3,
            conserve_angular_momentum: true,
            conserve_kinetic_energy: true,

            density_error_tolerance: 1e-3,
            density_correction_max_iters: 20,

            adaptation_interval: 1,
            random_seed: 0x5eed,
        }
    }
}

impl AdaptationParams {
    pub fn reference_volume<const D: usize>(&self) -> FT {
        self.reference_spacing.powi(D as i32)
    }

    pub fn split_volume_threshold<const D: usize>(&self) -> FT {
        self.split_volume_ratio * self.reference_volume::<D>()
    }

    pub fn merge_volume_threshold<const D: usize>(&self) -> FT {
        self.merge_volume_ratio * self.reference_volume::<D>()
    }

    pub fn maximum_volume<const D: usize>(&self) -> FT {
        self.maximum_volume_ratio * self.reference_volume::<D>()
    }

    pub fn merge_search_radius(&self) -> FT {
        self.merge_search_radius_factor * self.reference_spacing
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let params: AdaptationParams = serde_yaml::from_str(yaml)?;
        params.validate()?;
        Ok(params)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(name: &'static str, value: FT) -> Result<(), ConfigError> {
            if value > 0. && value.is_finite() {
                Ok(())
            } else {
                Err(ConfigError::InvalidParameter {
                    name,
                    reason: format!("must be positive and finite, got {}", value),
                })
            }
        }

        positive("rest_density", self.rest_density)?;
        positive("smoothing_length", self.smoothing_length)?;
        positive("reference_spacing", self.reference_spacing)?;
        positive("split_volume_ratio", self.split_volume_ratio)?;
        positive("split_displacement_factor", self.split_displacement_factor)?;
        positive("merge_volume_ratio", self.merge_volume_ratio)?;
        positive("maximum_volume_ratio", self.maximum_volume_ratio)?;
        positive("merge_search_radius_factor", self.merge_search_radius_factor)?;
        positive("density_error_tolerance", self.density_error_tolerance)?;

        if self.split_children < 2 {
            return Err(ConfigError::InvalidParameter {
                name: "split_children",
                reason: format!("a split needs at least 2 children, got {}", self.split_children),
            });
        }
        if self.max_merge_group_size < 2 {
            return Err(ConfigError::InvalidParameter {
                name: "max_merge_group_size",
                reason: format!("a merge needs at least 2 members, got {}", self.max_merge_group_size),
            });
        }
        if self.split_retry_budget == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "split_retry_budget",
                reason: "at least one sample is required".into(),
            });
        }
        if self.density_correction_max_iters == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "density_correction_max_iters",
                reason: "at least one iteration is required".into(),
            });
        }
        if self.adaptation_interval == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "adaptation_interval",
                reason: "must be at least 1".into(),
            });
        }
        if self.merge_volume_ratio >= self.maximum_volume_ratio {
            return Err(ConfigError::InvalidParameter {
                name: "merge_volume_ratio",
                reason: format!(
                    "merge candidates ({}) must be smaller than the maximum volume ({})",
                    self.merge_volume_ratio, self.maximum_volume_ratio
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        AdaptationParams::default().validate().unwrap();
    }

    #[test]
    fn partial_yaml_falls_back_to_defaults() {
        let params = AdaptationParams::from_yaml_str(
            "rest_density: 1.0\nsplit_children: 3\nmerge_variant: MinimumDensityError\n",
        )
        .unwrap();
        assert_eq!(params.rest_density, 1.);
        assert_eq!(params.split_children, 3);
        assert_eq!(params.merge_variant, MergeVariant::MinimumDensityError);
        assert_eq!(params.split_retry_budget, AdaptationParams::default().split_retry_budget);
    }

    #[test]
    fn yaml_round_trip() {
        let mut params = AdaptationParams::default();
        params.split_variant = SplitVariant::MinimumDensityError;
        params.random_seed = 42;
        let yaml = params.to_yaml_string().unwrap();
        let back = AdaptationParams::from_yaml_str(&yaml).unwrap();
        assert_eq!(back.split_variant, SplitVariant::MinimumDensityError);
        assert_eq!(back.random_seed, 42);
        assert_eq!(back.reference_spacing, params.reference_spacing);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = AdaptationParams::from_yaml_str("split_children: 1\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidParameter {
                name: "split_children",
                ..
            }
        ));

        let err = AdaptationParams::from_yaml_str("reference_spacing: -1.0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidParameter {
                name: "reference_spacing",
                ..
            }
        ));

        assert!(matches!(
            AdaptationParams::from_yaml_str("rest_density: [1, 2]\n"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = AdaptationParams::load_from_file(Path::new("/nonexistent/adaptation.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
