use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::{
    dataset::augmentation::AugmentationMethod,
    error::{Result, WatermarkError},
};

pub mod error;
pub mod image_utils;
pub mod embedding;
pub mod synthesis;
pub mod dataset;

pub const DEFAULT_SHIFTS: [usize; 8] = [1, 64, 128, 192, 256, 320, 384, 448];

/// Hyperparameters for one dataset generation run.
///
/// Built once (usually from the command line) and handed by reference to every
/// component that needs it.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub image_size: u32,
    pub latent_dim: usize,
    pub key_len: usize,
    pub sample_size: usize,
    pub batch_size: usize,
    pub sd_moved: f64,
    pub pca_samples: usize,
    pub shifts: Vec<usize>,
    pub fixed_sigma: Option<f64>,
    pub augmentation: AugmentationMethod,
    pub style_mixing: bool,
    pub noise_seed: u64,
    pub seed: Option<u64>,
    pub save_dir: PathBuf,
    pub parallel_io: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            image_size: 256,
            latent_dim: 512,
            key_len: 64,
            sample_size: 10_000,
            batch_size: 12,
            sd_moved: 1.0,
            pca_samples: 10_000,
            shifts: DEFAULT_SHIFTS.to_vec(),
            fixed_sigma: Some(1.0),
            augmentation: AugmentationMethod::None,
            style_mixing: false,
            noise_seed: 2002,
            seed: None,
            save_dir: PathBuf::from("./test_images/"),
            parallel_io: true,
        }
    }
}

impl GenerationConfig {
    pub fn with_save_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.save_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_shifts(mut self, shifts: Vec<usize>) -> Self {
        self.shifts = shifts;
        self
    }

    pub fn num_main_pc(&self) -> usize {
        self.latent_dim.saturating_sub(self.key_len)
    }

    pub fn validate(&self) -> Result<()> {
        if self.image_size < 4 || !self.image_size.is_power_of_two() {
            return Err(WatermarkError::InvalidParameter(format!(
                "image size must be a power of two >= 4, got {}",
                self.image_size
            )));
        }

        if self.key_len == 0 || self.key_len >= self.latent_dim {
            return Err(WatermarkError::dimension(
                "key length (must be in 1..latent_dim)",
                self.latent_dim.saturating_sub(1),
                self.key_len,
            ));
        }

        if self.batch_size == 0 {
            return Err(WatermarkError::InvalidParameter(
                "batch size must be positive".into(),
            ));
        }

        if !self.sd_moved.is_finite() {
            return Err(WatermarkError::InvalidParameter(
                "standard deviations moved must be finite".into(),
            ));
        }

        if let Some(sigma) = self.fixed_sigma {
            if !sigma.is_finite() || sigma < 0.0 {
                return Err(WatermarkError::InvalidParameter(format!(
                    "fixed sigma must be a non-negative finite value, got {sigma}"
                )));
            }
        }

        if self.pca_samples < 2 {
            return Err(WatermarkError::Decomposition(format!(
                "at least 2 latent samples are needed for PCA, got {}",
                self.pca_samples
            )));
        }

        for &shift in &self.shifts {
            if shift.checked_add(self.key_len).is_none_or(|end| end > self.latent_dim) {
                return Err(WatermarkError::dimension(
                    format!("key block at shift {shift}"),
                    self.latent_dim,
                    shift.saturating_add(self.key_len),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShiftSummary {
    pub shift: usize,
    pub batches: usize,
    pub images_written: usize,
    pub orthogonality_residual: f64,
    pub directory: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetSummary {
    pub shifts: Vec<ShiftSummary>,
    pub total_images: usize,
}

impl DatasetSummary {
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = GenerationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_main_pc(), 448);
    }

    #[test]
    fn test_rejects_shift_past_basis_end() {
        let config = GenerationConfig::default().with_shifts(vec![449]);
        assert!(matches!(
            config.validate(),
            Err(WatermarkError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_shift_that_overflows() {
        let config = GenerationConfig::default().with_shifts(vec![1, usize::MAX]);
        assert!(matches!(
            config.validate(),
            Err(WatermarkError::DimensionMismatch { actual: usize::MAX, .. })
        ));
    }

    #[test]
    fn test_rejects_key_longer_than_basis() {
        let config = GenerationConfig {
            key_len: 512,
            ..GenerationConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(WatermarkError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_non_power_of_two_size() {
        let config = GenerationConfig {
            image_size: 100,
            ..GenerationConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(WatermarkError::InvalidParameter(_))
        ));
    }
}
