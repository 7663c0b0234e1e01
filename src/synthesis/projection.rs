use std::{fs, path::Path};

use log::info;
use ndarray::{Array2, Array4, ArrayView2, ArrayView3, s};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, WatermarkError},
    synthesis::{NoiseSet, StyleGenerator, style_layer_count},
};

/// Weights description of a [`ProjectionGenerator`].
///
/// The weights themselves are regenerated from `seed`, so a checkpoint is a
/// few lines of JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionCheckpoint {
    pub image_size: u32,
    pub latent_dim: usize,
    pub mapping_layers: usize,
    pub rank: usize,
    pub seed: u64,
    pub noise_strength: f32,
}

impl Default for ProjectionCheckpoint {
    fn default() -> Self {
        Self {
            image_size: 256,
            latent_dim: 512,
            mapping_layers: 8,
            rank: 16,
            seed: 550_000,
            noise_strength: 0.1,
        }
    }
}

impl ProjectionCheckpoint {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let fail = |reason: String| WatermarkError::CheckpointLoad {
            path: path.to_path_buf(),
            reason,
        };

        let contents = fs::read_to_string(path).map_err(|e| fail(e.to_string()))?;
        let checkpoint = serde_json::from_str::<Self>(&contents).map_err(|e| fail(e.to_string()))?;
        checkpoint.validate().map_err(|e| fail(e.to_string()))?;

        Ok(checkpoint)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| WatermarkError::storage(parent, e))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|e| WatermarkError::storage(path, e))
    }

    fn validate(&self) -> Result<()> {
        if self.image_size < 4 || !self.image_size.is_power_of_two() {
            return Err(WatermarkError::InvalidParameter(format!(
                "image size {} is not a power of two >= 4",
                self.image_size
            )));
        }
        if self.latent_dim == 0 || self.rank == 0 {
            return Err(WatermarkError::InvalidParameter(
                "latent dimension and rank must be positive".into(),
            ));
        }
        if !self.noise_strength.is_finite() {
            return Err(WatermarkError::InvalidParameter("noise strength must be finite".into()));
        }
        Ok(())
    }
}

/// Small deterministic stand-in for a style-based generator.
///
/// Mapping is a leaky-ReLU MLP over pixel-normalized seeds. Synthesis averages
/// a low-rank projection of every layer's style, expands it over a fixed pixel
/// basis, adds the full-resolution noise map and squashes with `tanh`.
pub struct ProjectionGenerator {
    checkpoint: ProjectionCheckpoint,
    mapping: Vec<Array2<f64>>,
    layer_projections: Vec<Array2<f64>>,
    pixel_basis: Array2<f32>,
}

impl ProjectionGenerator {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let checkpoint = ProjectionCheckpoint::load(path)?;
        info!("Loaded generator checkpoint {}", path.display());
        Self::from_checkpoint(checkpoint)
    }

    pub fn from_checkpoint(checkpoint: ProjectionCheckpoint) -> Result<Self> {
        checkpoint.validate()?;

        let dim = checkpoint.latent_dim;
        let rank = checkpoint.rank;
        let side = checkpoint.image_size as usize;
        let mut rng = ChaCha8Rng::seed_from_u64(checkpoint.seed);

        let mut gaussian = |shape: (usize, usize), std: f64| -> Result<Array2<f64>> {
            let normal = Normal::new(0.0, std)
                .map_err(|e| WatermarkError::InvalidParameter(e.to_string()))?;
            Ok(Array2::from_shape_fn(shape, |_| normal.sample(&mut rng)))
        };

        let mapping = (0..checkpoint.mapping_layers)
            .map(|_| gaussian((dim, dim), (2.0 / dim as f64).sqrt()))
            .collect::<Result<Vec<_>>>()?;
        let layer_projections = (0..style_layer_count(checkpoint.image_size))
            .map(|_| gaussian((dim, rank), 1.0 / (dim as f64).sqrt()))
            .collect::<Result<Vec<_>>>()?;
        let pixel_basis = gaussian((rank, 3 * side * side), 1.0 / (rank as f64).sqrt())?
            .mapv(|v| v as f32);

        Ok(Self {
            checkpoint,
            mapping,
            layer_projections,
            pixel_basis,
        })
    }

    pub fn checkpoint(&self) -> &ProjectionCheckpoint {
        &self.checkpoint
    }
}

impl StyleGenerator for ProjectionGenerator {
    fn latent_dim(&self) -> usize {
        self.checkpoint.latent_dim
    }

    fn image_size(&self) -> u32 {
        self.checkpoint.image_size
    }

    fn num_layers(&self) -> usize {
        self.layer_projections.len()
    }

    fn identity(&self) -> String {
        let c = &self.checkpoint;
        format!(
            "projection-s{}-d{}-m{}-r{}-seed{}",
            c.image_size, c.latent_dim, c.mapping_layers, c.rank, c.seed
        )
    }

    fn map_styles(&self, seeds: &ArrayView2<f64>) -> Result<Array2<f64>> {
        if seeds.ncols() != self.latent_dim() {
            return Err(WatermarkError::dimension("mapping input", self.latent_dim(), seeds.ncols()));
        }

        let mut hidden = seeds.to_owned();
        for mut row in hidden.rows_mut() {
            let norm = (row.mapv(|v| v * v).mean().unwrap_or(0.0) + 1e-8).sqrt();
            row.mapv_inplace(|v| v / norm);
        }

        for weight in &self.mapping {
            hidden = hidden.dot(weight);
            hidden.mapv_inplace(|v| if v >= 0.0 { v } else { 0.2 * v });
        }

        Ok(hidden)
    }

    fn synthesize(&self, styles: &ArrayView3<f64>, noise: &NoiseSet) -> Result<Array4<f32>> {
        let (batch, layers, dim) = styles.dim();
        let side = self.checkpoint.image_size as usize;

        if layers != self.num_layers() {
            return Err(WatermarkError::dimension("style layers", self.num_layers(), layers));
        }
        if dim != self.latent_dim() {
            return Err(WatermarkError::dimension("style width", self.latent_dim(), dim));
        }
        if noise.finest().dim() != (side, side) {
            return Err(WatermarkError::MalformedTensor(format!(
                "noise resolution {:?} does not match image size {side}",
                noise.finest().dim()
            )));
        }

        let mut coefficients = Array2::<f64>::zeros((batch, self.checkpoint.rank));
        for (layer, projection) in self.layer_projections.iter().enumerate() {
            coefficients += &styles.slice(s![.., layer, ..]).dot(projection);
        }
        coefficients /= layers as f64;

        let flat = coefficients.mapv(|v| v as f32).dot(&self.pixel_basis);
        let mut images = flat
            .into_shape_with_order((batch, 3, side, side))
            .map_err(|e| WatermarkError::MalformedTensor(e.to_string()))?;

        images.scaled_add(self.checkpoint.noise_strength, noise.finest());
        images.mapv_inplace(f32::tanh);

        Ok(images)
    }
}
