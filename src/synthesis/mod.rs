pub mod projection;

use image::RgbImage;
use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView3, Axis, s};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::{
    error::{Result, WatermarkError},
    image_utils::batch_to_images,
};

/// Pretrained image generator, seen only through its mapping and synthesis
/// stages.
pub trait StyleGenerator {
    fn latent_dim(&self) -> usize;

    fn image_size(&self) -> u32;

    /// Number of style injection points in the synthesis network.
    fn num_layers(&self) -> usize;

    /// Stable identifier of the loaded weights, used to key cached bases.
    fn identity(&self) -> String;

    /// Mapping stage: seeds `[N, D]` to style vectors `[N, D]`.
    fn map_styles(&self, seeds: &ArrayView2<f64>) -> Result<Array2<f64>>;

    /// Synthesis stage from already-resolved per-layer styles `[B, L, D]` to
    /// images `[B, 3, H, W]` in `[-1, 1]`.
    fn synthesize(&self, styles: &ArrayView3<f64>, noise: &NoiseSet) -> Result<Array4<f32>>;
}

pub fn style_layer_count(image_size: u32) -> usize {
    let log_size = image_size.max(4).ilog2() as usize;
    log_size * 2 - 2
}

#[derive(Debug, Clone, Copy)]
pub enum StyleInput<'a> {
    Single(ArrayView2<'a, f64>),
    /// Layers before `inject_index` take `primary`, the rest take `secondary`.
    Mixed {
        primary: ArrayView2<'a, f64>,
        secondary: ArrayView2<'a, f64>,
        inject_index: usize,
    },
}

impl StyleInput<'_> {
    pub fn batch_size(&self) -> usize {
        match self {
            StyleInput::Single(latent) => latent.nrows(),
            StyleInput::Mixed { primary, .. } => primary.nrows(),
        }
    }

    pub fn resolve(&self, num_layers: usize) -> Result<Array3<f64>> {
        match *self {
            StyleInput::Single(latent) => {
                let (batch, dim) = latent.dim();
                let mut styles = Array3::zeros((batch, num_layers, dim));
                for layer in 0..num_layers {
                    styles.slice_mut(s![.., layer, ..]).assign(&latent);
                }
                Ok(styles)
            }
            StyleInput::Mixed { primary, secondary, inject_index } => {
                if primary.dim() != secondary.dim() {
                    return Err(WatermarkError::MalformedTensor(format!(
                        "mixed latents differ in shape: {:?} vs {:?}",
                        primary.dim(),
                        secondary.dim()
                    )));
                }
                if inject_index > num_layers {
                    return Err(WatermarkError::dimension(
                        "style mixing inject index",
                        num_layers,
                        inject_index,
                    ));
                }

                let (batch, dim) = primary.dim();
                let mut styles = Array3::zeros((batch, num_layers, dim));
                for layer in 0..num_layers {
                    let source = if layer < inject_index { &primary } else { &secondary };
                    styles.slice_mut(s![.., layer, ..]).assign(source);
                }
                Ok(styles)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSet {
    levels: Vec<Array2<f32>>,
}

impl NoiseSet {
    /// One 4x4 map, then two maps per resolution from 8x8 up to `image_size`.
    pub fn seeded(image_size: u32, seed: u64) -> Result<Self> {
        if image_size < 4 || !image_size.is_power_of_two() {
            return Err(WatermarkError::InvalidParameter(format!(
                "noise resolution must be a power of two >= 4, got {image_size}"
            )));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let log_size = image_size.ilog2();
        let mut sample = |side: usize| {
            Array2::from_shape_fn((side, side), |_| -> f32 { StandardNormal.sample(&mut rng) })
        };

        let mut levels = vec![sample(4)];
        for i in 3..=log_size {
            for _ in 0..2 {
                levels.push(sample(1usize << i));
            }
        }

        Ok(Self { levels })
    }

    pub fn levels(&self) -> &[Array2<f32>] {
        &self.levels
    }

    pub fn finest(&self) -> &Array2<f32> {
        &self.levels[self.levels.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

pub struct ImageSynthesizer<'g, G: StyleGenerator + ?Sized> {
    generator: &'g G,
}

impl<'g, G: StyleGenerator + ?Sized> ImageSynthesizer<'g, G> {
    pub fn new(generator: &'g G) -> Self {
        Self { generator }
    }

    /// Default inject index for style mixing: only the last layer takes the
    /// secondary latent.
    pub fn mixing_inject_index(&self) -> usize {
        self.generator.num_layers().saturating_sub(1)
    }

    pub fn synthesize(&self, input: &StyleInput<'_>, noise: &NoiseSet) -> Result<Array4<f32>> {
        let latent_dim = self.generator.latent_dim();
        let styles = input.resolve(self.generator.num_layers())?;

        if styles.len_of(Axis(2)) != latent_dim {
            return Err(WatermarkError::dimension(
                "latent fed to synthesis",
                latent_dim,
                styles.len_of(Axis(2)),
            ));
        }

        let images = self.generator.synthesize(&styles.view(), noise)?;
        let size = self.generator.image_size() as usize;
        let expected = (input.batch_size(), 3, size, size);

        if images.dim() != expected {
            return Err(WatermarkError::MalformedTensor(format!(
                "generator returned {:?}, expected {expected:?}",
                images.dim()
            )));
        }

        Ok(images)
    }

    pub fn render(&self, input: &StyleInput<'_>, noise: &NoiseSet) -> Result<Vec<RgbImage>> {
        let images = self.synthesize(input, noise)?;
        batch_to_images(&images.view())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_layer_count_matches_resolution() {
        assert_eq!(style_layer_count(256), 14);
        assert_eq!(style_layer_count(1024), 18);
        assert_eq!(style_layer_count(4), 2);
    }

    #[test]
    fn test_noise_levels_follow_resolution_ladder() {
        let noise = NoiseSet::seeded(32, 2002).unwrap();
        let sides = noise.levels().iter().map(|l| l.nrows()).collect::<Vec<_>>();
        assert_eq!(sides, vec![4, 8, 8, 16, 16, 32, 32]);
        assert_eq!(noise.finest().dim(), (32, 32));
    }

    #[test]
    fn test_noise_is_reproducible_from_seed() {
        let a = NoiseSet::seeded(16, 2002).unwrap();
        let b = NoiseSet::seeded(16, 2002).unwrap();
        let c = NoiseSet::seeded(16, 7).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_noise_rejects_odd_size() {
        assert!(NoiseSet::seeded(48, 1).is_err());
    }

    #[test]
    fn test_single_input_broadcasts_over_layers() {
        let latent = array![[1.0, 2.0], [3.0, 4.0]];
        let styles = StyleInput::Single(latent.view()).resolve(3).unwrap();
        assert_eq!(styles.dim(), (2, 3, 2));
        assert_eq!(styles.slice(s![1, 2, ..]), array![3.0, 4.0]);
    }

    #[test]
    fn test_mixed_input_switches_at_inject_index() {
        let w0 = array![[0.0, 0.0]];
        let wx = array![[1.0, 1.0]];
        let styles = StyleInput::Mixed {
            primary: w0.view(),
            secondary: wx.view(),
            inject_index: 3,
        }
        .resolve(4)
        .unwrap();

        for layer in 0..3 {
            assert_eq!(styles.slice(s![0, layer, ..]), w0.row(0));
        }
        assert_eq!(styles.slice(s![0, 3, ..]), wx.row(0));
    }
}
