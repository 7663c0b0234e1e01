pub mod augmentation;
pub mod storage;

use log::{debug, info, warn};
use ndarray::{Array1, Array2};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::{
    DatasetSummary, GenerationConfig, ShiftSummary,
    dataset::storage::{DatasetWriter, PcaRecord, RenderedBatch, SampleRecord, TestData},
    embedding::{
        BinaryKey, KeyShiftEncoder, KeySubspaceSplit, LatentBasis,
        reconstructor::{apply_watermark, reconstruct_batch},
    },
    error::{Result, WatermarkError},
    synthesis::{ImageSynthesizer, NoiseSet, StyleGenerator, StyleInput},
};

const ORTHOGONALITY_TOLERANCE: f64 = 1e-6;

/// Batches run for one shift.
///
/// Always one more than `sample_size / batch_size`, so the last batch may
/// overshoot `sample_size` (10 samples in batches of 3 give 12 images).
pub fn batch_count(sample_size: usize, batch_size: usize) -> usize {
    sample_size / batch_size + 1
}

#[derive(Debug, Clone)]
pub struct WatermarkBatch {
    pub alpha: Array2<f64>,
    pub keys: Vec<BinaryKey>,
    pub w0: Array2<f64>,
    pub wx: Array2<f64>,
}

impl WatermarkBatch {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = SampleRecord> + '_ {
        self.keys.iter().enumerate().map(|(i, key)| SampleRecord {
            w0: self.w0.row(i).to_vec(),
            wx: self.wx.row(i).to_vec(),
            key: key.clone(),
        })
    }
}

/// Samples content coefficients and keys, then builds `w0` and `wx`.
pub fn embed_batch<R: Rng>(
    split: &KeySubspaceSplit,
    latent_mean: &Array1<f64>,
    encoder: &KeyShiftEncoder,
    batch_size: usize,
    rng: &mut R,
) -> Result<WatermarkBatch> {
    let sigma = split.sigma_complement();
    let alpha = Array2::from_shape_fn((batch_size, sigma.len()), |(_, j)| {
        let z: f64 = StandardNormal.sample(&mut *rng);
        sigma[j] * z
    });
    let keys = (0..batch_size)
        .map(|_| BinaryKey::random(split.key_len(), rng))
        .collect::<Vec<_>>();

    let w0 = reconstruct_batch(&alpha.view(), &split.u_cap().view(), &latent_mean.view())?;
    let displacement = encoder.encode_batch(&keys, &split.sigma_key().view(), &split.v_cap().view())?;
    let wx = apply_watermark(&w0.view(), &displacement.view())?;

    Ok(WatermarkBatch { alpha, keys, w0, wx })
}

pub struct DatasetGenerator<'a, G: StyleGenerator + ?Sized> {
    config: &'a GenerationConfig,
    synthesizer: ImageSynthesizer<'a, G>,
    writer: DatasetWriter,
    encoder: KeyShiftEncoder,
}

impl<'a, G: StyleGenerator + ?Sized> DatasetGenerator<'a, G> {
    pub fn new(config: &'a GenerationConfig, generator: &'a G) -> Result<Self> {
        config.validate()?;

        if generator.latent_dim() != config.latent_dim {
            return Err(WatermarkError::dimension(
                "generator latent dimension",
                config.latent_dim,
                generator.latent_dim(),
            ));
        }
        if generator.image_size() != config.image_size {
            return Err(WatermarkError::dimension(
                "generator image size",
                config.image_size as usize,
                generator.image_size() as usize,
            ));
        }
        if !config.augmentation.is_none() {
            warn!(
                "Augmentation {} is accepted but not implemented; watermarked images pass through unchanged",
                config.augmentation
            );
        }

        Ok(Self {
            config,
            synthesizer: ImageSynthesizer::new(generator),
            writer: DatasetWriter::new(&config.save_dir, config.augmentation)
                .with_parallel(config.parallel_io),
            encoder: KeyShiftEncoder::new(config.sd_moved),
        })
    }

    pub fn run<R: Rng>(&self, basis: &LatentBasis, noise: &NoiseSet, rng: &mut R) -> Result<DatasetSummary> {
        let mut shifts = Vec::with_capacity(self.config.shifts.len());

        for &shift in &self.config.shifts {
            shifts.push(self.generate_shift(basis, shift, noise, rng)?);
        }

        let total_images = shifts.iter().map(|s| s.images_written).sum();
        Ok(DatasetSummary { shifts, total_images })
    }

    pub fn split_for(&self, basis: &LatentBasis, shift: usize) -> Result<KeySubspaceSplit> {
        if basis.dim() != self.config.latent_dim {
            return Err(WatermarkError::dimension("latent basis", self.config.latent_dim, basis.dim()));
        }

        let split = KeySubspaceSplit::new(basis, shift, self.config.key_len)?;
        Ok(match self.config.fixed_sigma {
            Some(sigma) => split.with_fixed_sigma(sigma),
            None => split,
        })
    }

    pub fn generate_shift<R: Rng>(
        &self,
        basis: &LatentBasis,
        shift: usize,
        noise: &NoiseSet,
        rng: &mut R,
    ) -> Result<ShiftSummary> {
        let split = self.split_for(basis, shift)?;
        let residual = split.orthogonality_residual();
        if residual > ORTHOGONALITY_TOLERANCE {
            warn!("Shift {shift}: u_cap and v_cap are not orthogonal (max overlap {residual:.3e}); w0 leaks into key directions");
        }

        let paths = self.writer.prepare_shift(shift)?;
        let batch_size = self.config.batch_size;
        let batches = batch_count(self.config.sample_size, batch_size);
        info!(
            "Shift {shift}: generating {batches} batches of {batch_size} into {}",
            paths.root.display()
        );

        let mut records = TestData::default();
        for batch_index in 0..batches {
            let batch = embed_batch(&split, basis.mean(), &self.encoder, batch_size, rng)?;
            let rendered = self.render_batch(&batch, noise)?;

            records.extend(batch.records());
            self.writer.save_batch(&paths, batch_size * batch_index, &rendered)?;
            debug!("Shift {shift}: batch {}/{batches} done", batch_index + 1);
        }

        self.writer.write_test_data(&paths, &records)?;
        self.writer.write_pca(&paths, &PcaRecord::new(basis, &split))?;
        info!(
            "Shift {shift}: wrote {} samples (orthogonality residual {residual:.3e})",
            records.len()
        );

        Ok(ShiftSummary {
            shift: split.shift(),
            batches,
            images_written: records.len(),
            orthogonality_residual: residual,
            directory: paths.root,
        })
    }

    /// Two synthesis passes sharing `noise`: the watermarked latent (optionally
    /// style-mixed with the clean one) and the clean latent.
    pub fn render_batch(&self, batch: &WatermarkBatch, noise: &NoiseSet) -> Result<RenderedBatch> {
        let watermarked_input = if self.config.style_mixing {
            StyleInput::Mixed {
                primary: batch.w0.view(),
                secondary: batch.wx.view(),
                inject_index: self.synthesizer.mixing_inject_index(),
            }
        } else {
            StyleInput::Single(batch.wx.view())
        };

        let before_attack = self.synthesizer.render(&watermarked_input, noise)?;
        let clean = self.synthesizer.render(&StyleInput::Single(batch.w0.view()), noise)?;

        let augmentation = self.config.augmentation;
        let (watermarked, before_attack) = if augmentation.is_none() {
            (before_attack, Vec::new())
        } else {
            (augmentation.augment(before_attack.clone()), before_attack)
        };

        Ok(RenderedBatch {
            clean,
            watermarked,
            before_attack,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use ndarray::{Array4, ArrayView2, ArrayView3};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::{
        dataset::{
            augmentation::AugmentationMethod,
            storage::{BEFORE_ATTACK_DIR, CLEAN_DIR, WATERMARKED_DIR, read_pca, read_test_data},
        },
        embedding::LatentDecomposer,
        synthesis::projection::{ProjectionCheckpoint, ProjectionGenerator},
    };

    fn small_generator() -> ProjectionGenerator {
        ProjectionGenerator::from_checkpoint(ProjectionCheckpoint {
            image_size: 8,
            latent_dim: 8,
            mapping_layers: 2,
            rank: 4,
            seed: 3,
            noise_strength: 0.1,
        })
        .unwrap()
    }

    fn small_config(dir: &std::path::Path) -> GenerationConfig {
        GenerationConfig {
            image_size: 8,
            latent_dim: 8,
            key_len: 4,
            sample_size: 10,
            batch_size: 3,
            pca_samples: 400,
            shifts: vec![0, 4],
            parallel_io: false,
            ..GenerationConfig::default()
        }
        .with_save_dir(dir)
    }

    fn count_files(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    /// Counts synthesis calls and returns a constant image.
    struct CountingGenerator {
        calls: Cell<usize>,
    }

    impl StyleGenerator for CountingGenerator {
        fn latent_dim(&self) -> usize {
            8
        }

        fn image_size(&self) -> u32 {
            4
        }

        fn num_layers(&self) -> usize {
            2
        }

        fn identity(&self) -> String {
            "counting".into()
        }

        fn map_styles(&self, seeds: &ArrayView2<f64>) -> Result<Array2<f64>> {
            Ok(seeds.to_owned())
        }

        fn synthesize(&self, styles: &ArrayView3<f64>, _noise: &NoiseSet) -> Result<Array4<f32>> {
            self.calls.set(self.calls.get() + 1);
            Ok(Array4::zeros((styles.dim().0, 3, 4, 4)))
        }
    }

    #[test]
    fn test_batch_count_overshoots_sample_size() {
        assert_eq!(batch_count(10, 3), 4);
        assert_eq!(batch_count(10, 3) * 3, 12);
        assert_eq!(batch_count(9, 3), 4);
        assert_eq!(batch_count(0, 12), 1);
    }

    #[test]
    fn test_embedded_keys_are_recoverable() {
        let basis = LatentBasis::new(Array2::eye(8), Array1::from_elem(8, 2.0), Array1::zeros(8)).unwrap();
        let split = KeySubspaceSplit::new(&basis, 2, 4).unwrap();
        let encoder = KeyShiftEncoder::new(1.0);
        let mut rng = ChaCha8Rng::seed_from_u64(21);

        let batch = embed_batch(&split, basis.mean(), &encoder, 5, &mut rng).unwrap();

        assert_eq!(batch.w0.dim(), (5, 8));
        assert_eq!(batch.alpha.dim(), (5, 4));
        for (i, key) in batch.keys.iter().enumerate() {
            let displacement = &batch.wx.row(i) - &batch.w0.row(i);
            let decoded = encoder
                .decode(&displacement.view(), &split.sigma_key().view(), &split.v_cap().view())
                .unwrap();
            assert_eq!(&decoded, key);
        }
    }

    #[test]
    fn test_w0_has_no_component_in_key_block() {
        let basis = LatentBasis::new(Array2::eye(8), Array1::from_elem(8, 1.0), Array1::zeros(8)).unwrap();
        let split = KeySubspaceSplit::new(&basis, 0, 4).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(4);

        let batch = embed_batch(&split, basis.mean(), &KeyShiftEncoder::new(1.0), 3, &mut rng).unwrap();
        let projection = batch.w0.dot(&split.v_cap().t());
        assert!(projection.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn test_two_generator_calls_per_batch() {
        let dir = tempfile::tempdir().unwrap();
        let generator = CountingGenerator { calls: Cell::new(0) };
        let config = GenerationConfig {
            image_size: 4,
            latent_dim: 8,
            key_len: 4,
            sample_size: 10,
            batch_size: 3,
            shifts: vec![4],
            parallel_io: false,
            ..GenerationConfig::default()
        }
        .with_save_dir(dir.path());
        let basis = LatentBasis::new(Array2::eye(8), Array1::ones(8), Array1::zeros(8)).unwrap();
        let noise = NoiseSet::seeded(4, 2002).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let summary = DatasetGenerator::new(&config, &generator)
            .unwrap()
            .run(&basis, &noise, &mut rng)
            .unwrap();

        assert_eq!(generator.calls.get(), 8);
        assert_eq!(summary.total_images, 12);
    }

    #[test]
    fn test_zero_displacement_renders_identical_pair() {
        let dir = tempfile::tempdir().unwrap();
        let generator = small_generator();
        let config = GenerationConfig {
            sd_moved: 0.0,
            ..small_config(dir.path())
        };
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        let basis = LatentDecomposer::new(400, 8).decompose(&generator, None, &mut rng).unwrap();
        let noise = NoiseSet::seeded(8, 2002).unwrap();
        let dataset = DatasetGenerator::new(&config, &generator).unwrap();

        let split = dataset.split_for(&basis, 0).unwrap();
        let batch = embed_batch(&split, basis.mean(), &KeyShiftEncoder::new(0.0), 3, &mut rng).unwrap();
        let rendered = dataset.render_batch(&batch, &noise).unwrap();

        assert_eq!(batch.w0, batch.wx);
        assert_eq!(rendered.clean, rendered.watermarked);
        assert!(rendered.before_attack.is_empty());
    }

    #[test]
    fn test_end_to_end_sweep_writes_every_shift() {
        let dir = tempfile::tempdir().unwrap();
        let generator = small_generator();
        let config = small_config(dir.path());
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        let basis = LatentDecomposer::new(config.pca_samples, config.latent_dim)
            .decompose(&generator, None, &mut rng)
            .unwrap();
        let noise = NoiseSet::seeded(config.image_size, config.noise_seed).unwrap();

        let summary = DatasetGenerator::new(&config, &generator)
            .unwrap()
            .run(&basis, &noise, &mut rng)
            .unwrap();

        assert_eq!(summary.shifts.len(), 2);
        assert_eq!(summary.shifts[1].shift, 4);
        assert_eq!(summary.shifts[1].batches, 4);
        assert_eq!(summary.total_images, 24);

        for shift in [0, 4] {
            let root = dir.path().join(format!("shift_{shift}"));
            assert_eq!(count_files(&root.join(CLEAN_DIR)), 12);
            assert_eq!(count_files(&root.join(WATERMARKED_DIR)), 12);
            assert!(!root.join(BEFORE_ATTACK_DIR).exists());
            assert!(root.join(CLEAN_DIR).join("target_w0_11.png").is_file());

            let data = read_test_data(root.join("test_data.json")).unwrap();
            assert_eq!(data.len(), 12);
            assert_eq!(data.w0[0].len(), 8);

            let pca = read_pca(root.join("pca.json")).unwrap();
            assert_eq!(pca.sigma_key, vec![1.0; 4]);
            assert_eq!(pca.v_cap.len(), 4);
            assert_eq!(pca.u_cap.len(), 4);
            assert_eq!(pca.sigma_full.len(), 8);
        }
    }

    #[test]
    fn test_augmentation_keeps_pre_attack_images() {
        let dir = tempfile::tempdir().unwrap();
        let generator = small_generator();
        let config = GenerationConfig {
            augmentation: AugmentationMethod::Jpeg,
            sample_size: 2,
            shifts: vec![4],
            ..small_config(dir.path())
        };
        let basis = LatentBasis::new(Array2::eye(8), Array1::ones(8), Array1::zeros(8)).unwrap();
        let noise = NoiseSet::seeded(8, 2002).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(2);

        DatasetGenerator::new(&config, &generator)
            .unwrap()
            .run(&basis, &noise, &mut rng)
            .unwrap();

        let root = dir.path().join("shift_4");
        assert_eq!(count_files(&root.join(BEFORE_ATTACK_DIR)), 3);
    }

    #[test]
    fn test_style_mixing_changes_only_watermarked_render() {
        let dir = tempfile::tempdir().unwrap();
        let generator = small_generator();
        let plain = small_config(dir.path());
        let mixed = GenerationConfig {
            style_mixing: true,
            ..plain.clone()
        };
        let basis = LatentBasis::new(Array2::eye(8), Array1::ones(8), Array1::zeros(8)).unwrap();
        let noise = NoiseSet::seeded(8, 2002).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(6);

        let plain_gen = DatasetGenerator::new(&plain, &generator).unwrap();
        let mixed_gen = DatasetGenerator::new(&mixed, &generator).unwrap();
        let split = plain_gen.split_for(&basis, 0).unwrap();
        let mut batch = embed_batch(&split, basis.mean(), &KeyShiftEncoder::new(1.0), 2, &mut rng).unwrap();
        // force a visible key on every image
        batch.wx = &batch.w0 + &Array2::from_elem(batch.w0.dim(), 3.0);

        let a = plain_gen.render_batch(&batch, &noise).unwrap();
        let b = mixed_gen.render_batch(&batch, &noise).unwrap();

        assert_eq!(a.clean, b.clean);
        assert_ne!(a.watermarked, b.watermarked);
    }

    #[test]
    fn test_rejects_generator_with_other_latent_dim() {
        let dir = tempfile::tempdir().unwrap();
        let generator = small_generator();
        let config = GenerationConfig {
            latent_dim: 16,
            ..small_config(dir.path())
        };
        assert!(matches!(
            DatasetGenerator::new(&config, &generator),
            Err(WatermarkError::DimensionMismatch { .. })
        ));
    }
}
