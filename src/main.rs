use std::{path::PathBuf, process::ExitCode, time::Instant};

use clap::{Args, Parser, Subcommand};
use log::{error, info};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use latent_watermark::{
    DEFAULT_SHIFTS, GenerationConfig,
    dataset::{DatasetGenerator, augmentation::AugmentationMethod},
    embedding::{BasisCache, FileBasisCache, LatentDecomposer},
    error::Result,
    synthesis::{
        NoiseSet, StyleGenerator,
        projection::{ProjectionCheckpoint, ProjectionGenerator},
    },
};

/// Generates paired clean/watermarked image datasets from a style generator.
#[derive(Parser, Debug)]
#[command(author, version, about = "Latent-space watermark dataset generator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the shift sweep and write one dataset per shift.
    Generate(GenerateArgs),
    /// Write a reference generator checkpoint.
    InitCheckpoint(InitCheckpointArgs),
}

#[derive(Args, Debug)]
struct GenerateArgs {
    #[arg(long, default_value = "./checkpoint/550000.json")]
    ckpt: PathBuf,

    #[arg(long = "img-size", default_value_t = 256)]
    image_size: u32,

    /// Images per shift (the last batch may overshoot).
    #[arg(long, default_value_t = 10_000)]
    sample_size: usize,

    /// Standard deviations moved along each set key direction.
    #[arg(long, default_value_t = 1.0)]
    sd: f64,

    #[arg(long, default_value_t = 12)]
    batch_size: usize,

    #[arg(long, default_value_t = 64)]
    key_len: usize,

    #[arg(long, default_value = "./test_images/")]
    save_dir: PathBuf,

    /// None, Crop, Noise, Blur, Jpeg or Combination.
    #[arg(long, default_value = "None")]
    augmentation: AugmentationMethod,

    /// Style vectors sampled for the PCA.
    #[arg(long, default_value_t = 10_000)]
    pca_samples: usize,

    /// Key block offsets, comma separated.
    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_SHIFTS)]
    shifts: Vec<usize>,

    /// Constant key-block deviation.
    #[arg(long, default_value_t = 1.0, conflicts_with = "true_sigma")]
    fixed_sigma: f64,

    /// Use the per-component deviations of the key block instead.
    #[arg(long)]
    true_sigma: bool,

    /// Feed w0 to every layer but the last when rendering the watermarked image.
    #[arg(long)]
    style_mixing: bool,

    #[arg(long, default_value_t = 2002)]
    noise_seed: u64,

    /// Seed for PCA sampling, alpha and keys. OS entropy when absent.
    #[arg(long)]
    seed: Option<u64>,

    /// Directory of cached latent bases.
    #[arg(long, default_value = "./PCA")]
    pca_cache: PathBuf,

    #[arg(long)]
    no_cache: bool,

    /// Save PNGs one at a time.
    #[arg(long)]
    sequential_io: bool,
}

#[derive(Args, Debug)]
struct InitCheckpointArgs {
    #[arg(long, default_value = "./checkpoint/550000.json")]
    output: PathBuf,

    #[arg(long = "img-size", default_value_t = 256)]
    image_size: u32,

    #[arg(long, default_value_t = 512)]
    latent_dim: usize,

    #[arg(long, default_value_t = 8)]
    mapping_layers: usize,

    #[arg(long, default_value_t = 16)]
    rank: usize,

    #[arg(long, default_value_t = 550_000)]
    seed: u64,

    #[arg(long, default_value_t = 0.1)]
    noise_strength: f32,
}

impl GenerateArgs {
    fn to_config(&self, latent_dim: usize) -> GenerationConfig {
        GenerationConfig {
            image_size: self.image_size,
            latent_dim,
            key_len: self.key_len,
            sample_size: self.sample_size,
            batch_size: self.batch_size,
            sd_moved: self.sd,
            pca_samples: self.pca_samples,
            shifts: self.shifts.clone(),
            fixed_sigma: (!self.true_sigma).then_some(self.fixed_sigma),
            augmentation: self.augmentation,
            style_mixing: self.style_mixing,
            noise_seed: self.noise_seed,
            seed: self.seed,
            save_dir: self.save_dir.clone(),
            parallel_io: !self.sequential_io,
        }
    }
}

fn generate(args: &GenerateArgs) -> Result<()> {
    let started = Instant::now();

    let generator = ProjectionGenerator::load(&args.ckpt)?;
    let config = args.to_config(generator.latent_dim());
    config.validate()?;

    let mut rng = match config.seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_os_rng(),
    };

    let cache = FileBasisCache::new(&args.pca_cache);
    let cache = (!args.no_cache).then_some(&cache as &dyn BasisCache);
    let basis = LatentDecomposer::new(config.pca_samples, config.latent_dim).decompose(&generator, cache, &mut rng)?;

    let noise = NoiseSet::seeded(config.image_size, config.noise_seed)?;
    let summary = DatasetGenerator::new(&config, &generator)?.run(&basis, &noise, &mut rng)?;

    info!(
        "Generated {} images over {} shifts in {:.1}s",
        summary.total_images,
        summary.shifts.len(),
        started.elapsed().as_secs_f64()
    );
    info!("{}", summary.to_json()?);
    Ok(())
}

fn init_checkpoint(args: &InitCheckpointArgs) -> Result<()> {
    let checkpoint = ProjectionCheckpoint {
        image_size: args.image_size,
        latent_dim: args.latent_dim,
        mapping_layers: args.mapping_layers,
        rank: args.rank,
        seed: args.seed,
        noise_strength: args.noise_strength,
    };
    ProjectionGenerator::from_checkpoint(checkpoint.clone())?;
    checkpoint.save(&args.output)?;
    info!("Wrote generator checkpoint {}", args.output.display());
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match &cli.command {
        Command::Generate(args) => generate(args),
        Command::InitCheckpoint(args) => init_checkpoint(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
