//! Embeds random keys with a small reference generator and checks that each
//! one decodes back from the latent difference.
//!
//! ```bash
//! cargo run --example embed_key
//! ```

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use latent_watermark::{
    dataset::embed_batch,
    embedding::{KeyShiftEncoder, KeySubspaceSplit, LatentDecomposer},
    error::Result,
    synthesis::{
        ImageSynthesizer, NoiseSet, StyleInput,
        projection::{ProjectionCheckpoint, ProjectionGenerator},
    },
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let generator = ProjectionGenerator::from_checkpoint(ProjectionCheckpoint {
        image_size: 16,
        latent_dim: 32,
        mapping_layers: 4,
        rank: 8,
        ..ProjectionCheckpoint::default()
    })?;
    let mut rng = ChaCha8Rng::seed_from_u64(7);

    let basis = LatentDecomposer::new(2_000, 32).decompose(&generator, None, &mut rng)?;
    let split = KeySubspaceSplit::new(&basis, 8, 8)?.with_fixed_sigma(1.0);
    let encoder = KeyShiftEncoder::new(1.0);

    let batch = embed_batch(&split, basis.mean(), &encoder, 4, &mut rng)?;
    for (i, key) in batch.keys.iter().enumerate() {
        let displacement = &batch.wx.row(i) - &batch.w0.row(i);
        let decoded = encoder.decode(&displacement.view(), &split.sigma_key().view(), &split.v_cap().view())?;
        println!("key {key} -> decoded {decoded} ({})", if &decoded == key { "ok" } else { "MISMATCH" });
    }

    let noise = NoiseSet::seeded(16, 2002)?;
    let synthesizer = ImageSynthesizer::new(&generator);
    let clean = synthesizer.render(&StyleInput::Single(batch.w0.view()), &noise)?;
    let marked = synthesizer.render(&StyleInput::Single(batch.wx.view()), &noise)?;

    for (i, (a, b)) in clean.iter().zip(&marked).enumerate() {
        let changed = a.pixels().zip(b.pixels()).filter(|(p, q)| p != q).count();
        println!("image {i}: {changed} of {} pixels differ", a.width() * a.height());
    }

    println!("orthogonality residual: {:.3e}", split.orthogonality_residual());
    Ok(())
}
