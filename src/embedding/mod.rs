//! Watermark embedding in the generator's style space.
//!
//! The basis is fitted once per run ([`decomposer`]), then split per shift into
//! a content subspace and a key block ([`split`]). Keys become displacements
//! along the key block ([`encoder`]) and are added to latents rebuilt from
//! content coefficients ([`reconstructor`]).

pub mod cache;
pub mod decomposer;
pub mod encoder;
pub mod reconstructor;
pub mod split;

pub use cache::{BasisCache, BasisCacheKey, FileBasisCache, MemoryBasisCache};
pub use decomposer::{CovariancePca, LatentBasis, LatentDecomposer, PcaFitter};
pub use encoder::{BinaryKey, KeyShiftEncoder};
pub use split::KeySubspaceSplit;
