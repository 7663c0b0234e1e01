use log::{debug, info, warn};
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, ArrayView2, Axis, concatenate};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::{
    embedding::cache::{BasisCache, BasisCacheKey},
    error::{Result, WatermarkError},
    synthesis::StyleGenerator,
};

/// Principal-component basis of the generator's style space.
///
/// Row `i` of `components` is the `i`-th principal direction, ranked by
/// descending explained variance.
#[derive(Debug, Clone, PartialEq)]
pub struct LatentBasis {
    components: Array2<f64>,
    variances: Array1<f64>,
    mean: Array1<f64>,
}

impl LatentBasis {
    pub fn new(components: Array2<f64>, variances: Array1<f64>, mean: Array1<f64>) -> Result<Self> {
        let (rows, cols) = components.dim();

        if rows != cols {
            return Err(WatermarkError::dimension("principal components (square basis)", cols, rows));
        }
        if variances.len() != rows {
            return Err(WatermarkError::dimension("explained variances", rows, variances.len()));
        }
        if mean.len() != cols {
            return Err(WatermarkError::dimension("latent mean", cols, mean.len()));
        }
        if variances.iter().any(|&v| !v.is_finite() || v < 0.0) {
            return Err(WatermarkError::Decomposition(
                "explained variances must be finite and non-negative".into(),
            ));
        }

        Ok(Self { components, variances, mean })
    }

    pub fn dim(&self) -> usize {
        self.components.nrows()
    }

    pub fn components(&self) -> &Array2<f64> {
        &self.components
    }

    pub fn variances(&self) -> &Array1<f64> {
        &self.variances
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn sigma(&self) -> Array1<f64> {
        self.variances.mapv(f64::sqrt)
    }
}

pub trait PcaFitter {
    fn fit(&self, samples: &ArrayView2<f64>) -> Result<LatentBasis>;
}

#[derive(Debug, Clone, Default)]
pub struct CovariancePca;

impl CovariancePca {
    pub fn new() -> Self {
        Self
    }
}

impl PcaFitter for CovariancePca {
    fn fit(&self, samples: &ArrayView2<f64>) -> Result<LatentBasis> {
        let (n_samples, n_features) = samples.dim();

        if n_samples < 2 {
            return Err(WatermarkError::Decomposition(format!(
                "not enough samples for PCA: {n_samples}"
            )));
        }
        if n_features == 0 {
            return Err(WatermarkError::Decomposition("samples have no features".into()));
        }
        if samples.iter().any(|v| !v.is_finite()) {
            return Err(WatermarkError::Decomposition(
                "samples contain non-finite values".into(),
            ));
        }

        let mean = samples
            .mean_axis(Axis(0))
            .ok_or_else(|| WatermarkError::Decomposition("failed to compute sample mean".into()))?;
        let centered = samples - &mean;

        let mut covariance = centered.t().dot(&centered);
        covariance /= (n_samples - 1) as f64;

        let covariance = DMatrix::from_row_iterator(n_features, n_features, covariance.iter().copied());
        let eigen = SymmetricEigen::try_new(covariance, f64::EPSILON, 0)
            .ok_or_else(|| WatermarkError::Decomposition("symmetric eigen solver did not converge".into()))?;
        debug!("Covariance eigen-decomposition done ({n_features}x{n_features})");

        let mut order = (0..n_features).collect::<Vec<_>>();
        order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

        let mut components = Array2::zeros((n_features, n_features));
        let mut variances = Array1::zeros(n_features);

        for (rank, &idx) in order.iter().enumerate() {
            let mut component = Array1::from_iter(eigen.eigenvectors.column(idx).iter().copied());

            // sign is arbitrary; pin the largest entry positive
            let pivot = component
                .iter()
                .copied()
                .fold(0.0f64, |acc, v| if v.abs() > acc.abs() { v } else { acc });
            if pivot < 0.0 {
                component.mapv_inplace(|v| -v);
            }

            components.row_mut(rank).assign(&component);
            variances[rank] = eigen.eigenvalues[idx].max(0.0);
        }

        LatentBasis::new(components, variances, mean)
    }
}

pub struct LatentDecomposer<F: PcaFitter = CovariancePca> {
    sample_count: usize,
    latent_dim: usize,
    chunk_size: usize,
    fitter: F,
}

impl LatentDecomposer<CovariancePca> {
    pub fn new(sample_count: usize, latent_dim: usize) -> Self {
        Self::with_fitter(sample_count, latent_dim, CovariancePca::new())
    }
}

impl<F: PcaFitter> LatentDecomposer<F> {
    pub fn with_fitter(sample_count: usize, latent_dim: usize, fitter: F) -> Self {
        Self {
            sample_count,
            latent_dim,
            chunk_size: 1024,
            fitter,
        }
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn cache_key<G: StyleGenerator + ?Sized>(&self, generator: &G) -> BasisCacheKey {
        BasisCacheKey::new(generator.identity(), self.latent_dim, self.sample_count)
    }

    pub fn decompose<G, R>(
        &self,
        generator: &G,
        cache: Option<&dyn BasisCache>,
        rng: &mut R,
    ) -> Result<LatentBasis>
    where
        G: StyleGenerator + ?Sized,
        R: Rng + ?Sized,
    {
        if generator.latent_dim() != self.latent_dim {
            return Err(WatermarkError::dimension(
                "generator latent dimension",
                self.latent_dim,
                generator.latent_dim(),
            ));
        }

        let key = self.cache_key(generator);
        if let Some(cache) = cache {
            if let Some(basis) = cache.load(&key)? {
                if basis.dim() == self.latent_dim {
                    info!("Loaded cached latent basis {key}");
                    return Ok(basis);
                }
                warn!(
                    "Ignoring cached basis {key}: dimension {} != {}",
                    basis.dim(),
                    self.latent_dim
                );
            }
        }

        if self.sample_count <= self.latent_dim {
            warn!(
                "Only {} latent samples for a {}-dimensional space; trailing components will be degenerate",
                self.sample_count, self.latent_dim
            );
        }

        info!("Performing PCA over {} style vectors...", self.sample_count);
        let styles = self.sample_styles(generator, rng)?;
        let basis = self.fitter.fit(&styles.view())?;
        info!("PCA done");

        if let Some(cache) = cache {
            cache.store(&key, &basis)?;
        }

        Ok(basis)
    }

    fn sample_styles<G, R>(&self, generator: &G, rng: &mut R) -> Result<Array2<f64>>
    where
        G: StyleGenerator + ?Sized,
        R: Rng + ?Sized,
    {
        let mut chunks = Vec::new();
        let mut remaining = self.sample_count;

        while remaining > 0 {
            let rows = remaining.min(self.chunk_size);
            let seeds = Array2::from_shape_fn((rows, self.latent_dim), |_| -> f64 {
                StandardNormal.sample(&mut *rng)
            });
            let styles = generator.map_styles(&seeds.view())?;

            if styles.dim() != (rows, self.latent_dim) {
                return Err(WatermarkError::MalformedTensor(format!(
                    "mapping network returned {:?}, expected ({rows}, {})",
                    styles.dim(),
                    self.latent_dim
                )));
            }

            chunks.push(styles);
            remaining -= rows;
        }

        let views = chunks.iter().map(|c| c.view()).collect::<Vec<_>>();
        concatenate(Axis(0), &views)
            .map_err(|e| WatermarkError::Decomposition(format!("failed to stack style vectors: {e}")))
    }
}
