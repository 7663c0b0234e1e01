use ndarray::{Array1, Array2, Axis};

use crate::{
    embedding::decomposer::LatentBasis,
    error::{Result, WatermarkError},
};

/// Partition of a basis into the content subspace (`u_cap`) and the
/// contiguous key block (`v_cap`) starting at `shift`.
#[derive(Debug, Clone)]
pub struct KeySubspaceSplit {
    shift: usize,
    key_len: usize,
    u_cap: Array2<f64>,
    v_cap: Array2<f64>,
    sigma_complement: Array1<f64>,
    sigma_key: Array1<f64>,
    complement_indices: Vec<usize>,
}

impl KeySubspaceSplit {
    pub fn new(basis: &LatentBasis, shift: usize, key_len: usize) -> Result<Self> {
        let dim = basis.dim();

        if key_len == 0 || key_len >= dim {
            return Err(WatermarkError::dimension(
                "key length (must be in 1..latent_dim)",
                dim.saturating_sub(1),
                key_len,
            ));
        }
        if shift.checked_add(key_len).is_none_or(|end| end > dim) {
            return Err(WatermarkError::dimension(
                format!("key block at shift {shift}"),
                dim,
                shift.saturating_add(key_len),
            ));
        }

        let key_indices = (shift..shift + key_len).collect::<Vec<_>>();
        let complement_indices = (0..shift).chain(shift + key_len..dim).collect::<Vec<_>>();

        let sigma = basis.sigma();

        Ok(Self {
            shift,
            key_len,
            u_cap: basis.components().select(Axis(0), &complement_indices),
            v_cap: basis.components().select(Axis(0), &key_indices),
            sigma_complement: sigma.select(Axis(0), &complement_indices),
            sigma_key: sigma.select(Axis(0), &key_indices),
            complement_indices,
        })
    }

    pub fn with_fixed_sigma(mut self, sigma: f64) -> Self {
        self.sigma_key = Array1::from_elem(self.key_len, sigma);
        self
    }

    pub fn shift(&self) -> usize {
        self.shift
    }

    pub fn key_len(&self) -> usize {
        self.key_len
    }

    pub fn latent_dim(&self) -> usize {
        self.v_cap.ncols()
    }

    /// High-variance complement, `(D - K) x D`.
    pub fn u_cap(&self) -> &Array2<f64> {
        &self.u_cap
    }

    /// Key block, `K x D`.
    pub fn v_cap(&self) -> &Array2<f64> {
        &self.v_cap
    }

    pub fn sigma_complement(&self) -> &Array1<f64> {
        &self.sigma_complement
    }

    pub fn sigma_key(&self) -> &Array1<f64> {
        &self.sigma_key
    }

    pub fn complement_indices(&self) -> &[usize] {
        &self.complement_indices
    }

    pub fn key_indices(&self) -> std::ops::Range<usize> {
        self.shift..self.shift + self.key_len
    }

    /// Largest absolute inner product between a `u_cap` row and a `v_cap` row.
    ///
    /// Zero for an orthonormal basis. Anything larger means w0 leaks into the
    /// key directions and the reconstruction is only approximate.
    pub fn orthogonality_residual(&self) -> f64 {
        self.u_cap
            .dot(&self.v_cap.t())
            .iter()
            .fold(0.0f64, |acc, v| acc.max(v.abs()))
    }
}
