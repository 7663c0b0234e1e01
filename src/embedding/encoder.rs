use std::fmt;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WatermarkError};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BinaryKey(Vec<u8>);

impl BinaryKey {
    pub fn new(bits: Vec<u8>) -> Result<Self> {
        if let Some(bad) = bits.iter().find(|&&b| b > 1) {
            return Err(WatermarkError::InvalidParameter(format!(
                "key bits must be 0 or 1, found {bad}"
            )));
        }
        Ok(Self(bits))
    }

    pub fn zeros(len: usize) -> Self {
        Self(vec![0; len])
    }

    /// Each bit independently 0 or 1 with equal probability.
    pub fn random<R: Rng>(len: usize, rng: &mut R) -> Self {
        Self((0..len).map(|_| rng.random_range(0..2u8)).collect())
    }

    pub fn bits(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn count_ones(&self) -> usize {
        self.0.iter().filter(|&&b| b == 1).count()
    }
}

impl fmt::Display for BinaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for bit in &self.0 {
            write!(f, "{bit}")?;
        }
        Ok(())
    }
}

/// Maps keys to displacements along the key block.
///
/// Encoding is one-sided: a set bit moves the latent by `sd_moved * sigma_i`
/// along `v_cap[i]`, a cleared bit leaves that axis untouched. It never moves
/// in the negative direction.
#[derive(Debug, Clone, Copy)]
pub struct KeyShiftEncoder {
    sd_moved: f64,
}

impl KeyShiftEncoder {
    pub fn new(sd_moved: f64) -> Self {
        Self { sd_moved }
    }

    pub fn encode(
        &self,
        key: &BinaryKey,
        sigma: &ArrayView1<f64>,
        v_cap: &ArrayView2<f64>,
    ) -> Result<Array1<f64>> {
        check_key_shapes(key.len(), sigma, v_cap)?;

        let magnitudes = Array1::from_iter(
            key.bits()
                .iter()
                .zip(sigma.iter())
                .map(|(&bit, &s)| if bit == 1 { s } else { 0.0 }),
        );

        Ok(v_cap.t().dot(&magnitudes) * self.sd_moved)
    }

    pub fn encode_batch(
        &self,
        keys: &[BinaryKey],
        sigma: &ArrayView1<f64>,
        v_cap: &ArrayView2<f64>,
    ) -> Result<Array2<f64>> {
        let key_len = v_cap.nrows();
        for key in keys {
            check_key_shapes(key.len(), sigma, v_cap)?;
        }

        let magnitudes = Array2::from_shape_fn((keys.len(), key_len), |(row, i)| {
            if keys[row].bits()[i] == 1 { sigma[i] } else { 0.0 }
        });

        Ok(magnitudes.dot(v_cap) * self.sd_moved)
    }

    /// Recovers a key from a displacement produced by [`encode`](Self::encode).
    ///
    /// Projects onto each `v_cap` row and keeps bits whose coefficient passes
    /// half of the encoded magnitude. Exact for orthonormal `v_cap`.
    pub fn decode(
        &self,
        displacement: &ArrayView1<f64>,
        sigma: &ArrayView1<f64>,
        v_cap: &ArrayView2<f64>,
    ) -> Result<BinaryKey> {
        check_key_shapes(v_cap.nrows(), sigma, v_cap)?;
        if displacement.len() != v_cap.ncols() {
            return Err(WatermarkError::dimension(
                "displacement length",
                v_cap.ncols(),
                displacement.len(),
            ));
        }

        let coefficients = v_cap.dot(displacement);
        let mut bits = Vec::with_capacity(coefficients.len());

        for (coefficient, &s) in coefficients.iter().zip(sigma.iter()) {
            let step = self.sd_moved * s;
            if step == 0.0 || !step.is_finite() {
                return Err(WatermarkError::InvalidParameter(format!(
                    "cannot decode along an axis with encoded magnitude {step}"
                )));
            }
            bits.push(u8::from(coefficient / step > 0.5));
        }

        Ok(BinaryKey(bits))
    }
}

fn check_key_shapes(key_len: usize, sigma: &ArrayView1<f64>, v_cap: &ArrayView2<f64>) -> Result<()> {
    if sigma.len() != v_cap.nrows() {
        return Err(WatermarkError::dimension("key sigma length", v_cap.nrows(), sigma.len()));
    }
    if key_len != v_cap.nrows() {
        return Err(WatermarkError::dimension("key length", v_cap.nrows(), key_len));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use ndarray::{Array1, Array2, array};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    /// Four orthonormal rows in 8 dimensions, mixing pairs of axes.
    fn v_cap_8x4() -> Array2<f64> {
        let h = std::f64::consts::FRAC_1_SQRT_2;
        array![
            [h, h, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            [h, -h, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 0.0, h, 0.0, h, 0.0],
            [0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0],
        ]
    }

    #[test]
    fn test_zero_key_gives_zero_displacement() {
        let v_cap = v_cap_8x4();
        let sigma = Array1::from_elem(4, 3.0);
        let shift = KeyShiftEncoder::new(5.0)
            .encode(&BinaryKey::zeros(4), &sigma.view(), &v_cap.view())
            .unwrap();
        assert!(shift.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_only_set_bits_contribute() {
        let v_cap = v_cap_8x4();
        let sigma = Array1::from_elem(4, 2.0);
        let key = BinaryKey::new(vec![1, 0, 1, 0]).unwrap();

        let shift = KeyShiftEncoder::new(1.0)
            .encode(&key, &sigma.view(), &v_cap.view())
            .unwrap();

        let expected = &v_cap.row(0) * 2.0 + &v_cap.row(2) * 2.0;
        for (a, b) in shift.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_displacement_scales_linearly_with_sd() {
        let v_cap = v_cap_8x4();
        let sigma = array![0.5, 1.5, 2.0, 0.25];
        let key = BinaryKey::new(vec![1, 1, 0, 1]).unwrap();

        let once = KeyShiftEncoder::new(1.5).encode(&key, &sigma.view(), &v_cap.view()).unwrap();
        let twice = KeyShiftEncoder::new(3.0).encode(&key, &sigma.view(), &v_cap.view()).unwrap();

        for (a, b) in once.iter().zip(twice.iter()) {
            assert!((2.0 * a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_batch_matches_single_encoding() {
        let v_cap = v_cap_8x4();
        let sigma = array![1.0, 2.0, 3.0, 4.0];
        let encoder = KeyShiftEncoder::new(0.7);
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let keys = (0..5).map(|_| BinaryKey::random(4, &mut rng)).collect::<Vec<_>>();

        let batch = encoder.encode_batch(&keys, &sigma.view(), &v_cap.view()).unwrap();

        for (row, key) in keys.iter().enumerate() {
            let single = encoder.encode(key, &sigma.view(), &v_cap.view()).unwrap();
            for (a, b) in batch.row(row).iter().zip(single.iter()) {
                assert!((a - b).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_decode_recovers_key() {
        let v_cap = v_cap_8x4();
        let sigma = array![1.0, 0.5, 2.0, 1.0];
        let encoder = KeyShiftEncoder::new(1.0);
        let key = BinaryKey::new(vec![0, 1, 1, 0]).unwrap();

        let shift = encoder.encode(&key, &sigma.view(), &v_cap.view()).unwrap();
        let decoded = encoder.decode(&shift.view(), &sigma.view(), &v_cap.view()).unwrap();

        assert_eq!(decoded, key);
    }

    #[test]
    fn test_rejects_wrong_key_length() {
        let v_cap = v_cap_8x4();
        let sigma = Array1::ones(4);
        let result = KeyShiftEncoder::new(1.0).encode(&BinaryKey::zeros(3), &sigma.view(), &v_cap.view());
        assert!(matches!(result, Err(WatermarkError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_rejects_non_binary_bits() {
        assert!(BinaryKey::new(vec![0, 2, 1]).is_err());
    }

    #[test]
    fn test_random_keys_are_binary() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let key = BinaryKey::random(256, &mut rng);
        assert_eq!(key.len(), 256);
        assert!(key.bits().iter().all(|&b| b <= 1));
        assert!(key.count_ones() > 64 && key.count_ones() < 192);
    }

    #[test]
    fn test_display_prints_bits() {
        let key = BinaryKey::new(vec![1, 0, 0, 1]).unwrap();
        assert_eq!(key.to_string(), "1001");
    }
}
