use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use image::{ImageFormat, RgbImage};
use log::debug;
use ndarray::Array2;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    dataset::augmentation::AugmentationMethod,
    embedding::{BinaryKey, KeySubspaceSplit, LatentBasis},
    error::{Result, WatermarkError},
};

pub const CLEAN_DIR: &str = "image_before_perturb";
pub const WATERMARKED_DIR: &str = "perturbed_image";
pub const BEFORE_ATTACK_DIR: &str = "image_before_attack";
pub const TEST_DATA_FILE: &str = "test_data.json";
pub const PCA_FILE: &str = "pca.json";

#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub w0: Vec<f64>,
    pub wx: Vec<f64>,
    pub key: BinaryKey,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestData {
    pub wx: Vec<Vec<f64>>,
    pub w0: Vec<Vec<f64>>,
    pub key: Vec<BinaryKey>,
}

impl TestData {
    pub fn push(&mut self, record: SampleRecord) {
        self.wx.push(record.wx);
        self.w0.push(record.w0);
        self.key.push(record.key);
    }

    pub fn len(&self) -> usize {
        self.key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = SampleRecord> + '_ {
        self.w0
            .iter()
            .zip(&self.wx)
            .zip(&self.key)
            .map(|((w0, wx), key)| SampleRecord {
                w0: w0.clone(),
                wx: wx.clone(),
                key: key.clone(),
            })
    }
}

impl Extend<SampleRecord> for TestData {
    fn extend<I: IntoIterator<Item = SampleRecord>>(&mut self, iter: I) {
        for record in iter {
            self.push(record);
        }
    }
}

/// Parameters needed to reproduce or invert one shift's embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcaRecord {
    #[serde(rename = "sigma_512")]
    pub sigma_full: Vec<f64>,
    #[serde(rename = "sigma_64")]
    pub sigma_key: Vec<f64>,
    pub v_cap: Vec<Vec<f64>>,
    pub u_cap: Vec<Vec<f64>>,
    pub latent_mean: Vec<f64>,
}

impl PcaRecord {
    pub fn new(basis: &LatentBasis, split: &KeySubspaceSplit) -> Self {
        let rows = |m: &Array2<f64>| -> Vec<Vec<f64>> {
            m.rows().into_iter().map(|r| r.to_vec()).collect()
        };

        Self {
            sigma_full: basis.sigma().to_vec(),
            sigma_key: split.sigma_key().to_vec(),
            v_cap: rows(split.v_cap()),
            u_cap: rows(split.u_cap()),
            latent_mean: basis.mean().to_vec(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RenderedBatch {
    pub clean: Vec<RgbImage>,
    pub watermarked: Vec<RgbImage>,
    pub before_attack: Vec<RgbImage>,
}

#[derive(Debug, Clone)]
pub struct ShiftPaths {
    pub root: PathBuf,
    pub clean: PathBuf,
    pub watermarked: PathBuf,
    pub before_attack: Option<PathBuf>,
}

/// Writes the per-shift directory tree under `root`.
///
/// Nothing is written atomically: an interrupted run leaves whatever images
/// and records were already flushed.
#[derive(Debug, Clone)]
pub struct DatasetWriter {
    root: PathBuf,
    keep_before_attack: bool,
    parallel: bool,
}

impl DatasetWriter {
    pub fn new<P: AsRef<Path>>(root: P, augmentation: AugmentationMethod) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            keep_before_attack: !augmentation.is_none(),
            parallel: true,
        }
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn shift_dir(&self, shift: usize) -> PathBuf {
        self.root.join(format!("shift_{shift}"))
    }

    pub fn prepare_shift(&self, shift: usize) -> Result<ShiftPaths> {
        let root = self.shift_dir(shift);
        let paths = ShiftPaths {
            clean: root.join(CLEAN_DIR),
            watermarked: root.join(WATERMARKED_DIR),
            before_attack: self.keep_before_attack.then(|| root.join(BEFORE_ATTACK_DIR)),
            root,
        };

        for dir in [Some(&paths.clean), Some(&paths.watermarked), paths.before_attack.as_ref()]
            .into_iter()
            .flatten()
        {
            fs::create_dir_all(dir).map_err(|e| WatermarkError::storage(dir, e))?;
        }

        Ok(paths)
    }

    /// Saves a batch, numbering images from `start_index`.
    pub fn save_batch(&self, paths: &ShiftPaths, start_index: usize, batch: &RenderedBatch) -> Result<usize> {
        let mut jobs = Vec::with_capacity(batch.clean.len() * 3);

        for (i, image) in batch.clean.iter().enumerate() {
            jobs.push((paths.clean.join(format!("target_w0_{}.png", start_index + i)), image));
        }
        for (i, image) in batch.watermarked.iter().enumerate() {
            jobs.push((paths.watermarked.join(format!("target_wx_{}.png", start_index + i)), image));
        }
        if let Some(dir) = &paths.before_attack {
            for (i, image) in batch.before_attack.iter().enumerate() {
                jobs.push((dir.join(format!("target_wa_{}.png", start_index + i)), image));
            }
        }

        if self.parallel {
            jobs.par_iter().try_for_each(|(path, image)| save_png(path, image))?;
        } else {
            jobs.iter().try_for_each(|(path, image)| save_png(path, image))?;
        }

        debug!("Saved {} images starting at index {start_index}", jobs.len());
        Ok(jobs.len())
    }

    pub fn write_test_data(&self, paths: &ShiftPaths, data: &TestData) -> Result<PathBuf> {
        let path = paths.root.join(TEST_DATA_FILE);
        write_json(&path, data)?;
        Ok(path)
    }

    pub fn write_pca(&self, paths: &ShiftPaths, record: &PcaRecord) -> Result<PathBuf> {
        let path = paths.root.join(PCA_FILE);
        write_json(&path, record)?;
        Ok(path)
    }
}

pub fn read_test_data<P: AsRef<Path>>(path: P) -> Result<TestData> {
    read_json(path.as_ref())
}

pub fn read_pca<P: AsRef<Path>>(path: P) -> Result<PcaRecord> {
    read_json(path.as_ref())
}

fn save_png(path: &Path, image: &RgbImage) -> Result<()> {
    image.save_with_format(path, ImageFormat::Png)?;
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).map_err(|e| WatermarkError::storage(path, e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush().map_err(|e| WatermarkError::storage(path, e))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|e| WatermarkError::storage(path, e))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}
