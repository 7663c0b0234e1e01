use std::{
    collections::HashMap,
    fmt,
    fs,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use ndarray::{Array1, Array2};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    embedding::decomposer::LatentBasis,
    error::{Result, WatermarkError},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BasisCacheKey {
    pub generator: String,
    pub latent_dim: usize,
    pub sample_count: usize,
}

impl BasisCacheKey {
    pub fn new(generator: impl Into<String>, latent_dim: usize, sample_count: usize) -> Self {
        Self {
            generator: generator.into(),
            latent_dim,
            sample_count,
        }
    }

    pub fn file_stem(&self) -> String {
        let generator = self
            .generator
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect::<String>();

        format!("basis-{generator}-d{}-n{}", self.latent_dim, self.sample_count)
    }
}

impl fmt::Display for BasisCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file_stem())
    }
}

pub trait BasisCache {
    fn load(&self, key: &BasisCacheKey) -> Result<Option<LatentBasis>>;

    fn store(&self, key: &BasisCacheKey, basis: &LatentBasis) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct StoredBasis {
    components: Vec<Vec<f64>>,
    variances: Vec<f64>,
    mean: Vec<f64>,
}

impl From<&LatentBasis> for StoredBasis {
    fn from(basis: &LatentBasis) -> Self {
        Self {
            components: basis
                .components()
                .rows()
                .into_iter()
                .map(|row| row.to_vec())
                .collect(),
            variances: basis.variances().to_vec(),
            mean: basis.mean().to_vec(),
        }
    }
}

impl StoredBasis {
    fn into_basis(self) -> Result<LatentBasis> {
        let dim = self.components.len();
        let flat = self.components.into_iter().flatten().collect::<Vec<_>>();

        if flat.len() != dim * dim {
            return Err(WatermarkError::dimension("cached basis entries", dim * dim, flat.len()));
        }

        let components = Array2::from_shape_vec((dim, dim), flat)
            .map_err(|e| WatermarkError::MalformedTensor(e.to_string()))?;

        LatentBasis::new(
            components,
            Array1::from_vec(self.variances),
            Array1::from_vec(self.mean),
        )
    }
}

#[derive(Debug, Clone)]
pub struct FileBasisCache {
    dir: PathBuf,
}

impl FileBasisCache {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, key: &BasisCacheKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.file_stem()))
    }
}

impl BasisCache for FileBasisCache {
    fn load(&self, key: &BasisCacheKey) -> Result<Option<LatentBasis>> {
        let path = self.path_for(key);
        if !path.is_file() {
            debug!("No cached basis at {}", path.display());
            return Ok(None);
        }

        let contents = fs::read_to_string(&path).map_err(|e| WatermarkError::storage(&path, e))?;
        let stored = match serde_json::from_str::<StoredBasis>(&contents) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Unreadable basis cache {}: {e}; recomputing", path.display());
                return Ok(None);
            }
        };

        match stored.into_basis() {
            Ok(basis) => Ok(Some(basis)),
            Err(e) => {
                warn!("Inconsistent basis cache {}: {e}; recomputing", path.display());
                Ok(None)
            }
        }
    }

    fn store(&self, key: &BasisCacheKey, basis: &LatentBasis) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| WatermarkError::storage(&self.dir, e))?;

        let path = self.path_for(key);
        let json = serde_json::to_string(&StoredBasis::from(basis))?;
        fs::write(&path, json).map_err(|e| WatermarkError::storage(&path, e))?;

        debug!("Cached latent basis at {}", path.display());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryBasisCache {
    entries: Mutex<HashMap<BasisCacheKey, LatentBasis>>,
}

impl MemoryBasisCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl BasisCache for MemoryBasisCache {
    fn load(&self, key: &BasisCacheKey) -> Result<Option<LatentBasis>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn store(&self, key: &BasisCacheKey, basis: &LatentBasis) -> Result<()> {
        self.entries.lock().insert(key.clone(), basis.clone());
        Ok(())
    }
}
