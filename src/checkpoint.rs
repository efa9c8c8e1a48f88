use anyhow::{anyhow, Context, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::scaling::Scaling;

const PREFIX: &str = "model-chkpt-";
const SUFFIX: &str = ".safetensors";
const SCALING_MEAN: &str = "__scaling.mean";
const SCALING_STDDEV: &str = "__scaling.stddev";

// ---------------------------------------------------------------------------
// Single-file save/load (safetensors)
// ---------------------------------------------------------------------------

/// Writes every variable, plus the scaling vectors once they are set.
pub fn save_checkpoint(varmap: &VarMap, scaling: &Scaling, path: &Path) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("varmap lock poisoned"))?;
    let mut named: HashMap<String, Tensor> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    let params = named.len();
    if scaling.is_initialized() {
        let (mean, stddev) = scaling.to_tensors(&Device::Cpu)?;
        named.insert(SCALING_MEAN.to_string(), mean);
        named.insert(SCALING_STDDEV.to_string(), stddev);
    }
    candle_core::safetensors::save(&named, path)?;
    tracing::info!(params, path = %path.display(), "saved checkpoint");
    Ok(())
}

/// Restores variables in place. Scaling is restored when the file carries it.
pub fn load_checkpoint(varmap: &VarMap, scaling: &mut Scaling, path: &Path, device: &Device) -> Result<()> {
    let tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("loading checkpoint {}", path.display()))?;
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("varmap lock poisoned"))?;
    let mut loaded = 0usize;
    for (name, var) in data.iter() {
        if let Some(saved) = tensors.get(name) {
            var.set(saved)?;
            loaded += 1;
        }
    }
    if let (Some(mean), Some(stddev)) = (tensors.get(SCALING_MEAN), tensors.get(SCALING_STDDEV)) {
        scaling.set_from_tensors(mean, stddev)?;
    }
    tracing::info!(loaded, total = data.len(), path = %path.display(), "loaded checkpoint");
    Ok(())
}

// ---------------------------------------------------------------------------
// Step-indexed checkpoint directory
// ---------------------------------------------------------------------------

/// `model-chkpt-<step>.safetensors` files in one directory.
pub struct CheckpointManager {
    dir: PathBuf,
    saved: BTreeMap<usize, PathBuf>,
}

impl CheckpointManager {
    /// Creates the directory if needed and indexes checkpoints already in it.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating checkpoint dir {}", dir.display()))?;
        let mut saved = BTreeMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if let Some(step) = parse_step(&path) {
                saved.insert(step, path);
            }
        }
        Ok(Self { dir, saved })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, step: usize) -> PathBuf {
        self.dir.join(format!("{PREFIX}{step}{SUFFIX}"))
    }

    pub fn steps(&self) -> Vec<usize> {
        self.saved.keys().copied().collect()
    }

    pub fn latest_step(&self) -> Option<usize> {
        self.saved.keys().next_back().copied()
    }

    pub fn save(&mut self, varmap: &VarMap, scaling: &Scaling, step: usize) -> Result<PathBuf> {
        let path = self.path_for(step);
        save_checkpoint(varmap, scaling, &path)?;
        self.saved.insert(step, path.clone());
        Ok(path)
    }

    /// Loads `step`, or the newest checkpoint when `None`. Returns the step
    /// loaded, `None` if the directory has no checkpoints.
    pub fn restore(
        &self,
        varmap: &VarMap,
        scaling: &mut Scaling,
        step: Option<usize>,
        device: &Device,
    ) -> Result<Option<usize>> {
        let step = match step.or_else(|| self.latest_step()) {
            Some(s) => s,
            None => return Ok(None),
        };
        let path = self
            .saved
            .get(&step)
            .ok_or_else(|| anyhow!("no checkpoint for step {step} in {}", self.dir.display()))?;
        load_checkpoint(varmap, scaling, path, device)?;
        Ok(Some(step))
    }

    /// With `Some(keep)`, removes every checkpoint except step `keep`.
    /// `None` leaves the directory alone. Returns the number of files removed.
    pub fn clean(&mut self, keep: Option<usize>) -> Result<usize> {
        let Some(keep) = keep else {
            return Ok(0);
        };
        let doomed: Vec<usize> = self.saved.keys().copied().filter(|&s| s != keep).collect();
        for step in &doomed {
            if let Some(path) = self.saved.remove(step) {
                std::fs::remove_file(&path)
                    .with_context(|| format!("removing {}", path.display()))?;
            }
        }
        tracing::info!(removed = doomed.len(), keep, "cleaned checkpoint dir");
        Ok(doomed.len())
    }
}

fn parse_step(path: &Path) -> Option<usize> {
    path.file_name()?
        .to_str()?
        .strip_prefix(PREFIX)?
        .strip_suffix(SUFFIX)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn varmap_with_weight() -> Result<VarMap> {
        let varmap = VarMap::new();
        varmap.get(
            (3, 2),
            "w",
            candle_nn::Init::Randn { mean: 0.0, stdev: 1.0 },
            DType::F32,
            &Device::Cpu,
        )?;
        Ok(varmap)
    }

    fn weight(varmap: &VarMap) -> Result<Vec<Vec<f32>>> {
        let data = varmap.data().lock().map_err(|_| anyhow!("poisoned"))?;
        let var = data.get("w").ok_or_else(|| anyhow!("missing w"))?;
        Ok(var.as_tensor().to_vec2::<f32>()?)
    }

    #[test]
    fn test_save_restore_weights_and_scaling() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let varmap = varmap_with_weight()?;
        let original = weight(&varmap)?;
        let mut scaling = Scaling::identity(2);
        scaling.set(vec![1.0, 2.0], vec![3.0, 4.0])?;

        let mut mgr = CheckpointManager::new(dir.path())?;
        let path = mgr.save(&varmap, &scaling, 7)?;
        assert!(path.ends_with("model-chkpt-7.safetensors"));

        let other = varmap_with_weight()?;
        let mut restored = Scaling::identity(2);
        let step = mgr.restore(&other, &mut restored, None, &Device::Cpu)?;
        assert_eq!(step, Some(7));
        assert_eq!(weight(&other)?, original);
        assert_eq!(restored, scaling);
        Ok(())
    }

    #[test]
    fn test_rescan_and_clean() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let varmap = varmap_with_weight()?;
        let scaling = Scaling::identity(2);
        {
            let mut mgr = CheckpointManager::new(dir.path())?;
            for step in [10, 20, 30] {
                mgr.save(&varmap, &scaling, step)?;
            }
        }
        std::fs::write(dir.path().join("notes.txt"), "x")?;

        let mut mgr = CheckpointManager::new(dir.path())?;
        assert_eq!(mgr.steps(), vec![10, 20, 30]);
        assert_eq!(mgr.latest_step(), Some(30));

        assert_eq!(mgr.clean(None)?, 0);
        assert_eq!(mgr.clean(Some(20))?, 2);
        assert_eq!(mgr.steps(), vec![20]);
        assert!(!mgr.path_for(10).exists());
        assert!(mgr.path_for(20).exists());
        assert!(dir.path().join("notes.txt").exists());
        Ok(())
    }

    #[test]
    fn test_restore_empty_dir_and_missing_step() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let varmap = varmap_with_weight()?;
        let mut scaling = Scaling::identity(2);
        let mgr = CheckpointManager::new(dir.path())?;
        assert_eq!(mgr.restore(&varmap, &mut scaling, None, &Device::Cpu)?, None);
        assert!(mgr.restore(&varmap, &mut scaling, Some(5), &Device::Cpu).is_err());
        Ok(())
    }
}
