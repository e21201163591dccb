//! Named parameter groups and their safetensors files

use crate::error::Result;
use candle_nn::VarMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Parameters of the generator (`G`), discriminator (`D`) and encoder (`E`)
///
/// The maps share storage with the networks built from them, so loading into
/// a group updates the live model.
#[derive(Clone)]
pub struct ParameterGroups {
    pub generator: VarMap,
    pub discriminator: VarMap,
    pub encoder: VarMap,
}

impl Default for ParameterGroups {
    fn default() -> Self {
        Self {
            generator: VarMap::new(),
            discriminator: VarMap::new(),
            encoder: VarMap::new(),
        }
    }
}

/// `<dir>/<epoch>_net_<name>.safetensors`
pub fn checkpoint_path<P: AsRef<Path>>(dir: P, epoch: &str, name: &str) -> PathBuf {
    dir.as_ref().join(format!("{epoch}_net_{name}.safetensors"))
}

impl ParameterGroups {
    /// Groups by name, skipping those without parameters
    pub fn named(&self) -> Vec<(&'static str, &VarMap)> {
        [
            ("G", &self.generator),
            ("D", &self.discriminator),
            ("E", &self.encoder),
        ]
        .into_iter()
        .filter(|(_, map)| !map.all_vars().is_empty())
        .collect()
    }

    pub fn save<P: AsRef<Path>>(&self, dir: P, epoch: &str) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        for (name, map) in self.named() {
            let path = checkpoint_path(dir, epoch, name);
            map.save(&path)?;
            info!(group = name, path = %path.display(), "Saved parameters");
        }
        Ok(())
    }

    /// Load every non-empty group; a missing file is an error
    pub fn load<P: AsRef<Path>>(&mut self, dir: P, epoch: &str) -> Result<()> {
        let dir = dir.as_ref();
        for (name, map) in [
            ("G", &mut self.generator),
            ("D", &mut self.discriminator),
            ("E", &mut self.encoder),
        ] {
            if map.all_vars().is_empty() {
                continue;
            }
            let path = checkpoint_path(dir, epoch, name);
            if !path.exists() {
                warn!(group = name, path = %path.display(), "Checkpoint file missing");
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("missing checkpoint {}", path.display()),
                )
                .into());
            }
            map.load(&path)?;
            info!(group = name, path = %path.display(), "Loaded parameters");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    #[test]
    fn test_save_load_round_trip() {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();

        let groups = ParameterGroups::default();
        let vb = VarBuilder::from_varmap(&groups.generator, DType::F32, &device);
        let w = vb.get_with_hints((2, 3), "w", Init::Const(1.5)).unwrap();
        groups.save(dir.path(), "latest").unwrap();
        assert!(dir.path().join("latest_net_G.safetensors").exists());
        // empty groups are not written
        assert!(!dir.path().join("latest_net_D.safetensors").exists());

        let mut restored = ParameterGroups::default();
        let vb = VarBuilder::from_varmap(&restored.generator, DType::F32, &device);
        let w2 = vb.get_with_hints((2, 3), "w", Init::Const(0.0)).unwrap();
        restored.load(dir.path(), "latest").unwrap();
        assert_eq!(w2.to_vec2::<f32>().unwrap(), w.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_load_missing_file_fails() {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let mut groups = ParameterGroups::default();
        let vb = VarBuilder::from_varmap(&groups.encoder, DType::F32, &device);
        vb.get_with_hints(4, "b", Init::Const(0.0)).unwrap();
        assert!(groups.load(dir.path(), "3").is_err());
    }
}
