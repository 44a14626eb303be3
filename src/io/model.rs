use crate::config::{ClassificationConfig, Feature};
use crate::types::{PipelineError, PipelineResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Load a JSON model artifact
pub fn load_json<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> PipelineResult<T> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(PipelineError::MissingInput(format!(
            "model artifact {} does not exist",
            path.display()
        )));
    }
    log::info!("Loading model artifact: {}", path.display());
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map_err(|e| PipelineError::Model(format!("{}: {}", path.display(), e)))
}

/// Per-feature normalisation and shape of a convolutional segmenter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationConfig {
    pub features: Vec<String>,
    pub n_classes: usize,
    pub n_hchannels: usize,
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
    #[serde(default = "default_tile_size")]
    pub tile_size: usize,
}

fn default_tile_size() -> usize {
    256
}

impl NormalizationConfig {
    pub fn from_classification(config: &ClassificationConfig) -> Self {
        Self {
            features: config.features.clone(),
            n_classes: config.n_classes,
            n_hchannels: config.n_hchannels,
            mean: config.features_mean.clone(),
            std: config.features_std.clone(),
            tile_size: config.patch.width.max(config.patch.height),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let config: Self = load_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let n = Feature::parse_list(&self.features)?.len();
        if self.mean.len() != n || self.std.len() != n {
            return Err(PipelineError::Config(format!(
                "normalisation needs {} means and stds, got {} and {}",
                n,
                self.mean.len(),
                self.std.len()
            )));
        }
        if self.std.iter().any(|s| *s <= 0.0) {
            return Err(PipelineError::Config("feature std must be positive".to_string()));
        }
        if self.n_classes == 0 || self.tile_size == 0 {
            return Err(PipelineError::Config(
                "n_classes and tile_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
