//! Run configuration and the stack feature registry

use crate::core::patches::patch_stride;
use crate::types::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Features available in an atmospherically corrected stack, in stack band order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Feature {
    B01,
    B02,
    B03,
    B04,
    B05,
    B06,
    B07,
    B08,
    B8A,
    B11,
    B12,
    NDVI,
    FAI,
    FDI,
    SI,
    NDWI,
    NRD,
    NDMI,
    BSI,
}

impl Feature {
    pub const ALL: [Feature; 19] = [
        Feature::B01,
        Feature::B02,
        Feature::B03,
        Feature::B04,
        Feature::B05,
        Feature::B06,
        Feature::B07,
        Feature::B08,
        Feature::B8A,
        Feature::B11,
        Feature::B12,
        Feature::NDVI,
        Feature::FAI,
        Feature::FDI,
        Feature::SI,
        Feature::NDWI,
        Feature::NRD,
        Feature::NDMI,
        Feature::BSI,
    ];

    /// The eleven surface-reflectance bands
    pub const SPECTRAL: [Feature; 11] = [
        Feature::B01,
        Feature::B02,
        Feature::B03,
        Feature::B04,
        Feature::B05,
        Feature::B06,
        Feature::B07,
        Feature::B08,
        Feature::B8A,
        Feature::B11,
        Feature::B12,
    ];

    /// 1-based band index of this feature inside the stack
    pub fn band_index(self) -> usize {
        Feature::ALL
            .iter()
            .position(|f| *f == self)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    pub fn name(self) -> &'static str {
        match self {
            Feature::B01 => "B01",
            Feature::B02 => "B02",
            Feature::B03 => "B03",
            Feature::B04 => "B04",
            Feature::B05 => "B05",
            Feature::B06 => "B06",
            Feature::B07 => "B07",
            Feature::B08 => "B08",
            Feature::B8A => "B8A",
            Feature::B11 => "B11",
            Feature::B12 => "B12",
            Feature::NDVI => "NDVI",
            Feature::FAI => "FAI",
            Feature::FDI => "FDI",
            Feature::SI => "SI",
            Feature::NDWI => "NDWI",
            Feature::NRD => "NRD",
            Feature::NDMI => "NDMI",
            Feature::BSI => "BSI",
        }
    }

    /// Resolve an ordered list of feature names
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> PipelineResult<Vec<Feature>> {
        names.iter().map(|n| n.as_ref().parse()).collect()
    }
}

impl FromStr for Feature {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .iter()
            .copied()
            .find(|f| f.name() == s.trim())
            .ok_or_else(|| PipelineError::UnknownFeature(s.to_string()))
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Feature-based mask selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureMaskKind {
    #[serde(rename = "NDWI")]
    Ndwi,
    #[serde(rename = "BAND8")]
    Band8,
}

impl fmt::Display for FeatureMaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureMaskKind::Ndwi => f.write_str("NDWI"),
            FeatureMaskKind::Band8 => f.write_str("BAND8"),
        }
    }
}

/// Threshold and dilation for one feature mask
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdParams {
    pub threshold: f32,
    /// Binary dilation iterations (>= 1)
    pub dilation: usize,
}

/// Cloud detector parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudMaskParams {
    pub enabled: bool,
    /// Probability above which a pixel is cloudy
    pub threshold: f32,
    /// Disk radius (pixels) for probability averaging, 0 disables it
    pub average_over: usize,
    /// Disk radius (pixels) for dilation of the binary mask, 0 disables it
    pub dilation_size: usize,
    /// Boosted-tree cloud probability model
    pub model_path: Option<PathBuf>,
}

impl Default for CloudMaskParams {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.4,
            average_over: 2,
            dilation_size: 1,
            model_path: None,
        }
    }
}

/// Masking stage parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskingConfig {
    pub enabled: bool,
    /// Pixels by which the water region is eroded away from land
    pub land_buffer: usize,
    pub features_mask: Option<FeatureMaskKind>,
    pub ndwi: ThresholdParams,
    pub band8: ThresholdParams,
    pub cloud: CloudMaskParams,
    /// Keep unthresholded / undilated intermediate rasters on disk
    pub keep_intermediate: bool,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            land_buffer: 0,
            features_mask: Some(FeatureMaskKind::Band8),
            ndwi: ThresholdParams {
                threshold: 0.5,
                dilation: 6,
            },
            band8: ThresholdParams {
                threshold: 0.01,
                dilation: 2,
            },
            cloud: CloudMaskParams::default(),
            keep_intermediate: false,
        }
    }
}

/// Classification algorithm family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Random forest (tree ensemble)
    Rf,
    /// Gradient boosted trees
    Xgb,
    /// Convolutional segmentation network
    Unet,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Rf => f.write_str("rf"),
            Algorithm::Xgb => f.write_str("xgb"),
            Algorithm::Unet => f.write_str("unet"),
        }
    }
}

/// Patch size and overlap for split-and-mosaic
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatchParams {
    pub width: usize,
    pub height: usize,
    /// Overlap fraction between neighbouring patches, in [0, 1)
    pub overlap: f64,
}

impl Default for PatchParams {
    fn default() -> Self {
        Self {
            width: 256,
            height: 256,
            overlap: 0.5,
        }
    }
}

/// Classification stage parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub enabled: bool,
    pub split_and_mosaic: bool,
    pub patch: PatchParams,
    /// Also write the maximum class probability raster
    pub probabilities: bool,
    pub algorithm: Algorithm,
    pub model_path: PathBuf,
    /// Normalisation config for the convolutional backend; built from the fields below when absent
    pub norm_config_path: Option<PathBuf>,
    pub n_classes: usize,
    pub n_hchannels: usize,
    pub features: Vec<String>,
    pub features_mean: Vec<f32>,
    pub features_std: Vec<f32>,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            split_and_mosaic: false,
            patch: PatchParams::default(),
            probabilities: false,
            algorithm: Algorithm::Rf,
            model_path: PathBuf::from("configs/MLmodels/RF_Model_Example_MARIDA.json"),
            norm_config_path: None,
            n_classes: 11,
            n_hchannels: 16,
            features: Feature::ALL.iter().map(|f| f.name().to_string()).collect(),
            features_mean: vec![
                0.05197577, 0.04783991, 0.04056812, 0.03163572, 0.02972606, 0.03457443,
                0.03875053, 0.03436435, 0.0392113, 0.02358126, 0.01588816,
            ],
            features_std: vec![
                0.04725893, 0.04743808, 0.04699043, 0.04967381, 0.04946782, 0.06458357,
                0.07594915, 0.07120246, 0.08251058, 0.05111466, 0.03524419,
            ],
        }
    }
}

impl ClassificationConfig {
    pub fn resolved_features(&self) -> PipelineResult<Vec<Feature>> {
        Feature::parse_list(&self.features)
    }
}

/// Intermediate file removal after each product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupMode {
    #[default]
    None,
    /// Top-of-atmosphere bands, patches and per-patch maps
    Some,
    /// Additionally the corrected stack, masks and masked stack
    All,
}

/// Folder names below the working directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderConfig {
    pub root: PathBuf,
    pub s2l1c_products: String,
    pub ac_products: String,
    pub masked_products: String,
    pub classification_products: String,
    pub worldcover: String,
}

impl Default for FolderConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            s2l1c_products: "0_S2L1C_Products".to_string(),
            ac_products: "1_Atmospheric_Corrected_Products".to_string(),
            masked_products: "2_Masked_Products".to_string(),
            classification_products: "3_Classification_Results".to_string(),
            worldcover: "2-1_ESA_Worldcover".to_string(),
        }
    }
}

impl FolderConfig {
    pub fn s2l1c_dir(&self) -> PathBuf {
        self.root.join(&self.s2l1c_products)
    }

    pub fn ac_dir(&self) -> PathBuf {
        self.root.join(&self.ac_products)
    }

    pub fn masked_dir(&self) -> PathBuf {
        self.root.join(&self.masked_products)
    }

    pub fn classification_dir(&self) -> PathBuf {
        self.root.join(&self.classification_products)
    }

    pub fn worldcover_dir(&self) -> PathBuf {
        self.root.join(&self.worldcover)
    }
}

/// Complete, immutable run configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub folders: FolderConfig,
    pub masking: MaskingConfig,
    pub classification: ClassificationConfig,
    pub cleanup: CleanupMode,
    /// Only process products whose name contains this string
    pub name_filter: Option<String>,
    /// Redo stages whose artifacts already exist
    pub rerun: bool,
}

impl PipelineConfig {
    /// Load and validate a JSON configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: PipelineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        log::info!("Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let m = &self.masking;
        if m.ndwi.dilation < 1 || m.band8.dilation < 1 {
            return Err(PipelineError::Config(
                "dilation iterations must be equal or greater than 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&m.cloud.threshold) {
            return Err(PipelineError::Config(format!(
                "cloud threshold {} outside [0, 1]",
                m.cloud.threshold
            )));
        }

        let c = &self.classification;
        if c.patch.width == 0 || c.patch.height == 0 {
            return Err(PipelineError::Config("patch size must be at least 1".to_string()));
        }
        if !(0.0..1.0).contains(&c.patch.overlap) {
            return Err(PipelineError::Config(format!(
                "patch overlap {} outside [0, 1)",
                c.patch.overlap
            )));
        }
        if c.split_and_mosaic {
            patch_stride(c.patch.width, c.patch.overlap)?;
            patch_stride(c.patch.height, c.patch.overlap)?;
        }
        if c.n_classes == 0 {
            return Err(PipelineError::Config("n_classes must be at least 1".to_string()));
        }

        let features = c.resolved_features()?;
        if features.is_empty() {
            return Err(PipelineError::Config("feature list is empty".to_string()));
        }

        if c.algorithm == Algorithm::Unet {
            if !c.split_and_mosaic {
                return Err(PipelineError::Config(
                    "the unet algorithm needs split_and_mosaic".to_string(),
                ));
            }
            if c.patch.width != c.patch.height {
                return Err(PipelineError::Config(format!(
                    "unet patches must be square, got {}x{}",
                    c.patch.width, c.patch.height
                )));
            }
            if c.norm_config_path.is_none()
                && (c.features_mean.len() != features.len() || c.features_std.len() != features.len())
            {
                return Err(PipelineError::Config(format!(
                    "unet needs one mean and std per feature ({} features, {} means, {} stds)",
                    features.len(),
                    c.features_mean.len(),
                    c.features_std.len()
                )));
            }
            if c.features_std.iter().any(|s| *s <= 0.0) {
                return Err(PipelineError::Config("feature std must be positive".to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_registry_indices() {
        assert_eq!(Feature::B01.band_index(), 1);
        assert_eq!(Feature::B08.band_index(), 8);
        assert_eq!(Feature::B8A.band_index(), 9);
        assert_eq!(Feature::B12.band_index(), 11);
        assert_eq!(Feature::NDVI.band_index(), 12);
        assert_eq!(Feature::BSI.band_index(), 19);
    }

    #[test]
    fn test_unknown_feature_rejected() {
        let err = Feature::parse_list(&["B01", "B13"]).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownFeature(ref n) if n == "B13"));
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.masking.features_mask, Some(FeatureMaskKind::Band8));
        assert_eq!(config.classification.features.len(), 19);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "masking": { "features_mask": "NDWI", "land_buffer": 2 },
            "classification": { "algorithm": "xgb", "probabilities": true },
            "cleanup": "some"
        }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.masking.features_mask, Some(FeatureMaskKind::Ndwi));
        assert_eq!(config.masking.land_buffer, 2);
        assert_eq!(config.masking.ndwi.dilation, 6);
        assert_eq!(config.classification.algorithm, Algorithm::Xgb);
        assert_eq!(config.cleanup, CleanupMode::Some);
    }

    #[test]
    fn test_null_feature_mask() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{ "masking": { "features_mask": null } }"#).unwrap();
        assert_eq!(config.masking.features_mask, None);
    }

    #[test]
    fn test_zero_dilation_rejected() {
        let mut config = PipelineConfig::default();
        config.masking.ndwi.dilation = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_split_overlap_must_share_pixels() {
        let mut config = PipelineConfig::default();
        config.classification.split_and_mosaic = true;
        config.classification.patch = PatchParams {
            width: 4,
            height: 4,
            overlap: 0.1,
        };
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
        config.classification.patch.overlap = 0.0;
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
        config.classification.patch.overlap = 0.5;
        config.validate().unwrap();

        // Without patching the overlap is never used
        config.classification.split_and_mosaic = false;
        config.classification.patch.overlap = 0.0;
        config.validate().unwrap();
    }

    #[test]
    fn test_unet_patches_must_be_square() {
        let mut config = PipelineConfig::default();
        config.classification.algorithm = Algorithm::Unet;
        config.classification.features = Feature::SPECTRAL.iter().map(|f| f.to_string()).collect();
        config.classification.split_and_mosaic = true;
        config.classification.patch.height = 128;
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_unet_requires_split() {
        let mut config = PipelineConfig::default();
        config.classification.algorithm = Algorithm::Unet;
        config.classification.features = Feature::SPECTRAL.iter().map(|f| f.to_string()).collect();
        assert!(config.validate().is_err());
        config.classification.split_and_mosaic = true;
        config.validate().unwrap();
    }
}
