//! Core masking and classification modules

pub mod classifier;
pub mod cloud_mask;
pub mod feature_mask;
pub mod mask_combiner;
pub mod models;
pub mod morphology;
pub mod patches;
pub mod stack_masker;
pub mod water_mask;

// Re-export main types
pub use classifier::{
    classify_table, ClassMaps, ClassOutputs, ClassifierBackend, ClassifierEngine, LabelBase,
    PixelClassifier,
};
pub use cloud_mask::{CloudDetector, CloudProbabilityModel, CLOUD_BANDS};
pub use feature_mask::FeatureMaskBuilder;
pub use mask_combiner::MaskCombiner;
pub use patches::{patch_stride, start_points, Patch, PatchMerger, PatchSplitter};
pub use stack_masker::StackMasker;
pub use water_mask::{find_landcover_tiles, WaterMaskBuilder};
