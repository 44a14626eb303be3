//! POS2IDON core: Sentinel-2 masking and per-pixel classification
//!
//! Builds water, feature (NDWI / Band 8) and cloud masks for atmospherically
//! corrected Sentinel-2 stacks, combines them into a FINAL mask, masks the
//! stack and classifies every remaining pixel for floating marine litter
//! detection, optionally through overlapping patches.

pub mod config;
pub mod core;
pub mod io;
pub mod pipeline;
pub mod types;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use types::{
    BandInfo, ClassRaster, ErrorKind, GeoTransform, MaskRaster, PipelineError, PipelineResult,
    ProbabilityRaster, Raster, StackRaster,
};

pub use config::{Algorithm, Feature, FeatureMaskKind, PipelineConfig};
pub use core::{
    ClassifierEngine, CloudDetector, FeatureMaskBuilder, MaskCombiner, PatchMerger,
    PatchSplitter, StackMasker, WaterMaskBuilder,
};
pub use pipeline::{Pipeline, ProductStatus, RunSummary};
