//! Per-product stage sequencing with resume and failure isolation

use crate::config::{Algorithm, CleanupMode, PipelineConfig};
use crate::core::classifier::ClassifierEngine;
use crate::core::cloud_mask::{CloudDetector, CloudProbabilityModel};
use crate::core::feature_mask::FeatureMaskBuilder;
use crate::core::mask_combiner::MaskCombiner;
use crate::core::models::BoostedTreeModel;
use crate::core::patches::{PatchMerger, PatchSplitter};
use crate::core::stack_masker::StackMasker;
use crate::core::water_mask::{find_landcover_tiles, WaterMaskBuilder};
use crate::io::raster::{read_grid, read_raster, remove_raster, write_raster};
use crate::io::safe::{filter_products, is_old_format, product_short_name};
use crate::types::{ErrorKind, PipelineError, PipelineResult, StackRaster};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Pipeline stage, used to report where a product failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Naming,
    Masking,
    Classification,
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Naming => "naming",
            Stage::Masking => "masking",
            Stage::Classification => "classification",
            Stage::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// Last completed stage of one product
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProductStatus {
    Downloaded,
    Corrected,
    Masked,
    Classified,
    Failed { stage: Stage, reason: String },
}

impl ProductStatus {
    fn rank(&self) -> u8 {
        match self {
            ProductStatus::Downloaded => 0,
            ProductStatus::Corrected => 1,
            ProductStatus::Masked => 2,
            ProductStatus::Classified => 3,
            ProductStatus::Failed { .. } => 0,
        }
    }

    /// True once `self` has reached `other`
    pub fn reached(&self, other: &ProductStatus) -> bool {
        !matches!(self, ProductStatus::Failed { .. }) && self.rank() >= other.rank()
    }
}

/// Artifact locations of one product
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductPaths {
    pub short_name: String,
    pub ac_product: PathBuf,
    pub masked_product: PathBuf,
    pub classification: PathBuf,
}

impl ProductPaths {
    pub fn new(config: &PipelineConfig, short_name: &str) -> Self {
        Self {
            short_name: short_name.to_string(),
            ac_product: config.folders.ac_dir().join(short_name),
            masked_product: config.folders.masked_dir().join(short_name),
            classification: config.folders.classification_dir().join(short_name),
        }
    }

    pub fn stack(&self) -> PathBuf {
        self.ac_product.join(format!("{}_stack.tif", self.short_name))
    }

    pub fn toa_bands(&self) -> PathBuf {
        self.ac_product.join("Top_Atmosphere_Bands")
    }

    pub fn masks(&self) -> PathBuf {
        self.masked_product.join("Masks")
    }

    pub fn mask(&self, suffix: &str) -> PathBuf {
        self.masks().join(format!("{}_{}", self.short_name, suffix))
    }

    pub fn water_mask(&self) -> PathBuf {
        self.mask("WATER_Mask.tif")
    }

    pub fn cloud_mask(&self) -> PathBuf {
        self.mask("CLOUD_Mask.tif")
    }

    pub fn final_mask(&self) -> PathBuf {
        self.mask("FINAL_Mask.tif")
    }

    pub fn nan_mask(&self) -> PathBuf {
        self.mask("NAN_Mask.tif")
    }

    pub fn masked_stack(&self) -> PathBuf {
        self.masked_product
            .join(format!("{}_masked_stack.tif", self.short_name))
    }

    pub fn patches(&self) -> PathBuf {
        self.masked_product.join("Patches")
    }

    pub fn class_maps(&self) -> PathBuf {
        self.classification.join("sc_maps")
    }

    pub fn probability_maps(&self) -> PathBuf {
        self.classification.join("proba_maps")
    }

    /// Stem of the raster that is classified
    pub fn classified_stem(&self, masked: bool) -> String {
        if masked {
            format!("{}_masked_stack", self.short_name)
        } else {
            format!("{}_stack", self.short_name)
        }
    }
}

/// One product that stopped at a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductFailure {
    pub product: String,
    pub stage: Stage,
    pub reason: String,
}

/// End-of-run report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub found: usize,
    pub processed: usize,
    pub filtered_out: Vec<String>,
    pub old_format: Vec<String>,
    pub no_data_or_duplicate: Vec<String>,
    pub corrupted: Vec<String>,
    pub failed: Vec<ProductFailure>,
}

impl RunSummary {
    pub fn log(&self) {
        log::info!("📊 Products found: {}", self.found);
        log::info!("📊 Products processed: {}", self.processed);
        let buckets = [
            ("Filtered out by name", &self.filtered_out),
            ("Old format (duplicate)", &self.old_format),
            ("No data or duplicate sensing time", &self.no_data_or_duplicate),
            ("Corrupted", &self.corrupted),
        ];
        for (label, names) in buckets {
            if !names.is_empty() {
                log::info!("{}: {}", label, names.len());
                for name in names {
                    log::info!("   {}", name);
                }
            }
        }
        if !self.failed.is_empty() {
            log::info!("Failed: {}", self.failed.len());
            for f in &self.failed {
                log::info!("   {} ({}: {})", f.product, f.stage, f.reason);
            }
        }
    }
}

/// Batch runner over Sentinel-2 products
pub struct Pipeline {
    config: PipelineConfig,
    cloud_detector: Option<CloudDetector>,
    classifier: Option<ClassifierEngine>,
}

impl Pipeline {
    /// Validate the configuration and load the models; failures here abort the run
    pub fn new(config: PipelineConfig) -> PipelineResult<Self> {
        config.validate()?;

        let cloud = &config.masking.cloud;
        let cloud_detector = match (&cloud.model_path, config.masking.enabled && cloud.enabled) {
            (Some(path), true) => {
                let model = BoostedTreeModel::load(path)?;
                Some(CloudDetector::new(Box::new(model), cloud))
            }
            (None, true) => {
                log::warn!("Cloud mask enabled without a cloud model; continuing without it");
                None
            }
            (_, false) => None,
        };

        let classifier = if config.classification.enabled {
            Some(ClassifierEngine::from_config(&config.classification)?)
        } else {
            None
        };

        Ok(Self {
            config,
            cloud_detector,
            classifier,
        })
    }

    /// Pipeline with explicitly supplied models
    pub fn with_models(
        config: PipelineConfig,
        cloud_model: Option<Box<dyn CloudProbabilityModel>>,
        classifier: Option<ClassifierEngine>,
    ) -> PipelineResult<Self> {
        config.validate()?;
        let cloud_detector = cloud_model
            .filter(|_| config.masking.cloud.enabled)
            .map(|m| CloudDetector::new(m, &config.masking.cloud));
        Ok(Self {
            config,
            cloud_detector,
            classifier,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process every product in order; per-product failures are recorded, not raised
    pub fn run(&self, products: &[String]) -> RunSummary {
        let mut summary = RunSummary {
            found: products.len(),
            ..RunSummary::default()
        };
        log::info!("🚀 Processing {} product(s)", products.len());

        let filter = self.config.name_filter.as_deref().unwrap_or("");
        let (products, ignored) = filter_products(products, filter);
        summary.filtered_out = ignored;

        let mut short_names: HashSet<String> = HashSet::new();
        for (i, product) in products.iter().enumerate() {
            log::info!("Product {}/{}: {}", i + 1, products.len(), product);

            if is_old_format(product) {
                log::warn!("{} uses the old naming format, skipping", product);
                summary.old_format.push(product.clone());
                continue;
            }

            let short_name = match product_short_name(&self.config.folders.s2l1c_dir().join(product)) {
                Ok(name) => name,
                Err(e) => {
                    log::error!("❌ {} failed at {}: {}", product, Stage::Naming, e);
                    summary.corrupted.push(product.clone());
                    continue;
                }
            };
            if !short_names.insert(short_name.clone()) {
                log::warn!("{} duplicates sensing time {}, skipping", product, short_name);
                summary.no_data_or_duplicate.push(product.clone());
                continue;
            }

            let paths = ProductPaths::new(&self.config, &short_name);
            match self.advance(&paths) {
                Ok(ProductStatus::Downloaded) => {
                    log::warn!("No corrected stack for {}", product);
                    summary.no_data_or_duplicate.push(product.clone());
                }
                Ok(_) => summary.processed += 1,
                Err((stage, e)) => {
                    log::error!(
                        "❌ {} failed at {} ({:?}): {}",
                        product,
                        stage,
                        e.kind(),
                        e
                    );
                    if e.kind() == ErrorKind::MissingInput {
                        summary.corrupted.push(product.clone());
                    } else {
                        summary.failed.push(ProductFailure {
                            product: product.clone(),
                            stage,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        summary.log();
        summary
    }

    /// Status from the artifacts on disk
    pub fn resume_status(&self, paths: &ProductPaths) -> ProductStatus {
        let masked = self.config.masking.enabled;
        if let Some(engine) = &self.classifier {
            let (class_name, _) = engine.output_names(&paths.classified_stem(masked));
            if paths.class_maps().join(class_name).is_file() {
                return ProductStatus::Classified;
            }
        }
        if masked && paths.masked_stack().is_file() {
            return ProductStatus::Masked;
        }
        if paths.stack().is_file() {
            return ProductStatus::Corrected;
        }
        ProductStatus::Downloaded
    }

    /// Run the remaining stages of one corrected product
    pub fn process(&self, paths: &ProductPaths) -> ProductStatus {
        match self.advance(paths) {
            Ok(status) => status,
            Err((stage, e)) => ProductStatus::Failed {
                stage,
                reason: e.to_string(),
            },
        }
    }

    fn advance(&self, paths: &ProductPaths) -> Result<ProductStatus, (Stage, PipelineError)> {
        let mut status = self.resume_status(paths);
        if self.config.rerun && status.reached(&ProductStatus::Corrected) {
            status = ProductStatus::Corrected;
        }
        log::debug!("{} resumes from {:?}", paths.short_name, status);
        if status == ProductStatus::Downloaded {
            return Ok(status);
        }

        if self.config.masking.enabled && !status.reached(&ProductStatus::Masked) {
            self.mask(paths).map_err(|e| (Stage::Masking, e))?;
            status = ProductStatus::Masked;
        }

        if let Some(engine) = &self.classifier {
            if !status.reached(&ProductStatus::Classified) {
                self.classify(engine, paths)
                    .map_err(|e| (Stage::Classification, e))?;
                status = ProductStatus::Classified;
            }
        }

        self.cleanup(paths).map_err(|e| (Stage::Cleanup, e))?;
        Ok(status)
    }

    /// Water, feature and cloud masks, FINAL mask and masked stack
    pub fn mask(&self, paths: &ProductPaths) -> PipelineResult<()> {
        let masking = &self.config.masking;
        let stack = paths.stack();
        log::info!("🎭 Masking {}", paths.short_name);
        std::fs::create_dir_all(paths.masks())?;

        let grid = read_grid(&stack)?;
        let tiles = find_landcover_tiles(&self.config.folders.worldcover_dir())?;
        WaterMaskBuilder::new(masking.land_buffer).create(&tiles, &grid, &paths.water_mask())?;

        let feature_path = match masking.features_mask {
            Some(kind) => {
                let builder = FeatureMaskBuilder::from_config(kind, masking);
                builder.create(&stack, &paths.masks(), &paths.short_name)?;
                Some(paths.masks().join(builder.output_name(&paths.short_name)))
            }
            None => None,
        };

        let cloud_path = match &self.cloud_detector {
            Some(detector) => match detector.create(&paths.ac_product, &paths.cloud_mask()) {
                Ok(_) => Some(paths.cloud_mask()),
                Err(e) if e.kind() == ErrorKind::MissingInput => return Err(e),
                Err(e) => {
                    log::warn!(
                        "Cloud mask failed for {} ({}); continuing without it",
                        paths.short_name,
                        e
                    );
                    None
                }
            },
            None => None,
        };

        let combiner = MaskCombiner::new(masking.features_mask, cloud_path.is_some());
        combiner.create(
            &paths.water_mask(),
            feature_path.as_deref(),
            cloud_path.as_deref(),
            &paths.final_mask(),
        )?;

        if self.late_masking() {
            // Segmentation sees the unmasked stack; its maps are masked after mosaicking
            let corrected: StackRaster = read_raster(&stack)?;
            write_raster(paths.nan_mask(), &StackMasker::new().nan_mask(&corrected))?;
            drop(corrected);
            std::fs::copy(&stack, paths.masked_stack())?;
        } else {
            StackMasker::new().create(&stack, &paths.final_mask(), &paths.masked_stack())?;
        }
        Ok(())
    }

    fn late_masking(&self) -> bool {
        self.config.masking.enabled && self.config.classification.algorithm == Algorithm::Unet
    }

    /// Classify the (masked) stack directly or patch by patch
    pub fn classify(&self, engine: &ClassifierEngine, paths: &ProductPaths) -> PipelineResult<()> {
        let classification = &self.config.classification;
        let masked = self.config.masking.enabled;
        let input = if masked { paths.masked_stack() } else { paths.stack() };
        let with_probability = classification.probabilities;
        engine.begin_batch();

        if !classification.split_and_mosaic {
            engine.classify_file(&input, &paths.classification, with_probability)?;
            return Ok(());
        }

        let splitter = PatchSplitter::new(classification.patch);
        let patches = splitter.split_to_folder::<f32>(&input, &paths.patches())?;
        log::info!("Classifying {} patches of {}", patches.len(), paths.short_name);
        let mut outputs = Vec::with_capacity(patches.len());
        for patch in &patches {
            outputs.push(engine.classify_file(patch, &paths.classification, with_probability)?);
        }

        let (class_name, proba_name) = engine.output_names(&paths.classified_stem(masked));
        let tag = engine.algorithm_tag();
        let merger = PatchMerger::new();
        let class_map = paths.class_maps().join(class_name);
        merger.merge_folder::<u8>(&paths.class_maps(), &format!("_{}-scmap.tif", tag), &class_map)?;
        let probability_map = paths.probability_maps().join(proba_name);
        if with_probability {
            merger.merge_folder::<f32>(
                &paths.probability_maps(),
                &format!("_{}-probamap.tif", tag),
                &probability_map,
            )?;
        }

        if self.late_masking() {
            let masker = StackMasker::new();
            let (nan_mask, final_mask) = (paths.nan_mask(), paths.final_mask());
            masker.create_late(&class_map, &nan_mask, &final_mask, &class_map, 0u8, 0u8)?;
            if with_probability {
                masker.create_late(
                    &probability_map,
                    &nan_mask,
                    &final_mask,
                    &probability_map,
                    f32::NAN,
                    0.0f32,
                )?;
            }
        }

        if !self.config.masking.keep_intermediate {
            for output in &outputs {
                remove_raster(&output.class_map)?;
                if let Some(p) = &output.probability_map {
                    remove_raster(p)?;
                }
            }
        }
        Ok(())
    }

    /// Remove intermediate products according to the cleanup mode
    pub fn cleanup(&self, paths: &ProductPaths) -> PipelineResult<()> {
        let mode = self.config.cleanup;
        if mode == CleanupMode::None {
            return Ok(());
        }
        log::info!("🧹 Cleaning up {} ({:?})", paths.short_name, mode);
        remove_dir(&paths.toa_bands())?;
        remove_dir(&paths.patches())?;
        if mode == CleanupMode::All {
            remove_raster(paths.stack())?;
            remove_dir(&paths.masks())?;
            remove_raster(paths.masked_stack())?;
        }
        Ok(())
    }
}

fn remove_dir(path: &Path) -> PipelineResult<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Product names from a list file, one per line; blank lines and `#` comments are skipped
pub fn read_product_list<P: AsRef<Path>>(path: P) -> PipelineResult<Vec<String>> {
    let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        PipelineError::MissingInput(format!("{}: {}", path.as_ref().display(), e))
    })?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}
