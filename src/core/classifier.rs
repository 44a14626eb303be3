use crate::config::{Algorithm, ClassificationConfig, Feature};
use crate::core::models::{BoostedTreeModel, ConvSegmenter, TreeEnsembleModel};
use crate::io::model::NormalizationConfig;
use crate::io::raster::{read_raster, write_raster};
use crate::types::{
    BandInfo, ClassRaster, PipelineError, PipelineResult, ProbabilityRaster, StackRaster,
};
use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3, Axis};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Class numbering used by a backend's `predict`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelBase {
    /// Labels start at 0 and are shifted by one on output
    ZeroBased,
    OneBased,
}

/// Per-pixel classifier over a (pixels, features) table without NaN
pub trait PixelClassifier: Send + Sync {
    fn label_base(&self) -> LabelBase;

    fn predict(&self, table: ArrayView2<f32>) -> PipelineResult<Array1<u8>>;

    /// Per-class probabilities, one row per table row
    fn predict_proba(&self, table: ArrayView2<f32>) -> PipelineResult<Array2<f32>>;
}

/// Class map and optional maximum class probability map of one raster
#[derive(Debug, Clone)]
pub struct ClassMaps {
    pub classes: ClassRaster,
    pub probability: Option<ProbabilityRaster>,
}

/// Paths written by [`ClassifierEngine::classify_file`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassOutputs {
    pub class_map: PathBuf,
    pub probability_map: Option<PathBuf>,
}

pub enum ClassifierBackend {
    TreeEnsemble(TreeEnsembleModel),
    BoostedTree(BoostedTreeModel),
    ConvolutionalSegmenter(ConvSegmenter),
    Custom(Box<dyn PixelClassifier>),
}

impl ClassifierBackend {
    fn pixel_classifier(&self) -> Option<&dyn PixelClassifier> {
        match self {
            ClassifierBackend::TreeEnsemble(m) => Some(m),
            ClassifierBackend::BoostedTree(m) => Some(m),
            ClassifierBackend::Custom(m) => Some(m.as_ref()),
            ClassifierBackend::ConvolutionalSegmenter(_) => None,
        }
    }
}

/// Reshape (features, rows, cols) into a (pixels, features) table
pub fn to_table(features: ArrayView3<f32>) -> Array2<f32> {
    let (n, rows, cols) = features.dim();
    let mut table = Array2::<f32>::zeros((rows * cols, n));
    for (mut column, band) in table.axis_iter_mut(Axis(1)).zip(features.axis_iter(Axis(0))) {
        column.assign(&Array1::from_iter(band.iter().copied()));
    }
    table
}

/// Indices of the table rows without NaN
pub fn valid_rows(table: ArrayView2<f32>) -> Vec<usize> {
    table
        .outer_iter()
        .enumerate()
        .filter(|(_, row)| row.iter().all(|v| !v.is_nan()))
        .map(|(i, _)| i)
        .collect()
}

/// Classify the NaN-free rows of `table`; NaN rows keep label 0 and probability 0
///
/// When no row is usable the model is not called and the first such case per
/// batch is logged through `empty_logged`.
pub fn classify_table(
    model: &dyn PixelClassifier,
    table: ArrayView2<f32>,
    with_probability: bool,
    empty_logged: &AtomicBool,
) -> PipelineResult<(Array1<u8>, Option<Array1<f32>>)> {
    let pixels = table.nrows();
    let mut labels = Array1::<u8>::zeros(pixels);
    let mut probability = with_probability.then(|| Array1::<f32>::zeros(pixels));

    let valid = valid_rows(table);
    if valid.is_empty() {
        if !empty_logged.swap(true, Ordering::Relaxed) {
            log::info!("No valid pixels to classify; writing unclassified maps");
        }
        return Ok((labels, probability));
    }

    let subset = table.select(Axis(0), &valid);
    let mut predicted = model.predict(subset.view())?;
    if predicted.len() != valid.len() {
        return Err(PipelineError::Model(format!(
            "model returned {} labels for {} pixels",
            predicted.len(),
            valid.len()
        )));
    }
    if model.label_base() == LabelBase::ZeroBased {
        predicted.mapv_inplace(|l| l + 1);
    }
    for (&row, &label) in valid.iter().zip(predicted.iter()) {
        labels[row] = label;
    }

    if let Some(out) = probability.as_mut() {
        let proba = model.predict_proba(subset.view())?;
        if proba.nrows() != valid.len() {
            return Err(PipelineError::Model(format!(
                "model returned {} probability rows for {} pixels",
                proba.nrows(),
                valid.len()
            )));
        }
        let row_max = proba.map_axis(Axis(1), |p| p.fold(0.0f32, |a, &v| a.max(v)));
        for (&row, &p) in valid.iter().zip(row_max.iter()) {
            out[row] = p;
        }
    }

    Ok((labels, probability))
}

/// Reads model features from stacks and writes class / probability maps
pub struct ClassifierEngine {
    features: Vec<Feature>,
    backend: ClassifierBackend,
    tag: String,
    empty_logged: AtomicBool,
}

impl ClassifierEngine {
    pub fn new(features: Vec<Feature>, backend: ClassifierBackend, tag: &str) -> Self {
        Self {
            features,
            backend,
            tag: tag.to_string(),
            empty_logged: AtomicBool::new(false),
        }
    }

    /// Load the configured model and resolve its feature list
    pub fn from_config(config: &ClassificationConfig) -> PipelineResult<Self> {
        let (features, backend) = match config.algorithm {
            Algorithm::Rf => {
                let features = config.resolved_features()?;
                let model = TreeEnsembleModel::load(&config.model_path)?;
                check_feature_count(model.n_features, features.len())?;
                (features, ClassifierBackend::TreeEnsemble(model))
            }
            Algorithm::Xgb => {
                let features = config.resolved_features()?;
                let model = BoostedTreeModel::load(&config.model_path)?;
                check_feature_count(model.n_features, features.len())?;
                (features, ClassifierBackend::BoostedTree(model))
            }
            Algorithm::Unet => {
                let norm = match &config.norm_config_path {
                    Some(path) => NormalizationConfig::load(path)?,
                    None => NormalizationConfig::from_classification(config),
                };
                if config.patch.width != norm.tile_size || config.patch.height != norm.tile_size {
                    return Err(PipelineError::Config(format!(
                        "unet was trained on {}x{} tiles but patches are {}x{}",
                        norm.tile_size, norm.tile_size, config.patch.width, config.patch.height
                    )));
                }
                let features = Feature::parse_list(&norm.features)?;
                let model = ConvSegmenter::load(&config.model_path, norm)?;
                (features, ClassifierBackend::ConvolutionalSegmenter(model))
            }
        };
        log::info!(
            "Classifier {} ready with {} features",
            config.algorithm,
            features.len()
        );
        Ok(Self::new(features, backend, &config.algorithm.to_string()))
    }

    /// Short algorithm name used in output file names
    pub fn algorithm_tag(&self) -> &str {
        &self.tag
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    /// Start a new batch: the next empty input is logged again
    pub fn begin_batch(&self) {
        self.empty_logged.store(false, Ordering::Relaxed);
    }

    /// Model features of `stack` in model order, as (feature, row, column)
    ///
    /// Samples equal to their band's no-data value become NaN, so masked
    /// pixels stay unclassified.
    pub fn select_features(&self, stack: &StackRaster) -> PipelineResult<Array3<f32>> {
        let mut indices = Vec::with_capacity(self.features.len());
        for feature in &self.features {
            let index = feature.band_index();
            if index == 0 || index > stack.band_count() {
                return Err(PipelineError::MissingInput(format!(
                    "feature {} (band {}) not in a {}-band stack",
                    feature,
                    index,
                    stack.band_count()
                )));
            }
            indices.push(index - 1);
        }
        let mut selected = stack.data.select(Axis(0), &indices);
        for (mut band, &index) in selected.axis_iter_mut(Axis(0)).zip(&indices) {
            if let Some(no_data) = stack.bands[index].no_data {
                let no_data = no_data as f32;
                band.mapv_inplace(|v| if v == no_data { f32::NAN } else { v });
            }
        }
        Ok(selected)
    }

    /// Labels and optional probabilities for a (feature, row, column) cube
    pub fn classify_features(
        &self,
        features: ArrayView3<f32>,
        with_probability: bool,
    ) -> PipelineResult<(Array2<u8>, Option<Array2<f32>>)> {
        let (_, rows, cols) = features.dim();

        if let ClassifierBackend::ConvolutionalSegmenter(model) = &self.backend {
            let (labels, probability) = model.segment(features)?;
            return Ok((labels, with_probability.then_some(probability)));
        }

        let model = self
            .backend
            .pixel_classifier()
            .ok_or_else(|| PipelineError::Processing("backend has no pixel classifier".to_string()))?;
        let table = to_table(features);
        let (labels, probability) =
            classify_table(model, table.view(), with_probability, &self.empty_logged)?;
        let labels = labels.into_shape((rows, cols))?;
        let probability = match probability {
            Some(p) => Some(p.into_shape((rows, cols))?),
            None => None,
        };
        Ok((labels, probability))
    }

    pub fn classify(&self, stack: &StackRaster, with_probability: bool) -> PipelineResult<ClassMaps> {
        let features = self.select_features(stack)?;
        let (labels, probability) = self.classify_features(features.view(), with_probability)?;

        let mut classes = stack.with_band(labels);
        classes.bands = vec![BandInfo::named("CLASS")];
        let probability = probability.map(|p| {
            let mut raster = stack.with_band(p);
            raster.bands = vec![BandInfo::named("PROBABILITY")];
            raster
        });
        Ok(ClassMaps {
            classes,
            probability,
        })
    }

    /// File names of the class and probability maps for an input raster stem
    pub fn output_names(&self, stem: &str) -> (String, String) {
        (
            format!("{}_{}-scmap.tif", stem, self.tag),
            format!("{}_{}-probamap.tif", stem, self.tag),
        )
    }

    /// Classify the stack at `input`; maps go to `<output>/sc_maps` and `<output>/proba_maps`
    pub fn classify_file(
        &self,
        input: &Path,
        output: &Path,
        with_probability: bool,
    ) -> PipelineResult<ClassOutputs> {
        let stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| PipelineError::MissingInput(format!("invalid raster path {}", input.display())))?;
        log::info!("🗺️ Classifying {} with {}", input.display(), self.tag);

        let stack: StackRaster = read_raster(input)?;
        let maps = self.classify(&stack, with_probability)?;

        let (class_name, proba_name) = self.output_names(stem);
        let class_map = output.join("sc_maps").join(class_name);
        write_raster(&class_map, &maps.classes)?;

        let probability_map = match &maps.probability {
            Some(p) => {
                let path = output.join("proba_maps").join(proba_name);
                write_raster(&path, p)?;
                Some(path)
            }
            None => None,
        };
        Ok(ClassOutputs {
            class_map,
            probability_map,
        })
    }
}

fn check_feature_count(model: usize, configured: usize) -> PipelineResult<()> {
    if model != configured {
        return Err(PipelineError::Config(format!(
            "model expects {} features but {} are configured",
            model, configured
        )));
    }
    Ok(())
}
