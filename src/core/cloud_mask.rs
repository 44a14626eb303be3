use crate::config::CloudMaskParams;
use crate::core::morphology::{dilate_with_disk, disk_average};
use crate::io::raster::{read_raster, write_raster};
use crate::types::{BandInfo, MaskRaster, PipelineError, PipelineResult, Raster};
use ndarray::{Array2, Array3, ArrayView2, Axis};
use std::path::{Path, PathBuf};

/// Top-of-atmosphere bands fed to the cloud detector, in detector order
pub const CLOUD_BANDS: [&str; 10] = [
    "B01", "B02", "B04", "B05", "B08", "B8A", "B09", "B10", "B11", "B12",
];

/// Per-pixel cloud probability estimator
pub trait CloudProbabilityModel: Send + Sync {
    /// `bands` is (band, row, column) in [`CLOUD_BANDS`] order; returns probabilities in [0, 1]
    fn probability(&self, bands: &Array3<f32>) -> PipelineResult<Array2<f32>>;
}

/// Cloud mask from a probability model: average, threshold, dilate
pub struct CloudDetector {
    model: Box<dyn CloudProbabilityModel>,
    pub threshold: f32,
    pub average_over: usize,
    pub dilation_size: usize,
}

impl CloudDetector {
    pub fn new(model: Box<dyn CloudProbabilityModel>, params: &CloudMaskParams) -> Self {
        Self {
            model,
            threshold: params.threshold,
            average_over: params.average_over,
            dilation_size: params.dilation_size,
        }
    }

    /// Binary cloud mask (1 = cloud) from a probability field
    pub fn mask_from_probability(&self, probability: ArrayView2<f32>) -> Array2<u8> {
        let averaged = disk_average(probability, self.average_over);
        let thresholded = averaged.mapv(|p| u8::from(p > self.threshold));
        dilate_with_disk(thresholded.view(), self.dilation_size)
    }

    pub fn detect(&self, bands: &Array3<f32>) -> PipelineResult<Array2<u8>> {
        if bands.len_of(Axis(0)) != CLOUD_BANDS.len() {
            return Err(PipelineError::MissingInput(format!(
                "cloud detector needs {} bands, got {}",
                CLOUD_BANDS.len(),
                bands.len_of(Axis(0))
            )));
        }
        let probability = self.model.probability(bands)?;
        Ok(self.mask_from_probability(probability.view()))
    }

    /// `Top_Atmosphere_Bands/rhot_Bxx.tif` paths of a corrected product, in detector order
    pub fn toa_band_paths(ac_product: &Path) -> Vec<PathBuf> {
        CLOUD_BANDS
            .iter()
            .map(|b| {
                ac_product
                    .join("Top_Atmosphere_Bands")
                    .join(format!("rhot_{}.tif", b))
            })
            .collect()
    }

    /// Read the TOA bands, run the detector and write the mask to `output`
    pub fn create(&self, ac_product: &Path, output: &Path) -> PipelineResult<MaskRaster> {
        log::info!(
            "☁️ Creating cloud mask (threshold {}, average {}, dilation {})",
            self.threshold,
            self.average_over,
            self.dilation_size
        );
        let paths = Self::toa_band_paths(ac_product);

        let mut reference: Option<Raster<f32>> = None;
        let mut samples: Vec<f32> = Vec::new();
        for path in &paths {
            let band: Raster<f32> = read_raster(path)?;
            if let Some(r) = &reference {
                r.ensure_same_shape(&band, "cloud detector bands")?;
            }
            samples.extend(band.band(0).iter().copied());
            if reference.is_none() {
                reference = Some(band);
            }
        }
        let reference = reference.ok_or_else(|| {
            PipelineError::MissingInput("no top-of-atmosphere bands".to_string())
        })?;

        let (rows, cols) = reference.shape();
        let bands = Array3::from_shape_vec((paths.len(), rows, cols), samples)?;
        let clouds = self.detect(&bands)?;
        log::debug!(
            "Cloud mask: {} of {} pixels cloudy",
            clouds.iter().filter(|v| **v == 1).count(),
            clouds.len()
        );

        let mut mask = reference.with_band(clouds);
        mask.bands = vec![BandInfo::named("CLOUD")];
        write_raster(output, &mask)?;
        Ok(mask)
    }
}
