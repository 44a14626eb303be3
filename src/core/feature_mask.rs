use crate::config::{Feature, FeatureMaskKind, MaskingConfig, ThresholdParams};
use crate::core::morphology::binary_dilation;
use crate::io::raster::{read_bands, remove_raster, write_raster};
use crate::types::{BandInfo, MaskRaster, PipelineError, PipelineResult, Raster, StackRaster};
use ndarray::{Array2, ArrayView2, Zip};
use std::path::{Path, PathBuf};

/// Thresholded and dilated NDWI or Band 8 mask
#[derive(Debug, Clone)]
pub struct FeatureMaskBuilder {
    pub kind: FeatureMaskKind,
    pub params: ThresholdParams,
    /// Leave the unthresholded / undilated rasters on disk
    pub keep_intermediate: bool,
}

impl FeatureMaskBuilder {
    pub fn new(kind: FeatureMaskKind, params: ThresholdParams) -> Self {
        Self {
            kind,
            params,
            keep_intermediate: false,
        }
    }

    pub fn from_config(kind: FeatureMaskKind, config: &MaskingConfig) -> Self {
        let params = match kind {
            FeatureMaskKind::Ndwi => config.ndwi,
            FeatureMaskKind::Band8 => config.band8,
        };
        Self {
            kind,
            params,
            keep_intermediate: config.keep_intermediate,
        }
    }

    /// Stack features the mask is computed from
    pub fn source_features(&self) -> &'static [Feature] {
        match self.kind {
            FeatureMaskKind::Ndwi => &[Feature::B03, Feature::B08],
            FeatureMaskKind::Band8 => &[Feature::B08],
        }
    }

    /// Normalised difference water index (B03 - B08) / (B03 + B08)
    pub fn ndwi(green: ArrayView2<f32>, nir: ArrayView2<f32>) -> Array2<f32> {
        Zip::from(&green).and(&nir).map_collect(|g, n| (g - n) / (g + n))
    }

    /// NDWI keeps values strictly below the threshold, Band 8 strictly above
    pub fn threshold(&self, values: ArrayView2<f32>) -> Array2<u8> {
        let t = self.params.threshold;
        match self.kind {
            FeatureMaskKind::Ndwi => values.mapv(|v| u8::from(v < t)),
            FeatureMaskKind::Band8 => values.mapv(|v| u8::from(v > t)),
        }
    }

    /// Unthresholded quantity from the source bands, in `source_features` order
    fn quantity(&self, bands: &StackRaster) -> PipelineResult<Array2<f32>> {
        let expected = self.source_features().len();
        if bands.band_count() < expected {
            return Err(PipelineError::MissingInput(format!(
                "{} mask needs {} band(s), got {}",
                self.kind,
                expected,
                bands.band_count()
            )));
        }
        Ok(match self.kind {
            FeatureMaskKind::Ndwi => Self::ndwi(bands.band(0), bands.band(1)),
            FeatureMaskKind::Band8 => bands.band(0).to_owned(),
        })
    }

    /// Threshold then dilate an in-memory stack holding the source bands in order
    pub fn build(&self, bands: &StackRaster) -> PipelineResult<MaskRaster> {
        let values = self.quantity(bands)?;
        let thresholded = self.threshold(values.view());
        let dilated = binary_dilation(thresholded.view(), self.params.dilation);
        let mut mask = bands.with_band(dilated);
        mask.bands = vec![BandInfo::named(&self.kind.to_string())];
        Ok(mask)
    }

    /// Select the source bands from a full stack by registry index
    pub fn source_bands(&self, stack: &StackRaster) -> PipelineResult<StackRaster> {
        let mut picked = Vec::new();
        for feature in self.source_features() {
            let index = feature.band_index();
            if index > stack.band_count() {
                return Err(PipelineError::MissingInput(format!(
                    "stack has no band {} ({})",
                    index, feature
                )));
            }
            picked.push(stack.band(index - 1));
        }
        let data = ndarray::stack(ndarray::Axis(0), &picked)?;
        Ok(stack.with_data(data))
    }

    /// File name of the dilated mask
    pub fn output_name(&self, product: &str) -> String {
        match self.kind {
            FeatureMaskKind::Ndwi => format!("{}_NDWI_Thr_Dil_Mask.tif", product),
            FeatureMaskKind::Band8 => format!("{}_Band8_Thr_Dil_Mask.tif", product),
        }
    }

    /// Read the source bands from `stack_path`, write the dilated mask into `masks_folder`
    ///
    /// Intermediate rasters are removed after the dilated mask is written unless
    /// `keep_intermediate` is set.
    pub fn create(
        &self,
        stack_path: &Path,
        masks_folder: &Path,
        product: &str,
    ) -> PipelineResult<MaskRaster> {
        log::info!(
            "🎭 Creating {} mask (threshold {}, {} dilation(s))",
            self.kind,
            self.params.threshold,
            self.params.dilation
        );
        let indices: Vec<usize> = self.source_features().iter().map(|f| f.band_index()).collect();
        let bands: StackRaster = read_bands(stack_path, &indices)?;

        let mut intermediates: Vec<PathBuf> = Vec::new();
        let values = self.quantity(&bands)?;
        if self.kind == FeatureMaskKind::Ndwi {
            let path = masks_folder.join(format!("{}_NDWI.tif", product));
            write_raster(&path, &bands.with_band(values.clone()))?;
            intermediates.push(path);
        }

        let thresholded = self.threshold(values.view());
        let thr_name = match self.kind {
            FeatureMaskKind::Ndwi => format!("{}_NDWI_Thr.tif", product),
            FeatureMaskKind::Band8 => format!("{}_Band8_Thr.tif", product),
        };
        let thr_path = masks_folder.join(thr_name);
        write_raster(&thr_path, &bands.with_band(thresholded.clone()))?;
        intermediates.push(thr_path);

        let dilated = binary_dilation(thresholded.view(), self.params.dilation);
        let mut mask: MaskRaster = Raster::from_band(dilated, bands.geo_transform, &bands.projection);
        mask.bands = vec![BandInfo::named(&self.kind.to_string())];
        write_raster(masks_folder.join(self.output_name(product)), &mask)?;

        if !self.keep_intermediate {
            for path in &intermediates {
                remove_raster(path)?;
            }
        }
        Ok(mask)
    }
}
