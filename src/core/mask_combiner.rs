use crate::config::FeatureMaskKind;
use crate::io::raster::{read_raster, write_raster};
use crate::types::{BandInfo, MaskRaster, PipelineError, PipelineResult};
use ndarray::Zip;
use std::path::Path;

/// Combines water, feature and cloud masks into the FINAL mask
///
/// | feature mask  | cloud mask | FINAL                        |
/// |---------------|------------|------------------------------|
/// | NDWI / BAND8  | on         | water ∧ ¬cloud ∧ feature     |
/// | none          | on         | water ∧ ¬cloud               |
/// | NDWI / BAND8  | off        | water ∧ feature              |
/// | none          | off        | water                        |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskCombiner {
    pub feature_mask: Option<FeatureMaskKind>,
    pub cloud_mask: bool,
}

impl MaskCombiner {
    pub fn new(feature_mask: Option<FeatureMaskKind>, cloud_mask: bool) -> Self {
        Self {
            feature_mask,
            cloud_mask,
        }
    }

    pub fn formula(&self) -> String {
        let mut terms = vec!["water".to_string()];
        if self.cloud_mask {
            terms.push("¬cloud".to_string());
        }
        if let Some(kind) = self.feature_mask {
            terms.push(kind.to_string());
        }
        terms.join(" ∧ ")
    }

    /// FINAL value of one pixel; any non-zero input counts as set
    pub fn combine_pixel(&self, water: u8, cloud: u8, feature: u8) -> u8 {
        let mut keep = water != 0;
        if self.cloud_mask {
            keep &= cloud == 0;
        }
        if self.feature_mask.is_some() {
            keep &= feature != 0;
        }
        u8::from(keep)
    }

    /// Combine in-memory masks; every enabled mask must be supplied and share the water mask's shape
    pub fn combine(
        &self,
        water: &MaskRaster,
        feature: Option<&MaskRaster>,
        cloud: Option<&MaskRaster>,
    ) -> PipelineResult<MaskRaster> {
        log::info!("Combining masks: FINAL = {}", self.formula());

        let feature = match (self.feature_mask, feature) {
            (Some(kind), None) => {
                return Err(PipelineError::MissingInput(format!("{} mask not found", kind)))
            }
            (Some(_), Some(f)) => Some(f),
            (None, _) => None,
        };
        let cloud = match (self.cloud_mask, cloud) {
            (true, None) => return Err(PipelineError::MissingInput("cloud mask not found".to_string())),
            (true, Some(c)) => Some(c),
            (false, _) => None,
        };

        if let Some(f) = feature {
            water.ensure_same_shape(f, "feature mask")?;
        }
        if let Some(c) = cloud {
            water.ensure_same_shape(c, "cloud mask")?;
        }

        if feature.is_none() && cloud.is_none() {
            let mut copy = water.clone();
            copy.bands = vec![BandInfo::named("FINAL")];
            return Ok(copy);
        }

        let mut final_band = water.band(0).mapv(|w| self.combine_pixel(w, 0, 1));
        if let Some(c) = cloud {
            Zip::from(&mut final_band)
                .and(&c.band(0))
                .for_each(|out, &cv| *out = self.combine_pixel(*out, cv, 1));
        }
        if let Some(f) = feature {
            Zip::from(&mut final_band)
                .and(&f.band(0))
                .for_each(|out, &fv| *out = u8::from(*out != 0 && fv != 0));
        }

        let reference = feature.or(cloud).unwrap_or(water);
        let mut combined = reference.with_band(final_band);
        combined.bands = vec![BandInfo::named("FINAL")];
        Ok(combined)
    }

    /// Read the mask files, combine and write the FINAL mask to `output`
    pub fn create(
        &self,
        water_path: &Path,
        feature_path: Option<&Path>,
        cloud_path: Option<&Path>,
        output: &Path,
    ) -> PipelineResult<MaskRaster> {
        let water: MaskRaster = read_raster(water_path).map_err(|e| match e {
            PipelineError::MissingInput(_) => {
                PipelineError::MissingInput(format!("water mask {} not found", water_path.display()))
            }
            other => other,
        })?;
        let feature = match (self.feature_mask, feature_path) {
            (Some(_), Some(p)) => Some(read_raster::<u8, _>(p)?),
            _ => None,
        };
        let cloud = match (self.cloud_mask, cloud_path) {
            (true, Some(p)) => Some(read_raster::<u8, _>(p)?),
            _ => None,
        };

        let combined = self.combine(&water, feature.as_ref(), cloud.as_ref())?;
        write_raster(output, &combined)?;
        Ok(combined)
    }
}
