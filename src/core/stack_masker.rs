use crate::io::raster::{read_raster, write_raster};
use crate::types::{
    BandInfo, MaskRaster, PipelineError, PipelineResult, Raster, Reflectance, StackRaster,
};
use gdal::raster::GdalType;
use ndarray::{Axis, Zip};
use std::path::Path;

/// Mask value marking a pixel as excluded
pub const EXCLUDED: u8 = 0;

/// Applies the FINAL mask (and the NaN-validity mask) to stacks and results
#[derive(Debug, Clone, Default)]
pub struct StackMasker;

impl StackMasker {
    pub fn new() -> Self {
        Self
    }

    /// Overwrite every excluded pixel of every band with that band's no-data value
    ///
    /// Bands without a declared no-data value get NaN.
    pub fn mask_stack(&self, stack: &mut StackRaster, final_mask: &MaskRaster) -> PipelineResult<()> {
        stack.ensure_same_shape(final_mask, "stack masking")?;
        let mask = final_mask.band(0);
        let fills: Vec<Reflectance> = stack
            .bands
            .iter()
            .map(|b| b.no_data.map(|v| v as Reflectance).unwrap_or(Reflectance::NAN))
            .collect();

        for (mut band, fill) in stack.data.axis_iter_mut(Axis(0)).zip(fills) {
            Zip::from(&mut band).and(&mask).for_each(|value, &m| {
                if m == EXCLUDED {
                    *value = fill;
                }
            });
        }
        Ok(())
    }

    /// Single-band mask, 1 where the first band of the stack is NaN
    pub fn nan_mask(&self, stack: &StackRaster) -> MaskRaster {
        let mut mask = stack.with_band(stack.band(0).mapv(|v| u8::from(v.is_nan())));
        mask.bands = vec![BandInfo::named("NAN")];
        mask
    }

    /// Mask a downstream result: NaN-mask pixels get `invalid_fill`, then excluded pixels get `excluded_fill`
    pub fn mask_late<T: Copy>(
        &self,
        result: &mut Raster<T>,
        nan_mask: &MaskRaster,
        final_mask: &MaskRaster,
        invalid_fill: T,
        excluded_fill: T,
    ) -> PipelineResult<()> {
        result.ensure_same_shape(nan_mask, "late masking (NaN mask)")?;
        result.ensure_same_shape(final_mask, "late masking (FINAL mask)")?;
        let invalid = nan_mask.band(0);
        let keep = final_mask.band(0);
        for mut band in result.data.axis_iter_mut(Axis(0)) {
            Zip::from(&mut band).and(&invalid).and(&keep).for_each(|value, &n, &k| {
                if n == 1 {
                    *value = invalid_fill;
                }
                if k == EXCLUDED {
                    *value = excluded_fill;
                }
            });
        }
        Ok(())
    }

    /// Mask the stack at `stack_path` and write the masked stack to `output`
    pub fn create(
        &self,
        stack_path: &Path,
        final_mask_path: &Path,
        output: &Path,
    ) -> PipelineResult<StackRaster> {
        log::info!("🎭 Masking stack {}", stack_path.display());
        let mask: MaskRaster = read_raster(final_mask_path)?;
        let mut stack: StackRaster = read_raster(stack_path)?;
        self.mask_stack(&mut stack, &mask)?;
        write_raster(output, &stack)?;
        Ok(stack)
    }

    /// Late-mask the result raster at `result_path` and write it to `output`
    pub fn create_late<T: GdalType + Copy>(
        &self,
        result_path: &Path,
        nan_mask_path: &Path,
        final_mask_path: &Path,
        output: &Path,
        invalid_fill: T,
        excluded_fill: T,
    ) -> PipelineResult<Raster<T>> {
        if !final_mask_path.exists() {
            return Err(PipelineError::MissingInput(format!(
                "FINAL mask {} not found",
                final_mask_path.display()
            )));
        }
        let nan_mask: MaskRaster = read_raster(nan_mask_path)?;
        let final_mask: MaskRaster = read_raster(final_mask_path)?;
        let mut result: Raster<T> = read_raster(result_path)?;
        self.mask_late(&mut result, &nan_mask, &final_mask, invalid_fill, excluded_fill)?;
        write_raster(output, &result)?;
        Ok(result)
    }
}
