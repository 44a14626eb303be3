use crate::core::morphology::minimum_filter;
use crate::io::raster::{warp_nearest, write_raster, GridSpec};
use crate::types::{BandInfo, MaskRaster, PipelineResult, Raster};
use ndarray::{Array2, ArrayView2};
use std::path::{Path, PathBuf};

/// Land-cover class code for permanent water bodies
pub const WATER_CODE: u8 = 80;

/// Land-cover code for pixels without data (open ocean outside the tiles)
pub const NO_DATA_CODE: u8 = 0;

/// Builds the water mask from land-cover reference tiles
#[derive(Debug, Clone, Default)]
pub struct WaterMaskBuilder {
    /// Pixels by which the water region is pushed away from land
    pub land_buffer: usize,
}

impl WaterMaskBuilder {
    pub fn new(land_buffer: usize) -> Self {
        Self { land_buffer }
    }

    /// Water and no-data become 1, every other class 0
    pub fn reclassify(landcover: ArrayView2<u8>) -> Array2<u8> {
        landcover.mapv(|code| u8::from(code == WATER_CODE || code == NO_DATA_CODE))
    }

    /// Erode the water region by the configured buffer
    pub fn apply_buffer(&self, water: ArrayView2<u8>) -> Array2<u8> {
        if self.land_buffer == 0 {
            return water.to_owned();
        }
        log::debug!("Applying {} pixel land buffer", self.land_buffer);
        minimum_filter(water, self.land_buffer, 1)
    }

    /// Water mask on `grid` from an already resampled land-cover array
    pub fn from_landcover(&self, landcover: ArrayView2<u8>, grid: &GridSpec) -> MaskRaster {
        let water = Self::reclassify(landcover);
        self.named(Raster::from_band(
            self.apply_buffer(water.view()),
            grid.geo_transform,
            &grid.projection,
        ))
    }

    /// Water mask on `grid` from land-cover tiles; no tiles means open ocean (all water)
    pub fn build<P: AsRef<Path>>(&self, tiles: &[P], grid: &GridSpec) -> PipelineResult<MaskRaster> {
        if tiles.is_empty() {
            log::info!("No land-cover tile for this footprint, using an all-water mask");
            return Ok(self.named(grid.filled(1u8)));
        }
        log::info!("🌊 Creating water mask from {} land-cover tile(s)", tiles.len());
        let landcover = warp_nearest(tiles, grid)?;
        Ok(self.from_landcover(landcover.view(), grid))
    }

    /// Build and write `<name>_WATER_Mask.tif`
    pub fn create<P: AsRef<Path>>(
        &self,
        tiles: &[P],
        grid: &GridSpec,
        output: &Path,
    ) -> PipelineResult<MaskRaster> {
        let mask = self.build(tiles, grid)?;
        write_raster(output, &mask)?;
        let water = mask.data.iter().filter(|v| **v == 1).count();
        log::debug!("Water mask: {} of {} pixels eligible", water, mask.data.len());
        Ok(mask)
    }

    fn named(&self, mut mask: MaskRaster) -> MaskRaster {
        mask.bands = vec![BandInfo::named("WATER")];
        mask
    }
}

/// Land-cover tiles (`ESA*.tif`) available in a folder, sorted by name
pub fn find_landcover_tiles(folder: &Path) -> PipelineResult<Vec<PathBuf>> {
    if !folder.is_dir() {
        return Ok(Vec::new());
    }
    let mut tiles: Vec<PathBuf> = std::fs::read_dir(folder)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            name.starts_with("ESA") && name.ends_with(".tif")
        })
        .collect();
    tiles.sort();
    Ok(tiles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use ndarray::array;

    fn grid(width: usize, height: usize) -> GridSpec {
        GridSpec {
            geo_transform: GeoTransform::north_up(0.0, 0.0, 10.0),
            projection: String::new(),
            width,
            height,
        }
    }

    #[test]
    fn test_reclassify_codes() {
        let lc = array![[80u8, 0, 10], [50, 80, 95]];
        assert_eq!(WaterMaskBuilder::reclassify(lc.view()), array![[1u8, 1, 0], [0, 1, 0]]);
    }

    #[test]
    fn test_empty_tile_list_is_all_water() {
        let tiles: Vec<PathBuf> = Vec::new();
        let mask = WaterMaskBuilder::new(3).build(&tiles, &grid(7, 5)).unwrap();
        assert_eq!(mask.shape(), (5, 7));
        assert!(mask.data.iter().all(|v| *v == 1));
    }

    #[test]
    fn test_buffer_pushes_water_from_land() {
        let lc = array![[80u8, 80, 80, 10], [80, 80, 80, 80], [80, 80, 80, 80]];
        let mask = WaterMaskBuilder::new(1).from_landcover(lc.view(), &grid(4, 3));
        assert_eq!(
            mask.band(0),
            array![[1u8, 1, 0, 0], [1, 1, 0, 0], [1, 1, 1, 1]]
        );
    }

    #[test]
    fn test_missing_tile_folder_is_empty() {
        let tiles = find_landcover_tiles(Path::new("/nonexistent/worldcover")).unwrap();
        assert!(tiles.is_empty());
    }
}
