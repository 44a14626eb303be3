//! Overlapping patch splitting and duplication-free mosaicking
//!
//! Patches are cut on a regular grid of start offsets per axis. Merging fuses
//! neighbours pairwise, rows first and then the row mosaics top to bottom,
//! keeping the first half of each overlap from the earlier patch and the
//! second half from the later one.

use crate::config::PatchParams;
use crate::io::raster::{read_raster, write_raster};
use crate::types::{PipelineError, PipelineResult, Raster};
use gdal::raster::GdalType;
use ndarray::{concatenate, s, Axis};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Step between neighbouring patch origins, `round(patch * (1 - overlap))`
///
/// Neighbours must share at least one pixel strip for the merge to cut.
pub fn patch_stride(patch: usize, overlap: f64) -> PipelineResult<usize> {
    if !(0.0..1.0).contains(&overlap) {
        return Err(PipelineError::Config(format!("overlap {} outside [0, 1)", overlap)));
    }
    let stride = (patch as f64 * (1.0 - overlap)).round() as usize;
    if stride == 0 {
        return Err(PipelineError::Config(format!(
            "overlap {} leaves no stride for patch size {}",
            overlap, patch
        )));
    }
    if stride >= patch {
        return Err(PipelineError::Config(format!(
            "overlap {} gives no shared pixels between {} pixel patches",
            overlap, patch
        )));
    }
    Ok(stride)
}

/// Start offsets along one axis
///
/// The last patch is pulled back to end exactly at the image edge.
pub fn start_points(size: usize, patch: usize, overlap: f64) -> PipelineResult<Vec<usize>> {
    if patch == 0 || patch > size {
        return Err(PipelineError::Config(format!(
            "patch size {} does not fit an image dimension of {}",
            patch, size
        )));
    }
    if !(0.0..1.0).contains(&overlap) {
        return Err(PipelineError::Config(format!("overlap {} outside [0, 1)", overlap)));
    }

    let mut points = vec![0];
    if patch == size {
        return Ok(points);
    }
    let stride = patch_stride(patch, overlap)?;

    let mut counter = 1;
    loop {
        let pt = stride * counter;
        if pt + patch >= size {
            points.push(size - patch);
            break;
        }
        points.push(pt);
        counter += 1;
    }
    Ok(points)
}

/// One patch of a split raster
#[derive(Debug, Clone)]
pub struct Patch<T> {
    pub row: usize,
    pub col: usize,
    /// Pixel offset of the upper-left corner in the parent raster
    pub x: usize,
    pub y: usize,
    pub raster: Raster<T>,
}

/// `<w>x<h>_patch_<row>-<col>.tif`
pub fn patch_file_name(width: usize, height: usize, row: usize, col: usize) -> String {
    format!("{}x{}_patch_{}-{}.tif", width, height, row, col)
}

/// Grid position (row, col) encoded in a patch-derived file name
pub fn parse_patch_position(file_name: &str) -> Option<(usize, usize)> {
    let pattern = Regex::new(r"^\d+x\d+_patch_(\d+)-(\d+)").ok()?;
    let caps = pattern.captures(file_name)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

/// Splits rasters into overlapping patches
#[derive(Debug, Clone)]
pub struct PatchSplitter {
    pub params: PatchParams,
}

impl PatchSplitter {
    pub fn new(params: PatchParams) -> Self {
        Self { params }
    }

    pub fn split<T: Copy>(&self, raster: &Raster<T>) -> PipelineResult<Vec<Patch<T>>> {
        let (height, width) = raster.shape();
        let (pw, ph) = (self.params.width, self.params.height);
        let xs = start_points(width, pw, self.params.overlap)?;
        let ys = start_points(height, ph, self.params.overlap)?;
        log::debug!(
            "Splitting {}x{} raster into {}x{} patches ({} rows x {} columns)",
            width,
            height,
            pw,
            ph,
            ys.len(),
            xs.len()
        );

        let mut patches = Vec::with_capacity(xs.len() * ys.len());
        for (row, &y) in ys.iter().enumerate() {
            for (col, &x) in xs.iter().enumerate() {
                let window = raster.data.slice(s![.., y..y + ph, x..x + pw]).to_owned();
                let mut patch = raster.with_data(window);
                patch.geo_transform = raster.geo_transform.offset(x, y);
                patches.push(Patch {
                    row,
                    col,
                    x,
                    y,
                    raster: patch,
                });
            }
        }
        Ok(patches)
    }

    /// Split the raster at `input` and write one GeoTIFF per patch into `folder`
    pub fn split_to_folder<T: GdalType + Copy>(
        &self,
        input: &Path,
        folder: &Path,
    ) -> PipelineResult<Vec<PathBuf>> {
        log::info!(
            "🧩 Splitting {} into {}x{} patches ({:.0}% overlap)",
            input.display(),
            self.params.width,
            self.params.height,
            self.params.overlap * 100.0
        );
        let raster: Raster<T> = read_raster(input)?;
        std::fs::create_dir_all(folder)?;
        let mut paths = Vec::new();
        for patch in self.split(&raster)? {
            let path = folder.join(patch_file_name(
                self.params.width,
                self.params.height,
                patch.row,
                patch.col,
            ));
            write_raster(&path, &patch.raster)?;
            paths.push(path);
        }
        Ok(paths)
    }
}

/// Reassembles patches into one raster
#[derive(Debug, Clone, Default)]
pub struct PatchMerger;

impl PatchMerger {
    pub fn new() -> Self {
        Self
    }

    /// Fuse two horizontally adjacent rasters, cutting their overlap at its midpoint
    pub fn fuse_horizontal<T: Copy>(&self, left: &Raster<T>, right: &Raster<T>) -> PipelineResult<Raster<T>> {
        if left.height() != right.height() {
            return Err(PipelineError::ShapeMismatch {
                context: "horizontal patch fusion".to_string(),
                expected: left.shape(),
                found: right.shape(),
            });
        }
        let (lb, rb) = (left.bounds(), right.bounds());
        let pixel = left.geo_transform.pixel_width.abs();
        let overlap = ((lb.right.min(rb.right) - lb.left.max(rb.left)) / pixel).round();
        if overlap <= 0.0 {
            return Err(PipelineError::NoOverlap(format!(
                "left ends at {}, right starts at {}",
                lb.right, rb.left
            )));
        }
        let overlap = overlap as usize;
        if overlap > left.width().min(right.width()) {
            return Err(PipelineError::Processing(format!(
                "overlap of {} pixels exceeds a patch width",
                overlap
            )));
        }

        let left_half = overlap / 2;
        let left_keep = left.width() - overlap + left_half;
        let data = concatenate(
            Axis(2),
            &[
                left.data.slice(s![.., .., ..left_keep]),
                right.data.slice(s![.., .., left_half..]),
            ],
        )?;

        let width = ((rb.right - lb.left) / pixel).round() as usize;
        if width != data.len_of(Axis(2)) {
            return Err(PipelineError::Processing(format!(
                "fused width {} disagrees with bounds width {}",
                data.len_of(Axis(2)),
                width
            )));
        }
        let mut fused = left.with_data(data);
        fused.geo_transform.top_left_x = lb.left;
        Ok(fused)
    }

    /// Fuse two vertically adjacent rasters, cutting their overlap at its midpoint
    pub fn fuse_vertical<T: Copy>(&self, top: &Raster<T>, bottom: &Raster<T>) -> PipelineResult<Raster<T>> {
        if top.width() != bottom.width() {
            return Err(PipelineError::ShapeMismatch {
                context: "vertical patch fusion".to_string(),
                expected: top.shape(),
                found: bottom.shape(),
            });
        }
        let (tb, bb) = (top.bounds(), bottom.bounds());
        let pixel = top.geo_transform.pixel_height.abs();
        let overlap = ((tb.top.min(bb.top) - tb.bottom.max(bb.bottom)) / pixel).round();
        if overlap <= 0.0 {
            return Err(PipelineError::NoOverlap(format!(
                "top ends at {}, bottom starts at {}",
                tb.bottom, bb.top
            )));
        }
        let overlap = overlap as usize;
        if overlap > top.height().min(bottom.height()) {
            return Err(PipelineError::Processing(format!(
                "overlap of {} pixels exceeds a patch height",
                overlap
            )));
        }

        let top_half = overlap / 2;
        let top_keep = top.height() - overlap + top_half;
        let data = concatenate(
            Axis(1),
            &[
                top.data.slice(s![.., ..top_keep, ..]),
                bottom.data.slice(s![.., top_half.., ..]),
            ],
        )?;

        let height = ((tb.top - bb.bottom) / pixel).round() as usize;
        if height != data.len_of(Axis(1)) {
            return Err(PipelineError::Processing(format!(
                "fused height {} disagrees with bounds height {}",
                data.len_of(Axis(1)),
                height
            )));
        }
        let mut fused = top.with_data(data);
        fused.geo_transform.top_left_y = tb.top;
        Ok(fused)
    }

    /// Merge a grid of rasters given as rows of left-to-right columns
    pub fn merge_grid<T: Copy>(&self, rows: Vec<Vec<Raster<T>>>) -> PipelineResult<Raster<T>> {
        let mut row_mosaics = Vec::with_capacity(rows.len());
        for row in rows {
            let mut iter = row.into_iter();
            let mut mosaic = iter
                .next()
                .ok_or_else(|| PipelineError::MissingInput("empty patch row".to_string()))?;
            for right in iter {
                mosaic = self.fuse_horizontal(&mosaic, &right)?;
            }
            row_mosaics.push(mosaic);
        }

        let mut iter = row_mosaics.into_iter();
        let mut mosaic = iter
            .next()
            .ok_or_else(|| PipelineError::MissingInput("no patches to merge".to_string()))?;
        for bottom in iter {
            mosaic = self.fuse_vertical(&mosaic, &bottom)?;
        }
        Ok(mosaic)
    }

    /// Merge patches by their (row, col) tags
    pub fn merge<T: Copy>(&self, patches: Vec<Patch<T>>) -> PipelineResult<Raster<T>> {
        let mut grid: BTreeMap<usize, BTreeMap<usize, Raster<T>>> = BTreeMap::new();
        for patch in patches {
            grid.entry(patch.row).or_default().insert(patch.col, patch.raster);
        }
        let rows = grid
            .into_values()
            .map(|cols| cols.into_values().collect())
            .collect();
        self.merge_grid(rows)
    }

    /// Merge every patch file in `folder` whose name ends with `suffix`, writing the mosaic to `output`
    pub fn merge_folder<T: GdalType + Copy>(
        &self,
        folder: &Path,
        suffix: &str,
        output: &Path,
    ) -> PipelineResult<Raster<T>> {
        let mut grid: BTreeMap<usize, BTreeMap<usize, PathBuf>> = BTreeMap::new();
        for entry in std::fs::read_dir(folder)? {
            let path = entry?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if !name.ends_with(suffix) {
                continue;
            }
            if let Some((row, col)) = parse_patch_position(name) {
                grid.entry(row).or_default().insert(col, path.clone());
            }
        }
        if grid.is_empty() {
            return Err(PipelineError::MissingInput(format!(
                "no *{} patches in {}",
                suffix,
                folder.display()
            )));
        }
        log::info!(
            "🧩 Mosaicking {} patch row(s) from {}",
            grid.len(),
            folder.display()
        );

        let mut rows = Vec::with_capacity(grid.len());
        for cols in grid.into_values() {
            let row: PipelineResult<Vec<Raster<T>>> = cols.values().map(|p| read_raster::<T, _>(p)).collect();
            rows.push(row?);
        }
        let mosaic = self.merge_grid(rows)?;
        write_raster(output, &mosaic)?;
        Ok(mosaic)
    }
}
