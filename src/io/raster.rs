use crate::types::{BandInfo, GeoTransform, PipelineError, PipelineResult, Raster};
use gdal::raster::{Buffer, GdalType};
use gdal::{Dataset, DriverManager, Metadata};
use ndarray::{Array2, Array3};
use std::path::Path;

/// Size and georeference of a raster grid, without pixel data
#[derive(Debug, Clone, PartialEq)]
pub struct GridSpec {
    pub geo_transform: GeoTransform,
    pub projection: String,
    pub width: usize,
    pub height: usize,
}

impl GridSpec {
    pub fn of<T: Copy>(raster: &Raster<T>) -> Self {
        Self {
            geo_transform: raster.geo_transform,
            projection: raster.projection.clone(),
            width: raster.width(),
            height: raster.height(),
        }
    }

    /// Empty single-band raster on this grid
    pub fn filled<T: Copy>(&self, value: T) -> Raster<T> {
        Raster::from_band(
            Array2::from_elem((self.height, self.width), value),
            self.geo_transform,
            &self.projection,
        )
    }
}

/// Read every band of a raster file
pub fn read_raster<T: GdalType + Copy, P: AsRef<Path>>(path: P) -> PipelineResult<Raster<T>> {
    let dataset = open(path.as_ref())?;
    let count = dataset.raster_count() as usize;
    let indices: Vec<usize> = (1..=count).collect();
    read_dataset_bands(&dataset, &indices, path.as_ref())
}

/// Read a subset of bands (1-based indices) in the given order
pub fn read_bands<T: GdalType + Copy, P: AsRef<Path>>(
    path: P,
    indices: &[usize],
) -> PipelineResult<Raster<T>> {
    let dataset = open(path.as_ref())?;
    read_dataset_bands(&dataset, indices, path.as_ref())
}

/// Grid of a raster file
pub fn read_grid<P: AsRef<Path>>(path: P) -> PipelineResult<GridSpec> {
    let dataset = open(path.as_ref())?;
    let (width, height) = dataset.raster_size();
    Ok(GridSpec {
        geo_transform: GeoTransform::from_gdal(dataset.geo_transform()?),
        projection: dataset.projection(),
        width,
        height,
    })
}

fn open(path: &Path) -> PipelineResult<Dataset> {
    if !path.exists() {
        return Err(PipelineError::MissingInput(format!(
            "raster {} does not exist",
            path.display()
        )));
    }
    Ok(Dataset::open(path)?)
}

fn read_dataset_bands<T: GdalType + Copy>(
    dataset: &Dataset,
    indices: &[usize],
    path: &Path,
) -> PipelineResult<Raster<T>> {
    let (width, height) = dataset.raster_size();
    let count = dataset.raster_count() as usize;
    log::debug!(
        "Reading {} of {} bands ({}x{}) from {}",
        indices.len(),
        count,
        width,
        height,
        path.display()
    );

    let mut samples: Vec<T> = Vec::with_capacity(indices.len() * width * height);
    let mut bands = Vec::with_capacity(indices.len());
    for &index in indices {
        if index == 0 || index > count {
            return Err(PipelineError::MissingInput(format!(
                "band {} not present in {} ({} bands)",
                index,
                path.display(),
                count
            )));
        }
        let band = dataset.rasterband(index as isize)?;
        let buffer = band.read_as::<T>((0, 0), (width, height), (width, height), None)?;
        samples.extend(buffer.data);
        bands.push(BandInfo {
            description: band.description().unwrap_or_default(),
            no_data: band.no_data_value(),
        });
    }

    let data = Array3::from_shape_vec((indices.len(), height, width), samples)?;
    Raster::new(
        data,
        GeoTransform::from_gdal(dataset.geo_transform()?),
        dataset.projection(),
        bands,
    )
}

/// Write a raster as GeoTIFF, keeping band descriptions and no-data values
pub fn write_raster<T: GdalType + Copy, P: AsRef<Path>>(
    path: P,
    raster: &Raster<T>,
) -> PipelineResult<()> {
    let path = path.as_ref();
    log::debug!(
        "Writing {} band(s) {}x{} to {}",
        raster.band_count(),
        raster.width(),
        raster.height(),
        path.display()
    );
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let (height, width) = raster.shape();
    let mut dataset = driver.create_with_band_type::<T, _>(
        path,
        width as isize,
        height as isize,
        raster.band_count() as isize,
    )?;
    dataset.set_geo_transform(&raster.geo_transform.to_gdal())?;
    if !raster.projection.is_empty() {
        dataset.set_projection(&raster.projection)?;
    }

    for (i, info) in raster.bands.iter().enumerate() {
        let mut band = dataset.rasterband(i as isize + 1)?;
        let flat: Vec<T> = raster.band(i).iter().copied().collect();
        band.write((0, 0), (width, height), &Buffer::new((width, height), flat))?;
        if let Some(no_data) = info.no_data {
            band.set_no_data_value(Some(no_data))?;
        }
        if !info.description.is_empty() {
            band.set_description(&info.description)?;
        }
    }
    Ok(())
}

/// Remove a raster file, ignoring files that are already gone
pub fn remove_raster<P: AsRef<Path>>(path: P) -> PipelineResult<()> {
    match std::fs::remove_file(path.as_ref()) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Mosaic categorical byte rasters onto a target grid with nearest-neighbour resampling
///
/// Pixels no source covers stay 0.
pub fn warp_nearest<P: AsRef<Path>>(sources: &[P], grid: &GridSpec) -> PipelineResult<Array2<u8>> {
    log::debug!(
        "Warping {} source(s) onto {}x{} grid",
        sources.len(),
        grid.width,
        grid.height
    );
    let driver = DriverManager::get_driver_by_name("MEM")?;
    let mut target =
        driver.create_with_band_type::<u8, _>("", grid.width as isize, grid.height as isize, 1)?;
    target.set_geo_transform(&grid.geo_transform.to_gdal())?;
    if !grid.projection.is_empty() {
        target.set_projection(&grid.projection)?;
    }

    for source in sources {
        let source_ds = open(source.as_ref())?;
        let rc = unsafe {
            gdal_sys::GDALReprojectImage(
                source_ds.c_dataset(),
                std::ptr::null(),
                target.c_dataset(),
                std::ptr::null(),
                gdal_sys::GDALResampleAlg::GRA_NearestNeighbour,
                0.0,
                0.0,
                None,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if rc != gdal_sys::CPLErr::CE_None {
            return Err(PipelineError::External(format!(
                "GDALReprojectImage failed for {}",
                source.as_ref().display()
            )));
        }
    }

    let band = target.rasterband(1)?;
    let buffer = band.read_as::<u8>((0, 0), (grid.width, grid.height), (grid.width, grid.height), None)?;
    Ok(Array2::from_shape_vec((grid.height, grid.width), buffer.data)?)
}
