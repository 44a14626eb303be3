use ndarray::{Array2, Array3, ArrayView2, ArrayViewMut2, Axis};
use serde::{Deserialize, Serialize};

/// Surface reflectance / feature value stored in a stack
pub type Reflectance = f32;

/// Multi-band stack of spectral bands and indices (band x row x column)
pub type StackRaster = Raster<Reflectance>;

/// Binary mask (1 = keep/classify, 0 = exclude)
pub type MaskRaster = Raster<u8>;

/// Class-index map (1-based labels, 0 = unclassified)
pub type ClassRaster = Raster<u8>;

/// Maximum class probability map
pub type ProbabilityRaster = Raster<f32>;

/// Affine geotransform in GDAL order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with square pixels
    pub fn north_up(top_left_x: f64, top_left_y: f64, resolution: f64) -> Self {
        Self {
            top_left_x,
            pixel_width: resolution,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -resolution,
        }
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Transform of a sub-window whose upper-left pixel is (col, row) in this grid
    pub fn offset(&self, col: usize, row: usize) -> Self {
        let (x, y) = (col as f64, row as f64);
        Self {
            top_left_x: self.top_left_x + x * self.pixel_width + y * self.rotation_x,
            top_left_y: self.top_left_y + x * self.rotation_y + y * self.pixel_height,
            ..*self
        }
    }

    /// World-coordinate bounds of a grid of the given size
    pub fn bounds(&self, width: usize, height: usize) -> Bounds {
        let x_end = self.top_left_x + width as f64 * self.pixel_width;
        let y_end = self.top_left_y + height as f64 * self.pixel_height;
        Bounds {
            left: self.top_left_x.min(x_end),
            right: self.top_left_x.max(x_end),
            bottom: self.top_left_y.min(y_end),
            top: self.top_left_y.max(y_end),
        }
    }
}

/// Axis-aligned bounding box in the raster's spatial reference
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
    pub top: f64,
}

/// Per-band metadata carried alongside the samples
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BandInfo {
    pub description: String,
    pub no_data: Option<f64>,
}

impl BandInfo {
    pub fn named(description: &str) -> Self {
        Self {
            description: description.to_string(),
            no_data: None,
        }
    }
}

/// Geo-referenced raster with one or more co-registered bands
#[derive(Debug, Clone, PartialEq)]
pub struct Raster<T> {
    /// Samples laid out as (band, row, column)
    pub data: Array3<T>,
    pub geo_transform: GeoTransform,
    /// Spatial reference as WKT (empty when unknown)
    pub projection: String,
    pub bands: Vec<BandInfo>,
}

impl<T: Copy> Raster<T> {
    pub fn new(
        data: Array3<T>,
        geo_transform: GeoTransform,
        projection: String,
        bands: Vec<BandInfo>,
    ) -> PipelineResult<Self> {
        if bands.len() != data.len_of(Axis(0)) {
            return Err(PipelineError::Processing(format!(
                "{} band descriptors supplied for {} bands",
                bands.len(),
                data.len_of(Axis(0))
            )));
        }
        Ok(Self {
            data,
            geo_transform,
            projection,
            bands,
        })
    }

    /// Wrap a single 2D array as a one-band raster
    pub fn from_band(band: Array2<T>, geo_transform: GeoTransform, projection: &str) -> Self {
        Self {
            data: band.insert_axis(Axis(0)),
            geo_transform,
            projection: projection.to_string(),
            bands: vec![BandInfo::default()],
        }
    }

    /// New raster on this raster's grid with different samples
    pub fn with_data<U: Copy>(&self, data: Array3<U>) -> Raster<U> {
        let bands = if data.len_of(Axis(0)) == self.bands.len() {
            self.bands.clone()
        } else {
            vec![BandInfo::default(); data.len_of(Axis(0))]
        };
        Raster {
            data,
            geo_transform: self.geo_transform,
            projection: self.projection.clone(),
            bands,
        }
    }

    /// New single-band raster on this raster's grid
    pub fn with_band<U: Copy>(&self, band: Array2<U>) -> Raster<U> {
        Raster::from_band(band, self.geo_transform, &self.projection)
    }

    pub fn band_count(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn height(&self) -> usize {
        self.data.len_of(Axis(1))
    }

    pub fn width(&self) -> usize {
        self.data.len_of(Axis(2))
    }

    /// (rows, columns)
    pub fn shape(&self) -> (usize, usize) {
        (self.height(), self.width())
    }

    pub fn band(&self, index: usize) -> ArrayView2<'_, T> {
        self.data.index_axis(Axis(0), index)
    }

    pub fn band_mut(&mut self, index: usize) -> ArrayViewMut2<'_, T> {
        self.data.index_axis_mut(Axis(0), index)
    }

    pub fn bounds(&self) -> Bounds {
        self.geo_transform.bounds(self.width(), self.height())
    }

    /// Fail with a precondition error unless both rasters have the same rows/columns
    pub fn ensure_same_shape<U: Copy>(&self, other: &Raster<U>, context: &str) -> PipelineResult<()> {
        if self.shape() != other.shape() {
            return Err(PipelineError::ShapeMismatch {
                context: context.to_string(),
                expected: self.shape(),
                found: other.shape(),
            });
        }
        Ok(())
    }
}

/// Coarse error classification used by the product loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Shape mismatch, non-overlapping tiles
    Precondition,
    /// A required file or band is absent
    MissingInput,
    /// Failure reported by GDAL or another external collaborator
    External,
    /// Invalid or unknown configuration
    Configuration,
    Internal,
}

/// Error types for masking and classification
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML parsing error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Shape mismatch in {context}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        context: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("The tiles do not overlap: {0}")]
    NoOverlap(String),

    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Unknown feature: {0}")]
    UnknownFeature(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("External tool error: {0}")]
    External(String),

    #[error("Processing error: {0}")]
    Processing(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::ShapeMismatch { .. } | PipelineError::NoOverlap(_) => {
                ErrorKind::Precondition
            }
            PipelineError::MissingInput(_) => ErrorKind::MissingInput,
            PipelineError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ErrorKind::MissingInput
            }
            PipelineError::Io(_)
            | PipelineError::Gdal(_)
            | PipelineError::Xml(_)
            | PipelineError::External(_) => ErrorKind::External,
            PipelineError::UnknownFeature(_)
            | PipelineError::Config(_)
            | PipelineError::Model(_)
            | PipelineError::Json(_) => ErrorKind::Configuration,
            PipelineError::Shape(_) | PipelineError::Processing(_) => ErrorKind::Internal,
        }
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;
