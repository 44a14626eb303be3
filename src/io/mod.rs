//! Raster, model artifact and SAFE product input/output

pub mod model;
pub mod raster;
pub mod safe;

pub use model::{load_json, NormalizationConfig};
pub use raster::{
    read_bands, read_grid, read_raster, remove_raster, warp_nearest, write_raster, GridSpec,
};
pub use safe::{is_old_format, product_short_name, SafeName};
