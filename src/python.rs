//! Python bindings

use crate::config::{FeatureMaskKind, PatchParams, PipelineConfig};
use crate::core::mask_combiner::MaskCombiner;
use crate::core::patches::{PatchMerger, PatchSplitter};
use crate::pipeline::{Pipeline, RunSummary};
use crate::types::{GeoTransform, PipelineError, Raster};
use numpy::{IntoPyArray, PyArray2, PyArray3, PyReadonlyArray2, PyReadonlyArray3};
use pyo3::prelude::*;

fn to_py_err(e: PipelineError) -> PyErr {
    PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", e))
}

fn mask_raster(values: PyReadonlyArray2<u8>) -> Raster<u8> {
    Raster::from_band(
        values.as_array().to_owned(),
        GeoTransform::north_up(0.0, 0.0, 1.0),
        "",
    )
}

/// Python module definition
#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(combine_masks, m)?)?;
    m.add_function(wrap_pyfunction!(split_merge_roundtrip, m)?)?;
    m.add_function(wrap_pyfunction!(run_pipeline, m)?)?;
    m.add_class::<PyRunSummary>()?;
    Ok(())
}

/// FINAL mask from water, optional feature and optional cloud masks
#[pyfunction]
#[pyo3(signature = (water, feature=None, cloud=None, feature_kind=None))]
fn combine_masks<'py>(
    py: Python<'py>,
    water: PyReadonlyArray2<u8>,
    feature: Option<PyReadonlyArray2<u8>>,
    cloud: Option<PyReadonlyArray2<u8>>,
    feature_kind: Option<&str>,
) -> PyResult<&'py PyArray2<u8>> {
    let kind = match feature_kind.map(|k| k.to_uppercase()) {
        None => None,
        Some(k) if k == "NDWI" => Some(FeatureMaskKind::Ndwi),
        Some(k) if k == "BAND8" => Some(FeatureMaskKind::Band8),
        Some(k) => {
            return Err(PyErr::new::<pyo3::exceptions::PyValueError, _>(format!(
                "Invalid feature mask: {}",
                k
            )))
        }
    };
    let combiner = MaskCombiner::new(kind, cloud.is_some());
    let water = mask_raster(water);
    let feature = feature.map(mask_raster);
    let cloud = cloud.map(mask_raster);
    let combined = combiner
        .combine(&water, feature.as_ref(), cloud.as_ref())
        .map_err(to_py_err)?;
    Ok(combined.band(0).to_owned().into_pyarray(py))
}

/// Split a (band, row, col) array into overlapping patches and mosaic it back
#[pyfunction]
fn split_merge_roundtrip<'py>(
    py: Python<'py>,
    data: PyReadonlyArray3<f32>,
    patch_width: usize,
    patch_height: usize,
    overlap: f64,
) -> PyResult<&'py PyArray3<f32>> {
    let array = data.as_array().to_owned();
    let bands = array.len_of(ndarray::Axis(0));
    let raster = Raster::new(
        array,
        GeoTransform::north_up(0.0, 0.0, 1.0),
        String::new(),
        vec![Default::default(); bands],
    )
    .map_err(to_py_err)?;
    let splitter = PatchSplitter::new(PatchParams {
        width: patch_width,
        height: patch_height,
        overlap,
    });
    let patches = splitter.split(&raster).map_err(to_py_err)?;
    let merged = PatchMerger::new().merge(patches).map_err(to_py_err)?;
    Ok(merged.data.into_pyarray(py))
}

/// Run the batch described by a JSON configuration file
#[pyfunction]
fn run_pipeline(config_path: String, products: Vec<String>) -> PyResult<PyRunSummary> {
    let config = PipelineConfig::from_file(&config_path).map_err(to_py_err)?;
    let pipeline = Pipeline::new(config).map_err(to_py_err)?;
    Ok(PyRunSummary {
        inner: pipeline.run(&products),
    })
}

/// Python wrapper for RunSummary
#[pyclass(name = "RunSummary")]
struct PyRunSummary {
    inner: RunSummary,
}

#[pymethods]
impl PyRunSummary {
    #[getter]
    fn found(&self) -> usize {
        self.inner.found
    }

    #[getter]
    fn processed(&self) -> usize {
        self.inner.processed
    }

    #[getter]
    fn old_format(&self) -> Vec<String> {
        self.inner.old_format.clone()
    }

    #[getter]
    fn no_data_or_duplicate(&self) -> Vec<String> {
        self.inner.no_data_or_duplicate.clone()
    }

    #[getter]
    fn corrupted(&self) -> Vec<String> {
        self.inner.corrupted.clone()
    }

    fn to_json(&self) -> PyResult<String> {
        serde_json::to_string(&self.inner).map_err(|e| to_py_err(e.into()))
    }

    fn __str__(&self) -> String {
        format!(
            "RunSummary(found={}, processed={}, corrupted={}, failed={})",
            self.inner.found,
            self.inner.processed,
            self.inner.corrupted.len(),
            self.inner.failed.len()
        )
    }
}
