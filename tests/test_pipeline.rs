use approx::assert_relative_eq;
use ndarray::{Array2, Array3};
use pos2idon::config::{Algorithm, CleanupMode, FeatureMaskKind, PatchParams};
use pos2idon::core::CLOUD_BANDS;
use pos2idon::io::{read_raster, write_raster};
use pos2idon::pipeline::ProductPaths;
use pos2idon::types::{BandInfo, GeoTransform, MaskRaster, Raster, StackRaster};
use pos2idon::{Pipeline, PipelineConfig, ProductStatus};
use std::path::Path;
use tempfile::TempDir;

const PRODUCT: &str = "S2A_MSIL1C_20200918T161021_N0209_R140_T16PCC_20200918T194113.SAFE";
const SHORT: &str = "S2A_MSI_2020_09_18_16_14_29_T16PCC";

const MTD_TL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<n1:Level-1C_Tile_ID xmlns:n1="https://psd-14.sentinel2.eo.esa.int/PSD/S2_PDI_Level-1C_Tile_Metadata.xsd">
  <n1:General_Info>
    <SENSING_TIME metadataLevel="Standard">2020-09-18T16:14:29.456Z</SENSING_TIME>
  </n1:General_Info>
</n1:Level-1C_Tile_ID>"#;

/// Splits on B08 (feature 1): dark pixels are class 1, bright ones class 2
const FOREST: &str = r#"{
    "classes": [1, 2],
    "n_features": 2,
    "trees": [
        {"nodes": [
            {"feature": 1, "threshold": 0.15, "left": 1, "right": 2},
            {"value": [0.9, 0.1]},
            {"value": [0.2, 0.8]}
        ]}
    ]
}"#;

/// Cloudy when top-of-atmosphere B02 (feature 1) exceeds 0.5
const CLOUD_MODEL: &str = r#"{
    "n_classes": 1,
    "n_features": 10,
    "trees": [
        {"nodes": [
            {"feature": 1, "threshold": 0.5, "left": 1, "right": 2},
            {"leaf": -4.0},
            {"leaf": 4.0}
        ]}
    ]
}"#;

/// 1x1 convolutions: a relu copy of the standardised B08, then logits (0, 2 * hidden)
const SEGMENTER: &str = r#"{
    "layers": [
        {"in_channels": 1, "out_channels": 1, "kernel_size": 1, "weights": [1.0], "bias": [0.0], "activation": "relu"},
        {"in_channels": 1, "out_channels": 2, "kernel_size": 1, "weights": [0.0, 2.0], "bias": [0.0, 0.0]}
    ]
}"#;

const SIZE: usize = 8;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn geo() -> GeoTransform {
    GeoTransform::north_up(300000.0, 1400000.0, 10.0)
}

/// Downloaded SAFE folder, corrected 19-band stack and top-of-atmosphere bands
fn seed_product(root: &Path, config: &PipelineConfig) {
    let granule = config
        .folders
        .s2l1c_dir()
        .join(PRODUCT)
        .join("GRANULE")
        .join("L1C_T16PCC_A027366_20200918T161323");
    std::fs::create_dir_all(&granule).unwrap();
    std::fs::write(granule.join("MTD_TL.xml"), MTD_TL).unwrap();

    // B08 is 0.1 on the left half, 0.3 on the right half and 0 on the last two
    // rows (one dilation step re-admits the upper one); pixel (0, 0) is NaN in every band
    let mut data = Array3::<f32>::from_elem((19, SIZE, SIZE), 0.03);
    for r in 0..SIZE {
        for c in 0..SIZE {
            data[[7, r, c]] = if r >= SIZE - 2 {
                0.0
            } else if c < SIZE / 2 {
                0.1
            } else {
                0.3
            };
        }
    }
    for b in 0..19 {
        data[[b, 0, 0]] = f32::NAN;
    }
    let stack = Raster::new(data, geo(), String::new(), vec![BandInfo::default(); 19]).unwrap();
    let paths = ProductPaths::new(config, SHORT);
    write_raster(paths.stack(), &stack).unwrap();

    for band in CLOUD_BANDS {
        let mut values = Array2::<f32>::from_elem((SIZE, SIZE), 0.05);
        if band == "B02" {
            values[[2, 3]] = 0.9;
        }
        let raster = Raster::from_band(values, geo(), "");
        write_raster(paths.toa_bands().join(format!("rhot_{}.tif", band)), &raster).unwrap();
    }

    std::fs::write(root.join("rf.json"), FOREST).unwrap();
    std::fs::write(root.join("cloud.json"), CLOUD_MODEL).unwrap();
}

fn config(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.folders.root = root.to_path_buf();
    config.masking.features_mask = Some(FeatureMaskKind::Band8);
    config.masking.band8.dilation = 1;
    config.masking.cloud.enabled = true;
    config.masking.cloud.average_over = 0;
    config.masking.cloud.dilation_size = 0;
    config.masking.cloud.model_path = Some(root.join("cloud.json"));
    config.classification.algorithm = Algorithm::Rf;
    config.classification.model_path = root.join("rf.json");
    config.classification.features = vec!["B02".to_string(), "B08".to_string()];
    config.classification.probabilities = true;
    config
}

#[test]
fn test_full_run_masks_and_classifies() {
    init_logging();
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = config(dir.path());
    seed_product(dir.path(), &config);

    let pipeline = Pipeline::new(config.clone()).expect("Failed to set up pipeline");
    let summary = pipeline.run(&[PRODUCT.to_string()]);
    assert_eq!(summary.found, 1);
    assert_eq!(summary.processed, 1, "summary: {:?}", summary);
    assert!(summary.corrupted.is_empty());

    let paths = ProductPaths::new(&config, SHORT);
    let final_mask: MaskRaster = read_raster(paths.final_mask()).expect("FINAL mask missing");
    assert_eq!(final_mask.band(0)[[2, 3]], 0, "cloud pixel kept");
    assert_eq!(final_mask.band(0)[[SIZE - 1, 5]], 0, "dark last row kept");
    assert_eq!(final_mask.band(0)[[3, 3]], 1);

    let classes: Raster<u8> = read_raster(
        paths
            .class_maps()
            .join(format!("{}_masked_stack_rf-scmap.tif", SHORT)),
    )
    .expect("class map missing");
    let classes = classes.band(0);
    assert_eq!(classes[[0, 0]], 0, "NaN pixel classified");
    assert_eq!(classes[[2, 3]], 0, "cloud pixel classified");
    assert_eq!(classes[[SIZE - 1, 2]], 0, "excluded pixel classified");
    assert_eq!(classes[[3, 1]], 1);
    assert_eq!(classes[[3, 6]], 2);

    let proba: Raster<f32> = read_raster(
        paths
            .probability_maps()
            .join(format!("{}_masked_stack_rf-probamap.tif", SHORT)),
    )
    .expect("probability map missing");
    assert!((proba.band(0)[[3, 1]] - 0.9).abs() < 1e-6);
    assert!((proba.band(0)[[3, 6]] - 0.8).abs() < 1e-6);
    assert_eq!(proba.band(0)[[0, 0]], 0.0);

    // Everything is on disk: a second run resumes at Classified
    assert_eq!(pipeline.resume_status(&paths), ProductStatus::Classified);
    let again = pipeline.run(&[PRODUCT.to_string()]);
    assert_eq!(again.processed, 1);
}

#[test]
fn test_split_and_mosaic_matches_direct_classification() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let mut direct_config = config(dir.path());
    seed_product(dir.path(), &direct_config);
    direct_config.classification.probabilities = false;

    let direct = Pipeline::new(direct_config.clone()).unwrap();
    let paths = ProductPaths::new(&direct_config, SHORT);
    assert_eq!(direct.process(&paths), ProductStatus::Classified);
    let class_path = paths
        .class_maps()
        .join(format!("{}_masked_stack_rf-scmap.tif", SHORT));
    let expected: Raster<u8> = read_raster(&class_path).unwrap();
    std::fs::remove_file(&class_path).unwrap();

    let mut patched_config = direct_config.clone();
    patched_config.classification.split_and_mosaic = true;
    patched_config.classification.patch = PatchParams {
        width: 4,
        height: 4,
        overlap: 0.5,
    };
    let patched = Pipeline::new(patched_config).unwrap();
    assert_eq!(patched.process(&paths), ProductStatus::Classified);

    let mosaic: Raster<u8> = read_raster(&class_path).unwrap();
    assert_eq!(mosaic.data, expected.data);
    assert_eq!(mosaic.geo_transform, expected.geo_transform);
    assert!(!paths
        .class_maps()
        .join("4x4_patch_0-0_rf-scmap.tif")
        .exists());
}

#[test]
fn test_segmenter_maps_are_masked_after_mosaicking() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    seed_product(dir.path(), &config);
    std::fs::write(dir.path().join("unet.json"), SEGMENTER).unwrap();

    let c = &mut config.classification;
    c.algorithm = Algorithm::Unet;
    c.model_path = dir.path().join("unet.json");
    c.features = vec!["B08".to_string()];
    c.features_mean = vec![0.2];
    c.features_std = vec![0.1];
    c.n_classes = 2;
    c.n_hchannels = 1;
    c.split_and_mosaic = true;
    c.patch = PatchParams {
        width: 4,
        height: 4,
        overlap: 0.5,
    };

    let pipeline = Pipeline::new(config.clone()).unwrap();
    let paths = ProductPaths::new(&config, SHORT);
    assert_eq!(pipeline.process(&paths), ProductStatus::Classified);

    // The segmenter reads the unmasked stack
    let masked: StackRaster = read_raster(paths.masked_stack()).unwrap();
    assert_eq!(masked.band(7)[[SIZE - 1, 2]], 0.0);
    assert!(paths.nan_mask().is_file());

    let classes: Raster<u8> = read_raster(
        paths
            .class_maps()
            .join(format!("{}_masked_stack_unet-scmap.tif", SHORT)),
    )
    .unwrap();
    let classes = classes.band(0);
    assert_eq!(classes[[0, 0]], 0, "NaN pixel classified");
    assert_eq!(classes[[2, 3]], 0, "cloud pixel classified");
    assert_eq!(classes[[SIZE - 1, 2]], 0, "excluded pixel classified");
    assert_eq!(classes[[3, 1]], 1);
    assert_eq!(classes[[3, 6]], 2);
    assert_eq!(classes[[SIZE - 2, 2]], 1);

    let proba: Raster<f32> = read_raster(
        paths
            .probability_maps()
            .join(format!("{}_masked_stack_unet-probamap.tif", SHORT)),
    )
    .unwrap();
    let proba = proba.band(0);
    assert!(proba[[0, 0]].is_nan());
    assert_eq!(proba[[2, 3]], 0.0);
    assert_eq!(proba[[SIZE - 1, 2]], 0.0);
    assert_relative_eq!(proba[[3, 1]], 0.5, epsilon = 1e-5);
    assert_relative_eq!(proba[[3, 6]], 1.0 / (1.0 + (-2.0f32).exp()), epsilon = 1e-5);
}

#[test]
fn test_duplicate_and_missing_products() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.cleanup = CleanupMode::Some;
    seed_product(dir.path(), &config);

    // Same product listed twice: the second is a duplicate sensing time
    let pipeline = Pipeline::new(config.clone()).unwrap();
    let summary = pipeline.run(&[PRODUCT.to_string(), PRODUCT.to_string()]);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.no_data_or_duplicate, vec![PRODUCT.to_string()]);

    let paths = ProductPaths::new(&config, SHORT);
    assert!(!paths.toa_bands().exists(), "top-of-atmosphere bands not cleaned");
    assert!(paths.stack().exists());

    // Without a corrected stack the product has no data
    std::fs::remove_file(paths.stack()).unwrap();
    std::fs::remove_dir_all(&paths.classification).unwrap();
    std::fs::remove_dir_all(&paths.masked_product).unwrap();
    let summary = pipeline.run(&[PRODUCT.to_string()]);
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.no_data_or_duplicate, vec![PRODUCT.to_string()]);
}

#[test]
fn test_config_round_trip_through_json() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    let path = dir.path().join("config.json");
    std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    let loaded = PipelineConfig::from_file(&path).expect("Failed to load config");
    assert_eq!(loaded, config);
}
