use ndarray::{array, Array2, Array3, Axis};
use pos2idon::config::{FeatureMaskKind, MaskingConfig, ThresholdParams};
use pos2idon::io::{read_raster, write_raster, GridSpec};
use pos2idon::types::{BandInfo, GeoTransform, MaskRaster, Raster, StackRaster};
use pos2idon::core::find_landcover_tiles;
use pos2idon::{FeatureMaskBuilder, MaskCombiner, StackMasker, WaterMaskBuilder};
use tempfile::TempDir;

const NO_DATA: f64 = -9999.0;

fn geo() -> GeoTransform {
    GeoTransform::north_up(500000.0, 1500000.0, 10.0)
}

/// 4 bands over 4x4 pixels; band 2 is green, band 4 near-infrared.
/// The upper-left 3x3 block has NDWI 0.8, the rest 0.0.
fn four_band_stack() -> StackRaster {
    let mut data = Array3::<f32>::zeros((4, 4, 4));
    data.index_axis_mut(Axis(0), 0).fill(0.05);
    data.index_axis_mut(Axis(0), 1).fill(0.1);
    data.index_axis_mut(Axis(0), 2).fill(0.07);
    data.index_axis_mut(Axis(0), 3).fill(0.1);
    for r in 0..3 {
        for c in 0..3 {
            data[[1, r, c]] = 0.9;
        }
    }
    let bands = (1..=4)
        .map(|i| BandInfo {
            description: format!("B{}", i),
            no_data: Some(NO_DATA),
        })
        .collect();
    Raster::new(data, geo(), String::new(), bands).expect("Failed to build stack")
}

#[test]
fn test_ndwi_scenario_final_mask_and_masked_stack() {
    let stack = four_band_stack();
    let builder = FeatureMaskBuilder::new(
        FeatureMaskKind::Ndwi,
        ThresholdParams {
            threshold: 0.5,
            dilation: 1,
        },
    );

    let source = stack.with_data(stack.data.select(Axis(0), &[1, 3]));
    let feature = builder.build(&source).expect("Failed to build NDWI mask");

    // Dilation by one 4-connected step leaves only the inner 2x2 corner excluded
    let expected: Array2<u8> = array![[0, 0, 1, 1], [0, 0, 1, 1], [1, 1, 1, 1], [1, 1, 1, 1]];
    assert_eq!(feature.band(0), expected);

    let water = GridSpec::of(&stack).filled(1u8);
    let combiner = MaskCombiner::new(Some(FeatureMaskKind::Ndwi), false);
    let final_mask = combiner
        .combine(&water, Some(&feature), None)
        .expect("Failed to combine masks");
    assert_eq!(final_mask.band(0), expected);

    let mut masked = stack.clone();
    StackMasker::new()
        .mask_stack(&mut masked, &final_mask)
        .expect("Failed to mask stack");

    for b in 0..4 {
        for r in 0..4 {
            for c in 0..4 {
                let value = masked.band(b)[[r, c]];
                if expected[[r, c]] == 0 {
                    assert_eq!(value, NO_DATA as f32, "band {} pixel ({}, {})", b, r, c);
                } else {
                    assert_eq!(value, stack.band(b)[[r, c]], "band {} pixel ({}, {})", b, r, c);
                }
            }
        }
    }
}

#[test]
fn test_band8_mask_through_files() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let masks = dir.path().join("Masks");

    // 19-band stack; band 8 (B08) bright in the left column only
    let mut data = Array3::<f32>::from_elem((19, 3, 3), 0.005);
    for r in 0..3 {
        data[[7, r, 0]] = 0.2;
    }
    let bands = vec![
        BandInfo {
            description: String::new(),
            no_data: Some(NO_DATA)
        };
        19
    ];
    let stack = Raster::new(data, geo(), String::new(), bands).unwrap();
    let stack_path = dir.path().join("P_stack.tif");
    write_raster(&stack_path, &stack).expect("Failed to write stack");

    let mut config = MaskingConfig::default();
    config.band8 = ThresholdParams {
        threshold: 0.01,
        dilation: 1,
    };
    let builder = FeatureMaskBuilder::from_config(FeatureMaskKind::Band8, &config);
    let mask = builder
        .create(&stack_path, &masks, "P")
        .expect("Failed to create Band 8 mask");
    assert_eq!(mask.band(0), array![[1u8, 1, 0], [1, 1, 0], [1, 1, 0]]);

    let mask_path = masks.join(builder.output_name("P"));
    assert!(mask_path.is_file());
    assert!(!masks.join("P_Band8_Thr.tif").exists(), "intermediate not removed");

    let water_path = masks.join("P_WATER_Mask.tif");
    let tiles: Vec<std::path::PathBuf> = Vec::new();
    WaterMaskBuilder::new(0)
        .create(&tiles, &GridSpec::of(&stack), &water_path)
        .expect("Failed to create water mask");

    let final_path = masks.join("P_FINAL_Mask.tif");
    MaskCombiner::new(Some(FeatureMaskKind::Band8), false)
        .create(&water_path, Some(&mask_path), None, &final_path)
        .expect("Failed to combine masks");

    let masked_path = dir.path().join("P_masked_stack.tif");
    let masked = StackMasker::new()
        .create(&stack_path, &final_path, &masked_path)
        .expect("Failed to mask stack");
    assert_eq!(masked.band(7)[[0, 0]], 0.2);
    assert_eq!(masked.band(7)[[1, 2]], NO_DATA as f32);

    let reread: StackRaster = read_raster(&masked_path).expect("Failed to read masked stack");
    assert_eq!(reread.data, masked.data);
    assert_eq!(reread.bands[0].no_data, Some(NO_DATA));
    assert_eq!(reread.geo_transform, geo());

    let final_mask: MaskRaster = read_raster(&final_path).unwrap();
    assert_eq!(final_mask.bands[0].description, "FINAL");
}

#[test]
fn test_open_ocean_water_mask_is_all_water() {
    let grid = GridSpec {
        geo_transform: geo(),
        projection: String::new(),
        width: 7,
        height: 5,
    };
    let tiles: Vec<std::path::PathBuf> = Vec::new();
    let mask = WaterMaskBuilder::new(3).build(&tiles, &grid).unwrap();
    assert_eq!(mask.shape(), (5, 7));
    assert!(mask.data.iter().all(|v| *v == 1));
}

#[test]
fn test_ndwi_mask_through_files_removes_intermediates() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let masks = dir.path().join("Masks");
    std::fs::create_dir_all(&masks).unwrap();

    // B03 (band 3) bright in the left column gives NDWI 0.8 there and 0.0 elsewhere
    let mut data = Array3::<f32>::from_elem((19, 3, 3), 0.1);
    for r in 0..3 {
        data[[2, r, 0]] = 0.9;
    }
    let stack = Raster::new(data, geo(), String::new(), vec![BandInfo::default(); 19]).unwrap();
    let stack_path = dir.path().join("P_stack.tif");
    write_raster(&stack_path, &stack).unwrap();

    let builder = FeatureMaskBuilder::new(
        FeatureMaskKind::Ndwi,
        ThresholdParams {
            threshold: 0.5,
            dilation: 1,
        },
    );
    let mask = builder.create(&stack_path, &masks, "P").expect("Failed to create NDWI mask");
    assert_eq!(mask.band(0), array![[1u8, 1, 1], [1, 1, 1], [1, 1, 1]]);

    assert!(masks.join(builder.output_name("P")).is_file());
    assert!(!masks.join("P_NDWI.tif").exists(), "NDWI raster not removed");
    assert!(!masks.join("P_NDWI_Thr.tif").exists(), "thresholded NDWI not removed");
}

/// 20 m land-cover tile with the given 2x2 classes
fn landcover_tile(path: &std::path::Path, left_x: f64, classes: Array2<u8>, wkt: &str) {
    let tile = Raster::from_band(classes, GeoTransform::north_up(left_x, 1500000.0, 20.0), wkt);
    write_raster(path, &tile).expect("Failed to write land-cover tile");
}

#[test]
fn test_water_mask_from_coarser_adjacent_tiles() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let wkt = gdal::spatial_ref::SpatialRef::from_epsg(32629)
        .and_then(|srs| srs.to_wkt())
        .expect("Failed to build UTM reference");

    let worldcover = dir.path().join("WorldCover");
    std::fs::create_dir_all(&worldcover).unwrap();
    landcover_tile(&worldcover.join("ESA_WorldCover_A.tif"), 500000.0, array![[80, 10], [50, 80]], &wkt);
    landcover_tile(&worldcover.join("ESA_WorldCover_B.tif"), 500040.0, array![[10, 80], [80, 30]], &wkt);
    std::fs::write(worldcover.join("README.txt"), "not a tile").unwrap();

    let tiles = find_landcover_tiles(&worldcover).unwrap();
    assert_eq!(tiles.len(), 2);

    // 10 m grid over both tiles plus two uncovered columns on the east side
    let grid = GridSpec {
        geo_transform: geo(),
        projection: wkt.clone(),
        width: 10,
        height: 4,
    };
    let landcover = pos2idon::io::warp_nearest(&tiles, &grid).expect("Failed to warp tiles");
    let expected_landcover: Array2<u8> = array![
        [80, 80, 10, 10, 10, 10, 80, 80, 0, 0],
        [80, 80, 10, 10, 10, 10, 80, 80, 0, 0],
        [50, 50, 80, 80, 80, 80, 30, 30, 0, 0],
        [50, 50, 80, 80, 80, 80, 30, 30, 0, 0],
    ];
    assert_eq!(landcover, expected_landcover);

    let mask = WaterMaskBuilder::new(0).build(&tiles, &grid).expect("Failed to build water mask");
    let expected_mask: Array2<u8> = array![
        [1, 1, 0, 0, 0, 0, 1, 1, 1, 1],
        [1, 1, 0, 0, 0, 0, 1, 1, 1, 1],
        [0, 0, 1, 1, 1, 1, 0, 0, 1, 1],
        [0, 0, 1, 1, 1, 1, 0, 0, 1, 1],
    ];
    assert_eq!(mask.band(0), expected_mask);
    assert_eq!(mask.geo_transform, geo());
}
