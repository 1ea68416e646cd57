//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;

use cellpipe::measurements::MeasurementValue;
use cellpipe::{ImageNumber, Measurements, ModuleNum, Pipeline};
use std::path::Path;
use tempfile::TempDir;

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}

/// Write a uniform 4x3 grayscale PNG.
pub fn write_png(dir: &Path, name: &str, value: u8) {
    let img = image::GrayImage::from_pixel(4, 3, image::Luma([value]));
    img.save(dir.join(name)).unwrap();
}

/// A folder of uniform images, one per `(file name, gray value)`.
pub fn image_folder(files: &[(&str, u8)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, value) in files {
        write_png(dir.path(), name, *value);
    }
    dir
}

/// Two plates of two wells each: `P1_A01_s1.png` ... `P2_B01_s1.png`.
pub fn two_plate_folder() -> TempDir {
    image_folder(&[
        ("P1_A01_s1.png", 51),
        ("P1_B01_s1.png", 102),
        ("P2_A01_s1.png", 153),
        ("P2_B01_s1.png", 204),
    ])
}

/// Set the setting whose text is `text` on module `module_num`.
pub fn set_setting(pipeline: &mut Pipeline, module_num: u32, text: &str, value: &str) {
    let module_num = ModuleNum(module_num);
    let key = pipeline
        .module(module_num)
        .unwrap()
        .module
        .settings()
        .into_iter()
        .find(|s| s.text() == text)
        .unwrap_or_else(|| panic!("module {} has no setting {:?}", module_num, text))
        .key();
    pipeline.edit_setting(module_num, key, value).unwrap();
}

/// Image feature as f64, panicking if it is missing.
pub fn image_f64(m: &Measurements, feature: &str, image_number: u32) -> f64 {
    m.get_image_measurement(feature, ImageNumber(image_number))
        .and_then(MeasurementValue::as_f64)
        .unwrap_or_else(|| panic!("no {} for image set {}", feature, image_number))
}

pub fn image_text(m: &Measurements, feature: &str, image_number: u32) -> Option<String> {
    m.get_image_measurement(feature, ImageNumber(image_number))
        .map(|v| v.to_string())
}

pub fn numbers(values: &[u32]) -> Vec<ImageNumber> {
    values.iter().copied().map(ImageNumber).collect()
}
