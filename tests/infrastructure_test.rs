//! Test to verify test infrastructure works correctly

mod common;

use cellpipe::ImageNumber;
use common::builders::{FailOn, PipelineBuilder, VISITED};

#[test]
fn test_infrastructure_setup() {
    let folder = common::two_plate_folder();
    let pipeline = PipelineBuilder::new(folder.path())
        .grouped_by("Plate")
        .measure_intensity()
        .build();

    assert_eq!(pipeline.len(), 2);
    assert_eq!(pipeline.modules()[0].module_name(), "LoadImages");
    assert!(pipeline.test_valid().is_ok());
    assert_eq!(std::fs::read_dir(folder.path()).unwrap().count(), 4);
}

#[test]
fn test_image_folder_writes_uniform_images() {
    let folder = common::image_folder(&[("a.png", 51)]);
    let img = image::open(folder.path().join("a.png")).unwrap().to_luma8();
    assert_eq!(img.dimensions(), (4, 3));
    assert!(img.pixels().all(|p| p.0 == [51]));
}

#[test]
fn test_set_setting_edits_by_text() {
    let folder = common::image_folder(&[]);
    let mut pipeline = PipelineBuilder::new(folder.path()).build();
    common::set_setting(&mut pipeline, 1, "File names end with", ".tif");

    let values = pipeline.modules()[0].module.setting_values();
    assert_eq!(values[0], folder.path().to_string_lossy());
    assert_eq!(values[1], ".tif");
}

#[test]
#[should_panic(expected = "has no setting")]
fn test_set_setting_rejects_unknown_text() {
    let folder = common::image_folder(&[]);
    let mut pipeline = PipelineBuilder::new(folder.path()).build();
    common::set_setting(&mut pipeline, 1, "No such setting", "x");
}

#[test]
fn test_fail_on_marks_other_image_sets() {
    let folder = common::image_folder(&[("a.png", 1), ("b.png", 2)]);
    let mut pipeline = PipelineBuilder::new(folder.path())
        .with_module(FailOn::new(&[2]))
        .build();
    let options = cellpipe::RunOptions::new().with_error_policy(cellpipe::ErrorPolicy::Skip);
    let outcome = pipeline.run(&options, None).unwrap();

    assert_eq!(common::image_f64(&outcome.measurements, VISITED, 1), 1.0);
    assert!(outcome
        .measurements
        .get_image_measurement(VISITED, ImageNumber(2))
        .is_none());
    assert_eq!(common::numbers(&[1, 2]), outcome.image_sets_run);
}
