//! Test data builders for creating pipelines and test modules

use super::set_setting;
use cellpipe::measurements::{ColumnType, MeasurementColumn};
use cellpipe::module::builtin::{CalculateGroupMean, LoadImages, MeasureImageIntensity};
use cellpipe::module::{ModuleError, ModuleResult};
use cellpipe::pipeline::Workspace;
use cellpipe::{ImageNumber, Module, Pipeline, Setting};
use std::path::{Path, PathBuf};

/// Builder for a LoadImages-based pipeline over a folder of images
pub struct PipelineBuilder {
    folder: PathBuf,
    metadata: bool,
    group_by: Option<String>,
    measure: bool,
    group_mean: bool,
    extra: Vec<Box<dyn Module>>,
}

impl PipelineBuilder {
    pub fn new(folder: &Path) -> Self {
        Self {
            folder: folder.to_path_buf(),
            metadata: false,
            group_by: None,
            measure: false,
            group_mean: false,
            extra: Vec::new(),
        }
    }

    /// Extract `Plate_Well_Site` metadata from file names
    pub fn with_metadata(mut self) -> Self {
        self.metadata = true;
        self
    }

    pub fn grouped_by(mut self, keys: &str) -> Self {
        self.metadata = true;
        self.group_by = Some(keys.to_string());
        self
    }

    pub fn measure_intensity(mut self) -> Self {
        self.measure = true;
        self
    }

    /// Average the mean intensity per group; implies `measure_intensity`
    pub fn group_mean(mut self) -> Self {
        self.measure = true;
        self.group_mean = true;
        self
    }

    pub fn with_module(mut self, module: Box<dyn Module>) -> Self {
        self.extra.push(module);
        self
    }

    pub fn build(self) -> Pipeline {
        let mut pipeline = Pipeline::default();
        pipeline.add_module(Box::new(LoadImages::new()));
        set_setting(
            &mut pipeline,
            1,
            "Input image folder",
            &self.folder.to_string_lossy(),
        );
        if self.metadata {
            set_setting(&mut pipeline, 1, "Extract metadata from file names?", "Yes");
        }
        if let Some(keys) = &self.group_by {
            set_setting(&mut pipeline, 1, "Group images by metadata?", "Yes");
            set_setting(&mut pipeline, 1, "Metadata keys to group by", keys);
        }
        if self.measure {
            pipeline.add_module(Box::new(MeasureImageIntensity::new()));
        }
        if self.group_mean {
            pipeline.add_module(Box::new(CalculateGroupMean::new()));
        }
        for module in self.extra {
            pipeline.add_module(module);
        }
        pipeline
    }
}

/// Writes `Test_Visited = 1` and fails on selected image sets
pub struct FailOn {
    image_numbers: Vec<ImageNumber>,
}

pub const VISITED: &str = "Test_Visited";

impl FailOn {
    pub fn new(image_numbers: &[u32]) -> Box<Self> {
        Box::new(Self {
            image_numbers: image_numbers.iter().copied().map(ImageNumber).collect(),
        })
    }
}

impl Module for FailOn {
    fn module_name(&self) -> &str {
        "FailOn"
    }

    fn variable_revision_number(&self) -> u32 {
        1
    }

    fn settings(&self) -> Vec<&Setting> {
        Vec::new()
    }

    fn settings_mut(&mut self) -> Vec<&mut Setting> {
        Vec::new()
    }

    fn run(&mut self, ws: &mut Workspace) -> ModuleResult<()> {
        let n = ws.image_number()?;
        if self.image_numbers.contains(&n) {
            return Err(ModuleError::Failed(format!("refusing image set {}", n)));
        }
        ws.measurements.add_image_measurement(n, VISITED, 1);
        Ok(())
    }

    fn get_measurement_columns(&self) -> Vec<MeasurementColumn> {
        vec![MeasurementColumn::image(VISITED, ColumnType::Integer)]
    }
}

/// Computes a scale once in an interactive `prepare_run` and writes it as
/// `Test_Scale` for every image set
///
/// In batch mode `prepare_run` leaves the shared state alone, so a worker
/// only sees the scale if the batch file carried it over.
#[derive(Default)]
pub struct Calibrate;

pub const SCALE: &str = "Test_Scale";

impl Calibrate {
    pub const NAME: &'static str = "Calibrate";

    pub fn create() -> Box<dyn Module> {
        Box::new(Self)
    }
}

impl Module for Calibrate {
    fn module_name(&self) -> &str {
        Self::NAME
    }

    fn variable_revision_number(&self) -> u32 {
        1
    }

    fn settings(&self) -> Vec<&Setting> {
        Vec::new()
    }

    fn settings_mut(&mut self) -> Vec<&mut Setting> {
        Vec::new()
    }

    fn prepare_run(&mut self, ws: &mut Workspace) -> ModuleResult<bool> {
        if !ws.is_batch_mode() {
            ws.shared_state().set("scale", 2.0)?;
        }
        Ok(true)
    }

    fn run(&mut self, ws: &mut Workspace) -> ModuleResult<()> {
        let n = ws.image_number()?;
        let scale: f64 = ws
            .shared_state()
            .get("scale")
            .ok_or_else(|| ModuleError::Failed("not calibrated".into()))?;
        ws.measurements.add_image_measurement(n, SCALE, scale);
        Ok(())
    }

    fn get_measurement_columns(&self) -> Vec<MeasurementColumn> {
        vec![MeasurementColumn::image(SCALE, ColumnType::Float)]
    }
}
