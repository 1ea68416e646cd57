//! Per-invocation execution context.
//!
//! A `Workspace` binds everything a module hook may touch: the measurements
//! of the run, the images and objects of the current image set, the module's
//! own state slot, and a scratch map for display data. It is rebuilt by the
//! driver for every (module, image set) invocation and never persisted.

use crate::measurements::Measurements;
use crate::module::{ModuleError, ModuleResult, ModuleState, SharedState};
use crate::pipeline::id::{ImageNumber, ModuleNum};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Values a module leaves for an external visualization layer.
pub type DisplayData = Map<String, Value>;

/// A single-channel image with intensities scaled to `0.0..=1.0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pixels: Vec<f32>,
    width: u32,
    height: u32,
    path: Option<PathBuf>,
}

impl Image {
    pub fn new(width: u32, height: u32, pixels: Vec<f32>) -> ModuleResult<Self> {
        if pixels.len() != width as usize * height as usize {
            return Err(ModuleError::Failed(format!(
                "{}x{} image needs {} pixels, got {}",
                width,
                height,
                width as usize * height as usize,
                pixels.len()
            )));
        }
        Ok(Self {
            pixels,
            width,
            height,
            path: None,
        })
    }

    /// Decode an image file to grayscale.
    pub fn open(path: impl AsRef<Path>) -> ModuleResult<Self> {
        let path = path.as_ref();
        let luma = image::open(path)?.to_luma32f();
        let (width, height) = luma.dimensions();
        Ok(Self {
            pixels: luma.into_raw(),
            width,
            height,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Images of the current image set, by name.
#[derive(Debug, Clone, Default)]
pub struct ImageSet {
    images: IndexMap<String, Image>,
}

impl ImageSet {
    pub fn add(&mut self, name: impl Into<String>, image: Image) {
        self.images.insert(name.into(), image);
    }

    pub fn get(&self, name: &str) -> ModuleResult<&Image> {
        self.images
            .get(name)
            .ok_or_else(|| ModuleError::MissingImage(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.images.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.images.keys().map(String::as_str)
    }
}

/// A labeled segmentation: `0` is background, `1..=count` are objects.
#[derive(Debug, Clone, PartialEq)]
pub struct Objects {
    pub labels: Vec<u32>,
    pub width: u32,
    pub height: u32,
}

impl Objects {
    pub fn count(&self) -> u32 {
        self.labels.iter().copied().max().unwrap_or(0)
    }
}

/// Objects of the current image set, by name.
#[derive(Debug, Clone, Default)]
pub struct ObjectSet {
    objects: IndexMap<String, Objects>,
}

impl ObjectSet {
    pub fn add(&mut self, name: impl Into<String>, objects: Objects) {
        self.objects.insert(name.into(), objects);
    }

    pub fn get(&self, name: &str) -> ModuleResult<&Objects> {
        self.objects
            .get(name)
            .ok_or_else(|| ModuleError::MissingObjects(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }
}

/// Image-set scoped data the driver owns and resets between image sets.
#[derive(Debug, Clone, Default)]
pub struct ImageSetData {
    pub image_set: ImageSet,
    pub object_set: ObjectSet,
    pub display_data: DisplayData,
}

/// Context passed to module lifecycle hooks.
pub struct Workspace<'a> {
    /// Measurements of the whole run.
    pub measurements: &'a mut Measurements,
    pub image_set: &'a mut ImageSet,
    pub object_set: &'a mut ObjectSet,
    /// Scratch values for `Module::display`.
    pub display_data: &'a mut DisplayData,
    state: &'a mut ModuleState,
    module_num: ModuleNum,
    image_number: Option<ImageNumber>,
    batch_mode: bool,
}

impl<'a> Workspace<'a> {
    pub fn new(
        module_num: ModuleNum,
        measurements: &'a mut Measurements,
        data: &'a mut ImageSetData,
        state: &'a mut ModuleState,
    ) -> Self {
        Self {
            measurements,
            image_set: &mut data.image_set,
            object_set: &mut data.object_set,
            display_data: &mut data.display_data,
            state,
            module_num,
            image_number: None,
            batch_mode: false,
        }
    }

    pub fn at_image(mut self, image_number: ImageNumber) -> Self {
        self.image_number = Some(image_number);
        self
    }

    pub fn in_batch_mode(mut self, batch_mode: bool) -> Self {
        self.batch_mode = batch_mode;
        self
    }

    pub fn module_num(&self) -> ModuleNum {
        self.module_num
    }

    /// The image set being processed. Only set inside `run` and `display`.
    pub fn image_number(&self) -> ModuleResult<ImageNumber> {
        self.image_number.ok_or(ModuleError::NoImageSet)
    }

    pub fn current_image_number(&self) -> Option<ImageNumber> {
        self.image_number
    }

    /// Whether the pipeline was prepared for remote batch execution.
    pub fn is_batch_mode(&self) -> bool {
        self.batch_mode
    }

    pub fn shared_state(&mut self) -> &mut SharedState {
        &mut self.state.shared_state
    }

    pub fn batch_state(&mut self) -> &mut Vec<u8> {
        &mut self.state.batch_state
    }
}
