//! Errors raised by module hooks.

use crate::pipeline::error::ValidationError;
use crate::pipeline::id::ImageNumber;
use thiserror::Error;

/// Failure inside a module's lifecycle hook.
///
/// The driver wraps these into `PipelineError::RunException` together with
/// the module, stage and image set they came from.
#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("Image \"{0}\" is not in the image set")]
    MissingImage(String),

    #[error("Objects \"{0}\" are not in the object set")]
    MissingObjects(String),

    #[error("Measurement {object_name}.{feature} is missing for image set {image_number}")]
    MissingMeasurement {
        object_name: String,
        feature: String,
        image_number: ImageNumber,
    },

    #[error("No image set is being processed")]
    NoImageSet,

    #[error(transparent)]
    Setting(#[from] ValidationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image decoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

pub type ModuleResult<T> = std::result::Result<T, ModuleError>;
