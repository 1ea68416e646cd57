//! Pipeline-specific error types.

use crate::pipeline::id::{ImageNumber, ModuleNum};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle phase a run exception was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    PrepareRun,
    PrepareGroup,
    Run,
    PostGroup,
    PostRun,
}

impl RunStage {
    /// Failures in these stages abort the run regardless of the error policy.
    pub fn is_fatal(self) -> bool {
        matches!(self, RunStage::PrepareRun | RunStage::PrepareGroup)
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::PrepareRun => "prepare_run",
            RunStage::PrepareGroup => "prepare_group",
            RunStage::Run => "run",
            RunStage::PostGroup => "post_group",
            RunStage::PostRun => "post_run",
        };
        f.write_str(name)
    }
}

/// A setting value, or a module's cross-setting invariant, is invalid.
///
/// Always attributable to exactly one setting.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message} (setting \"{setting_text}\")")]
pub struct ValidationError {
    pub message: String,
    pub setting_key: Uuid,
    pub setting_text: String,
    pub module_num: Option<ModuleNum>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>, setting: &crate::module::Setting) -> Self {
        Self {
            message: message.into(),
            setting_key: setting.key(),
            setting_text: setting.text().to_string(),
            module_num: None,
        }
    }

    pub fn in_module(mut self, module_num: ModuleNum) -> Self {
        self.module_num = Some(module_num);
        self
    }
}

/// Errors that can occur within the pipeline system.
#[derive(Error, Debug)]
pub enum PipelineError {
    // ── Load ──
    #[error("Pipeline parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Legacy pipeline format is not supported: {0}")]
    LegacyFormat(String),

    #[error("Unsupported pipeline format version {0}")]
    UnsupportedVersion(u32),

    #[error("Unknown module \"{0}\"")]
    UnknownModule(String),

    #[error("Failed to upgrade settings of {module_name} from revision {revision}: {message}")]
    Upgrade {
        module_name: String,
        revision: u32,
        message: String,
    },

    #[error("{module_name} expects {expected} setting values but {actual} were supplied")]
    ValueCountMismatch {
        module_name: String,
        expected: usize,
        actual: usize,
    },

    // ── Validation ──
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    // ── Run ──
    #[error("{module_name} ({module_num}) failed in {stage}{}: {message}", image_suffix(.image_number))]
    RunException {
        module_num: ModuleNum,
        module_name: String,
        stage: RunStage,
        image_number: Option<ImageNumber>,
        message: String,
    },

    #[error("More than one module defines a grouping: {0}")]
    ConflictingGroupings(String),

    #[error("Groups do not partition the image sets: {0}")]
    InvalidPartition(String),

    #[error("Invalid group specification \"{0}\", expected key=value[,key=value...]")]
    InvalidGroupSpec(String),

    #[error("No group matches {0}")]
    NoMatchingGroup(String),

    #[error("The pipeline did not produce any image sets")]
    NoImageSets,

    #[error("{module_name} ({module_num}) did not write {feature} for image sets {missing:?} in post_group")]
    AggregationIncomplete {
        module_num: ModuleNum,
        module_name: String,
        feature: String,
        missing: Vec<ImageNumber>,
    },

    #[error("Run cancelled before image set {0}")]
    Cancelled(ImageNumber),

    // ── Editing ──
    #[error("No module {0} in pipeline")]
    InvalidModuleNum(ModuleNum),

    #[error("Module {0} has no setting {1}")]
    UnknownSetting(ModuleNum, Uuid),

    #[error("Module {0} cannot be edited while the pipeline is in batch mode")]
    BatchModeLocked(ModuleNum),

    // ── Storage ──
    #[error("Measurements error: {0}")]
    Measurements(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn image_suffix(image_number: &Option<ImageNumber>) -> String {
    match image_number {
        Some(n) => format!(" on image set {}", n),
        None => String::new(),
    }
}

impl PipelineError {
    /// Errors that abort a pipeline load.
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            PipelineError::Parse { .. }
                | PipelineError::LegacyFormat(_)
                | PipelineError::UnsupportedVersion(_)
                | PipelineError::UnknownModule(_)
                | PipelineError::Upgrade { .. }
                | PipelineError::ValueCountMismatch { .. }
        )
    }

    pub(crate) fn parse(line: usize, message: impl Into<String>) -> Self {
        PipelineError::Parse {
            line,
            message: message.into(),
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
