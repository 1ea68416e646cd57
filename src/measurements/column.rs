//! Measurement column schema.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scope for per-image measurements.
pub const IMAGE: &str = "Image";
/// Scope for run-level measurements.
pub const EXPERIMENT: &str = "Experiment";
/// Scope for neighbor relationships between objects.
pub const NEIGHBORS: &str = "Neighbors";

pub const C_METADATA: &str = "Metadata";
pub const C_FILE_NAME: &str = "FileName";
pub const C_PATH_NAME: &str = "PathName";

pub const GROUP_NUMBER: &str = "Group_Number";
pub const GROUP_INDEX: &str = "Group_Index";
pub const EXIT_STATUS: &str = "Exit_Status";
pub const PIPELINE_TEXT: &str = "Pipeline_Pipeline";
pub const RUN_TIMESTAMP: &str = "Run_Timestamp";
pub const GROUPING_TAGS: &str = "Metadata_GroupingTags";
pub const MODULE_ERROR: &str = "ModuleError";
/// Per-module shared state recorded in a batch file, as a JSON array.
pub const SHARED_STATE: &str = "Pipeline_SharedState";

pub const STATUS_SUCCESS: &str = "Success";
pub const STATUS_FAILURE: &str = "Failure";

/// Default length for text columns.
pub const DEFAULT_VARCHAR_LEN: usize = 255;

/// Declared storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Float,
    Varchar(usize),
}

impl ColumnType {
    pub fn varchar() -> Self {
        ColumnType::Varchar(DEFAULT_VARCHAR_LEN)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Integer => f.write_str("integer"),
            ColumnType::Float => f.write_str("float"),
            ColumnType::Varchar(len) => write!(f, "varchar({})", len),
        }
    }
}

/// When during a run a column's values are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    #[default]
    EachCycle,
    PostGroup,
    PostRun,
}

/// One declared column: `(scope, feature, type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementColumn {
    pub object_name: String,
    pub feature: String,
    pub data_type: ColumnType,
    #[serde(default)]
    pub availability: Availability,
}

impl MeasurementColumn {
    pub fn new(object_name: impl Into<String>, feature: impl Into<String>, data_type: ColumnType) -> Self {
        Self {
            object_name: object_name.into(),
            feature: feature.into(),
            data_type,
            availability: Availability::EachCycle,
        }
    }

    pub fn image(feature: impl Into<String>, data_type: ColumnType) -> Self {
        Self::new(IMAGE, feature, data_type)
    }

    pub fn experiment(feature: impl Into<String>, data_type: ColumnType) -> Self {
        Self::new(EXPERIMENT, feature, data_type)
    }

    pub fn available(mut self, availability: Availability) -> Self {
        self.availability = availability;
        self
    }

    /// Text before the first `_`.
    pub fn category(&self) -> &str {
        self.feature.split('_').next().unwrap_or("")
    }

    /// Second `_`-separated component of the feature name.
    pub fn measurement(&self) -> Option<&str> {
        self.feature.split('_').nth(1)
    }

    /// Remaining components after category and measurement.
    pub fn qualifiers(&self) -> Vec<&str> {
        self.feature.split('_').skip(2).collect()
    }
}

/// A declared relationship between two object sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRelationship {
    pub relationship: String,
    pub object_name1: String,
    pub object_name2: String,
}

/// Image feature naming a metadata key.
pub fn metadata_feature(key: &str) -> String {
    if key.starts_with(C_METADATA) && key[C_METADATA.len()..].starts_with('_') {
        key.to_string()
    } else {
        format!("{}_{}", C_METADATA, key)
    }
}
