//! # cellpipe: image-analysis pipeline engine
//!
//! Loads a declarative list of analysis modules with versioned settings,
//! drives every module through its lifecycle over an ordered set of image
//! sets (optionally partitioned into metadata-defined groups), and stores
//! the results as typed measurement columns.
//!
//! ## Architecture
//!
//! - **Module**: the lifecycle contract, settings, settings upgrade chain and
//!   the registry of built-in modules
//! - **Pipeline**: ordered module slots, the text format, the execution
//!   driver and grouping coordinator
//! - **Measurements**: the column store and its JSON file
//! - **Batch**: path rewriting and per-group command generation for running
//!   a pipeline across a cluster, one process per group
//!
//! ## Example
//!
//! ```ignore
//! use cellpipe::{Pipeline, RunOptions, ErrorPolicy};
//!
//! let mut pipeline = Pipeline::default();
//! pipeline.load("analysis.cppipe")?;
//!
//! let options = RunOptions::new().with_error_policy(ErrorPolicy::Skip);
//! let outcome = pipeline.run(&options, None)?;
//! outcome.measurements.save("out.json")?;
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod measurements;
pub mod module;
pub mod pipeline;

// Re-export commonly used types
pub use batch::{PathMapper, PathMapping};
pub use config::{Preferences, RunConfig};
pub use error::{CellPipeError, Result};
pub use measurements::{GroupKey, MeasurementColumn, Measurements};
pub use module::{Module, ModuleRegistry, Setting};
pub use pipeline::{
    ErrorPolicy, ImageNumber, ModuleNum, Pipeline, PipelineError, PipelineEvent, RunOptions,
    RunOutcome, RunStatus,
};
