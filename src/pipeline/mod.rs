//! Pipeline: ordered modules, persistence and execution.
//!
//! A pipeline owns an ordered list of module slots. It is loaded from and
//! saved to a line-oriented text format, and driven headlessly over the
//! image sets its modules produce.
//!
//! # Architecture
//!
//! ```text
//! text ──► format::parse ──► ModuleRecord ──► registry ──► ModuleSlot
//!                                                            │
//! RunOptions ──► Pipeline::run ──► prepare_run ──► grouping ─┤
//!                                   per group / image set ◄──┘
//!                                        │
//!                                        ▼
//!                            Measurements + PipelineEvent
//! ```
//!
//! # Design
//!
//! - **Positional numbering**: `ModuleNum` is recomputed on every edit.
//! - **All-or-nothing load**: a failed load leaves the pipeline unchanged.
//! - **Explicit error policy**: `ErrorPolicy` decides whether a failing
//!   image set aborts the run; `prepare_run`/`prepare_group` failures always do.
//! - **Checked aggregation**: post-group columns must exist for every image
//!   set of the group once `post_group` returns.

pub mod error;
pub mod events;
pub mod executor;
pub mod format;
pub mod grouping;
pub mod id;
pub mod run;
pub mod slot;
pub mod workspace;

pub use error::{PipelineError, PipelineResult, RunStage, ValidationError};
pub use events::{PipelineEvent, PipelineListener, RunStatus};
pub use executor::Pipeline;
pub use format::{add_message_for_user, ModuleRecord, PipelineDocument};
pub use id::{ImageNumber, ImageNumberRange, ModuleNum};
pub use run::{ErrorPolicy, RunOptions, RunOutcome};
pub use slot::ModuleSlot;
pub use workspace::{DisplayData, Image, ImageSet, ImageSetData, ObjectSet, Objects, Workspace};
