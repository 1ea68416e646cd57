//! Pipeline events and listeners.
//!
//! Listeners observe editing, loading and running. They are notified
//! synchronously, in registration order, on the thread driving the pipeline.

use crate::measurements::GroupKey;
use crate::pipeline::error::RunStage;
use crate::pipeline::id::{ImageNumber, ModuleNum};
use crate::pipeline::workspace::DisplayData;
use crossbeam_channel::Sender;

/// Final state of a run, recorded as the `Exit_Status` experiment feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => crate::measurements::column::STATUS_SUCCESS,
            RunStatus::Failure => crate::measurements::column::STATUS_FAILURE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    // ── Editing ──
    Loaded { module_count: usize },
    Cleared,
    ModuleAdded(ModuleNum),
    ModuleRemoved(ModuleNum),
    ModuleMoved { from: ModuleNum, to: ModuleNum },
    ModuleEdited(ModuleNum),
    MessageForUser { caption: String, message: String },

    // ── Running ──
    RunStarted,
    /// Non-fatal advice from `test_module_warnings`.
    ValidationWarning { module_num: ModuleNum, message: String },
    PrepareRunComplete { image_count: usize },
    GroupStarted { key: GroupKey, image_numbers: Vec<ImageNumber> },
    ImageSetStarted(ImageNumber),
    ModuleRunComplete { module_num: ModuleNum, image_number: ImageNumber },
    Display { module_num: ModuleNum, image_number: ImageNumber, data: DisplayData },
    PauseRequested { module_num: ModuleNum, image_number: ImageNumber },
    ImageSetComplete(ImageNumber),
    GroupComplete { key: GroupKey },
    RunException {
        module_num: ModuleNum,
        module_name: String,
        stage: RunStage,
        image_number: Option<ImageNumber>,
        message: String,
        /// Whether the run stops because of this failure.
        fatal: bool,
    },
    RunFinished(RunStatus),
}

/// Receives pipeline events.
#[cfg_attr(test, mockall::automock)]
pub trait PipelineListener: Send {
    fn on_event(&self, event: &PipelineEvent);
}

impl<F> PipelineListener for F
where
    F: Fn(&PipelineEvent) + Send,
{
    fn on_event(&self, event: &PipelineEvent) {
        self(event)
    }
}

/// Forward events to another thread, e.g. a progress display.
impl PipelineListener for Sender<PipelineEvent> {
    fn on_event(&self, event: &PipelineEvent) {
        // A dropped receiver just stops listening.
        let _ = self.send(event.clone());
    }
}

/// Registered listeners, notified in registration order.
#[derive(Default)]
pub(crate) struct Listeners(Vec<Box<dyn PipelineListener>>);

impl Listeners {
    pub fn push(&mut self, listener: Box<dyn PipelineListener>) {
        self.0.push(listener);
    }

    pub fn notify(&self, event: PipelineEvent) {
        for listener in &self.0 {
            listener.on_event(&event);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}
