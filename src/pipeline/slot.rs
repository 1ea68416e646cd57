//! A module together with the per-pipeline flags and state around it.

use crate::module::{Module, ModuleState};
use crate::pipeline::format::ModuleRecord;
use crate::pipeline::id::ModuleNum;

/// A module's place in a pipeline.
///
/// `module_num` is positional; the owning pipeline renumbers every slot
/// whenever the module order changes.
pub struct ModuleSlot {
    pub module: Box<dyn Module>,
    module_num: ModuleNum,
    pub enabled: bool,
    pub show_window: bool,
    /// Ask the front end to pause after this module runs.
    pub wants_pause: bool,
    pub notes: Vec<String>,
    pub state: ModuleState,
}

impl ModuleSlot {
    pub fn new(module: Box<dyn Module>) -> Self {
        Self {
            module,
            module_num: ModuleNum(0),
            enabled: true,
            show_window: false,
            wants_pause: false,
            notes: Vec::new(),
            state: ModuleState::default(),
        }
    }

    pub fn module_num(&self) -> ModuleNum {
        self.module_num
    }

    pub(crate) fn set_module_num(&mut self, module_num: ModuleNum) {
        self.module_num = module_num;
    }

    pub fn module_name(&self) -> &str {
        self.module.module_name()
    }

    /// Image feature set to 1 for an image set this module failed on.
    pub fn error_feature(&self) -> String {
        module_error_feature(self.module_num, self.module_name())
    }

    pub(crate) fn to_record(&self) -> ModuleRecord {
        let mut record = ModuleRecord::new(self.module_name(), self.module.variable_revision_number());
        record.module_num = Some(self.module_num.0);
        record.show_window = self.show_window;
        record.enabled = self.enabled;
        record.wants_pause = self.wants_pause;
        record.notes = self.notes.clone();
        record.batch_state = self.state.batch_state.clone();
        record.settings = self
            .module
            .settings()
            .into_iter()
            .map(|s| (s.text().to_string(), s.value().to_string()))
            .collect();
        record
    }
}

/// `ModuleError_03FlagImage` for module 3.
pub fn module_error_feature(module_num: ModuleNum, module_name: &str) -> String {
    format!(
        "{}_{:02}{}",
        crate::measurements::column::MODULE_ERROR,
        module_num.0,
        module_name
    )
}

impl std::fmt::Debug for ModuleSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleSlot")
            .field("module", &self.module_name())
            .field("module_num", &self.module_num)
            .field("enabled", &self.enabled)
            .field("show_window", &self.show_window)
            .finish()
    }
}
