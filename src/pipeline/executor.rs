//! The pipeline: an ordered list of module slots.
//!
//! Editing keeps `module_num` equal to list position. Loading is
//! all-or-nothing: a new slot list is built and only swapped in once every
//! record resolved, upgraded and bound.

use crate::measurements::column::{
    EXIT_STATUS, GROUP_INDEX, GROUP_NUMBER, PIPELINE_TEXT, RUN_TIMESTAMP, SHARED_STATE,
};
use crate::measurements::file::looks_like_measurements;
use crate::measurements::{ColumnType, MeasurementColumn, Measurements, EXPERIMENT};
use crate::module::{Module, ModuleRegistry, ValidationContext};
use crate::pipeline::error::{PipelineError, PipelineResult, ValidationError};
use crate::pipeline::events::{Listeners, PipelineEvent, PipelineListener};
use crate::pipeline::format::{self, PipelineDocument};
use crate::pipeline::id::ModuleNum;
use crate::pipeline::slot::ModuleSlot;
use crate::pipeline::workspace::{ImageSetData, Workspace};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Pipeline text outgrows the default varchar width.
const LONG_TEXT_LEN: usize = 65_535;

pub struct Pipeline {
    pub(crate) slots: Vec<ModuleSlot>,
    registry: Arc<ModuleRegistry>,
    pub(crate) listeners: Listeners,
    pub(crate) batch_mode: bool,
    message_for_user: Option<(String, String)>,
}

impl Pipeline {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self {
            slots: Vec::new(),
            registry,
            listeners: Listeners::default(),
            batch_mode: false,
            message_for_user: None,
        }
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn add_listener(&mut self, listener: impl PipelineListener + 'static) {
        self.listeners.push(Box::new(listener));
    }

    // ── Access ──

    pub fn modules(&self) -> &[ModuleSlot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn module(&self, module_num: ModuleNum) -> PipelineResult<&ModuleSlot> {
        self.check_module_num(module_num)?;
        Ok(&self.slots[module_num.index()])
    }

    pub fn module_mut(&mut self, module_num: ModuleNum) -> PipelineResult<&mut ModuleSlot> {
        self.check_module_num(module_num)?;
        Ok(&mut self.slots[module_num.index()])
    }

    pub fn is_batch_mode(&self) -> bool {
        self.batch_mode
    }

    pub fn message_for_user(&self) -> Option<(&str, &str)> {
        self.message_for_user
            .as_ref()
            .map(|(c, m)| (c.as_str(), m.as_str()))
    }

    pub fn set_message_for_user(&mut self, caption: impl Into<String>, message: impl Into<String>) {
        self.message_for_user = Some((caption.into(), message.into()));
    }

    fn check_module_num(&self, module_num: ModuleNum) -> PipelineResult<()> {
        if module_num.0 == 0 || module_num.index() >= self.slots.len() {
            return Err(PipelineError::InvalidModuleNum(module_num));
        }
        Ok(())
    }

    fn renumber(&mut self) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.set_module_num(ModuleNum::from_index(i));
        }
    }

    // ── Editing ──

    /// Append `module`. Returns its module number.
    pub fn add_module(&mut self, module: Box<dyn Module>) -> ModuleNum {
        self.slots.push(ModuleSlot::new(module));
        self.renumber();
        let module_num = ModuleNum::from_index(self.slots.len() - 1);
        self.listeners.notify(PipelineEvent::ModuleAdded(module_num));
        module_num
    }

    /// Append a registered module with default settings.
    pub fn add_module_by_name(&mut self, name: &str) -> PipelineResult<ModuleNum> {
        let module = self.registry.create(name)?;
        Ok(self.add_module(module))
    }

    /// Insert `module` so that it becomes `module_num`, shifting later modules.
    pub fn insert_module(&mut self, module_num: ModuleNum, module: Box<dyn Module>) -> PipelineResult<()> {
        if module_num.0 == 0 || module_num.index() > self.slots.len() {
            return Err(PipelineError::InvalidModuleNum(module_num));
        }
        self.slots.insert(module_num.index(), ModuleSlot::new(module));
        self.renumber();
        self.listeners.notify(PipelineEvent::ModuleAdded(module_num));
        Ok(())
    }

    pub fn remove_module(&mut self, module_num: ModuleNum) -> PipelineResult<ModuleSlot> {
        self.check_module_num(module_num)?;
        let slot = self.slots.remove(module_num.index());
        self.renumber();
        tracing::debug!("Removed {} ({})", slot.module_name(), module_num);
        self.listeners.notify(PipelineEvent::ModuleRemoved(module_num));
        Ok(slot)
    }

    /// Move the module at `from` so it ends up at position `to`.
    pub fn move_module(&mut self, from: ModuleNum, to: ModuleNum) -> PipelineResult<()> {
        self.check_module_num(from)?;
        self.check_module_num(to)?;
        if from == to {
            return Ok(());
        }
        let slot = self.slots.remove(from.index());
        self.slots.insert(to.index(), slot);
        self.renumber();
        self.listeners.notify(PipelineEvent::ModuleMoved { from, to });
        Ok(())
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.batch_mode = false;
        self.message_for_user = None;
        self.listeners.notify(PipelineEvent::Cleared);
    }

    /// Set the value of the setting identified by `key`.
    pub fn edit_setting(
        &mut self,
        module_num: ModuleNum,
        key: Uuid,
        value: impl Into<String>,
    ) -> PipelineResult<()> {
        if self.batch_mode {
            return Err(PipelineError::BatchModeLocked(module_num));
        }
        let slot = self.module_mut(module_num)?;
        let setting = slot
            .module
            .settings_mut()
            .into_iter()
            .find(|s| s.key() == key)
            .ok_or(PipelineError::UnknownSetting(module_num, key))?;
        setting.set_value(value);
        self.listeners.notify(PipelineEvent::ModuleEdited(module_num));
        Ok(())
    }

    pub fn set_enabled(&mut self, module_num: ModuleNum, enabled: bool) -> PipelineResult<()> {
        if self.batch_mode {
            return Err(PipelineError::BatchModeLocked(module_num));
        }
        self.module_mut(module_num)?.enabled = enabled;
        self.listeners.notify(PipelineEvent::ModuleEdited(module_num));
        Ok(())
    }

    // ── Load / save ──

    /// Replace the pipeline with the one in `text`.
    ///
    /// `text` may also be a measurements file, in which case the pipeline it
    /// was produced with is loaded. On error the pipeline is left unchanged.
    pub fn load_text(&mut self, text: &str) -> PipelineResult<()> {
        if looks_like_measurements(text) {
            let measurements = Measurements::from_json(text, Some(&[]))?;
            let pipeline_text = measurements
                .get_experiment_measurement(PIPELINE_TEXT)
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    PipelineError::Measurements(format!("no {} experiment measurement", PIPELINE_TEXT))
                })?;
            return self.load_document(format::parse(pipeline_text)?);
        }
        self.load_document(format::parse(text)?)
    }

    pub fn load(&mut self, path: impl AsRef<Path>) -> PipelineResult<()> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        self.load_text(&text)?;
        tracing::info!("Loaded pipeline {}", path.display());
        Ok(())
    }

    fn load_document(&mut self, doc: PipelineDocument) -> PipelineResult<()> {
        let mut slots = Vec::with_capacity(doc.records.len());
        for (i, record) in doc.records.into_iter().enumerate() {
            let mut module = self.registry.create(&record.class_name)?;
            module.set_settings_from_values(
                record.values(),
                record.revision,
                &record.class_name,
                record.from_legacy,
            )?;
            let mut slot = ModuleSlot::new(module);
            slot.set_module_num(ModuleNum::from_index(i));
            slot.show_window = record.show_window;
            slot.enabled = record.enabled;
            slot.wants_pause = record.wants_pause;
            slot.notes = record.notes;
            slot.state.batch_state = record.batch_state;
            slots.push(slot);
        }
        for slot in &mut slots {
            slot.module.post_pipeline_load();
        }

        self.slots = slots;
        self.batch_mode = doc.batch_mode;
        self.message_for_user = doc.message_for_user;
        tracing::debug!(
            "Pipeline has {} modules{}",
            self.slots.len(),
            if self.batch_mode { " (batch mode)" } else { "" }
        );
        self.listeners.notify(PipelineEvent::Loaded {
            module_count: self.slots.len(),
        });
        if let Some((caption, message)) = &self.message_for_user {
            self.listeners.notify(PipelineEvent::MessageForUser {
                caption: caption.clone(),
                message: message.clone(),
            });
        }
        Ok(())
    }

    pub fn to_text(&self) -> String {
        format::write(&PipelineDocument {
            batch_mode: self.batch_mode,
            message_for_user: self.message_for_user.clone(),
            records: self.slots.iter().map(ModuleSlot::to_record).collect(),
            ..PipelineDocument::default()
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> PipelineResult<()> {
        std::fs::write(path.as_ref(), self.to_text())?;
        tracing::info!("Saved pipeline to {}", path.as_ref().display());
        Ok(())
    }

    // ── Validation ──

    /// Validate every enabled module against the names provided upstream.
    pub fn test_valid(&self) -> Result<(), ValidationError> {
        let mut ctx = ValidationContext::new();
        for slot in self.slots.iter().filter(|s| s.enabled) {
            slot.module
                .test_valid(&ctx)
                .map_err(|e| e.in_module(slot.module_num()))?;
            for (group, name) in slot.module.provided_names() {
                ctx.provide(group, name);
            }
        }
        Ok(())
    }

    /// Non-fatal advice from every enabled module.
    pub fn test_warnings(&self) -> Vec<ValidationError> {
        let mut ctx = ValidationContext::new();
        let mut warnings = Vec::new();
        for slot in self.slots.iter().filter(|s| s.enabled) {
            if let Err(e) = slot.module.test_module_warnings(&ctx) {
                warnings.push(e.in_module(slot.module_num()));
            }
            for (group, name) in slot.module.provided_names() {
                ctx.provide(group, name);
            }
        }
        warnings
    }

    // ── Measurements ──

    /// Every column a run writes: the pipeline's own plus those of each
    /// enabled module.
    pub fn get_measurement_columns(&self) -> Vec<MeasurementColumn> {
        let mut columns = vec![
            MeasurementColumn::new(EXPERIMENT, PIPELINE_TEXT, ColumnType::Varchar(LONG_TEXT_LEN)),
            MeasurementColumn::experiment(RUN_TIMESTAMP, ColumnType::varchar()),
            MeasurementColumn::experiment(EXIT_STATUS, ColumnType::varchar()),
            MeasurementColumn::image(GROUP_NUMBER, ColumnType::Integer),
            MeasurementColumn::image(GROUP_INDEX, ColumnType::Integer),
        ];
        if self.batch_mode {
            columns.push(MeasurementColumn::experiment(SHARED_STATE, ColumnType::Varchar(LONG_TEXT_LEN)));
        }
        for slot in self.slots.iter().filter(|s| s.enabled) {
            columns.extend(slot.module.get_measurement_columns());
            columns.push(MeasurementColumn::image(slot.error_feature(), ColumnType::Integer));
        }
        columns
    }

    // ── Batch mode ──

    /// Prepare every module for execution on another host.
    ///
    /// `alter_path` maps local paths to the remote host's. The pipeline is in
    /// batch mode afterwards and rejects edits until `turn_off_batch_mode`.
    pub fn prepare_to_create_batch(
        &mut self,
        measurements: &mut Measurements,
        alter_path: &dyn Fn(&str) -> String,
    ) -> PipelineResult<()> {
        let mut data = ImageSetData::default();
        for slot in self.slots.iter_mut() {
            let module_num = slot.module_num();
            let ModuleSlot { module, state, .. } = slot;
            let mut ws = Workspace::new(module_num, measurements, &mut data, state);
            module
                .prepare_to_create_batch(&mut ws, alter_path)
                .map_err(|e| PipelineError::RunException {
                    module_num,
                    module_name: module.module_name().to_string(),
                    stage: crate::pipeline::error::RunStage::PrepareRun,
                    image_number: None,
                    message: e.to_string(),
                })?;
        }
        self.batch_mode = true;
        Ok(())
    }

    /// Every slot's shared state in module order, as handed to workers.
    pub fn shared_state_for_workers(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.slots
                .iter()
                .map(|s| s.state.shared_state.for_worker())
                .collect(),
        )
    }

    /// Return to interactive editing.
    pub fn turn_off_batch_mode(&mut self) {
        for slot in &mut self.slots {
            slot.module.turn_off_batch_mode();
        }
        self.batch_mode = false;
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(Arc::new(ModuleRegistry::with_builtins()))
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("modules", &self.slots)
            .field("batch_mode", &self.batch_mode)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::builtin::{FlagImage, LoadImages, MeasureImageIntensity};
    use crate::pipeline::events::MockPipelineListener;
    use mockall::predicate::eq;
    use mockall::Sequence;

    fn three_modules() -> Pipeline {
        let mut p = Pipeline::default();
        p.add_module(Box::new(LoadImages::new()));
        p.add_module(Box::new(MeasureImageIntensity::new()));
        p.add_module(Box::new(FlagImage::new()));
        p
    }

    fn names(p: &Pipeline) -> Vec<(u32, &str)> {
        p.modules()
            .iter()
            .map(|s| (s.module_num().0, s.module_name()))
            .collect()
    }

    #[test]
    fn test_module_nums_follow_position() {
        let mut p = three_modules();
        assert_eq!(
            names(&p),
            vec![(1, "LoadImages"), (2, "MeasureImageIntensity"), (3, "FlagImage")]
        );

        p.move_module(ModuleNum(3), ModuleNum(1)).unwrap();
        assert_eq!(
            names(&p),
            vec![(1, "FlagImage"), (2, "LoadImages"), (3, "MeasureImageIntensity")]
        );

        p.remove_module(ModuleNum(1)).unwrap();
        assert_eq!(names(&p), vec![(1, "LoadImages"), (2, "MeasureImageIntensity")]);

        p.insert_module(ModuleNum(2), Box::new(FlagImage::new())).unwrap();
        assert_eq!(
            names(&p),
            vec![(1, "LoadImages"), (2, "FlagImage"), (3, "MeasureImageIntensity")]
        );
    }

    #[test]
    fn test_invalid_module_num() {
        let mut p = three_modules();
        assert!(matches!(
            p.remove_module(ModuleNum(4)),
            Err(PipelineError::InvalidModuleNum(_))
        ));
        assert!(p.module(ModuleNum(0)).is_err());
        assert!(p.insert_module(ModuleNum(5), Box::new(FlagImage::new())).is_err());
    }

    #[test]
    fn test_editing_events() {
        let mut listener = MockPipelineListener::new();
        let mut seq = Sequence::new();
        listener
            .expect_on_event()
            .with(eq(PipelineEvent::ModuleAdded(ModuleNum(1))))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        listener
            .expect_on_event()
            .with(eq(PipelineEvent::ModuleAdded(ModuleNum(2))))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        listener
            .expect_on_event()
            .with(eq(PipelineEvent::ModuleMoved {
                from: ModuleNum(2),
                to: ModuleNum(1),
            }))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        listener
            .expect_on_event()
            .with(eq(PipelineEvent::Cleared))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());

        let mut p = Pipeline::default();
        p.add_listener(listener);
        p.add_module(Box::new(LoadImages::new()));
        p.add_module(Box::new(FlagImage::new()));
        p.move_module(ModuleNum(2), ModuleNum(1)).unwrap();
        p.clear();
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut p = three_modules();
        {
            let slot = p.module_mut(ModuleNum(2)).unwrap();
            slot.show_window = true;
            slot.notes = vec!["Whole-image stats".into()];
        }
        p.set_enabled(ModuleNum(3), false).unwrap();
        let key = p.modules()[1].module.settings()[0].key();
        p.edit_setting(ModuleNum(2), key, "OrigBlue").unwrap();

        let text = p.to_text();
        let mut loaded = Pipeline::default();
        loaded.load_text(&text).unwrap();
        assert_eq!(loaded.to_text(), text);

        let slot = loaded.module(ModuleNum(2)).unwrap();
        assert!(slot.show_window);
        assert_eq!(slot.notes, vec!["Whole-image stats"]);
        assert_eq!(slot.module.setting_values()[0], "OrigBlue");
        assert!(!loaded.module(ModuleNum(3)).unwrap().enabled);
    }

    #[test]
    fn test_failed_load_leaves_pipeline_unchanged() {
        let mut p = three_modules();
        let before = p.to_text();
        let bad = before.replace("FlagImage:[", "NoSuchModule:[");
        assert!(matches!(
            p.load_text(&bad),
            Err(PipelineError::UnknownModule(name)) if name == "NoSuchModule"
        ));
        assert_eq!(p.to_text(), before);
    }

    #[test]
    fn test_dotted_and_renamed_class_names_load() {
        let p = three_modules();
        let text = p
            .to_text()
            .replace("FlagImage:[", "cellprofiler.modules.flagimage.FlagImages:[");
        let mut loaded = Pipeline::default();
        loaded.load_text(&text).unwrap();
        assert_eq!(loaded.modules()[2].module_name(), "FlagImage");
    }

    #[test]
    fn test_batch_mode_locks_edits() {
        let mut p = three_modules();
        let mut m = Measurements::new();
        p.prepare_to_create_batch(&mut m, &|path| path.to_string())
            .unwrap();
        assert!(p.is_batch_mode());
        let key = p.modules()[1].module.settings()[0].key();
        assert!(matches!(
            p.edit_setting(ModuleNum(2), key, "x"),
            Err(PipelineError::BatchModeLocked(_))
        ));

        p.turn_off_batch_mode();
        assert!(p.edit_setting(ModuleNum(2), key, "x").is_ok());
    }

    #[test]
    fn test_unknown_setting_key() {
        let mut p = three_modules();
        assert!(matches!(
            p.edit_setting(ModuleNum(1), Uuid::new_v4(), "x"),
            Err(PipelineError::UnknownSetting(..))
        ));
    }

    #[test]
    fn test_validation_uses_upstream_names() {
        let mut p = Pipeline::default();
        p.add_module(Box::new(MeasureImageIntensity::new()));
        let err = p.test_valid().unwrap_err();
        assert_eq!(err.module_num, Some(ModuleNum(1)));

        p.insert_module(ModuleNum(1), Box::new(LoadImages::new())).unwrap();
        // LoadImages provides "DNA", but its folder setting is still empty.
        let names_ok = p.test_valid().map_err(|e| e.module_num);
        assert_ne!(names_ok, Err(Some(ModuleNum(2))));
    }

    #[test]
    fn test_columns_include_pipeline_features() {
        let p = three_modules();
        let columns = p.get_measurement_columns();
        assert!(columns.iter().any(|c| c.feature == PIPELINE_TEXT));
        assert!(columns.iter().any(|c| c.feature == GROUP_NUMBER));
        assert!(columns.iter().any(|c| c.feature == "ModuleError_03FlagImage"));
        assert!(columns
            .iter()
            .any(|c| c.feature == "Intensity_MeanIntensity_DNA"));
    }
}
