//! Module lifecycle contract.
//!
//! A module is one configurable pipeline step. The pipeline drives every
//! module through the same contract:
//!
//! ```text
//! load:  upgrade_settings ─► prepare_settings ─► bind values
//! run:   prepare_run ─► (per group) prepare_group
//!                      ─► (per image set) run ─► display
//!                      ─► post_group
//!        ─► post_run
//! ```
//!
//! # Design
//!
//! - **Trait objects**: modules are `Box<dyn Module>` created by name through
//!   the `ModuleRegistry`, so new variants never touch the driver.
//! - **Text settings**: every `Setting` keeps the exact serialized text;
//!   typed access and validation sit on top.
//! - **Explicit migration**: `upgrade_chain` lists one pure step per
//!   revision that changed the setting list.
//! - **No hidden state**: anything carried between image sets lives in the
//!   slot's `SharedState`, reached through the `Workspace`.

pub mod builtin;
pub mod error;
pub mod registry;
pub mod setting;
pub mod shared_state;
pub mod upgrade;

pub use error::{ModuleError, ModuleResult};
pub use registry::{ModuleFactory, ModuleRegistry};
pub use setting::{NameGroup, Setting, SettingKind, ValidationContext, NO, NONE_NAME, YES};
pub use shared_state::{ModuleState, SharedState};
pub use upgrade::{MigrateFn, UpgradeChain, UpgradedSettings};

use crate::measurements::{GroupKey, Grouping, MeasurementColumn, ObjectRelationship};
use crate::pipeline::error::{PipelineError, PipelineResult, ValidationError};
use crate::pipeline::id::ImageNumber;
use crate::pipeline::workspace::Workspace;

/// A pipeline step.
///
/// Only `module_name`, `variable_revision_number`, the settings accessors and
/// `run` are required; every other hook has a neutral default.
pub trait Module: Send {
    /// Registry name, also written to saved pipelines.
    fn module_name(&self) -> &str;

    fn category(&self) -> &str {
        "Other"
    }

    /// Revision of the current setting list layout.
    fn variable_revision_number(&self) -> u32;

    // ==================== Settings ====================

    /// Every setting in serialization order. Must be stable across calls.
    fn settings(&self) -> Vec<&Setting>;

    /// Same order as `settings`.
    fn settings_mut(&mut self) -> Vec<&mut Setting>;

    /// The subset shown to the user and validated.
    fn visible_settings(&self) -> Vec<&Setting> {
        self.settings()
    }

    /// Reshape variable-length setting lists to fit `values` before binding.
    fn prepare_settings(&mut self, _values: &[String]) -> PipelineResult<()> {
        Ok(())
    }

    /// Migrations from every revision this module has ever saved.
    fn upgrade_chain(&self) -> UpgradeChain {
        UpgradeChain::new(self.variable_revision_number())
    }

    /// Map values saved at `revision` onto the current setting layout.
    fn upgrade_settings(
        &self,
        values: Vec<String>,
        revision: u32,
        module_name: &str,
        from_legacy: bool,
    ) -> PipelineResult<UpgradedSettings> {
        self.upgrade_chain()
            .apply(values, revision, module_name, from_legacy)
    }

    /// Upgrade, reshape, then bind `values` positionally.
    fn set_settings_from_values(
        &mut self,
        values: Vec<String>,
        revision: u32,
        module_name: &str,
        from_legacy: bool,
    ) -> PipelineResult<()> {
        let upgraded = self.upgrade_settings(values, revision, module_name, from_legacy)?;
        if upgraded.from_legacy {
            return Err(PipelineError::Upgrade {
                module_name: module_name.to_string(),
                revision,
                message: "settings from the legacy pipeline format cannot be converted".into(),
            });
        }
        if upgraded.revision != self.variable_revision_number() {
            return Err(PipelineError::Upgrade {
                module_name: module_name.to_string(),
                revision: upgraded.revision,
                message: format!(
                    "upgrade stopped before revision {}",
                    self.variable_revision_number()
                ),
            });
        }

        self.prepare_settings(&upgraded.values)?;
        let mut settings = self.settings_mut();
        if settings.len() != upgraded.values.len() {
            return Err(PipelineError::ValueCountMismatch {
                module_name: module_name.to_string(),
                expected: settings.len(),
                actual: upgraded.values.len(),
            });
        }
        for (setting, value) in settings.iter_mut().zip(upgraded.values) {
            setting.set_value(value);
        }
        Ok(())
    }

    /// Current values in serialization order.
    fn setting_values(&self) -> Vec<String> {
        self.settings()
            .into_iter()
            .map(|s| s.value().to_string())
            .collect()
    }

    /// Called once every module of a freshly loaded pipeline is bound.
    fn post_pipeline_load(&mut self) {}

    // ==================== Validation ====================

    /// Check each visible setting, then cross-setting invariants.
    fn test_valid(&self, ctx: &ValidationContext) -> Result<(), ValidationError> {
        for setting in self.visible_settings() {
            setting.test_valid(ctx)?;
        }
        self.validate_module(ctx)
    }

    fn validate_module(&self, _ctx: &ValidationContext) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Non-fatal advice. The run proceeds even when this fails.
    fn test_module_warnings(&self, ctx: &ValidationContext) -> Result<(), ValidationError> {
        for setting in self.visible_settings() {
            setting.test_setting_warnings()?;
        }
        self.validate_module_warnings(ctx)
    }

    fn validate_module_warnings(&self, _ctx: &ValidationContext) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Names provided without a provider setting.
    fn other_providers(&self) -> Vec<(NameGroup, String)> {
        Vec::new()
    }

    /// Every image and object name this module makes available downstream.
    fn provided_names(&self) -> Vec<(NameGroup, String)> {
        let mut names: Vec<(NameGroup, String)> = self
            .settings()
            .into_iter()
            .filter_map(|s| s.provided_name().map(|(g, n)| (g, n.to_string())))
            .collect();
        names.extend(self.other_providers());
        names
    }

    // ==================== Run hooks ====================

    /// Called once before any image set. May populate the image-set universe
    /// by writing image measurements. Returning `false` aborts the run.
    fn prepare_run(&mut self, _ws: &mut Workspace) -> ModuleResult<bool> {
        Ok(true)
    }

    /// The grouping this module imposes on the run, if any.
    fn get_groupings(&self, _ws: &Workspace) -> ModuleResult<Option<Grouping>> {
        Ok(None)
    }

    fn prepare_group(
        &mut self,
        _ws: &mut Workspace,
        _key: &GroupKey,
        _image_numbers: &[ImageNumber],
    ) -> ModuleResult<()> {
        Ok(())
    }

    /// Process the current image set.
    fn run(&mut self, ws: &mut Workspace) -> ModuleResult<()>;

    /// Render `ws.display_data`. Only called in runs that show displays.
    fn display(&self, _ws: &Workspace) {}

    /// Called after the last image set of a group. Aggregation modules must
    /// finish writing their group results here.
    fn post_group(
        &mut self,
        _ws: &mut Workspace,
        _key: &GroupKey,
        _image_numbers: &[ImageNumber],
    ) -> ModuleResult<()> {
        Ok(())
    }

    fn post_run(&mut self, _ws: &mut Workspace) -> ModuleResult<()> {
        Ok(())
    }

    /// Whether results depend on more than one image set.
    fn is_aggregation_module(&self) -> bool {
        false
    }

    // ==================== Measurement declarations ====================

    /// Every column `run`, `post_group` and `post_run` write.
    fn get_measurement_columns(&self) -> Vec<MeasurementColumn> {
        Vec::new()
    }

    fn get_categories(&self, object_name: &str) -> Vec<String> {
        let mut categories: Vec<String> = Vec::new();
        for column in self.get_measurement_columns() {
            let category = column.category();
            if column.object_name == object_name && !categories.iter().any(|c| c == category) {
                categories.push(category.to_string());
            }
        }
        categories
    }

    fn get_measurements(&self, object_name: &str, category: &str) -> Vec<String> {
        let mut measurements: Vec<String> = Vec::new();
        for column in self.get_measurement_columns() {
            if column.object_name != object_name || column.category() != category {
                continue;
            }
            if let Some(m) = column.measurement() {
                if !measurements.iter().any(|x| x == m) {
                    measurements.push(m.to_string());
                }
            }
        }
        measurements
    }

    /// Images a measurement was made on, when it is image-qualified.
    fn get_measurement_images(
        &self,
        _object_name: &str,
        _category: &str,
        _measurement: &str,
    ) -> Vec<String> {
        Vec::new()
    }

    /// Objects a measurement relates to, when it is object-qualified
    /// (e.g. a neighbor count measured against another object set).
    fn get_measurement_objects(
        &self,
        _object_name: &str,
        _category: &str,
        _measurement: &str,
    ) -> Vec<String> {
        Vec::new()
    }

    fn get_object_relationships(&self) -> Vec<ObjectRelationship> {
        Vec::new()
    }

    // ==================== Batch mode ====================

    /// Rewrite every stored path with `alter_path` so the pipeline resolves
    /// files on a remote host. Modules may also stash data in
    /// `ws.batch_state()`.
    fn prepare_to_create_batch(
        &mut self,
        _ws: &mut Workspace,
        alter_path: &dyn Fn(&str) -> String,
    ) -> ModuleResult<()> {
        for setting in self.settings_mut() {
            if *setting.kind() == SettingKind::DirectoryPath {
                let altered = alter_path(setting.value());
                setting.set_value(altered);
            }
        }
        Ok(())
    }

    /// Return to interactive editing after batch preparation.
    fn turn_off_batch_mode(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::{ColumnType, IMAGE};

    struct Stub {
        name: Setting,
        threshold: Setting,
    }

    impl Stub {
        fn new() -> Self {
            Self {
                name: Setting::image_subscriber("Input image", "DNA"),
                threshold: Setting::float("Threshold", 0.5, Some(0.0), Some(1.0)),
            }
        }
    }

    impl Module for Stub {
        fn module_name(&self) -> &str {
            "Stub"
        }

        fn variable_revision_number(&self) -> u32 {
            2
        }

        fn settings(&self) -> Vec<&Setting> {
            vec![&self.name, &self.threshold]
        }

        fn settings_mut(&mut self) -> Vec<&mut Setting> {
            vec![&mut self.name, &mut self.threshold]
        }

        fn upgrade_chain(&self) -> UpgradeChain {
            UpgradeChain::new(2).step(1, |mut v| {
                v.push("0.5".into());
                v
            })
        }

        fn run(&mut self, _ws: &mut Workspace) -> ModuleResult<()> {
            Ok(())
        }

        fn get_measurement_columns(&self) -> Vec<MeasurementColumn> {
            vec![
                MeasurementColumn::image("Threshold_Final_DNA", ColumnType::Float),
                MeasurementColumn::image("Threshold_Orig_DNA", ColumnType::Float),
                MeasurementColumn::image("Count_Nuclei", ColumnType::Integer),
            ]
        }
    }

    #[test]
    fn test_set_settings_round_trip() {
        let mut m = Stub::new();
        let values = vec!["OrigBlue".to_string(), "0.25".to_string()];
        m.set_settings_from_values(values.clone(), 2, "Stub", false)
            .unwrap();
        assert_eq!(m.setting_values(), values);
    }

    #[test]
    fn test_set_settings_upgrades_old_revision() {
        let mut m = Stub::new();
        m.set_settings_from_values(vec!["OrigBlue".into()], 1, "Stub", false)
            .unwrap();
        assert_eq!(m.setting_values(), vec!["OrigBlue", "0.5"]);
    }

    #[test]
    fn test_value_count_mismatch() {
        let mut m = Stub::new();
        let err = m
            .set_settings_from_values(vec!["a".into(), "b".into(), "c".into()], 2, "Stub", false)
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ValueCountMismatch {
                expected: 2,
                actual: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_legacy_values_are_rejected() {
        let mut m = Stub::new();
        let err = m
            .set_settings_from_values(vec!["a".into(), "b".into()], 2, "Stub", true)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Upgrade { .. }));
    }

    #[test]
    fn test_derived_categories_and_measurements() {
        let m = Stub::new();
        assert_eq!(m.get_categories(IMAGE), vec!["Threshold", "Count"]);
        assert_eq!(m.get_measurements(IMAGE, "Threshold"), vec!["Final", "Orig"]);
        assert!(m.get_categories("Nuclei").is_empty());
    }

    #[test]
    fn test_validation_points_at_setting() {
        let mut m = Stub::new();
        let mut ctx = ValidationContext::new();
        ctx.provide(NameGroup::Image, "DNA");
        assert!(m.test_valid(&ctx).is_ok());

        m.threshold.set_value("2");
        let err = m.test_valid(&ctx).unwrap_err();
        assert_eq!(err.setting_key, m.threshold.key());
    }
}
