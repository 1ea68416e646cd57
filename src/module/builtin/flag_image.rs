//! FlagImage: marks image sets whose measurements fall out of range.
//!
//! The setting list is variable length: three fixed settings followed by one
//! group of five per measurement checked. The hidden count setting lets
//! `prepare_settings` size the list before values are bound.

use crate::measurements::{metadata_feature, ColumnType, MeasurementColumn, IMAGE};
use crate::module::{Module, ModuleError, ModuleResult, Setting, ValidationContext};
use crate::pipeline::error::{PipelineError, PipelineResult, ValidationError};
use crate::pipeline::workspace::Workspace;

pub const MODULE_NAME: &str = "FlagImage";

const FIXED_SETTING_COUNT: usize = 3;
const GROUP_SETTING_COUNT: usize = 5;

pub const COMBINE_ANY: &str = "Flag if any fail";
pub const COMBINE_ALL: &str = "Flag if all fail";

/// One measurement checked against optional bounds.
struct MeasurementCheck {
    measurement: Setting,
    check_low: Setting,
    minimum: Setting,
    check_high: Setting,
    maximum: Setting,
}

impl MeasurementCheck {
    fn new() -> Self {
        Self {
            measurement: Setting::measurement("Which measurement?", "None"),
            check_low: Setting::binary("Flag images based on low values?", true),
            minimum: Setting::float("Minimum value", 0.0, None, None),
            check_high: Setting::binary("Flag images based on high values?", true),
            maximum: Setting::float("Maximum value", 1.0, None, None),
        }
    }

    fn settings(&self) -> [&Setting; GROUP_SETTING_COUNT] {
        [
            &self.measurement,
            &self.check_low,
            &self.minimum,
            &self.check_high,
            &self.maximum,
        ]
    }

    fn settings_mut(&mut self) -> [&mut Setting; GROUP_SETTING_COUNT] {
        [
            &mut self.measurement,
            &mut self.check_low,
            &mut self.minimum,
            &mut self.check_high,
            &mut self.maximum,
        ]
    }

    fn fails(&self, value: f64) -> Result<bool, ValidationError> {
        if value.is_nan() {
            return Ok(true);
        }
        let low = self.check_low.is_yes() && value < self.minimum.as_f64()?;
        let high = self.check_high.is_yes() && value > self.maximum.as_f64()?;
        Ok(low || high)
    }
}

pub struct FlagImage {
    flag_name: Setting,
    combine: Setting,
    check_count: Setting,
    checks: Vec<MeasurementCheck>,
}

impl FlagImage {
    pub fn new() -> Self {
        let mut module = Self {
            flag_name: Setting::text_value("Name the flag", "QCFlag"),
            combine: Setting::choice(
                "How should the measurements be combined?",
                &[COMBINE_ANY, COMBINE_ALL],
                COMBINE_ANY,
            ),
            check_count: Setting::integer("Measurement count", 0, Some(1), None),
            checks: Vec::new(),
        };
        module.add_check();
        module
    }

    /// Append another measurement check with default bounds.
    pub fn add_check(&mut self) {
        self.checks.push(MeasurementCheck::new());
        self.check_count.set_value(self.checks.len().to_string());
    }

    pub fn check_count(&self) -> usize {
        self.checks.len()
    }

    fn feature(&self) -> String {
        metadata_feature(self.flag_name.value())
    }
}

impl Default for FlagImage {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for FlagImage {
    fn module_name(&self) -> &str {
        MODULE_NAME
    }

    fn category(&self) -> &str {
        "Data Tools"
    }

    fn variable_revision_number(&self) -> u32 {
        1
    }

    fn settings(&self) -> Vec<&Setting> {
        let mut settings = vec![&self.flag_name, &self.combine, &self.check_count];
        for check in &self.checks {
            settings.extend(check.settings());
        }
        settings
    }

    fn settings_mut(&mut self) -> Vec<&mut Setting> {
        let mut settings = vec![
            &mut self.flag_name,
            &mut self.combine,
            &mut self.check_count,
        ];
        for check in &mut self.checks {
            settings.extend(check.settings_mut());
        }
        settings
    }

    fn visible_settings(&self) -> Vec<&Setting> {
        let mut visible = vec![&self.flag_name, &self.combine];
        for check in &self.checks {
            visible.push(&check.measurement);
            visible.push(&check.check_low);
            if check.check_low.is_yes() {
                visible.push(&check.minimum);
            }
            visible.push(&check.check_high);
            if check.check_high.is_yes() {
                visible.push(&check.maximum);
            }
        }
        visible
    }

    fn prepare_settings(&mut self, values: &[String]) -> PipelineResult<()> {
        let Some(count) = values.get(FIXED_SETTING_COUNT - 1) else {
            // Too short to hold the count; binding reports the mismatch.
            return Ok(());
        };
        let mismatch = |expected: usize| PipelineError::ValueCountMismatch {
            module_name: MODULE_NAME.to_string(),
            expected,
            actual: values.len(),
        };
        let count: usize = count
            .trim()
            .parse()
            .map_err(|_| mismatch(FIXED_SETTING_COUNT))?;
        // The count must agree with the values before any group is allocated.
        let expected = count
            .checked_mul(GROUP_SETTING_COUNT)
            .and_then(|n| n.checked_add(FIXED_SETTING_COUNT))
            .ok_or_else(|| mismatch(usize::MAX))?;
        if expected != values.len() {
            return Err(mismatch(expected));
        }
        self.checks.truncate(count);
        self.checks.resize_with(count, MeasurementCheck::new);
        Ok(())
    }

    fn validate_module(&self, _ctx: &ValidationContext) -> Result<(), ValidationError> {
        if self.checks.is_empty() {
            return Err(ValidationError::new(
                "Add at least one measurement to check",
                &self.check_count,
            ));
        }
        for check in &self.checks {
            if !check.check_low.is_yes() && !check.check_high.is_yes() {
                return Err(ValidationError::new(
                    "Check low values, high values, or both",
                    &check.check_low,
                ));
            }
            if check.check_low.is_yes()
                && check.check_high.is_yes()
                && check.minimum.as_f64()? > check.maximum.as_f64()?
            {
                return Err(ValidationError::new(
                    "The minimum must not exceed the maximum",
                    &check.minimum,
                ));
            }
        }
        Ok(())
    }

    fn run(&mut self, ws: &mut Workspace) -> ModuleResult<()> {
        let n = ws.image_number()?;
        let mut failures = Vec::with_capacity(self.checks.len());
        for check in &self.checks {
            let feature = check.measurement.value();
            let value = ws
                .measurements
                .get_image_measurement(feature, n)
                .and_then(|v| v.as_f64())
                .ok_or_else(|| ModuleError::MissingMeasurement {
                    object_name: IMAGE.to_string(),
                    feature: feature.to_string(),
                    image_number: n,
                })?;
            failures.push(check.fails(value)?);
        }

        let flagged = if self.combine.value() == COMBINE_ALL {
            failures.iter().all(|f| *f)
        } else {
            failures.iter().any(|f| *f)
        };
        ws.measurements
            .add_image_measurement(n, &self.feature(), flagged as i64);
        ws.display_data
            .insert("flagged".into(), serde_json::Value::Bool(flagged));
        Ok(())
    }

    fn get_measurement_columns(&self) -> Vec<MeasurementColumn> {
        vec![MeasurementColumn::image(self.feature(), ColumnType::Integer)]
    }
}
