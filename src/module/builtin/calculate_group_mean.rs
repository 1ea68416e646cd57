//! CalculateGroupMean: averages an image measurement over each group.
//!
//! Values are collected in the module's shared state while the group runs
//! and the mean is written back to every image set of the group in
//! `post_group`.

use crate::measurements::{Availability, ColumnType, GroupKey, MeasurementColumn, IMAGE};
use crate::module::{Module, ModuleError, ModuleResult, Setting, ValidationContext};
use crate::pipeline::error::ValidationError;
use crate::pipeline::id::ImageNumber;
use crate::pipeline::workspace::Workspace;

pub const MODULE_NAME: &str = "CalculateGroupMean";

const C_GROUP_MEAN: &str = "GroupMean";
const STATE_VALUES: &str = "values";

pub struct CalculateGroupMean {
    measurement: Setting,
    output_name: Setting,
}

impl CalculateGroupMean {
    pub fn new() -> Self {
        Self {
            measurement: Setting::measurement("Measurement to average", "Intensity_MeanIntensity_DNA"),
            output_name: Setting::text_value("Name the group mean feature", "MeanIntensity"),
        }
    }

    fn feature(&self) -> String {
        format!("{}_{}", C_GROUP_MEAN, self.output_name.value())
    }
}

impl Default for CalculateGroupMean {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for CalculateGroupMean {
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
        vec![&self.measurement, &self.output_name]
    }

    fn settings_mut(&mut self) -> Vec<&mut Setting> {
        vec![&mut self.measurement, &mut self.output_name]
    }

    fn validate_module(&self, _ctx: &ValidationContext) -> Result<(), ValidationError> {
        let name = self.output_name.value();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(ValidationError::new(
                "The feature name must be a single word",
                &self.output_name,
            ));
        }
        Ok(())
    }

    fn prepare_group(
        &mut self,
        ws: &mut Workspace,
        _key: &GroupKey,
        _image_numbers: &[ImageNumber],
    ) -> ModuleResult<()> {
        ws.shared_state().set(STATE_VALUES, Vec::<f64>::new())?;
        Ok(())
    }

    fn run(&mut self, ws: &mut Workspace) -> ModuleResult<()> {
        let n = ws.image_number()?;
        let feature = self.measurement.value();
        let value = ws
            .measurements
            .get_image_measurement(feature, n)
            .and_then(|v| v.as_f64())
            .ok_or_else(|| ModuleError::MissingMeasurement {
                object_name: IMAGE.to_string(),
                feature: feature.to_string(),
                image_number: n,
            })?;

        let mut values: Vec<f64> = ws.shared_state().get(STATE_VALUES).unwrap_or_default();
        // JSON has no NaN
        if value.is_finite() {
            values.push(value);
        }
        ws.shared_state().set(STATE_VALUES, values)?;
        Ok(())
    }

    fn post_group(
        &mut self,
        ws: &mut Workspace,
        key: &GroupKey,
        image_numbers: &[ImageNumber],
    ) -> ModuleResult<()> {
        let values: Vec<f64> = ws.shared_state().get(STATE_VALUES).unwrap_or_default();
        let mean = if values.is_empty() {
            f64::NAN
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        };
        tracing::debug!("Group [{}] mean of {}: {}", key, self.measurement.value(), mean);

        let feature = self.feature();
        for &n in image_numbers {
            ws.measurements.add_image_measurement(n, &feature, mean);
        }
        ws.shared_state().remove(STATE_VALUES);
        Ok(())
    }

    fn is_aggregation_module(&self) -> bool {
        true
    }

    fn get_measurement_columns(&self) -> Vec<MeasurementColumn> {
        vec![MeasurementColumn::image(self.feature(), ColumnType::Float)
            .available(Availability::PostGroup)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::{MeasurementValue, Measurements};
    use crate::module::ModuleState;
    use crate::pipeline::id::ModuleNum;
    use crate::pipeline::workspace::ImageSetData;

    #[test]
    fn test_mean_written_to_every_image_set() {
        let mut module = CalculateGroupMean::new();
        let mut m = Measurements::new();
        let images = [ImageNumber(1), ImageNumber(2), ImageNumber(3)];
        for (n, v) in images.iter().zip([0.2, 0.4, f64::NAN]) {
            m.add_image_measurement(*n, "Intensity_MeanIntensity_DNA", v);
        }

        let mut data = ImageSetData::default();
        let mut state = ModuleState::default();
        let key = GroupKey::new();
        module
            .prepare_group(
                &mut Workspace::new(ModuleNum(1), &mut m, &mut data, &mut state),
                &key,
                &images,
            )
            .unwrap();
        for n in images {
            let mut ws = Workspace::new(ModuleNum(1), &mut m, &mut data, &mut state).at_image(n);
            module.run(&mut ws).unwrap();
        }
        module
            .post_group(
                &mut Workspace::new(ModuleNum(1), &mut m, &mut data, &mut state),
                &key,
                &images,
            )
            .unwrap();

        for n in images {
            let mean = m
                .get_image_measurement("GroupMean_MeanIntensity", n)
                .and_then(MeasurementValue::as_f64)
                .unwrap();
            assert!((mean - 0.3).abs() < 1e-9);
        }
        assert!(state.shared_state.is_empty());
    }

    #[test]
    fn test_declares_post_group_column() {
        let module = CalculateGroupMean::new();
        let columns = module.get_measurement_columns();
        assert_eq!(columns[0].availability, Availability::PostGroup);
        assert!(module.is_aggregation_module());
    }
}
