//! MeasureImageIntensity: whole-image intensity statistics.

use crate::measurements::{ColumnType, MeasurementColumn, IMAGE};
use crate::module::{Module, ModuleResult, Setting, UpgradeChain, NO};
use crate::pipeline::workspace::Workspace;

pub const MODULE_NAME: &str = "MeasureImageIntensity";

const C_INTENSITY: &str = "Intensity";
const F_TOTAL: &str = "TotalIntensity";
const F_MEAN: &str = "MeanIntensity";
const F_MIN: &str = "MinIntensity";
const F_MAX: &str = "MaxIntensity";

pub struct MeasureImageIntensity {
    image_name: Setting,
    wants_total: Setting,
    wants_mean: Setting,
    ignore_zero: Setting,
}

impl MeasureImageIntensity {
    pub fn new() -> Self {
        Self {
            image_name: Setting::image_subscriber("Select the image to measure", "DNA"),
            wants_total: Setting::binary("Measure the total intensity?", true),
            wants_mean: Setting::binary("Measure the mean intensity?", true),
            ignore_zero: Setting::binary("Ignore zero-valued pixels?", false)
                .with_doc("Exclude pixels that are exactly zero, e.g. masked background."),
        }
    }

    fn feature(&self, measurement: &str) -> String {
        format!("{}_{}_{}", C_INTENSITY, measurement, self.image_name.value())
    }

    fn features(&self) -> Vec<&'static str> {
        let mut features = Vec::new();
        if self.wants_total.is_yes() {
            features.push(F_TOTAL);
        }
        if self.wants_mean.is_yes() {
            features.push(F_MEAN);
        }
        features.push(F_MIN);
        features.push(F_MAX);
        features
    }
}

impl Default for MeasureImageIntensity {
    fn default() -> Self {
        Self::new()
    }
}

/// Intensity statistics of `pixels`; NaN when no pixel qualifies.
pub(crate) fn intensity_stats(pixels: impl Iterator<Item = f32>) -> (f64, f64, f64, f64) {
    let mut count = 0usize;
    let mut total = 0.0f64;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for p in pixels {
        let p = p as f64;
        count += 1;
        total += p;
        min = min.min(p);
        max = max.max(p);
    }
    if count == 0 {
        return (0.0, f64::NAN, f64::NAN, f64::NAN);
    }
    (total, total / count as f64, min, max)
}

impl Module for MeasureImageIntensity {
    fn module_name(&self) -> &str {
        MODULE_NAME
    }

    fn category(&self) -> &str {
        "Measurement"
    }

    fn variable_revision_number(&self) -> u32 {
        2
    }

    fn settings(&self) -> Vec<&Setting> {
        vec![
            &self.image_name,
            &self.wants_total,
            &self.wants_mean,
            &self.ignore_zero,
        ]
    }

    fn settings_mut(&mut self) -> Vec<&mut Setting> {
        vec![
            &mut self.image_name,
            &mut self.wants_total,
            &mut self.wants_mean,
            &mut self.ignore_zero,
        ]
    }

    fn upgrade_chain(&self) -> UpgradeChain {
        // Revision 2 added "Ignore zero-valued pixels?", off by default.
        UpgradeChain::new(2).step(1, |mut v| {
            v.push(NO.to_string());
            v
        })
    }

    fn run(&mut self, ws: &mut Workspace) -> ModuleResult<()> {
        let n = ws.image_number()?;
        let image = ws.image_set.get(self.image_name.value())?;
        let ignore_zero = self.ignore_zero.is_yes();
        let (total, mean, min, max) = intensity_stats(
            image
                .pixels()
                .iter()
                .copied()
                .filter(|p| !(ignore_zero && *p == 0.0)),
        );

        for feature in self.features() {
            let value = match feature {
                F_TOTAL => total,
                F_MEAN => mean,
                F_MIN => min,
                _ => max,
            };
            ws.measurements
                .add_image_measurement(n, &self.feature(feature), value);
        }
        ws.display_data.insert("mean".into(), serde_json::json!(mean));
        Ok(())
    }

    fn get_measurement_columns(&self) -> Vec<MeasurementColumn> {
        self.features()
            .into_iter()
            .map(|f| MeasurementColumn::image(self.feature(f), ColumnType::Float))
            .collect()
    }

    fn get_measurement_images(&self, object_name: &str, category: &str, measurement: &str) -> Vec<String> {
        if object_name == IMAGE && category == C_INTENSITY && self.features().iter().any(|f| *f == measurement) {
            vec![self.image_name.value().to_string()]
        } else {
            Vec::new()
        }
    }
}
