//! Self-describing measurements file.
//!
//! A JSON document holding the declared columns followed by every value.
//! Non-finite floats are written as `null` since JSON has no NaN.

use super::{MeasurementColumn, MeasurementValue, Measurements, RelationshipRecord};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::ImageNumber;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Marker identifying a measurements file.
pub const MEASUREMENTS_FORMAT: &str = "cellpipe-measurements";

/// Current measurements file version.
pub const MEASUREMENTS_FORMAT_VERSION: u32 = 1;

/// Default extension for measurements files.
pub const MEASUREMENTS_FILE_EXTENSION: &str = "json";

#[derive(Debug, Serialize, Deserialize)]
struct MeasurementsFile {
    format: String,

    #[serde(default = "default_version")]
    version: u32,

    created: DateTime<Utc>,

    columns: Vec<MeasurementColumn>,

    #[serde(default)]
    experiment: IndexMap<String, Option<MeasurementValue>>,

    #[serde(default)]
    image: IndexMap<String, BTreeMap<ImageNumber, Option<MeasurementValue>>>,

    #[serde(default)]
    objects: IndexMap<String, IndexMap<String, BTreeMap<ImageNumber, Vec<Option<f64>>>>>,

    #[serde(default)]
    relationships: Vec<RelationshipRecord>,
}

fn default_version() -> u32 {
    MEASUREMENTS_FORMAT_VERSION
}

fn to_stored(value: &MeasurementValue) -> Option<MeasurementValue> {
    match value {
        MeasurementValue::Float(v) if !v.is_finite() => None,
        other => Some(other.clone()),
    }
}

fn from_stored(value: Option<MeasurementValue>) -> MeasurementValue {
    value.unwrap_or(MeasurementValue::Float(f64::NAN))
}

/// Whether `text` looks like a measurements file rather than pipeline text.
pub fn looks_like_measurements(text: &str) -> bool {
    text.trim_start().starts_with('{') && text.contains(MEASUREMENTS_FORMAT)
}

impl Measurements {
    /// Serialize to a JSON string.
    pub fn to_json(&self) -> PipelineResult<String> {
        Ok(serde_json::to_string_pretty(&self.to_file())?)
    }

    /// Parse a JSON string produced by `to_json` or `save`.
    pub fn from_json(text: &str, image_numbers: Option<&[ImageNumber]>) -> PipelineResult<Self> {
        let file: MeasurementsFile = serde_json::from_str(text)?;
        Self::from_file(file, image_numbers)
    }

    /// Write the store to `path`.
    ///
    /// The document is written next to the target and renamed into place so
    /// a crashed writer never leaves a truncated file behind.
    pub fn save(&self, path: impl AsRef<Path>) -> PipelineResult<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("partial");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer(&mut writer, &self.to_file())?;
            writer.flush()?;
        }
        std::fs::rename(&tmp, path)?;
        tracing::debug!(
            "Wrote {} image sets of measurements to {:?}",
            self.image_count(),
            path
        );
        Ok(())
    }

    /// Read a measurements file, optionally keeping only some image sets.
    pub fn load(path: impl AsRef<Path>, image_numbers: Option<&[ImageNumber]>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let file: MeasurementsFile = serde_json::from_reader(reader)?;
        let mut m = Self::from_file(file, image_numbers)?;
        m.set_filename(path);
        Ok(m)
    }

    fn to_file(&self) -> MeasurementsFile {
        MeasurementsFile {
            format: MEASUREMENTS_FORMAT.to_string(),
            version: MEASUREMENTS_FORMAT_VERSION,
            created: Utc::now(),
            columns: self.columns().cloned().collect(),
            experiment: self
                .experiment_values()
                .iter()
                .map(|(k, v)| (k.clone(), to_stored(v)))
                .collect(),
            image: self
                .image_values()
                .iter()
                .map(|(k, rows)| {
                    let rows = rows.iter().map(|(n, v)| (*n, to_stored(v))).collect();
                    (k.clone(), rows)
                })
                .collect(),
            objects: self
                .object_values()
                .iter()
                .map(|(object, features)| {
                    let features = features
                        .iter()
                        .map(|(feature, rows)| {
                            let rows = rows
                                .iter()
                                .map(|(n, values)| {
                                    let values = values
                                        .iter()
                                        .map(|v| v.is_finite().then_some(*v))
                                        .collect();
                                    (*n, values)
                                })
                                .collect();
                            (feature.clone(), rows)
                        })
                        .collect();
                    (object.clone(), features)
                })
                .collect(),
            relationships: self.relationships().to_vec(),
        }
    }

    fn from_file(file: MeasurementsFile, image_numbers: Option<&[ImageNumber]>) -> PipelineResult<Self> {
        if file.format != MEASUREMENTS_FORMAT {
            return Err(PipelineError::Measurements(format!(
                "not a measurements file (format \"{}\")",
                file.format
            )));
        }
        if file.version > MEASUREMENTS_FORMAT_VERSION {
            return Err(PipelineError::Measurements(format!(
                "measurements file version {} is newer than supported version {}",
                file.version, MEASUREMENTS_FORMAT_VERSION
            )));
        }

        let keep: Option<BTreeSet<ImageNumber>> = image_numbers.map(|n| n.iter().copied().collect());
        let wanted = |n: &ImageNumber| keep.as_ref().map_or(true, |k| k.contains(n));

        let mut m = Measurements::new();
        m.declare_columns(file.columns);
        for (feature, value) in file.experiment {
            m.add_experiment_measurement(&feature, from_stored(value));
        }
        for (feature, rows) in file.image {
            for (n, value) in rows.into_iter().filter(|(n, _)| wanted(n)) {
                m.add_image_measurement(n, &feature, from_stored(value));
            }
        }
        for (object, features) in file.objects {
            for (feature, rows) in features {
                for (n, values) in rows.into_iter().filter(|(n, _)| wanted(n)) {
                    let values = values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect();
                    m.add_measurement(&object, &feature, n, values);
                }
            }
        }
        for record in file.relationships {
            if wanted(&record.image_number1) && wanted(&record.image_number2) {
                m.add_relationship(record);
            }
        }
        Ok(m)
    }
}
