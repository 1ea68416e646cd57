//! Measurements store.
//!
//! Columnar, append-oriented storage for everything a run produces, keyed by
//! `(scope, feature)` and indexed by image number for per-image scopes.
//!
//! # Scopes
//!
//! - **Experiment**: one value per run (pipeline text, exit status).
//! - **Image**: one value per image set.
//! - **Objects**: one vector of values per image set, one entry per object.
//!   `Neighbors` is stored like an object scope.
//!
//! Columns declared up front via `declare_columns` keep their name and type
//! for the whole run. Writing an undeclared feature creates the column lazily
//! and logs a warning, since modules are expected to declare what they write.

pub mod column;
pub mod file;
pub mod grouping;
pub mod value;

pub use column::{
    metadata_feature, Availability, ColumnType, MeasurementColumn, ObjectRelationship, EXPERIMENT,
    IMAGE, NEIGHBORS,
};
pub use grouping::{Group, GroupKey, Grouping};
pub use value::MeasurementValue;

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{ImageNumber, ModuleNum};
use column::{C_METADATA, GROUPING_TAGS};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

type ColumnKey = (String, String);

/// One related pair of objects, possibly across image sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub module_num: ModuleNum,
    pub relationship: String,
    pub object_name1: String,
    pub object_name2: String,
    pub image_number1: ImageNumber,
    pub object_number1: u32,
    pub image_number2: ImageNumber,
    pub object_number2: u32,
}

/// The measurements of one run.
#[derive(Debug, Clone, Default)]
pub struct Measurements {
    columns: IndexMap<ColumnKey, MeasurementColumn>,
    declared: HashSet<ColumnKey>,
    warned: HashSet<ColumnKey>,
    experiment: IndexMap<String, MeasurementValue>,
    image: IndexMap<String, BTreeMap<ImageNumber, MeasurementValue>>,
    objects: IndexMap<String, IndexMap<String, BTreeMap<ImageNumber, Vec<f64>>>>,
    relationships: Vec<RelationshipRecord>,
    image_numbers: BTreeSet<ImageNumber>,
    grouping_cache: RefCell<HashMap<Vec<String>, Vec<Group>>>,
    filename: Option<PathBuf>,
}

impl Measurements {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that `flush` writes to `path`.
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            filename: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    pub fn set_filename(&mut self, path: impl Into<PathBuf>) {
        self.filename = Some(path.into());
    }

    /// Write the store to its backing file, if it has one.
    pub fn flush(&self) -> PipelineResult<()> {
        match &self.filename {
            Some(path) => self.save(path),
            None => Ok(()),
        }
    }

    // ==================== Schema ====================

    /// Fix the schema for a run.
    pub fn declare_columns<I>(&mut self, columns: I)
    where
        I: IntoIterator<Item = MeasurementColumn>,
    {
        for column in columns {
            let key = (column.object_name.clone(), column.feature.clone());
            let existing = if self.declared.contains(&key) {
                self.columns.get(&key).map(|c| c.data_type)
            } else {
                None
            };
            match existing {
                Some(data_type) => {
                    if data_type != column.data_type {
                        tracing::warn!(
                            "Column {}.{} declared as {} and {}; keeping {}",
                            key.0,
                            key.1,
                            data_type,
                            column.data_type,
                            data_type
                        );
                    }
                }
                None => {
                    self.columns.insert(key.clone(), column);
                    self.declared.insert(key);
                }
            }
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = &MeasurementColumn> {
        self.columns.values()
    }

    pub fn column(&self, object_name: &str, feature: &str) -> Option<&MeasurementColumn> {
        self.columns
            .get(&(object_name.to_string(), feature.to_string()))
    }

    pub fn is_declared(&self, object_name: &str, feature: &str) -> bool {
        self.declared
            .contains(&(object_name.to_string(), feature.to_string()))
    }

    fn ensure_column(&mut self, object_name: &str, feature: &str, inferred: ColumnType) {
        let key = (object_name.to_string(), feature.to_string());
        if self.columns.contains_key(&key) {
            return;
        }
        if !self.warned.contains(&key) {
            tracing::warn!(
                "Measurement {}.{} was written without being declared",
                object_name,
                feature
            );
            self.warned.insert(key.clone());
        }
        self.columns
            .insert(key, MeasurementColumn::new(object_name, feature, inferred));
    }

    fn check_value(&mut self, object_name: &str, feature: &str, value: &MeasurementValue) {
        let key = (object_name.to_string(), feature.to_string());
        let Some(column) = self.columns.get(&key) else {
            return;
        };
        if !value.fits(column.data_type) && !self.warned.contains(&key) {
            tracing::warn!(
                "Value {:?} does not fit column {}.{} of type {}",
                value,
                object_name,
                feature,
                column.data_type
            );
            self.warned.insert(key);
        }
    }

    /// Scopes in column order, without duplicates.
    pub fn get_object_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for (object_name, _) in self.columns.keys() {
            if !names.contains(&object_name.as_str()) {
                names.push(object_name);
            }
        }
        names
    }

    pub fn get_feature_names(&self, object_name: &str) -> Vec<&str> {
        self.columns
            .keys()
            .filter(|(o, _)| o == object_name)
            .map(|(_, f)| f.as_str())
            .collect()
    }

    pub fn has_feature(&self, object_name: &str, feature: &str) -> bool {
        match object_name {
            EXPERIMENT => self.experiment.contains_key(feature),
            IMAGE => self.image.contains_key(feature),
            _ => self
                .objects
                .get(object_name)
                .is_some_and(|o| o.contains_key(feature)),
        }
    }

    // ==================== Experiment ====================

    pub fn add_experiment_measurement(&mut self, feature: &str, value: impl Into<MeasurementValue>) {
        let value = value.into();
        self.ensure_column(EXPERIMENT, feature, value.inferred_type());
        self.check_value(EXPERIMENT, feature, &value);
        if feature == GROUPING_TAGS {
            self.grouping_cache.get_mut().clear();
        }
        self.experiment.insert(feature.to_string(), value);
    }

    pub fn get_experiment_measurement(&self, feature: &str) -> Option<&MeasurementValue> {
        self.experiment.get(feature)
    }

    // ==================== Image ====================

    pub fn add_image_measurement(
        &mut self,
        image_number: ImageNumber,
        feature: &str,
        value: impl Into<MeasurementValue>,
    ) {
        let value = value.into();
        self.ensure_column(IMAGE, feature, value.inferred_type());
        self.check_value(IMAGE, feature, &value);
        if feature.starts_with(C_METADATA) {
            self.grouping_cache.get_mut().clear();
        }
        self.image_numbers.insert(image_number);
        self.image
            .entry(feature.to_string())
            .or_default()
            .insert(image_number, value);
    }

    pub fn get_image_measurement(
        &self,
        feature: &str,
        image_number: ImageNumber,
    ) -> Option<&MeasurementValue> {
        self.image.get(feature)?.get(&image_number)
    }

    pub fn has_image_measurement(&self, feature: &str, image_number: ImageNumber) -> bool {
        self.get_image_measurement(feature, image_number).is_some()
    }

    /// Every image number with at least one image measurement, ascending.
    pub fn image_numbers(&self) -> Vec<ImageNumber> {
        self.image_numbers.iter().copied().collect()
    }

    pub fn image_count(&self) -> usize {
        self.image_numbers.len()
    }

    // ==================== Objects ====================

    /// Store one value per object for `object_name` in image set `image_number`.
    pub fn add_measurement(
        &mut self,
        object_name: &str,
        feature: &str,
        image_number: ImageNumber,
        values: Vec<f64>,
    ) {
        self.ensure_column(object_name, feature, ColumnType::Float);
        self.image_numbers.insert(image_number);
        self.objects
            .entry(object_name.to_string())
            .or_default()
            .entry(feature.to_string())
            .or_default()
            .insert(image_number, values);
    }

    pub fn get_measurement(
        &self,
        object_name: &str,
        feature: &str,
        image_number: ImageNumber,
    ) -> Option<&[f64]> {
        self.objects
            .get(object_name)?
            .get(feature)?
            .get(&image_number)
            .map(Vec::as_slice)
    }

    pub fn add_relationship(&mut self, record: RelationshipRecord) {
        self.relationships.push(record);
    }

    pub fn relationships(&self) -> &[RelationshipRecord] {
        &self.relationships
    }

    // ==================== Grouping ====================

    /// Metadata features that define groups.
    ///
    /// Uses the tags recorded by the run if there are any, otherwise every
    /// image metadata feature.
    pub fn get_grouping_tags(&self) -> Vec<String> {
        if let Some(MeasurementValue::Text(json)) = self.experiment.get(GROUPING_TAGS) {
            match serde_json::from_str::<Vec<String>>(json) {
                Ok(tags) => return tags,
                Err(e) => tracing::warn!("Ignoring malformed grouping tags {:?}: {}", json, e),
            }
        }
        self.image
            .keys()
            .filter(|f| f.starts_with(C_METADATA) && f.as_str() != GROUPING_TAGS)
            .cloned()
            .collect()
    }

    pub fn set_grouping_tags(&mut self, tags: &[String]) {
        // Vec<String> serialization cannot fail
        let json = serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string());
        self.add_experiment_measurement(GROUPING_TAGS, json);
    }

    /// Partition the image sets by their values for `tags`.
    ///
    /// Groups are ordered by their first image number. Results are cached per
    /// tag list until a metadata feature changes.
    pub fn get_groupings(&self, tags: &[String]) -> Vec<Group> {
        let tags: Vec<String> = tags.iter().map(|t| metadata_feature(t)).collect();
        if let Some(cached) = self.grouping_cache.borrow().get(&tags) {
            return cached.clone();
        }

        let mut order: Vec<GroupKey> = Vec::new();
        let mut members: HashMap<GroupKey, Vec<ImageNumber>> = HashMap::new();
        for &image_number in &self.image_numbers {
            let mut key = GroupKey::new();
            for tag in &tags {
                let value = self
                    .get_image_measurement(tag, image_number)
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                key.insert(tag.clone(), value);
            }
            members
                .entry(key.clone())
                .or_insert_with(|| {
                    order.push(key);
                    Vec::new()
                })
                .push(image_number);
        }

        let groups: Vec<Group> = order
            .into_iter()
            .enumerate()
            .map(|(i, key)| {
                let image_numbers = members.remove(&key).unwrap_or_default();
                Group::new(i as u32 + 1, key, image_numbers)
            })
            .collect();

        self.grouping_cache
            .borrow_mut()
            .insert(tags, groups.clone());
        groups
    }

    // ==================== Partitioning ====================

    /// Drop every per-image row outside `keep`.
    pub fn restrict_to(&mut self, keep: &[ImageNumber]) {
        let keep: BTreeSet<ImageNumber> = keep.iter().copied().collect();
        for rows in self.image.values_mut() {
            rows.retain(|n, _| keep.contains(n));
        }
        for features in self.objects.values_mut() {
            for rows in features.values_mut() {
                rows.retain(|n, _| keep.contains(n));
            }
        }
        self.relationships
            .retain(|r| keep.contains(&r.image_number1) && keep.contains(&r.image_number2));
        self.image_numbers.retain(|n| keep.contains(n));
        self.grouping_cache.get_mut().clear();
    }

    /// Fold in the measurements a separate worker produced.
    ///
    /// Workers process disjoint image sets, so the same cell holding two
    /// different values is an error. Experiment values present in both must
    /// agree, except the exit status which combines to failure if either
    /// worker failed. NaN agrees with NaN. On error `self` is unchanged.
    pub fn merge(&mut self, other: Measurements) -> PipelineResult<()> {
        self.check_merge(&other)?;

        for column in other.columns.into_values() {
            let key = (column.object_name.clone(), column.feature.clone());
            self.columns.entry(key).or_insert(column);
        }
        self.declared.extend(other.declared);

        for (feature, value) in other.experiment {
            match self.experiment.get(&feature) {
                Some(existing) if existing.same_as(&value) => {}
                Some(_) if feature == column::EXIT_STATUS => {
                    self.experiment
                        .insert(feature, MeasurementValue::from(column::STATUS_FAILURE));
                }
                Some(_) => {}
                None => {
                    self.experiment.insert(feature, value);
                }
            }
        }

        for (feature, rows) in other.image {
            let target = self.image.entry(feature).or_default();
            for (image_number, value) in rows {
                target.entry(image_number).or_insert(value);
            }
        }

        for (object_name, features) in other.objects {
            let target_features = self.objects.entry(object_name).or_default();
            for (feature, rows) in features {
                target_features.entry(feature).or_default().extend(rows);
            }
        }

        for record in other.relationships {
            if !self.relationships.contains(&record) {
                self.relationships.push(record);
            }
        }
        self.image_numbers.extend(other.image_numbers);
        self.grouping_cache.get_mut().clear();
        Ok(())
    }

    /// Every reason `merge` would refuse `other`, checked before anything
    /// is written.
    fn check_merge(&self, other: &Measurements) -> PipelineResult<()> {
        for (feature, value) in &other.experiment {
            if feature == column::EXIT_STATUS || feature == column::RUN_TIMESTAMP {
                continue;
            }
            if let Some(existing) = self.experiment.get(feature) {
                if !existing.same_as(value) {
                    return Err(PipelineError::Measurements(format!(
                        "experiment feature {} differs: {} vs {}",
                        feature, existing, value
                    )));
                }
            }
        }

        for (feature, rows) in &other.image {
            let Some(target) = self.image.get(feature) else {
                continue;
            };
            for (image_number, value) in rows {
                if let Some(existing) = target.get(image_number) {
                    if !existing.same_as(value) {
                        return Err(PipelineError::Measurements(format!(
                            "Image.{} for image set {} differs: {} vs {}",
                            feature, image_number, existing, value
                        )));
                    }
                }
            }
        }

        for (object_name, features) in &other.objects {
            let Some(target_features) = self.objects.get(object_name) else {
                continue;
            };
            for (feature, rows) in features {
                let Some(target) = target_features.get(feature) else {
                    continue;
                };
                if let Some(image_number) = rows.keys().find(|n| target.contains_key(n)) {
                    return Err(PipelineError::Measurements(format!(
                        "{}.{} for image set {} was written by more than one worker",
                        object_name, feature, image_number
                    )));
                }
            }
        }
        Ok(())
    }

    // ── Raw access for the file format ──

    pub(crate) fn experiment_values(&self) -> &IndexMap<String, MeasurementValue> {
        &self.experiment
    }

    pub(crate) fn image_values(&self) -> &IndexMap<String, BTreeMap<ImageNumber, MeasurementValue>> {
        &self.image
    }

    pub(crate) fn object_values(
        &self,
    ) -> &IndexMap<String, IndexMap<String, BTreeMap<ImageNumber, Vec<f64>>>> {
        &self.objects
    }

    pub(crate) fn declared_columns(&self) -> impl Iterator<Item = &MeasurementColumn> {
        self.columns
            .iter()
            .filter(|(k, _)| self.declared.contains(*k))
            .map(|(_, c)| c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plate() -> Measurements {
        let mut m = Measurements::new();
        m.declare_columns([
            MeasurementColumn::image("Metadata_ROW", ColumnType::varchar()),
            MeasurementColumn::image("Metadata_COL", ColumnType::varchar()),
        ]);
        let wells = [("A", "1"), ("A", "1"), ("A", "2"), ("A", "2")];
        for (i, (row, col)) in wells.iter().enumerate() {
            let n = ImageNumber(i as u32 + 1);
            m.add_image_measurement(n, "Metadata_ROW", *row);
            m.add_image_measurement(n, "Metadata_COL", *col);
        }
        m
    }

    #[test]
    fn test_groupings_by_two_tags() {
        let m = plate();
        let groups = m.get_groupings(&["ROW".to_string(), "COL".to_string()]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].image_numbers, vec![ImageNumber(1), ImageNumber(2)]);
        assert_eq!(groups[0].key.get("COL"), Some("1"));
        assert_eq!(groups[1].image_numbers, vec![ImageNumber(3), ImageNumber(4)]);
        assert_eq!(groups[1].key.get("Metadata_COL"), Some("2"));
        assert_eq!(groups[1].number, 2);
    }

    #[test]
    fn test_grouping_cache_invalidated_by_metadata_write() {
        let mut m = plate();
        let tags = vec!["Metadata_COL".to_string()];
        assert_eq!(m.get_groupings(&tags).len(), 2);
        m.add_image_measurement(ImageNumber(4), "Metadata_COL", "3");
        assert_eq!(m.get_groupings(&tags).len(), 3);
    }

    #[test]
    fn test_grouping_tags_default_to_metadata_features() {
        let mut m = plate();
        assert_eq!(m.get_grouping_tags(), vec!["Metadata_ROW", "Metadata_COL"]);
        m.set_grouping_tags(&["Metadata_COL".to_string()]);
        assert_eq!(m.get_grouping_tags(), vec!["Metadata_COL"]);
    }

    #[test]
    fn test_undeclared_column_is_created_lazily() {
        let mut m = Measurements::new();
        m.add_image_measurement(ImageNumber(1), "Count_Nuclei", 12);
        let col = m.column(IMAGE, "Count_Nuclei").unwrap();
        assert_eq!(col.data_type, ColumnType::Integer);
        assert!(!m.is_declared(IMAGE, "Count_Nuclei"));
    }

    #[test]
    fn test_declared_type_is_stable() {
        let mut m = Measurements::new();
        m.declare_columns([MeasurementColumn::image("X", ColumnType::Float)]);
        m.declare_columns([MeasurementColumn::image("X", ColumnType::Integer)]);
        assert_eq!(m.column(IMAGE, "X").unwrap().data_type, ColumnType::Float);
    }

    #[test]
    fn test_restrict_and_merge() {
        let full = plate();
        let mut first = full.clone();
        first.restrict_to(&[ImageNumber(1), ImageNumber(2)]);
        let mut second = full.clone();
        second.restrict_to(&[ImageNumber(3), ImageNumber(4)]);
        assert_eq!(first.image_count(), 2);

        first.add_measurement("Nuclei", "Area", ImageNumber(1), vec![10.0, 20.0]);
        second.add_measurement("Nuclei", "Area", ImageNumber(3), vec![5.0]);

        first.merge(second).unwrap();
        assert_eq!(first.image_count(), 4);
        assert_eq!(
            first.get_measurement("Nuclei", "Area", ImageNumber(3)),
            Some(&[5.0][..])
        );
    }

    #[test]
    fn test_merge_conflict_is_rejected() {
        let mut a = Measurements::new();
        a.add_image_measurement(ImageNumber(1), "Count", 1);
        let mut b = Measurements::new();
        b.add_image_measurement(ImageNumber(1), "Count", 2);
        assert!(a.merge(b).is_err());
    }

    #[test]
    fn test_failed_merge_leaves_store_unchanged() {
        let mut a = Measurements::new();
        a.add_image_measurement(ImageNumber(1), "Zeta", 1.0);
        let mut b = Measurements::new();
        b.add_image_measurement(ImageNumber(2), "Alpha", 5.0);
        b.add_image_measurement(ImageNumber(1), "Zeta", 2.0);
        b.add_experiment_measurement("Pipeline_Note", "from b");

        assert!(a.merge(b).is_err());
        assert!(a.get_image_measurement("Alpha", ImageNumber(2)).is_none());
        assert!(a.get_experiment_measurement("Pipeline_Note").is_none());
        assert!(!a.has_feature(IMAGE, "Alpha"));
        assert_eq!(a.image_numbers(), vec![ImageNumber(1)]);
    }

    #[test]
    fn test_merge_accepts_matching_nan() {
        let mut a = Measurements::new();
        a.add_image_measurement(ImageNumber(1), "X", f64::NAN);
        a.add_experiment_measurement("Mean_X", f64::NAN);
        let mut b = Measurements::new();
        b.add_image_measurement(ImageNumber(1), "X", f64::NAN);
        b.add_image_measurement(ImageNumber(2), "X", 3.0);
        b.add_experiment_measurement("Mean_X", f64::NAN);

        a.merge(b).unwrap();
        let x1 = a.get_image_measurement("X", ImageNumber(1)).and_then(MeasurementValue::as_f64);
        assert!(x1.is_some_and(f64::is_nan));
        assert_eq!(
            a.get_image_measurement("X", ImageNumber(2)),
            Some(&MeasurementValue::Float(3.0))
        );
    }

    #[test]
    fn test_merge_combines_exit_status() {
        let mut a = Measurements::new();
        a.add_experiment_measurement(column::EXIT_STATUS, column::STATUS_SUCCESS);
        let mut b = Measurements::new();
        b.add_experiment_measurement(column::EXIT_STATUS, column::STATUS_FAILURE);
        a.merge(b).unwrap();
        assert_eq!(
            a.get_experiment_measurement(column::EXIT_STATUS),
            Some(&MeasurementValue::from(column::STATUS_FAILURE))
        );
    }
}
