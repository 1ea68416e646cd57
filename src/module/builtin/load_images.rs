//! LoadImages: builds the image-set universe from a folder.
//!
//! Every matching file becomes one image set. File names can carry metadata
//! (`Plate_Well_Site.png`) which is recorded as `Metadata_<key>` image
//! measurements and may be used to group the run.

use crate::measurements::column::{C_FILE_NAME, C_PATH_NAME};
use crate::measurements::{
    metadata_feature, ColumnType, Grouping, MeasurementColumn, MeasurementValue, IMAGE,
};
use crate::module::{Module, ModuleError, ModuleResult, Setting, UpgradeChain, ValidationContext, NO};
use crate::pipeline::error::ValidationError;
use crate::pipeline::id::ImageNumber;
use crate::pipeline::workspace::{Image, Workspace};
use std::path::Path;

pub const MODULE_NAME: &str = "LoadImages";

pub struct LoadImages {
    folder: Setting,
    suffix: Setting,
    image_name: Setting,
    extract_metadata: Setting,
    metadata_keys: Setting,
    delimiter: Setting,
    group_by_metadata: Setting,
    grouping_keys: Setting,
}

impl LoadImages {
    pub fn new() -> Self {
        Self {
            folder: Setting::directory("Input image folder", ".")
                .with_doc("Folder scanned for image files."),
            suffix: Setting::text_value("File names end with", ".png"),
            image_name: Setting::image_provider("Name this loaded image", "DNA"),
            extract_metadata: Setting::binary("Extract metadata from file names?", false),
            metadata_keys: Setting::text_value("Metadata keys, in file name order", "Plate,Well,Site")
                .with_doc("Comma-separated names for the delimited parts of each file name."),
            delimiter: Setting::text_value("File name delimiter", "_"),
            group_by_metadata: Setting::binary("Group images by metadata?", false),
            grouping_keys: Setting::text_value("Metadata keys to group by", "Plate"),
        }
    }

    fn file_feature(&self) -> String {
        format!("{}_{}", C_FILE_NAME, self.image_name.value())
    }

    fn path_feature(&self) -> String {
        format!("{}_{}", C_PATH_NAME, self.image_name.value())
    }

    fn keys(setting: &Setting) -> Vec<String> {
        setting
            .value()
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn scan_folder(&self) -> ModuleResult<Vec<String>> {
        let suffix = self.suffix.value().to_lowercase();
        let mut files = Vec::new();
        for entry in std::fs::read_dir(self.folder.value())? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.to_lowercase().ends_with(&suffix) {
                files.push(name);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Metadata values parsed from the stem of `file_name`.
    fn metadata_from_name(&self, file_name: &str) -> Vec<(String, String)> {
        let stem = Path::new(file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let keys = Self::keys(&self.metadata_keys);
        let parts: Vec<&str> = stem.split(self.delimiter.value()).collect();
        if parts.len() < keys.len() {
            tracing::warn!(
                "{} has {} parts but {} metadata keys are configured",
                file_name,
                parts.len(),
                keys.len()
            );
        }
        keys.into_iter()
            .enumerate()
            .map(|(i, key)| (key, parts.get(i).copied().unwrap_or("").to_string()))
            .collect()
    }

    fn text_measurement(ws: &Workspace, feature: &str, image_number: ImageNumber) -> ModuleResult<String> {
        ws.measurements
            .get_image_measurement(feature, image_number)
            .map(MeasurementValue::to_string)
            .ok_or_else(|| ModuleError::MissingMeasurement {
                object_name: IMAGE.to_string(),
                feature: feature.to_string(),
                image_number,
            })
    }
}

impl Default for LoadImages {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for LoadImages {
    fn module_name(&self) -> &str {
        MODULE_NAME
    }

    fn category(&self) -> &str {
        "File Processing"
    }

    fn variable_revision_number(&self) -> u32 {
        3
    }

    fn settings(&self) -> Vec<&Setting> {
        vec![
            &self.folder,
            &self.suffix,
            &self.image_name,
            &self.extract_metadata,
            &self.metadata_keys,
            &self.delimiter,
            &self.group_by_metadata,
            &self.grouping_keys,
        ]
    }

    fn settings_mut(&mut self) -> Vec<&mut Setting> {
        vec![
            &mut self.folder,
            &mut self.suffix,
            &mut self.image_name,
            &mut self.extract_metadata,
            &mut self.metadata_keys,
            &mut self.delimiter,
            &mut self.group_by_metadata,
            &mut self.grouping_keys,
        ]
    }

    fn visible_settings(&self) -> Vec<&Setting> {
        let mut visible = vec![
            &self.folder,
            &self.suffix,
            &self.image_name,
            &self.extract_metadata,
        ];
        if self.extract_metadata.is_yes() {
            visible.push(&self.metadata_keys);
            visible.push(&self.delimiter);
            visible.push(&self.group_by_metadata);
            if self.group_by_metadata.is_yes() {
                visible.push(&self.grouping_keys);
            }
        }
        visible
    }

    fn upgrade_chain(&self) -> UpgradeChain {
        UpgradeChain::new(3)
            // Revision 2 added file name metadata.
            .step(1, |mut v| {
                v.extend([NO.to_string(), "Plate,Well,Site".to_string(), "_".to_string()]);
                v
            })
            // Revision 3 added metadata grouping.
            .step(2, |mut v| {
                v.extend([NO.to_string(), "Plate".to_string()]);
                v
            })
    }

    fn validate_module(&self, _ctx: &ValidationContext) -> Result<(), ValidationError> {
        if !self.extract_metadata.is_yes() {
            return Ok(());
        }
        if self.delimiter.value().is_empty() {
            return Err(ValidationError::new("The delimiter cannot be empty", &self.delimiter));
        }
        let keys = Self::keys(&self.metadata_keys);
        if keys.is_empty() {
            return Err(ValidationError::new(
                "Name at least one metadata key",
                &self.metadata_keys,
            ));
        }
        if self.group_by_metadata.is_yes() {
            let grouping = Self::keys(&self.grouping_keys);
            if grouping.is_empty() {
                return Err(ValidationError::new(
                    "Name at least one metadata key to group by",
                    &self.grouping_keys,
                ));
            }
            if let Some(unknown) = grouping.iter().find(|k| !keys.contains(k)) {
                return Err(ValidationError::new(
                    format!("\"{}\" is not one of the extracted metadata keys", unknown),
                    &self.grouping_keys,
                ));
            }
        }
        Ok(())
    }

    fn prepare_run(&mut self, ws: &mut Workspace) -> ModuleResult<bool> {
        let file_feature = self.file_feature();
        if ws.is_batch_mode() && ws.measurements.has_feature(IMAGE, &file_feature) {
            tracing::debug!("Using the {} image sets recorded in the batch file", ws.measurements.image_count());
            return Ok(true);
        }

        let files = if ws.is_batch_mode() && !ws.batch_state().is_empty() {
            serde_json::from_slice::<Vec<String>>(ws.batch_state())?
        } else {
            self.scan_folder()?
        };
        if files.is_empty() {
            tracing::warn!(
                "No files ending in {:?} found in {}",
                self.suffix.value(),
                self.folder.value()
            );
            return Ok(false);
        }

        let path_feature = self.path_feature();
        for (i, file_name) in files.iter().enumerate() {
            let n = ImageNumber(i as u32 + 1);
            ws.measurements.add_image_measurement(n, &file_feature, file_name.as_str());
            ws.measurements
                .add_image_measurement(n, &path_feature, self.folder.value());
            if self.extract_metadata.is_yes() {
                for (key, value) in self.metadata_from_name(file_name) {
                    ws.measurements
                        .add_image_measurement(n, &metadata_feature(&key), value);
                }
            }
        }
        tracing::info!("{} found {} image sets", MODULE_NAME, files.len());
        Ok(true)
    }

    fn get_groupings(&self, ws: &Workspace) -> ModuleResult<Option<Grouping>> {
        if !(self.extract_metadata.is_yes() && self.group_by_metadata.is_yes()) {
            return Ok(None);
        }
        let key_names: Vec<String> = Self::keys(&self.grouping_keys)
            .iter()
            .map(|k| metadata_feature(k))
            .collect();
        let groups = ws.measurements.get_groupings(&key_names);
        Ok(Some(Grouping { key_names, groups }))
    }

    fn run(&mut self, ws: &mut Workspace) -> ModuleResult<()> {
        let n = ws.image_number()?;
        let folder = Self::text_measurement(ws, &self.path_feature(), n)?;
        let file_name = Self::text_measurement(ws, &self.file_feature(), n)?;
        let image = Image::open(Path::new(&folder).join(&file_name))?;
        ws.display_data
            .insert("file_name".into(), serde_json::Value::String(file_name));
        ws.image_set.add(self.image_name.value(), image);
        Ok(())
    }

    fn get_measurement_columns(&self) -> Vec<MeasurementColumn> {
        let mut columns = vec![
            MeasurementColumn::image(self.file_feature(), ColumnType::varchar()),
            MeasurementColumn::image(self.path_feature(), ColumnType::varchar()),
        ];
        if self.extract_metadata.is_yes() {
            for key in Self::keys(&self.metadata_keys) {
                columns.push(MeasurementColumn::image(
                    metadata_feature(&key),
                    ColumnType::varchar(),
                ));
            }
        }
        columns
    }

    fn get_measurement_images(&self, object_name: &str, category: &str, _measurement: &str) -> Vec<String> {
        if object_name == IMAGE && (category == C_FILE_NAME || category == C_PATH_NAME) {
            vec![self.image_name.value().to_string()]
        } else {
            Vec::new()
        }
    }

    fn prepare_to_create_batch(
        &mut self,
        ws: &mut Workspace,
        alter_path: &dyn Fn(&str) -> String,
    ) -> ModuleResult<()> {
        let file_feature = self.file_feature();
        let path_feature = self.path_feature();
        let mut files = Vec::new();
        for n in ws.measurements.image_numbers() {
            if let Some(file_name) = ws.measurements.get_image_measurement(&file_feature, n) {
                files.push(file_name.to_string());
            }
            let altered = ws
                .measurements
                .get_image_measurement(&path_feature, n)
                .map(|p| alter_path(&p.to_string()));
            if let Some(altered) = altered {
                ws.measurements.add_image_measurement(n, &path_feature, altered);
            }
        }
        *ws.batch_state() = serde_json::to_vec(&files)?;

        let folder = alter_path(self.folder.value());
        self.folder.set_value(folder);
        Ok(())
    }
}
