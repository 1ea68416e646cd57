//! Batch surface: preparing a pipeline for cluster execution and the small
//! reporting helpers the command line exposes.
//!
//! A batch file is a measurements file whose `Pipeline_Pipeline` experiment
//! feature holds the pipeline in batch mode, with every image set and its
//! group membership already recorded. Workers load it, run one group (or one
//! image range) each, and the outputs are merged afterwards.

use crate::measurements::column::{GROUPING_TAGS, PIPELINE_TEXT, SHARED_STATE, STATUS_FAILURE};
use crate::measurements::{Group, Measurements};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::events::RunStatus;
use crate::pipeline::executor::Pipeline;
use crate::pipeline::grouping::{collect_grouping, record_group_membership};
use crate::pipeline::id::ImageNumber;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Default program name used in generated commands.
pub const DEFAULT_PROGRAM: &str = "cellpipe";

pub const BEGIN_MEASUREMENTS: &str = "--- begin measurements ---";
pub const END_MEASUREMENTS: &str = "--- end measurements ---";

// ==================== Path Mapping ====================

/// One local prefix and the remote prefix that replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapping {
    pub local: String,
    pub remote: String,
}

impl PathMapping {
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            local: normalize(&local.into()),
            remote: normalize(&remote.into()),
        }
    }

    /// Parse `LOCAL=REMOTE`.
    pub fn parse(spec: &str) -> PipelineResult<Self> {
        let (local, remote) = spec.split_once('=').ok_or_else(|| {
            PipelineError::Measurements(format!(
                "Invalid path mapping \"{}\", expected LOCAL=REMOTE",
                spec
            ))
        })?;
        if local.trim().is_empty() {
            return Err(PipelineError::Measurements(format!(
                "Invalid path mapping \"{}\": empty local prefix",
                spec
            )));
        }
        Ok(Self::new(local.trim(), remote.trim()))
    }
}

/// Forward slashes, no trailing separator (except for the root itself).
fn normalize(path: &str) -> String {
    let path = path.replace('\\', "/");
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Rewrites local paths for the hosts a batch runs on.
///
/// The longest matching prefix wins. A prefix only matches whole path
/// components, so `/data` maps `/data/a.png` but not `/database`.
#[derive(Debug, Clone, Default)]
pub struct PathMapper {
    mappings: Vec<PathMapping>,
}

impl PathMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_mappings(mappings: impl IntoIterator<Item = PathMapping>) -> Self {
        let mut mapper = Self::new();
        for mapping in mappings {
            mapper.add(mapping);
        }
        mapper
    }

    pub fn add(&mut self, mapping: PathMapping) -> &mut Self {
        self.mappings.push(mapping);
        self.mappings
            .sort_by(|a, b| b.local.len().cmp(&a.local.len()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn map(&self, path: &str) -> String {
        let normalized = normalize(path);
        for mapping in &self.mappings {
            let Some(rest) = normalized.strip_prefix(mapping.local.as_str()) else {
                continue;
            };
            if rest.is_empty() {
                return mapping.remote.clone();
            }
            if rest.starts_with('/') || mapping.local == "/" {
                let rest = rest.trim_start_matches('/');
                return if mapping.remote.ends_with('/') {
                    format!("{}{}", mapping.remote, rest)
                } else {
                    format!("{}/{}", mapping.remote, rest)
                };
            }
        }
        path.to_string()
    }
}

// ==================== Batch File ====================

/// Prepare `pipeline` for cluster execution and write the batch file.
///
/// The pipeline is left in batch mode. Each module's shared state after
/// `prepare_run` goes into the file so workers start from it. Returns the
/// groups recorded in the file.
pub fn create_batch_file(
    pipeline: &mut Pipeline,
    mapper: &PathMapper,
    out_path: impl AsRef<Path>,
) -> PipelineResult<Vec<Group>> {
    let out_path = out_path.as_ref();
    pipeline.test_valid()?;

    let mut measurements = Measurements::new();
    if !pipeline.prepare_run(&mut measurements)? {
        return Err(PipelineError::NoImageSets);
    }
    if measurements.image_count() == 0 {
        return Err(PipelineError::NoImageSets);
    }

    pipeline.prepare_to_create_batch(&mut measurements, &|p: &str| mapper.map(p))?;
    let batch_mode = pipeline.is_batch_mode();
    let grouping = collect_grouping(&mut pipeline.slots, &mut measurements, batch_mode)?;
    record_group_membership(&grouping, &mut measurements);

    measurements.declare_columns(pipeline.get_measurement_columns());
    measurements.add_experiment_measurement(PIPELINE_TEXT, pipeline.to_text());
    measurements.add_experiment_measurement(
        SHARED_STATE,
        serde_json::to_string(&pipeline.shared_state_for_workers())?,
    );
    measurements.save(out_path)?;

    tracing::info!(
        "Wrote batch file {} with {} image sets in {} groups",
        out_path.display(),
        measurements.image_count(),
        grouping.groups.len()
    );
    Ok(grouping.groups)
}

/// Groups recorded in a batch or output file.
///
/// Without recorded grouping tags the whole file is a single group with an
/// empty key.
pub fn recorded_groups(measurements: &Measurements) -> Vec<Group> {
    if measurements.get_experiment_measurement(GROUPING_TAGS).is_some() {
        measurements.get_groupings(&measurements.get_grouping_tags())
    } else {
        measurements.get_groupings(&[])
    }
}

// ==================== Batch Commands ====================

/// How generated worker commands are spelled.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    pub program: String,
    /// Directory each worker writes its `Batch_<n>_out.json` to.
    pub output_dir: Option<PathBuf>,
    /// Split an ungrouped run into chunks of this many image sets.
    pub images_per_batch: Option<usize>,
}

impl Default for CommandTemplate {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            output_dir: None,
            images_per_batch: None,
        }
    }
}

/// One shell command per group, or per image range when the run is not
/// grouped.
///
/// Together the commands select every image set of `groups` exactly once.
pub fn batch_commands(
    batch_file: impl AsRef<Path>,
    groups: &[Group],
    template: &CommandTemplate,
) -> Vec<String> {
    let file = batch_file.as_ref().to_string_lossy().into_owned();
    let base = format!("{} run -p {}", shell_quote(&template.program), shell_quote(&file));

    let mut commands = Vec::new();
    for group in groups {
        if group.key.is_empty() {
            for (first, last) in chunks(&group.image_numbers, template.images_per_batch) {
                let mut command = format!("{} -f {} -l {}", base, first, last);
                push_output(&mut command, template, commands.len() + 1);
                commands.push(command);
            }
        } else {
            let mut command = format!("{} -g {}", base, shell_quote(&group.key.to_string()));
            push_output(&mut command, template, commands.len() + 1);
            commands.push(command);
        }
    }
    commands
}

fn push_output(command: &mut String, template: &CommandTemplate, batch: usize) {
    if let Some(dir) = &template.output_dir {
        let out = dir.join(format!("Batch_{}_out.json", batch));
        command.push_str(" -o ");
        command.push_str(&shell_quote(&out.to_string_lossy()));
    }
}

/// Inclusive `(first, last)` bounds of consecutive chunks.
fn chunks(image_numbers: &[ImageNumber], size: Option<usize>) -> Vec<(ImageNumber, ImageNumber)> {
    let size = size.filter(|&s| s > 0).unwrap_or(image_numbers.len().max(1));
    image_numbers
        .chunks(size)
        .filter_map(|chunk| Some((*chunk.first()?, *chunk.last()?)))
        .collect()
}

/// Quote `arg` for a POSIX shell if it needs it.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=,:@%+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

// ==================== Reporting ====================

/// Write the sentinel a cluster scheduler polls for.
///
/// A missing status means the run never finished and is reported as failure.
pub fn write_done_file(path: impl AsRef<Path>, status: Option<RunStatus>) -> std::io::Result<()> {
    let text = status.map(RunStatus::as_str).unwrap_or(STATUS_FAILURE);
    std::fs::write(path.as_ref(), format!("{}\n", text))?;
    tracing::debug!("Wrote {} to {}", text, path.as_ref().display());
    Ok(())
}

/// List the columns a run of `pipeline` would write, without running it.
pub fn print_measurements(pipeline: &Pipeline, writer: &mut impl Write) -> std::io::Result<()> {
    writeln!(writer, "{}", BEGIN_MEASUREMENTS)?;
    writeln!(writer, "Object,Feature,Type")?;
    for column in pipeline.get_measurement_columns() {
        writeln!(
            writer,
            "{},{},{}",
            column.object_name, column.feature, column.data_type
        )?;
    }
    writeln!(writer, "{}", END_MEASUREMENTS)?;
    Ok(())
}

/// Print the groups of a measurements file as JSON:
/// `[[{"Metadata_Plate": "P1"}, [1, 2, 3]], ...]`.
pub fn print_groups(measurements: &Measurements, writer: &mut impl Write) -> PipelineResult<()> {
    let groups: Vec<_> = recorded_groups(measurements)
        .into_iter()
        .map(|g| (g.key, g.image_numbers))
        .collect();
    serde_json::to_writer(&mut *writer, &groups)?;
    writeln!(writer)?;
    Ok(())
}
