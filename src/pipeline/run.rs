//! Execution driver.
//!
//! A run walks every enabled module through the lifecycle:
//!
//! 1. Validate, then `prepare_run` to build the image-set universe.
//! 2. Collect the grouping and narrow it to the requested groups/range.
//! 3. Per group: `prepare_group`, then `run` on every image set in ascending
//!    order, then `post_group` with the aggregation postcondition checked.
//! 4. `post_run` once every selected group completed.
//!
//! The driver is single-threaded. A stop flag is polled between image sets.

use crate::measurements::column::{EXIT_STATUS, PIPELINE_TEXT, RUN_TIMESTAMP, SHARED_STATE};
use crate::measurements::{Availability, Group, GroupKey, Measurements, IMAGE};
use crate::module::ModuleError;
use crate::pipeline::error::{PipelineError, PipelineResult, RunStage};
use crate::pipeline::events::{Listeners, PipelineEvent, RunStatus};
use crate::pipeline::executor::Pipeline;
use crate::pipeline::grouping::{collect_grouping, record_group_membership, select_groups};
use crate::pipeline::id::{ImageNumber, ImageNumberRange, ModuleNum};
use crate::pipeline::slot::{module_error_feature, ModuleSlot};
use crate::pipeline::workspace::{ImageSetData, Workspace};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// What the driver does when a module fails on an image set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Stop the run.
    #[default]
    Abort,
    /// Record the failure and continue with the next image set.
    Skip,
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorPolicy::Abort => f.write_str("abort"),
            ErrorPolicy::Skip => f.write_str("skip"),
        }
    }
}

impl FromStr for ErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abort" => Ok(ErrorPolicy::Abort),
            "skip" => Ok(ErrorPolicy::Skip),
            other => Err(format!("unknown error policy \"{}\" (expected abort or skip)", other)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub range: ImageNumberRange,
    /// Only run groups whose key matches every pair of this filter.
    pub group: Option<GroupKey>,
    pub error_policy: ErrorPolicy,
    /// Call `Module::display` for modules with `show_window` set.
    pub show_displays: bool,
    stop: Arc<AtomicBool>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_range(mut self, first: Option<ImageNumber>, last: Option<ImageNumber>) -> Self {
        self.range = ImageNumberRange::new(first, last);
        self
    }

    pub fn with_group(mut self, group: GroupKey) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn with_displays(mut self, show: bool) -> Self {
        self.show_displays = show;
        self
    }

    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Set this flag to stop the run before the next image set.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub measurements: Measurements,
    /// Every failure recorded during the run, in order.
    pub exceptions: Vec<PipelineError>,
    /// Image sets that were started, including failed ones.
    pub image_sets_run: Vec<ImageNumber>,
    /// A module failed fatally, or `prepare_run` declined to run.
    pub aborted: bool,
    pub cancelled: bool,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

impl Pipeline {
    /// Run the pipeline headlessly.
    ///
    /// `initial` seeds the measurements, e.g. with the image sets recorded in
    /// a batch file. Setup errors (validation, grouping, an empty universe)
    /// are returned as `Err`; module failures are recorded in the outcome.
    pub fn run(
        &mut self,
        options: &RunOptions,
        initial: Option<Measurements>,
    ) -> PipelineResult<RunOutcome> {
        self.test_valid()?;

        let mut measurements = initial.unwrap_or_default();
        measurements.add_experiment_measurement(PIPELINE_TEXT, self.to_text());
        measurements.add_experiment_measurement(RUN_TIMESTAMP, chrono::Utc::now().to_rfc3339());
        measurements.declare_columns(self.get_measurement_columns());

        self.listeners.notify(PipelineEvent::RunStarted);
        for warning in self.test_warnings() {
            tracing::warn!("{}", warning);
            self.listeners.notify(PipelineEvent::ValidationWarning {
                module_num: warning.module_num.unwrap_or(ModuleNum(0)),
                message: warning.to_string(),
            });
        }
        tracing::info!(
            "Running {} modules ({} on error)",
            self.slots.len(),
            options.error_policy
        );

        let mut driver = RunDriver {
            slots: &mut self.slots,
            ctx: RunContext {
                listeners: &self.listeners,
                options,
                batch_mode: self.batch_mode,
                measurements,
                exceptions: Vec::new(),
                image_sets_run: Vec::new(),
                failed: false,
                aborted: false,
                cancelled: false,
                warned_columns: HashSet::new(),
            },
        };
        match driver.execute() {
            Ok(()) => driver.ctx.finish(),
            Err(e) => {
                tracing::error!("Run failed: {}", e);
                self.listeners
                    .notify(PipelineEvent::RunFinished(RunStatus::Failure));
                Err(e)
            }
        }
    }

    /// Call `prepare_run` on every enabled module.
    ///
    /// Returns `false` if a module declined to run.
    pub fn prepare_run(&mut self, measurements: &mut Measurements) -> PipelineResult<bool> {
        prepare_run(&mut self.slots, measurements, self.batch_mode)
    }
}

fn prepare_run(
    slots: &mut [ModuleSlot],
    measurements: &mut Measurements,
    batch_mode: bool,
) -> PipelineResult<bool> {
    let mut data = ImageSetData::default();
    for slot in slots.iter_mut().filter(|s| s.enabled) {
        let module_num = slot.module_num();
        let ModuleSlot { module, state, .. } = slot;
        let mut ws =
            Workspace::new(module_num, measurements, &mut data, state).in_batch_mode(batch_mode);
        match module.prepare_run(&mut ws) {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!("{} ({}) declined to run", module.module_name(), module_num);
                return Ok(false);
            }
            Err(e) => {
                return Err(run_exception(
                    module_num,
                    module.module_name(),
                    RunStage::PrepareRun,
                    None,
                    e,
                ))
            }
        }
    }
    Ok(true)
}

/// Install the shared state a batch file recorded for each module.
///
/// A file without the feature leaves the state as `prepare_run` built it.
fn restore_shared_state(slots: &mut [ModuleSlot], measurements: &Measurements) -> PipelineResult<()> {
    let Some(text) = measurements
        .get_experiment_measurement(SHARED_STATE)
        .and_then(|v| v.as_str())
    else {
        return Ok(());
    };
    let snapshots: Vec<serde_json::Value> = serde_json::from_str(text)?;
    if snapshots.len() != slots.len() {
        return Err(PipelineError::Measurements(format!(
            "{} holds state for {} modules but the pipeline has {}",
            SHARED_STATE,
            snapshots.len(),
            slots.len()
        )));
    }
    for (slot, snapshot) in slots.iter_mut().zip(snapshots) {
        slot.state.shared_state.set_for_worker(snapshot);
    }
    tracing::debug!("Restored shared state for {} modules", slots.len());
    Ok(())
}

fn run_exception(
    module_num: ModuleNum,
    module_name: &str,
    stage: RunStage,
    image_number: Option<ImageNumber>,
    e: ModuleError,
) -> PipelineError {
    PipelineError::RunException {
        module_num,
        module_name: module_name.to_string(),
        stage,
        image_number,
        message: e.to_string(),
    }
}

struct RunDriver<'p> {
    slots: &'p mut [ModuleSlot],
    ctx: RunContext<'p>,
}

/// Everything a run touches besides the module slots.
struct RunContext<'p> {
    listeners: &'p Listeners,
    options: &'p RunOptions,
    batch_mode: bool,
    measurements: Measurements,
    exceptions: Vec<PipelineError>,
    image_sets_run: Vec<ImageNumber>,
    failed: bool,
    aborted: bool,
    cancelled: bool,
    warned_columns: HashSet<String>,
}

impl RunDriver<'_> {
    fn execute(&mut self) -> PipelineResult<()> {
        match prepare_run(self.slots, &mut self.ctx.measurements, self.ctx.batch_mode) {
            Ok(true) => {}
            Ok(false) => {
                self.ctx.aborted = true;
                return Ok(());
            }
            Err(e) => {
                self.ctx.fail(e, RunStage::PrepareRun, None);
                return Ok(());
            }
        }
        if self.ctx.batch_mode {
            restore_shared_state(self.slots, &self.ctx.measurements)?;
        }

        let image_count = self.ctx.measurements.image_count();
        if image_count == 0 {
            return Err(PipelineError::NoImageSets);
        }
        let grouping = collect_grouping(self.slots, &mut self.ctx.measurements, self.ctx.batch_mode)?;
        record_group_membership(&grouping, &mut self.ctx.measurements);
        self.ctx
            .listeners
            .notify(PipelineEvent::PrepareRunComplete { image_count });

        let groups = select_groups(
            grouping.groups,
            self.ctx.options.group.as_ref(),
            self.ctx.options.range,
        )?;
        tracing::info!(
            "Processing {} image sets in {} groups",
            groups.iter().map(|g| g.image_numbers.len()).sum::<usize>(),
            groups.len()
        );

        for group in &groups {
            self.run_group(group);
            if self.ctx.aborted || self.ctx.cancelled {
                return Ok(());
            }
        }
        self.post_run();
        Ok(())
    }

    fn run_group(&mut self, group: &Group) {
        tracing::debug!(
            "Group {} [{}]: {} image sets",
            group.number,
            group.key,
            group.image_numbers.len()
        );
        self.ctx.listeners.notify(PipelineEvent::GroupStarted {
            key: group.key.clone(),
            image_numbers: group.image_numbers.clone(),
        });

        let mut data = ImageSetData::default();
        for slot in self.slots.iter_mut().filter(|s| s.enabled) {
            let module_num = slot.module_num();
            let ModuleSlot { module, state, .. } = slot;
            let mut ws = Workspace::new(module_num, &mut self.ctx.measurements, &mut data, state)
                .in_batch_mode(self.ctx.batch_mode);
            if let Err(e) = module.prepare_group(&mut ws, &group.key, &group.image_numbers) {
                let error = run_exception(
                    module_num,
                    module.module_name(),
                    RunStage::PrepareGroup,
                    None,
                    e,
                );
                self.ctx.fail(error, RunStage::PrepareGroup, None);
                return;
            }
        }

        for &image_number in &group.image_numbers {
            if self.ctx.options.stop.load(Ordering::Relaxed) {
                tracing::warn!("Run cancelled before image set {}", image_number);
                self.ctx.cancelled = true;
                self.ctx
                    .exceptions
                    .push(PipelineError::Cancelled(image_number));
                return;
            }
            self.run_image_set(image_number);
            if self.ctx.aborted {
                return;
            }
        }

        self.post_group(group);
        if !self.ctx.aborted {
            self.ctx.listeners.notify(PipelineEvent::GroupComplete {
                key: group.key.clone(),
            });
        }
    }

    fn run_image_set(&mut self, image_number: ImageNumber) {
        self.ctx
            .listeners
            .notify(PipelineEvent::ImageSetStarted(image_number));
        self.ctx.image_sets_run.push(image_number);

        let mut data = ImageSetData::default();
        let mut succeeded = true;
        for slot in self.slots.iter_mut().filter(|s| s.enabled) {
            let module_num = slot.module_num();
            let show = slot.show_window && self.ctx.options.show_displays;
            let pause = slot.wants_pause;
            let ModuleSlot { module, state, .. } = slot;

            data.display_data.clear();
            let mut ws = Workspace::new(module_num, &mut self.ctx.measurements, &mut data, state)
                .at_image(image_number)
                .in_batch_mode(self.ctx.batch_mode);
            let started = Instant::now();
            if let Err(e) = module.run(&mut ws) {
                let error = run_exception(
                    module_num,
                    module.module_name(),
                    RunStage::Run,
                    Some(image_number),
                    e,
                );
                self.ctx.fail(error, RunStage::Run, Some(image_number));
                succeeded = false;
                break;
            }
            tracing::trace!(
                "{} ({}) ran on image set {} in {:?}",
                module.module_name(),
                module_num,
                image_number,
                started.elapsed()
            );

            if show {
                module.display(&ws);
                self.ctx.listeners.notify(PipelineEvent::Display {
                    module_num,
                    image_number,
                    data: ws.display_data.clone(),
                });
            }
            self.ctx.listeners.notify(PipelineEvent::ModuleRunComplete {
                module_num,
                image_number,
            });
            if pause {
                self.ctx.listeners.notify(PipelineEvent::PauseRequested {
                    module_num,
                    image_number,
                });
            }
        }

        if succeeded {
            self.check_each_cycle_columns(image_number);
        }
        self.ctx
            .listeners
            .notify(PipelineEvent::ImageSetComplete(image_number));
    }

    /// Warn about declared per-image columns a successful image set left empty.
    fn check_each_cycle_columns(&mut self, image_number: ImageNumber) {
        for slot in self.slots.iter().filter(|s| s.enabled) {
            for column in slot.module.get_measurement_columns() {
                if column.object_name != IMAGE
                    || column.availability != Availability::EachCycle
                    || self
                        .ctx
                        .measurements
                        .has_image_measurement(&column.feature, image_number)
                    || self.ctx.warned_columns.contains(&column.feature)
                {
                    continue;
                }
                tracing::warn!(
                    "{} ({}) declares {} but did not write it for image set {}",
                    slot.module_name(),
                    slot.module_num(),
                    column.feature,
                    image_number
                );
                self.ctx.warned_columns.insert(column.feature);
            }
        }
    }

    fn post_group(&mut self, group: &Group) {
        let mut data = ImageSetData::default();
        for slot in self.slots.iter_mut().filter(|s| s.enabled) {
            let module_num = slot.module_num();
            let ModuleSlot { module, state, .. } = slot;
            let mut ws = Workspace::new(module_num, &mut self.ctx.measurements, &mut data, state)
                .in_batch_mode(self.ctx.batch_mode);
            if let Err(e) = module.post_group(&mut ws, &group.key, &group.image_numbers) {
                let error = run_exception(
                    module_num,
                    module.module_name(),
                    RunStage::PostGroup,
                    None,
                    e,
                );
                self.ctx.fail(error, RunStage::PostGroup, None);
                if self.ctx.aborted {
                    return;
                }
                continue;
            }

            // Group results must be complete once post_group returns.
            for column in module.get_measurement_columns() {
                if column.object_name != IMAGE || column.availability != Availability::PostGroup {
                    continue;
                }
                let missing: Vec<ImageNumber> = group
                    .image_numbers
                    .iter()
                    .copied()
                    .filter(|n| !self.ctx.measurements.has_image_measurement(&column.feature, *n))
                    .collect();
                if missing.is_empty() {
                    continue;
                }
                let error = PipelineError::AggregationIncomplete {
                    module_num,
                    module_name: module.module_name().to_string(),
                    feature: column.feature,
                    missing,
                };
                self.ctx.fail(error, RunStage::PostGroup, None);
                if self.ctx.aborted {
                    return;
                }
            }
        }
    }

    fn post_run(&mut self) {
        let mut data = ImageSetData::default();
        for slot in self.slots.iter_mut().filter(|s| s.enabled) {
            let module_num = slot.module_num();
            let ModuleSlot { module, state, .. } = slot;
            let mut ws = Workspace::new(module_num, &mut self.ctx.measurements, &mut data, state)
                .in_batch_mode(self.ctx.batch_mode);
            if let Err(e) = module.post_run(&mut ws) {
                let error =
                    run_exception(module_num, module.module_name(), RunStage::PostRun, None, e);
                self.ctx.fail(error, RunStage::PostRun, None);
            }
        }
    }
}

impl RunContext<'_> {
    /// Record a module failure and decide whether the run continues.
    fn fail(&mut self, error: PipelineError, stage: RunStage, image_number: Option<ImageNumber>) {
        let fatal = stage.is_fatal() || self.options.error_policy == ErrorPolicy::Abort;
        let (module_num, module_name) = match &error {
            PipelineError::RunException {
                module_num,
                module_name,
                ..
            }
            | PipelineError::AggregationIncomplete {
                module_num,
                module_name,
                ..
            } => (*module_num, module_name.clone()),
            _ => (ModuleNum(0), String::new()),
        };

        if fatal {
            tracing::error!("{}", error);
        } else {
            tracing::warn!("{}; continuing", error);
        }
        if let Some(n) = image_number {
            self.measurements
                .add_image_measurement(n, &module_error_feature(module_num, &module_name), 1);
        }
        self.listeners.notify(PipelineEvent::RunException {
            module_num,
            module_name,
            stage,
            image_number,
            message: error.to_string(),
            fatal,
        });
        self.exceptions.push(error);
        self.failed = true;
        self.aborted |= fatal;
    }

    fn finish(mut self) -> PipelineResult<RunOutcome> {
        let status = if self.failed || self.aborted || self.cancelled {
            RunStatus::Failure
        } else {
            RunStatus::Success
        };
        self.measurements
            .add_experiment_measurement(EXIT_STATUS, status.as_str());

        if let Err(e) = self.measurements.flush() {
            tracing::error!("Failed to write measurements: {}", e);
            self.listeners
                .notify(PipelineEvent::RunFinished(RunStatus::Failure));
            return Err(e);
        }
        tracing::info!(
            "Run finished: {} ({} image sets, {} exceptions)",
            status.as_str(),
            self.image_sets_run.len(),
            self.exceptions.len()
        );
        self.listeners.notify(PipelineEvent::RunFinished(status));

        Ok(RunOutcome {
            status,
            measurements: self.measurements,
            exceptions: self.exceptions,
            image_sets_run: self.image_sets_run,
            aborted: self.aborted,
            cancelled: self.cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::{ColumnType, MeasurementColumn};
    use crate::module::{Module, ModuleResult, Setting};
    use crate::pipeline::events::MockPipelineListener;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Provides `count` image sets, two per `Metadata_ROW` value when grouped.
    struct Source {
        count: Setting,
        grouped: bool,
    }

    impl Source {
        fn new(count: i64, grouped: bool) -> Box<Self> {
            Box::new(Self {
                count: Setting::integer("Image sets", count, Some(0), None),
                grouped,
            })
        }
    }

    impl Module for Source {
        fn module_name(&self) -> &str {
            "Source"
        }

        fn variable_revision_number(&self) -> u32 {
            1
        }

        fn settings(&self) -> Vec<&Setting> {
            vec![&self.count]
        }

        fn settings_mut(&mut self) -> Vec<&mut Setting> {
            vec![&mut self.count]
        }

        fn prepare_run(&mut self, ws: &mut Workspace) -> ModuleResult<bool> {
            let count = self.count.as_i64()? as u32;
            for i in 1..=count {
                let row = ((b'A' + ((i - 1) / 2) as u8) as char).to_string();
                ws.measurements
                    .add_image_measurement(ImageNumber(i), "Metadata_ROW", row);
            }
            Ok(count > 0)
        }

        fn get_groupings(&self, ws: &Workspace) -> ModuleResult<Option<crate::measurements::Grouping>> {
            if !self.grouped {
                return Ok(None);
            }
            let key_names = vec!["Metadata_ROW".to_string()];
            let groups = ws.measurements.get_groupings(&key_names);
            Ok(Some(crate::measurements::Grouping { key_names, groups }))
        }

        fn run(&mut self, _ws: &mut Workspace) -> ModuleResult<()> {
            Ok(())
        }
    }

    /// Logs every hook; fails `run` on one image set.
    struct Recorder {
        log: Log,
        fail_on: Option<ImageNumber>,
        fail_stage: Option<RunStage>,
    }

    impl Recorder {
        fn new(log: &Log) -> Box<Self> {
            Box::new(Self {
                log: Arc::clone(log),
                fail_on: None,
                fail_stage: None,
            })
        }

        fn failing_on(mut self: Box<Self>, n: u32) -> Box<Self> {
            self.fail_on = Some(ImageNumber(n));
            self
        }

        fn failing_in(mut self: Box<Self>, stage: RunStage) -> Box<Self> {
            self.fail_stage = Some(stage);
            self
        }

        fn push(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    impl Module for Recorder {
        fn module_name(&self) -> &str {
            "Recorder"
        }

        fn variable_revision_number(&self) -> u32 {
            1
        }

        fn settings(&self) -> Vec<&Setting> {
            Vec::new()
        }

        fn settings_mut(&mut self) -> Vec<&mut Setting> {
            Vec::new()
        }

        fn prepare_run(&mut self, _ws: &mut Workspace) -> ModuleResult<bool> {
            self.push("prepare_run".into());
            if self.fail_stage == Some(RunStage::PrepareRun) {
                return Err(ModuleError::Failed("no input".into()));
            }
            Ok(true)
        }

        fn prepare_group(
            &mut self,
            _ws: &mut Workspace,
            key: &GroupKey,
            _image_numbers: &[ImageNumber],
        ) -> ModuleResult<()> {
            self.push(format!("prepare_group {}", key));
            Ok(())
        }

        fn run(&mut self, ws: &mut Workspace) -> ModuleResult<()> {
            let n = ws.image_number()?;
            self.push(format!("run {}", n));
            if self.fail_on == Some(n) {
                return Err(ModuleError::Failed(format!("bad image set {}", n)));
            }
            ws.measurements.add_image_measurement(n, "Recorder_Seen", 1);
            Ok(())
        }

        fn post_group(
            &mut self,
            _ws: &mut Workspace,
            key: &GroupKey,
            _image_numbers: &[ImageNumber],
        ) -> ModuleResult<()> {
            self.push(format!("post_group {}", key));
            Ok(())
        }

        fn post_run(&mut self, _ws: &mut Workspace) -> ModuleResult<()> {
            self.push("post_run".into());
            Ok(())
        }

        fn get_measurement_columns(&self) -> Vec<MeasurementColumn> {
            vec![MeasurementColumn::image("Recorder_Seen", ColumnType::Integer)]
        }
    }

    /// Declares a post-group column but never writes it.
    struct LazyAggregate;

    impl Module for LazyAggregate {
        fn module_name(&self) -> &str {
            "LazyAggregate"
        }

        fn variable_revision_number(&self) -> u32 {
            1
        }

        fn settings(&self) -> Vec<&Setting> {
            Vec::new()
        }

        fn settings_mut(&mut self) -> Vec<&mut Setting> {
            Vec::new()
        }

        fn run(&mut self, _ws: &mut Workspace) -> ModuleResult<()> {
            Ok(())
        }

        fn is_aggregation_module(&self) -> bool {
            true
        }

        fn get_measurement_columns(&self) -> Vec<MeasurementColumn> {
            vec![MeasurementColumn::image("Lazy_Total", ColumnType::Float)
                .available(Availability::PostGroup)]
        }
    }

    fn pipeline(count: i64, grouped: bool, log: &Log) -> Pipeline {
        pipeline_with(count, grouped, Recorder::new(log))
    }

    fn pipeline_with(count: i64, grouped: bool, recorder: Box<Recorder>) -> Pipeline {
        let mut p = Pipeline::default();
        p.add_module(Source::new(count, grouped));
        p.add_module(recorder);
        p
    }

    #[test]
    fn test_hook_order_with_groups() {
        let log = Log::default();
        let mut p = pipeline(4, true, &log);
        let outcome = p.run(&RunOptions::new(), None).unwrap();
        assert!(outcome.is_success());
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "prepare_run",
                "prepare_group Metadata_ROW=A",
                "run 1",
                "run 2",
                "post_group Metadata_ROW=A",
                "prepare_group Metadata_ROW=B",
                "run 3",
                "run 4",
                "post_group Metadata_ROW=B",
                "post_run",
            ]
        );
        let m = &outcome.measurements;
        assert_eq!(
            m.get_experiment_measurement(EXIT_STATUS).and_then(|v| v.as_str()),
            Some("Success")
        );
        assert_eq!(
            m.get_image_measurement("Group_Index", ImageNumber(4))
                .and_then(|v| v.as_i64()),
            Some(2)
        );
        assert!(m.get_experiment_measurement(PIPELINE_TEXT).is_some());
    }

    #[test]
    fn test_skip_policy_continues_after_failure() {
        let log = Log::default();
        let mut p = pipeline_with(5, false, Recorder::new(&log).failing_on(3));
        let options = RunOptions::new().with_error_policy(ErrorPolicy::Skip);
        let outcome = p.run(&options, None).unwrap();

        assert_eq!(outcome.status, RunStatus::Failure);
        assert!(!outcome.aborted);
        assert_eq!(outcome.image_sets_run.len(), 5);
        let m = &outcome.measurements;
        assert!(!m.has_image_measurement("Recorder_Seen", ImageNumber(3)));
        assert!(m.has_image_measurement("Recorder_Seen", ImageNumber(5)));
        assert_eq!(
            m.get_image_measurement("ModuleError_02Recorder", ImageNumber(3))
                .and_then(|v| v.as_i64()),
            Some(1)
        );
        assert!(log.lock().unwrap().contains(&"post_run".to_string()));
    }

    #[test]
    fn test_abort_policy_stops_run() {
        let log = Log::default();
        let mut p = pipeline_with(5, false, Recorder::new(&log).failing_on(3));
        let outcome = p.run(&RunOptions::new(), None).unwrap();

        assert!(outcome.aborted);
        assert_eq!(outcome.image_sets_run, vec![ImageNumber(1), ImageNumber(2), ImageNumber(3)]);
        let log = log.lock().unwrap();
        assert!(!log.iter().any(|e| e.starts_with("post_")));
    }

    #[test]
    fn test_prepare_run_failure_is_fatal_under_skip() {
        let log = Log::default();
        let mut p = pipeline_with(3, false, Recorder::new(&log).failing_in(RunStage::PrepareRun));
        let options = RunOptions::new().with_error_policy(ErrorPolicy::Skip);
        let outcome = p.run(&options, None).unwrap();
        assert!(outcome.aborted);
        assert!(outcome.image_sets_run.is_empty());
        assert_eq!(outcome.status, RunStatus::Failure);
    }

    #[test]
    fn test_no_image_sets() {
        let log = Log::default();
        let mut p = Pipeline::default();
        p.add_module(Recorder::new(&log));
        assert!(matches!(
            p.run(&RunOptions::new(), None),
            Err(PipelineError::NoImageSets)
        ));
    }

    #[test]
    fn test_group_filter_and_range() {
        let log = Log::default();
        let mut p = pipeline(6, true, &log);
        let options = RunOptions::new().with_group(GroupKey::parse("ROW=B").unwrap());
        let outcome = p.run(&options, None).unwrap();
        assert_eq!(outcome.image_sets_run, vec![ImageNumber(3), ImageNumber(4)]);

        let options = RunOptions::new().with_range(Some(ImageNumber(2)), Some(ImageNumber(5)));
        let outcome = p.run(&options, None).unwrap();
        assert_eq!(
            outcome.image_sets_run,
            vec![ImageNumber(2), ImageNumber(3), ImageNumber(4), ImageNumber(5)]
        );
    }

    #[test]
    fn test_stop_flag_cancels_between_image_sets() {
        let log = Log::default();
        let mut p = pipeline(4, false, &log);
        let options = RunOptions::new();
        let stop = options.stop_flag();
        p.add_listener(move |e: &PipelineEvent| {
            if *e == PipelineEvent::ImageSetComplete(ImageNumber(2)) {
                stop.store(true, Ordering::Relaxed);
            }
        });
        let outcome = p.run(&options, None).unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.image_sets_run, vec![ImageNumber(1), ImageNumber(2)]);
        assert!(matches!(
            outcome.exceptions.as_slice(),
            [PipelineError::Cancelled(ImageNumber(3))]
        ));
    }

    #[test]
    fn test_incomplete_aggregation_is_reported() {
        let log = Log::default();
        let mut p = pipeline(2, false, &log);
        p.add_module(Box::new(LazyAggregate));
        let options = RunOptions::new().with_error_policy(ErrorPolicy::Skip);
        let outcome = p.run(&options, None).unwrap();
        assert_eq!(outcome.status, RunStatus::Failure);
        assert!(matches!(
            outcome.exceptions.as_slice(),
            [PipelineError::AggregationIncomplete { feature, missing, .. }]
                if feature == "Lazy_Total" && missing.len() == 2
        ));
    }

    #[test]
    fn test_run_exception_event_is_fatal_under_abort() {
        let log = Log::default();
        let mut p = pipeline_with(2, false, Recorder::new(&log).failing_on(1));

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let mut listener = MockPipelineListener::new();
        listener
            .expect_on_event()
            .returning(move |e| sink.lock().unwrap().push(e.clone()));
        p.add_listener(listener);
        p.run(&RunOptions::new(), None).unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.first(), Some(&PipelineEvent::RunStarted));
        assert_eq!(
            events.last(),
            Some(&PipelineEvent::RunFinished(RunStatus::Failure))
        );
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::RunException {
                stage: RunStage::Run,
                fatal: true,
                image_number: Some(ImageNumber(1)),
                ..
            }
        )));
        assert!(!events
            .iter()
            .any(|e| matches!(e, PipelineEvent::GroupComplete { .. })));
    }

    #[test]
    fn test_error_policy_parses() {
        assert_eq!("Skip".parse::<ErrorPolicy>(), Ok(ErrorPolicy::Skip));
        assert_eq!("abort".parse::<ErrorPolicy>(), Ok(ErrorPolicy::Abort));
        assert!("retry".parse::<ErrorPolicy>().is_err());
    }
}
