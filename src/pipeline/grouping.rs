//! Grouping coordinator.
//!
//! Collects the grouping the pipeline imposes, checks that it partitions the
//! image-set universe, and narrows it to what a run was asked to process.

use crate::measurements::column::{GROUP_INDEX, GROUP_NUMBER};
use crate::measurements::{Group, GroupKey, Grouping, Measurements};
use crate::module::ModuleError;
use crate::pipeline::error::{PipelineError, PipelineResult, RunStage};
use crate::pipeline::id::{ImageNumber, ImageNumberRange, ModuleNum};
use crate::pipeline::slot::ModuleSlot;
use crate::pipeline::workspace::{ImageSetData, Workspace};
use std::collections::BTreeSet;

/// Ask every enabled module for its grouping.
///
/// At most one module may contribute one. Without any, the whole universe is
/// a single group with an empty key.
pub fn collect_grouping(
    slots: &mut [ModuleSlot],
    measurements: &mut Measurements,
    batch_mode: bool,
) -> PipelineResult<Grouping> {
    let mut found: Option<(String, Grouping)> = None;
    let mut data = ImageSetData::default();
    for slot in slots.iter_mut().filter(|s| s.enabled) {
        let module_num = slot.module_num();
        let ModuleSlot { module, state, .. } = slot;
        let ws = Workspace::new(module_num, measurements, &mut data, state).in_batch_mode(batch_mode);
        let grouping = module
            .get_groupings(&ws)
            .map_err(|e| run_exception(module.module_name(), module_num, e))?;
        let Some(grouping) = grouping else {
            continue;
        };
        if let Some((first, _)) = &found {
            return Err(PipelineError::ConflictingGroupings(format!(
                "{} and {}",
                first,
                module.module_name()
            )));
        }
        found = Some((module.module_name().to_string(), grouping));
    }

    let grouping = match found {
        Some((name, grouping)) => {
            tracing::debug!(
                "{} groups by {:?} into {} groups",
                name,
                grouping.key_names,
                grouping.groups.len()
            );
            grouping
        }
        None => Grouping {
            key_names: Vec::new(),
            groups: vec![Group::new(1, GroupKey::new(), measurements.image_numbers())],
        },
    };
    validate_partition(&grouping, &measurements.image_numbers())?;
    Ok(grouping)
}

fn run_exception(
    module_name: &str,
    module_num: ModuleNum,
    e: ModuleError,
) -> PipelineError {
    PipelineError::RunException {
        module_num,
        module_name: module_name.to_string(),
        stage: RunStage::PrepareRun,
        image_number: None,
        message: e.to_string(),
    }
}

/// Every image set belongs to exactly one group, and groups are not empty.
pub fn validate_partition(grouping: &Grouping, universe: &[ImageNumber]) -> PipelineResult<()> {
    let universe: BTreeSet<ImageNumber> = universe.iter().copied().collect();
    let mut seen = BTreeSet::new();
    for group in &grouping.groups {
        if group.image_numbers.is_empty() {
            return Err(PipelineError::InvalidPartition(format!(
                "group [{}] is empty",
                group.key
            )));
        }
        for &n in &group.image_numbers {
            if !universe.contains(&n) {
                return Err(PipelineError::InvalidPartition(format!(
                    "image set {} of group [{}] does not exist",
                    n, group.key
                )));
            }
            if !seen.insert(n) {
                return Err(PipelineError::InvalidPartition(format!(
                    "image set {} is in more than one group",
                    n
                )));
            }
        }
    }
    if let Some(missing) = universe.difference(&seen).next() {
        return Err(PipelineError::InvalidPartition(format!(
            "image set {} is not in any group",
            missing
        )));
    }
    Ok(())
}

/// Record each image set's group number and position within its group.
pub fn record_group_membership(grouping: &Grouping, measurements: &mut Measurements) {
    for group in &grouping.groups {
        for (i, &n) in group.image_numbers.iter().enumerate() {
            measurements.add_image_measurement(n, GROUP_NUMBER, group.number);
            measurements.add_image_measurement(n, GROUP_INDEX, i as u32 + 1);
        }
    }
    if !grouping.key_names.is_empty() {
        measurements.set_grouping_tags(&grouping.key_names);
    }
}

/// Narrow `groups` to those matching `filter` and the image sets in `range`.
///
/// Groups left without image sets are dropped. A filter that matches no group
/// is an error.
pub fn select_groups(
    groups: Vec<Group>,
    filter: Option<&GroupKey>,
    range: ImageNumberRange,
) -> PipelineResult<Vec<Group>> {
    let groups: Vec<Group> = match filter {
        Some(filter) => {
            let matching: Vec<Group> = groups.into_iter().filter(|g| g.key.matches(filter)).collect();
            if matching.is_empty() {
                return Err(PipelineError::NoMatchingGroup(filter.to_string()));
            }
            matching
        }
        None => groups,
    };

    Ok(groups
        .into_iter()
        .filter_map(|mut group| {
            group.image_numbers.retain(|n| range.contains(*n));
            (!group.image_numbers.is_empty()).then_some(group)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn numbers(v: &[u32]) -> Vec<ImageNumber> {
        v.iter().copied().map(ImageNumber).collect()
    }

    fn two_groups() -> Grouping {
        Grouping {
            key_names: vec!["Metadata_ROW".into()],
            groups: vec![
                Group::new(1, GroupKey::new().with("Metadata_ROW", "A"), numbers(&[1, 2])),
                Group::new(2, GroupKey::new().with("Metadata_ROW", "B"), numbers(&[3, 4])),
            ],
        }
    }

    #[test]
    fn test_partition_accepts_exact_cover() {
        assert!(validate_partition(&two_groups(), &numbers(&[1, 2, 3, 4])).is_ok());
    }

    #[test]
    fn test_partition_rejects_overlap_and_gaps() {
        let mut overlap = two_groups();
        overlap.groups[1].image_numbers.push(ImageNumber(2));
        assert!(validate_partition(&overlap, &numbers(&[1, 2, 3, 4])).is_err());
        assert!(validate_partition(&two_groups(), &numbers(&[1, 2, 3, 4, 5])).is_err());
        assert!(validate_partition(&two_groups(), &numbers(&[1, 2, 3])).is_err());
    }

    #[test]
    fn test_select_by_key() {
        let selected = select_groups(
            two_groups().groups,
            Some(&GroupKey::parse("ROW=B").unwrap()),
            ImageNumberRange::all(),
        )
        .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].image_numbers, numbers(&[3, 4]));

        let err = select_groups(
            two_groups().groups,
            Some(&GroupKey::parse("ROW=H").unwrap()),
            ImageNumberRange::all(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::NoMatchingGroup(_)));
    }

    #[test]
    fn test_select_by_range_drops_empty_groups() {
        let range = ImageNumberRange::new(Some(ImageNumber(3)), Some(ImageNumber(3)));
        let selected = select_groups(two_groups().groups, None, range).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].number, 2);
        assert_eq!(selected[0].image_numbers, numbers(&[3]));
    }

    #[test]
    fn test_group_membership_recorded() {
        let mut m = Measurements::new();
        record_group_membership(&two_groups(), &mut m);
        assert_eq!(
            m.get_image_measurement(GROUP_INDEX, ImageNumber(4))
                .and_then(|v| v.as_i64()),
            Some(2)
        );
        assert_eq!(m.get_grouping_tags(), vec!["Metadata_ROW"]);
    }

    proptest! {
        #[test]
        fn prop_metadata_groupings_partition_universe(
            rows in prop::collection::vec(("[A-C]", 1u8..3), 1..40)
        ) {
            let mut m = Measurements::new();
            for (i, (row, col)) in rows.iter().enumerate() {
                let n = ImageNumber(i as u32 + 1);
                m.add_image_measurement(n, "Metadata_ROW", row.as_str());
                m.add_image_measurement(n, "Metadata_COL", *col as i64);
            }
            let key_names = vec!["ROW".to_string(), "COL".to_string()];
            let grouping = Grouping {
                groups: m.get_groupings(&key_names),
                key_names,
            };
            prop_assert!(validate_partition(&grouping, &m.image_numbers()).is_ok());
            for group in &grouping.groups {
                prop_assert!(group.image_numbers.windows(2).all(|w| w[0] < w[1]));
            }
        }
    }
}
