//! Resume-point decision tree.
//!
//! Only artifact presence and ledger flags are consulted, never artifact
//! content, so the result is independent of what the agent wrote.

use crate::core::snapshot::EpicSnapshot;
use crate::core::types::ResumePoint;
use crate::core::validation::validate_feature_index;

/// Why a resume point could not be derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectError {
    /// The epic was never planned.
    MissingRequirements,
    /// Index and folders disagree; carries every discrepancy.
    IndexMismatch(Vec<String>),
}

/// Evaluate the decision tree top to bottom; the first match wins.
pub fn decide(snapshot: &EpicSnapshot) -> Result<ResumePoint, DetectError> {
    if !snapshot.has_requirements {
        return Err(DetectError::MissingRequirements);
    }

    let Some(index) = &snapshot.index else {
        return Ok(ResumePoint::CreateFeatures);
    };
    if snapshot.features.is_empty() {
        return Ok(ResumePoint::CreateFeatures);
    }

    let errors = validate_feature_index(index, &snapshot.features);
    if !errors.is_empty() {
        return Err(DetectError::IndexMismatch(errors));
    }

    if let Some(feature_index) = snapshot.features.iter().position(|f| !f.has_tasks) {
        return Ok(ResumePoint::CreateTasks { feature_index });
    }

    if let Some(feature_index) = snapshot.features.iter().position(|f| f.ledger.is_none()) {
        return Ok(ResumePoint::CreateTaskPrompts { feature_index });
    }

    for (feature_index, feature) in snapshot.features.iter().enumerate() {
        let first_open = feature
            .ledger
            .as_ref()
            .and_then(|ledger| ledger.first_incomplete());
        if let Some(task_group_index) = first_open {
            return Ok(ResumePoint::Implement {
                feature_index,
                task_group_index,
            });
        }
    }

    if !snapshot.has_verification {
        return Ok(ResumePoint::Finalize);
    }

    Ok(ResumePoint::Complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ProgressLedger, TaskGroup};
    use crate::test_support::{feature_snapshot, index_with, ledger};

    fn planned(features: &[(&str, &str)]) -> EpicSnapshot {
        EpicSnapshot {
            has_requirements: true,
            index: Some(index_with(features)),
            features: features
                .iter()
                .map(|(number, name)| feature_snapshot(number, name))
                .collect(),
            has_verification: false,
        }
    }

    fn with_ledgers(mut snapshot: EpicSnapshot, ledgers: Vec<ProgressLedger>) -> EpicSnapshot {
        for (feature, ledger) in snapshot.features.iter_mut().zip(ledgers) {
            feature.has_tasks = true;
            feature.has_ledger_file = true;
            feature.ledger = Some(ledger);
        }
        snapshot
    }

    #[test]
    fn missing_requirements_is_fatal() {
        let snapshot = EpicSnapshot::default();
        assert_eq!(decide(&snapshot), Err(DetectError::MissingRequirements));
    }

    #[test]
    fn no_index_means_create_features() {
        let snapshot = EpicSnapshot {
            has_requirements: true,
            ..EpicSnapshot::default()
        };
        assert_eq!(decide(&snapshot), Ok(ResumePoint::CreateFeatures));
    }

    #[test]
    fn index_without_folders_means_create_features() {
        let mut snapshot = planned(&[("01", "auth")]);
        snapshot.features.clear();
        assert_eq!(decide(&snapshot), Ok(ResumePoint::CreateFeatures));
    }

    #[test]
    fn mismatch_reports_all_errors() {
        let mut snapshot = planned(&[("01", "auth"), ("02", "billing")]);
        snapshot.features[1] = feature_snapshot("03", "search");
        let Err(DetectError::IndexMismatch(errors)) = decide(&snapshot) else {
            panic!("expected mismatch");
        };
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn first_feature_without_tasks_is_selected() {
        let mut snapshot = planned(&[("01", "auth"), ("02", "billing"), ("03", "search")]);
        snapshot.features[0].has_tasks = true;
        assert_eq!(
            decide(&snapshot),
            Ok(ResumePoint::CreateTasks { feature_index: 1 })
        );
    }

    #[test]
    fn corrupt_ledger_counts_as_missing() {
        let mut snapshot = with_ledgers(
            planned(&[("01", "auth"), ("02", "billing")]),
            vec![ledger(&[true]), ledger(&[false])],
        );
        snapshot.features[1].ledger = None;
        assert_eq!(
            decide(&snapshot),
            Ok(ResumePoint::CreateTaskPrompts { feature_index: 1 })
        );
    }

    #[test]
    fn tasks_phase_precedes_prompt_phase_across_features() {
        let mut snapshot = planned(&[("01", "auth"), ("02", "billing")]);
        snapshot.features[0].has_tasks = true;
        snapshot.features[1].has_tasks = false;
        assert_eq!(
            decide(&snapshot),
            Ok(ResumePoint::CreateTasks { feature_index: 1 })
        );
    }

    #[test]
    fn resume_index_equals_completed_prefix_length() {
        for total in 1..=6usize {
            for done in 0..total {
                let flags: Vec<bool> = (0..total).map(|i| i < done).collect();
                let snapshot = with_ledgers(planned(&[("01", "auth")]), vec![ledger(&flags)]);
                assert_eq!(
                    decide(&snapshot),
                    Ok(ResumePoint::Implement {
                        feature_index: 0,
                        task_group_index: done,
                    }),
                    "total={total} done={done}"
                );
            }
        }
    }

    #[test]
    fn first_incomplete_wins_over_later_gaps() {
        let snapshot = with_ledgers(
            planned(&[("01", "auth")]),
            vec![ledger(&[true, false, true, false])],
        );
        assert_eq!(
            decide(&snapshot),
            Ok(ResumePoint::Implement {
                feature_index: 0,
                task_group_index: 1,
            })
        );
    }

    #[test]
    fn completed_feature_rolls_over_to_next() {
        let snapshot = with_ledgers(
            planned(&[("01", "auth"), ("02", "billing")]),
            vec![ledger(&[true, true]), ledger(&[false, false])],
        );
        assert_eq!(
            decide(&snapshot),
            Ok(ResumePoint::Implement {
                feature_index: 1,
                task_group_index: 0,
            })
        );
    }

    #[test]
    fn empty_ledger_is_treated_as_complete() {
        let snapshot = with_ledgers(
            planned(&[("01", "auth"), ("02", "billing")]),
            vec![ProgressLedger::default(), ledger(&[false])],
        );
        assert_eq!(
            decide(&snapshot),
            Ok(ResumePoint::Implement {
                feature_index: 1,
                task_group_index: 0,
            })
        );
    }

    #[test]
    fn all_groups_done_without_verification_is_finalize() {
        let snapshot = with_ledgers(planned(&[("01", "auth")]), vec![ledger(&[true, true])]);
        assert_eq!(decide(&snapshot), Ok(ResumePoint::Finalize));
    }

    #[test]
    fn verification_present_is_complete() {
        let mut snapshot = with_ledgers(planned(&[("01", "auth")]), vec![ledger(&[true])]);
        snapshot.has_verification = true;
        assert_eq!(decide(&snapshot), Ok(ResumePoint::Complete));
    }

    #[test]
    fn two_feature_scenario_moves_from_implement_to_finalize() {
        let mut snapshot = with_ledgers(
            planned(&[("01", "auth"), ("02", "billing")]),
            vec![ledger(&[true, true]), ledger(&[false])],
        );
        assert_eq!(
            decide(&snapshot),
            Ok(ResumePoint::Implement {
                feature_index: 1,
                task_group_index: 0,
            })
        );
        assert_eq!(decide(&snapshot), decide(&snapshot));

        snapshot.features[1].ledger = Some(ProgressLedger {
            task_groups: vec![TaskGroup {
                name: "group-1".to_string(),
                completed: true,
            }],
        });
        assert_eq!(decide(&snapshot), Ok(ResumePoint::Finalize));
    }
}
