//! In-memory view of an epic directory used by the pure decision logic.

use crate::manifest::{FeatureIndex, ProgressLedger};

/// Everything the progress detector needs to know about an epic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpicSnapshot {
    pub has_requirements: bool,
    /// `None` when `features.yaml` is absent or could not be parsed.
    pub index: Option<FeatureIndex>,
    /// Feature folders in execution order.
    pub features: Vec<FeatureSnapshot>,
    pub has_verification: bool,
}

/// One discovered `NN-name` feature folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSnapshot {
    pub folder_name: String,
    pub number: String,
    pub name: String,
    pub has_prd: bool,
    pub has_tasks: bool,
    pub has_ledger_file: bool,
    /// Parsed ledger; `None` when absent or corrupt.
    pub ledger: Option<ProgressLedger>,
}

impl FeatureSnapshot {
    /// Split a folder name of the form `NN-name` into its parts.
    pub fn split_folder_name(folder_name: &str) -> Option<(&str, &str)> {
        let (number, name) = folder_name.split_once('-')?;
        if number.len() != 2 || !number.bytes().all(|b| b.is_ascii_digit()) || name.is_empty() {
            return None;
        }
        Some((number, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_first_dash_only() {
        assert_eq!(
            FeatureSnapshot::split_folder_name("01-user-auth"),
            Some(("01", "user-auth"))
        );
    }

    #[test]
    fn rejects_non_two_digit_prefix() {
        assert_eq!(FeatureSnapshot::split_folder_name("1-auth"), None);
        assert_eq!(FeatureSnapshot::split_folder_name("001-auth"), None);
        assert_eq!(FeatureSnapshot::split_folder_name("ab-auth"), None);
        assert_eq!(FeatureSnapshot::split_folder_name("01-"), None);
    }
}
