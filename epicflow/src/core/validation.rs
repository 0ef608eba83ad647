//! Cross-checks between the feature index and the folders on disk.

use std::collections::BTreeSet;

use crate::core::snapshot::FeatureSnapshot;
use crate::manifest::FeatureIndex;

/// Check that index entries and discovered folders biject on `(number, name)`.
///
/// Every discrepancy is reported, in deterministic order:
/// - duplicate index entries
/// - index entries without a folder
/// - folders without an index entry
pub fn validate_feature_index(index: &FeatureIndex, features: &[FeatureSnapshot]) -> Vec<String> {
    let mut errors = Vec::new();

    let mut indexed = BTreeSet::new();
    for entry in &index.features {
        let key = (entry.number.clone(), entry.name.clone());
        if !indexed.insert(key) {
            errors.push(format!(
                "duplicate entry '{}' in features.yaml",
                entry.folder_name()
            ));
        }
    }

    let discovered: BTreeSet<(String, String)> = features
        .iter()
        .map(|feature| (feature.number.clone(), feature.name.clone()))
        .collect();

    for (number, name) in indexed.difference(&discovered) {
        errors.push(format!(
            "features.yaml lists '{number}-{name}' but no such folder exists under features/"
        ));
    }
    for (number, name) in discovered.difference(&indexed) {
        errors.push(format!(
            "folder features/{number}-{name} has no entry in features.yaml"
        ));
    }

    errors
}
