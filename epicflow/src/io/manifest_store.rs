//! Typed read/write of `features.yaml` and `progress.yaml`.
//!
//! Readers return `None` for both absent and malformed manifests: neither can
//! be trusted as state, so callers treat them the same way.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::io::layout::{FEATURE_INDEX_FILE, LEDGER_FILE};
use crate::manifest::{FeatureIndex, ProgressLedger};

/// Load `<epic>/features.yaml`.
pub fn read_feature_index(epic_dir: &Path) -> Option<FeatureIndex> {
    read_yaml(&epic_dir.join(FEATURE_INDEX_FILE))
}

/// Load `<feature>/progress.yaml`.
pub fn read_progress_ledger(feature_dir: &Path) -> Option<ProgressLedger> {
    read_yaml(&feature_dir.join(LEDGER_FILE))
}

/// Flip `completed` to true for the task group named `name`.
///
/// Returns `Ok(false)` if the ledger is unreadable or has no such group; never
/// adds a group.
pub fn mark_task_group_complete(feature_dir: &Path, name: &str) -> Result<bool> {
    let Some(mut ledger) = read_progress_ledger(feature_dir) else {
        return Ok(false);
    };
    let Some(group) = ledger.task_groups.iter_mut().find(|g| g.name == name) else {
        debug!(name, "task group not found in ledger");
        return Ok(false);
    };
    if !group.completed {
        group.completed = true;
        write_progress_ledger(feature_dir, &ledger)?;
    }
    Ok(true)
}

/// Flip `completed` to true for the index entry with `number`.
///
/// Returns `Ok(false)` if the index is unreadable or has no such entry.
pub fn mark_feature_complete(epic_dir: &Path, number: &str) -> Result<bool> {
    let Some(mut index) = read_feature_index(epic_dir) else {
        return Ok(false);
    };
    let Some(entry) = index.features.iter_mut().find(|e| e.number == number) else {
        debug!(number, "feature not found in index");
        return Ok(false);
    };
    if !entry.completed {
        entry.completed = true;
        write_feature_index(epic_dir, &index)?;
    }
    Ok(true)
}

/// Atomically write `<epic>/features.yaml`.
pub fn write_feature_index(epic_dir: &Path, index: &FeatureIndex) -> Result<()> {
    write_yaml(&epic_dir.join(FEATURE_INDEX_FILE), index)
}

/// Atomically write `<feature>/progress.yaml`.
pub fn write_progress_ledger(feature_dir: &Path, ledger: &ProgressLedger) -> Result<()> {
    write_yaml(&feature_dir.join(LEDGER_FILE), ledger)
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let contents = fs::read_to_string(path).ok()?;
    match serde_yaml::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(path = %path.display(), err = %err, "ignoring malformed manifest");
            None
        }
    }
}

fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let buf = serde_yaml::to_string(value).context("serialize manifest yaml")?;
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("manifest path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("yaml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp manifest {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace manifest {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{index_with, ledger};

    #[test]
    fn reads_ledger_in_documented_shape() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join(LEDGER_FILE),
            "task_groups:\n  - name: schema\n    completed: true\n  - name: api\n    completed: false\n",
        )
        .expect("write");

        let loaded = read_progress_ledger(temp.path()).expect("ledger");
        assert_eq!(loaded.task_groups.len(), 2);
        assert_eq!(loaded.task_groups[0].name, "schema");
        assert_eq!(loaded.first_incomplete(), Some(1));
    }

    #[test]
    fn reads_index_with_string_numbers() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join(FEATURE_INDEX_FILE),
            "epic_name: checkout\nepic_path: epics/2025-01-02-checkout\ngenerated: '2025-01-02'\ntotal_features: 1\nfeatures:\n  - number: '01'\n    name: cart\n    path: features/01-cart\n    description: Cart page\n    completed: false\n",
        )
        .expect("write");

        let index = read_feature_index(temp.path()).expect("index");
        assert_eq!(index.features[0].number, "01");
        assert_eq!(index.features[0].folder_name(), "01-cart");
    }

    #[test]
    fn malformed_and_missing_manifests_read_as_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(read_progress_ledger(temp.path()).is_none());

        fs::write(temp.path().join(LEDGER_FILE), "task_groups: [unclosed").expect("write");
        assert!(read_progress_ledger(temp.path()).is_none());

        fs::write(temp.path().join(FEATURE_INDEX_FILE), "just a scalar\n").expect("write");
        assert!(read_feature_index(temp.path()).is_none());
    }

    #[test]
    fn mark_task_group_flips_only_the_named_group() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_progress_ledger(temp.path(), &ledger(&[false, false, false])).expect("write");

        assert!(mark_task_group_complete(temp.path(), "group-2").expect("mark"));
        let loaded = read_progress_ledger(temp.path()).expect("ledger");
        let flags: Vec<bool> = loaded.task_groups.iter().map(|g| g.completed).collect();
        assert_eq!(flags, vec![false, true, false]);
        let names: Vec<&str> = loaded.task_groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["group-1", "group-2", "group-3"]);
    }

    #[test]
    fn mark_task_group_never_upserts() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_progress_ledger(temp.path(), &ledger(&[false])).expect("write");

        assert!(!mark_task_group_complete(temp.path(), "missing").expect("mark"));
        assert_eq!(
            read_progress_ledger(temp.path()).expect("ledger").task_groups.len(),
            1
        );
        let empty = tempfile::tempdir().expect("tempdir");
        assert!(!mark_task_group_complete(empty.path(), "group-1").expect("mark"));
        assert!(!empty.path().join(LEDGER_FILE).exists());
    }

    #[test]
    fn mark_feature_complete_updates_index() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_feature_index(temp.path(), &index_with(&[("01", "auth"), ("02", "billing")]))
            .expect("write");

        assert!(mark_feature_complete(temp.path(), "02").expect("mark"));
        assert!(!mark_feature_complete(temp.path(), "07").expect("mark"));
        let index = read_feature_index(temp.path()).expect("index");
        assert!(!index.features[0].completed);
        assert!(index.features[1].completed);
    }
}
