use serde::{Deserialize, Serialize};

/// Per-epic feature index (`features.yaml`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeatureIndex {
    pub epic_name: String,
    pub epic_path: String,
    #[serde(default)]
    pub generated: String,
    #[serde(default)]
    pub total_features: usize,
    #[serde(default)]
    pub features: Vec<FeatureIndexEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeatureIndexEntry {
    /// Two-digit, zero-padded; kept as a string so it sorts lexicographically.
    pub number: String,
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub completed: bool,
}

impl FeatureIndexEntry {
    /// Folder name this entry must correspond to (`NN-name`).
    pub fn folder_name(&self) -> String {
        format!("{}-{}", self.number, self.name)
    }
}

/// Per-feature progress ledger (`progress.yaml`).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressLedger {
    pub task_groups: Vec<TaskGroup>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskGroup {
    pub name: String,
    pub completed: bool,
}

impl ProgressLedger {
    /// Lowest index with `completed == false`.
    pub fn first_incomplete(&self) -> Option<usize> {
        self.task_groups.iter().position(|group| !group.completed)
    }

    pub fn is_complete(&self) -> bool {
        self.first_incomplete().is_none()
    }
}
