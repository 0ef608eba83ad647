//! Canonical paths inside an epic directory and the directory scan that
//! feeds the progress detector.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use regex::Regex;
use tracing::debug;

use crate::core::snapshot::{EpicSnapshot, FeatureSnapshot};
use crate::io::manifest_store::{read_feature_index, read_progress_ledger};

pub const REQUIREMENTS_FILE: &str = "requirements.md";
pub const FEATURE_INDEX_FILE: &str = "features.yaml";
pub const VERIFICATION_FILE: &str = "verification.md";
pub const FEATURES_DIR: &str = "features";
pub const PRD_FILE: &str = "prd.md";
pub const TASKS_FILE: &str = "tasks.md";
pub const LEDGER_FILE: &str = "progress.yaml";
pub const PROMPTS_DIR: &str = "prompts";

static FEATURE_DIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{2}-.+$").expect("feature dir regex is valid"));

/// All canonical paths for one epic.
#[derive(Debug, Clone)]
pub struct EpicPaths {
    pub root: PathBuf,
    pub requirements_path: PathBuf,
    pub feature_index_path: PathBuf,
    pub verification_path: PathBuf,
    pub features_dir: PathBuf,
}

impl EpicPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            requirements_path: root.join(REQUIREMENTS_FILE),
            feature_index_path: root.join(FEATURE_INDEX_FILE),
            verification_path: root.join(VERIFICATION_FILE),
            features_dir: root.join(FEATURES_DIR),
            root,
        }
    }

    pub fn feature(&self, folder_name: &str) -> FeaturePaths {
        FeaturePaths::new(self.features_dir.join(folder_name))
    }

    /// Slug of a `YYYY-MM-DD-slug` directory, else the bare directory name.
    pub fn slug(&self) -> String {
        EpicId::from_path(&self.root)
            .map(|id| id.slug)
            .or_else(|| {
                self.root
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .unwrap_or_default()
    }
}

/// Paths for one `features/NN-name` folder.
#[derive(Debug, Clone)]
pub struct FeaturePaths {
    pub dir: PathBuf,
    pub prd_path: PathBuf,
    pub tasks_path: PathBuf,
    pub ledger_path: PathBuf,
    pub prompts_dir: PathBuf,
}

impl FeaturePaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            prd_path: dir.join(PRD_FILE),
            tasks_path: dir.join(TASKS_FILE),
            ledger_path: dir.join(LEDGER_FILE),
            prompts_dir: dir.join(PROMPTS_DIR),
            dir,
        }
    }

    /// Prompt file for the task group at `index` (`prompts/01.md` for index 0).
    pub fn prompt_path(&self, task_group_index: usize) -> PathBuf {
        self.prompts_dir
            .join(format!("{:02}.md", task_group_index + 1))
    }
}

/// `(date, slug)` parsed from a `YYYY-MM-DD-slug` epic directory name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpicId {
    pub date: NaiveDate,
    pub slug: String,
}

impl EpicId {
    pub fn parse(dir_name: &str) -> Option<Self> {
        if dir_name.len() < 12 || !dir_name.is_char_boundary(10) {
            return None;
        }
        let (date, rest) = dir_name.split_at(10);
        let slug = rest.strip_prefix('-')?;
        if slug.is_empty() {
            return None;
        }
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
        Some(Self {
            date,
            slug: slug.to_string(),
        })
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.file_name()
            .and_then(|name| name.to_str())
            .and_then(Self::parse)
    }
}

impl std::fmt::Display for EpicId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.date.format("%Y-%m-%d"), self.slug)
    }
}

/// List feature folders matching `NN-name`, sorted by name.
///
/// A missing `features/` directory yields an empty list.
pub fn discover_features(paths: &EpicPaths) -> Result<Vec<FeatureSnapshot>> {
    if !paths.features_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    let entries = fs::read_dir(&paths.features_dir)
        .with_context(|| format!("read {}", paths.features_dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", paths.features_dir.display()))?;
        if !entry.path().is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if FEATURE_DIR_RE.is_match(&name) {
            names.push(name);
        }
    }
    names.sort();

    let mut features = Vec::with_capacity(names.len());
    for folder_name in names {
        let Some((number, name)) = FeatureSnapshot::split_folder_name(&folder_name) else {
            continue;
        };
        let feature_paths = paths.feature(&folder_name);
        features.push(FeatureSnapshot {
            number: number.to_string(),
            name: name.to_string(),
            has_prd: feature_paths.prd_path.is_file(),
            has_tasks: feature_paths.tasks_path.is_file(),
            has_ledger_file: feature_paths.ledger_path.is_file(),
            ledger: read_progress_ledger(&feature_paths.dir),
            folder_name,
        });
    }
    Ok(features)
}

/// Read everything the detector needs from disk.
pub fn scan_epic(paths: &EpicPaths) -> Result<EpicSnapshot> {
    let features = discover_features(paths)?;
    let snapshot = EpicSnapshot {
        has_requirements: paths.requirements_path.is_file(),
        index: read_feature_index(&paths.root),
        features,
        has_verification: paths.verification_path.is_file(),
    };
    debug!(
        epic = %paths.root.display(),
        features = snapshot.features.len(),
        has_index = snapshot.index.is_some(),
        "scanned epic"
    );
    Ok(snapshot)
}
