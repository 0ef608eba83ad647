//! Test-only helpers: manifest builders, temp git repositories, epic
//! fixtures, and a scripted runtime adapter.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde_json::json;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::core::snapshot::FeatureSnapshot;
use crate::core::types::{TokenUsage, ToolCallEvent, ToolResult};
use crate::io::adapter::{AdapterRun, EventObserver, InstructionRequest, RuntimeAdapter};
use crate::io::git::Git;
use crate::io::layout::EpicPaths;
use crate::io::manifest_store::{
    mark_task_group_complete, write_feature_index, write_progress_ledger,
};
use crate::manifest::{FeatureIndex, FeatureIndexEntry, ProgressLedger, TaskGroup};

/// Feature folder with a PRD and nothing else.
pub fn feature_snapshot(number: &str, name: &str) -> FeatureSnapshot {
    FeatureSnapshot {
        folder_name: format!("{number}-{name}"),
        number: number.to_string(),
        name: name.to_string(),
        has_prd: true,
        has_tasks: false,
        has_ledger_file: false,
        ledger: None,
    }
}

/// Index listing `(number, name)` pairs, none completed.
pub fn index_with(features: &[(&str, &str)]) -> FeatureIndex {
    FeatureIndex {
        epic_name: "checkout".to_string(),
        epic_path: "epics/2025-01-02-checkout".to_string(),
        generated: "2025-01-02".to_string(),
        total_features: features.len(),
        features: features
            .iter()
            .map(|(number, name)| FeatureIndexEntry {
                number: number.to_string(),
                name: name.to_string(),
                path: format!("features/{number}-{name}"),
                description: format!("{name} feature"),
                completed: false,
            })
            .collect(),
    }
}

/// Ledger with groups named `group-1`, `group-2`, ...
pub fn ledger(completed: &[bool]) -> ProgressLedger {
    ProgressLedger {
        task_groups: completed
            .iter()
            .enumerate()
            .map(|(i, &completed)| TaskGroup {
                name: format!("group-{}", i + 1),
                completed,
            })
            .collect(),
    }
}

pub fn file_sha256(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// A git repository in a temp dir with one commit (`README.md`).
pub struct TestRepo {
    _temp: TempDir,
    root: PathBuf,
    git: Git,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let repo = Self::unborn()?;
        fs::write(repo.root.join("README.md"), "# test repo\n").context("write README.md")?;
        repo.commit_all("initial")?;
        Ok(repo)
    }

    /// Freshly initialized repository whose branch has no commits yet.
    pub fn unborn() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp dir")?;
        let root = temp.path().to_path_buf();
        let git = Git::new(&root);
        git.run_raw(&["init", "-q"])?;
        git.run_raw(&["config", "user.email", "epicflow@example.com"])?;
        git.run_raw(&["config", "user.name", "epicflow tests"])?;
        git.run_raw(&["config", "commit.gpgsign", "false"])?;
        Ok(Self {
            _temp: temp,
            root,
            git,
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    /// Create an empty `epics/2025-01-02-<slug>` directory.
    pub fn epic(&self, slug: &str) -> Result<EpicFiles> {
        EpicFiles::create(self.root.join("epics").join(format!("2025-01-02-{slug}")))
    }

    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.git.run_raw(&["add", "-A"])?;
        self.git.run_raw(&["commit", "-q", "-m", message])?;
        Ok(())
    }

    /// Subjects of the last `n` commits, newest first.
    pub fn commit_subjects(&self, n: usize) -> Result<Vec<String>> {
        let out = self.git.run_raw(&["log", &format!("-{n}"), "--format=%s"])?;
        Ok(out.lines().map(str::to_string).collect())
    }
}

/// Writes planning artifacts into one epic directory.
#[derive(Debug, Clone)]
pub struct EpicFiles {
    paths: EpicPaths,
}

impl EpicFiles {
    fn create(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;
        Ok(Self {
            paths: EpicPaths::new(root),
        })
    }

    pub fn paths(&self) -> &EpicPaths {
        &self.paths
    }

    pub fn write_requirements(&self) -> Result<()> {
        write(&self.paths.requirements_path, "# Requirements\n\nShip it.\n")
    }

    pub fn write_verification(&self) -> Result<()> {
        write(&self.paths.verification_path, "# Verification\n\nAll good.\n")
    }

    /// Write `features.yaml` and one folder with a PRD per entry.
    pub fn plan_features(&self, features: &[(&str, &str)]) -> Result<()> {
        let mut index = index_with(features);
        index.epic_path = self.paths.root.display().to_string();
        write_feature_index(&self.paths.root, &index)?;
        for (number, name) in features {
            self.add_feature_dir(&format!("{number}-{name}"))?;
        }
        Ok(())
    }

    /// Feature folder with a PRD but no index entry.
    pub fn add_feature_dir(&self, folder: &str) -> Result<()> {
        write(&self.paths.feature(folder).prd_path, "# PRD\n")
    }

    pub fn write_tasks(&self, folder: &str) -> Result<()> {
        write(&self.paths.feature(folder).tasks_path, "# Tasks\n")
    }

    pub fn write_ledger(&self, folder: &str, completed: &[bool]) -> Result<()> {
        write_progress_ledger(&self.paths.feature(folder).dir, &ledger(completed))
    }

    pub fn write_prompt(&self, folder: &str, task_group_index: usize, text: &str) -> Result<()> {
        write(&self.paths.feature(folder).prompt_path(task_group_index), text)
    }

    pub fn complete_group(&self, folder: &str, name: &str) -> Result<()> {
        if mark_task_group_complete(&self.paths.feature(folder).dir, name)? {
            Ok(())
        } else {
            Err(anyhow!("no task group {name} in {folder}"))
        }
    }
}

fn write(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

/// An epic in a plain temp dir (no git).
pub struct EpicFixture {
    _temp: TempDir,
    files: EpicFiles,
}

impl EpicFixture {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp dir")?;
        let files = EpicFiles::create(temp.path().join("2025-01-02-checkout"))?;
        Ok(Self { _temp: temp, files })
    }
}

impl Deref for EpicFixture {
    type Target = EpicFiles;

    fn deref(&self) -> &EpicFiles {
        &self.files
    }
}

type Effect = Box<dyn Fn(&InstructionRequest) -> Result<()>>;

/// One queued response of a [`ScriptedAdapter`].
pub struct ScriptedStep {
    /// Applied to the working tree before any events are replayed.
    effect: Effect,
    events: Vec<ToolCallEvent>,
    exit_code: i32,
}

impl ScriptedStep {
    pub fn succeeding(effect: impl Fn(&InstructionRequest) -> Result<()> + 'static) -> Self {
        Self {
            effect: Box::new(effect),
            events: vec![ToolCallEvent::new(
                "Read",
                json!({"file_path": "README.md"}),
                ToolResult::ok(),
            )],
            exit_code: 0,
        }
    }

    /// Succeeds after marking `group` complete in the feature's ledger.
    pub fn completing(epic: &EpicFiles, folder: &str, group: &str) -> Self {
        let (epic, folder, group) = (epic.clone(), folder.to_string(), group.to_string());
        Self::succeeding(move |_| epic.complete_group(&folder, &group))
    }

    pub fn failing(
        exit_code: i32,
        effect: impl Fn(&InstructionRequest) -> Result<()> + 'static,
    ) -> Self {
        Self {
            exit_code,
            ..Self::succeeding(effect)
        }
    }

    /// Repeats one failing `Bash` call until the observer breaks.
    pub fn looping(effect: impl Fn(&InstructionRequest) -> Result<()> + 'static) -> Self {
        let event = ToolCallEvent::new(
            "Bash",
            json!({"command": "cargo build"}),
            ToolResult::error("error[E0425]: cannot find value `x`"),
        );
        Self {
            effect: Box::new(effect),
            events: vec![event; 20],
            exit_code: 0,
        }
    }
}

/// Runtime adapter that replays queued [`ScriptedStep`]s without spawning.
pub struct ScriptedAdapter {
    steps: RefCell<VecDeque<ScriptedStep>>,
    requests: RefCell<Vec<InstructionRequest>>,
    calls: Cell<usize>,
}

impl ScriptedAdapter {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: RefCell::new(steps.into()),
            requests: RefCell::new(Vec::new()),
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<InstructionRequest> {
        self.requests.borrow().clone()
    }
}

impl RuntimeAdapter for ScriptedAdapter {
    fn run_instruction(
        &self,
        request: &InstructionRequest,
        observer: &mut EventObserver<'_>,
    ) -> Result<AdapterRun> {
        self.calls.set(self.calls.get() + 1);
        self.requests.borrow_mut().push(request.clone());
        let step = self
            .steps
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted adapter exhausted at {}", request.step))?;

        (step.effect)(request)?;

        let mut loop_detected = false;
        for event in &step.events {
            if observer(event).is_break() {
                loop_detected = true;
                break;
            }
        }

        Ok(AdapterRun {
            success: !loop_detected && step.exit_code == 0,
            exit_code: (!loop_detected).then_some(step.exit_code),
            duration_ms: 5,
            loop_detected,
            timed_out: false,
            token_usage: Some(TokenUsage {
                input_tokens: 100,
                output_tokens: 20,
                ..TokenUsage::default()
            }),
            cost_usd: Some(0.01),
        })
    }
}
