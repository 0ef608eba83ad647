//! Resumable executor for phases 3-7.
//!
//! Every agent invocation runs inside a checkpoint: on success the working
//! tree is committed, on a loop abort it is reset to the commit captured
//! before the step. After each phase the resume point is re-detected from
//! disk, so a run can be interrupted at any point and picked up again.

use std::fs;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::loop_detector::{LoopDetectionConfig, LoopDetector, LoopReason};
use crate::core::types::{PipelinePhase, ResumePoint, ToolCallEvent};
use crate::core::usage::TokenUsageAggregate;
use crate::detect::{detect, detect_paths};
use crate::errors::{
    AdapterExecutionError, LoopDetectedError, ManifestDriftWarning, PhaseStalledError,
};
use crate::io::adapter::{InstructionRequest, RuntimeAdapter};
use crate::io::checkpoint::CheckpointManager;
use crate::io::config::{EngineConfig, ensure_state_dir};
use crate::io::git::Git;
use crate::io::instructions::InstructionRenderer;
use crate::io::layout::{EpicPaths, scan_epic};
use crate::io::manifest_store::{mark_feature_complete, read_progress_ledger};

pub const SNAPSHOT_MESSAGE: &str = "chore(epicflow): snapshot pending changes";

/// Knobs for one pipeline invocation, resolved from [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub step_timeout: Duration,
    pub output_limit_bytes: usize,
    pub loop_detection: LoopDetectionConfig,
    /// Branch to create or check out before the first step.
    pub branch: Option<String>,
    /// Copy each step's raw agent stream under `.epicflow/logs/`.
    pub stream_logs: bool,
}

impl PipelineConfig {
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            step_timeout: Duration::from_secs(config.step_timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
            loop_detection: config.loop_detection.clone(),
            branch: config.git.branch.clone(),
            stream_logs: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

/// One committed (or no-op) step, reported through `on_step`.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub phase: PipelinePhase,
    pub label: String,
    /// HEAD after the step, when the step produced a commit.
    pub commit: Option<String>,
    pub duration_ms: u64,
    pub cost_usd: Option<f64>,
    pub warning: Option<ManifestDriftWarning>,
}

/// Summary of a pipeline invocation that reached `Complete`.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    pub start: ResumePoint,
    pub end: ResumePoint,
    pub steps_executed: u32,
    pub warnings: Vec<ManifestDriftWarning>,
}

/// Run the epic at `epic_dir` from its detected resume point to completion.
///
/// Token and cost totals are folded into `usage` as steps finish, so the
/// caller still has them when a step fails. Stops at the first fatal error:
/// [`StructuralValidationError`](crate::errors::StructuralValidationError),
/// [`AdapterExecutionError`], [`LoopDetectedError`] or [`PhaseStalledError`].
#[instrument(skip_all, fields(epic = %epic_dir.display()))]
pub fn run_pipeline<A: RuntimeAdapter, F: FnMut(&StepReport)>(
    epic_dir: &Path,
    adapter: &A,
    config: &PipelineConfig,
    usage: &mut TokenUsageAggregate,
    on_step: F,
) -> Result<PipelineOutcome> {
    let start = detect(epic_dir)?;
    info!(%start, "resume point");
    if start.is_complete() {
        return Ok(PipelineOutcome {
            start,
            end: start,
            steps_executed: 0,
            warnings: Vec::new(),
        });
    }

    let root = fs::canonicalize(epic_dir)
        .with_context(|| format!("resolve epic path {}", epic_dir.display()))?;
    let paths = EpicPaths::new(root);
    let repo_root = Git::new(&paths.root).toplevel()?;
    let git = Git::new(&repo_root);
    prepare_branch(&git, config.branch.as_deref())?;

    let log_dir = if config.stream_logs {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
        Some(ensure_state_dir(&repo_root)?.join(stamp))
    } else {
        None
    };

    let checkpoints = CheckpointManager::new(git);
    if checkpoints.commit_if_dirty(SNAPSHOT_MESSAGE)? {
        info!("committed pending changes before first step");
    }

    let mut run = PipelineRun {
        paths,
        repo_root,
        log_dir,
        adapter,
        config,
        checkpoints,
        renderer: InstructionRenderer::new()?,
        usage,
        on_step,
        steps_executed: 0,
        warnings: Vec::new(),
    };
    let end = run.drive(start)?;
    Ok(PipelineOutcome {
        start,
        end,
        steps_executed: run.steps_executed,
        warnings: run.warnings,
    })
}

/// Refuse detached HEAD; switch to (or create) the configured branch.
fn prepare_branch(git: &Git, branch: Option<&str>) -> Result<()> {
    let current = git.current_branch()?;
    let Some(branch) = branch else {
        return Ok(());
    };
    if current == branch {
        return Ok(());
    }
    if git.branch_exists(branch)? {
        info!(branch, "checking out existing branch");
        git.checkout_branch(branch)
    } else {
        info!(branch, "creating branch");
        git.checkout_new_branch(branch)
    }
}

struct StepSpec {
    phase: PipelinePhase,
    label: String,
    instruction: String,
    commit_message: String,
}

struct PipelineRun<'a, A, F> {
    paths: EpicPaths,
    repo_root: PathBuf,
    log_dir: Option<PathBuf>,
    adapter: &'a A,
    config: &'a PipelineConfig,
    checkpoints: CheckpointManager,
    renderer: InstructionRenderer,
    usage: &'a mut TokenUsageAggregate,
    on_step: F,
    steps_executed: u32,
    warnings: Vec<ManifestDriftWarning>,
}

impl<A: RuntimeAdapter, F: FnMut(&StepReport)> PipelineRun<'_, A, F> {
    /// Run phases in order, re-detecting after each. A phase is never
    /// revisited within one invocation.
    ///
    /// Drift inside a phase only warns; the remaining units of that phase
    /// still run. It becomes terminal here, at the phase boundary, when the
    /// re-detected point has not moved past the phase (`PhaseStalledError`).
    fn drive(&mut self, start: ResumePoint) -> Result<ResumePoint> {
        let mut point = start;
        loop {
            let phase = point.phase();
            match point {
                ResumePoint::Complete => return Ok(point),
                ResumePoint::CreateFeatures => self.create_features()?,
                ResumePoint::CreateTasks { feature_index } => self.create_tasks(feature_index)?,
                ResumePoint::CreateTaskPrompts { feature_index } => {
                    self.create_task_prompts(feature_index)?;
                }
                ResumePoint::Implement {
                    feature_index,
                    task_group_index,
                } => self.implement(feature_index, task_group_index)?,
                ResumePoint::Finalize => self.finalize()?,
            }

            let next = detect_paths(&self.paths)?;
            if !next.is_complete() && next.phase() <= phase {
                warn!(%phase, %next, "phase did not advance");
                return Err(PhaseStalledError { phase, next }.into());
            }
            info!(%phase, %next, "phase finished");
            point = next;
        }
    }

    fn create_features(&mut self) -> Result<()> {
        let phase = PipelinePhase::CreateFeatures;
        let spec = StepSpec {
            phase,
            label: phase.as_str().to_string(),
            instruction: self.renderer.create_features(&self.paths)?,
            commit_message: format!("chore(epicflow): {} for {}", phase.as_str(), self.paths.slug()),
        };
        self.execute_step(spec, |paths| {
            let snapshot = scan_epic(paths)?;
            if snapshot.index.is_none() {
                return Ok(Some(format!(
                    "{} is missing or malformed",
                    paths.feature_index_path.display()
                )));
            }
            if snapshot.features.is_empty() {
                return Ok(Some(format!(
                    "no NN-name folders under {}",
                    paths.features_dir.display()
                )));
            }
            Ok(None)
        })
    }

    fn create_tasks(&mut self, start: usize) -> Result<()> {
        let phase = PipelinePhase::CreateTasks;
        let snapshot = scan_epic(&self.paths)?;
        let folders: Vec<String> = snapshot
            .features
            .iter()
            .map(|f| f.folder_name.clone())
            .collect();
        for (i, feature) in snapshot.features.iter().enumerate().skip(start) {
            let folder = &feature.folder_name;
            if feature.has_tasks {
                debug!(folder, "tasks already present");
                continue;
            }
            let tasks_path = self.paths.feature(folder).tasks_path;
            let spec = StepSpec {
                phase,
                label: format!("{}-{folder}", phase.as_str()),
                instruction: self.renderer.create_tasks(&self.paths, folder, &folders[..i])?,
                commit_message: format!("chore(epicflow): {} for {folder}", phase.as_str()),
            };
            self.execute_step(spec, move |_| {
                Ok((!tasks_path.is_file())
                    .then(|| format!("{} was not written", tasks_path.display())))
            })?;
        }
        Ok(())
    }

    fn create_task_prompts(&mut self, start: usize) -> Result<()> {
        let phase = PipelinePhase::CreateTaskPrompts;
        let snapshot = scan_epic(&self.paths)?;
        for feature in snapshot.features.iter().skip(start) {
            let folder = &feature.folder_name;
            if feature.ledger.is_some() {
                debug!(folder, "ledger already present");
                continue;
            }
            let feature_paths = self.paths.feature(folder);
            let spec = StepSpec {
                phase,
                label: format!("{}-{folder}", phase.as_str()),
                instruction: self.renderer.create_task_prompts(&self.paths, folder)?,
                commit_message: format!("chore(epicflow): {} for {folder}", phase.as_str()),
            };
            self.execute_step(spec, move |_| {
                Ok(read_progress_ledger(&feature_paths.dir).is_none().then(|| {
                    format!(
                        "{} is missing or malformed",
                        feature_paths.ledger_path.display()
                    )
                }))
            })?;
        }
        Ok(())
    }

    /// Task groups start at `start_group` for the first feature only.
    fn implement(&mut self, start_feature: usize, start_group: usize) -> Result<()> {
        let phase = PipelinePhase::Implement;
        let snapshot = scan_epic(&self.paths)?;
        for (i, feature) in snapshot.features.iter().enumerate().skip(start_feature) {
            let folder = feature.folder_name.clone();
            let feature_dir = self.paths.feature(&folder).dir;
            let mut group_index = if i == start_feature { start_group } else { 0 };

            loop {
                // Re-read each time: the agent may have updated more than its own group.
                let Some(ledger) = read_progress_ledger(&feature_dir) else {
                    warn!(folder, "ledger unreadable, stopping phase");
                    return Ok(());
                };
                let Some(group) = ledger.task_groups.get(group_index) else {
                    break;
                };
                if group.completed {
                    group_index += 1;
                    continue;
                }

                let group_name = group.name.clone();
                let is_final = group_index + 1 == ledger.task_groups.len();
                let prefix = if is_final { "feat" } else { "wip" };
                let spec = StepSpec {
                    phase,
                    label: format!("{}-{folder}-{:02}", phase.as_str(), group_index + 1),
                    instruction: self.renderer.implement(&self.paths, &folder, &ledger, group_index)?,
                    commit_message: format!("{prefix}({folder}): {group_name}"),
                };
                let number = feature.number.clone();
                let settle_dir = feature_dir.clone();
                self.execute_step(spec, move |paths| {
                    settle_task_group(paths, &settle_dir, &number, &group_name, is_final)
                })?;
                group_index += 1;
            }

            if read_progress_ledger(&feature_dir).is_none_or(|l| !l.is_complete()) {
                warn!(folder, "feature still has incomplete task groups, stopping phase");
                return Ok(());
            }
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        let phase = PipelinePhase::Finalize;
        let snapshot = scan_epic(&self.paths)?;
        let features: Vec<String> = snapshot
            .features
            .iter()
            .map(|f| f.folder_name.clone())
            .collect();
        let spec = StepSpec {
            phase,
            label: phase.as_str().to_string(),
            instruction: self.renderer.finalize(&self.paths, &features)?,
            commit_message: format!("chore(epicflow): {} {}", phase.as_str(), self.paths.slug()),
        };
        self.execute_step(spec, |paths| {
            Ok((!paths.verification_path.is_file())
                .then(|| format!("{} was not written", paths.verification_path.display())))
        })
    }

    /// Run one agent invocation as a transaction.
    ///
    /// `settle` runs after a successful invocation and before the commit; it
    /// may update manifests and returns a drift detail when the expected
    /// on-disk marker is missing.
    fn execute_step<S>(&mut self, spec: StepSpec, settle: S) -> Result<()>
    where
        S: FnOnce(&EpicPaths) -> Result<Option<String>>,
    {
        let StepSpec {
            phase,
            label,
            instruction,
            commit_message,
        } = spec;
        let checkpoint = self.checkpoints.capture_checkpoint()?;
        let step_number = self.steps_executed + 1;
        let request = InstructionRequest {
            step: label.clone(),
            workdir: self.repo_root.clone(),
            instruction,
            timeout: self.config.step_timeout,
            output_limit_bytes: self.config.output_limit_bytes,
            stream_path: self
                .log_dir
                .as_ref()
                .map(|dir| dir.join(format!("{step_number:03}-{label}.jsonl"))),
        };
        info!(step = %label, %checkpoint, "starting step");

        let mut detector = LoopDetector::new(self.config.loop_detection.clone());
        let mut loop_reason: Option<LoopReason> = None;
        let mut observer = |event: &ToolCallEvent| {
            let verdict = detector.observe(event);
            if verdict.should_abort {
                loop_reason = verdict.reason;
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        };
        let run = self
            .adapter
            .run_instruction(&request, &mut observer)
            .with_context(|| format!("run agent for {label}"))?;
        self.usage
            .record_step(run.token_usage, run.cost_usd, run.duration_ms);

        if run.loop_detected {
            let outcome = self.checkpoints.reset_and_clean(&checkpoint);
            warn!(step = %label, reason = ?loop_reason, "loop detected, step rolled back");
            return Err(LoopDetectedError::new(
                &label,
                &checkpoint,
                loop_reason.as_ref(),
                outcome.reset_ok,
                outcome.clean_ok,
            )
            .into());
        }
        if !run.success {
            return Err(AdapterExecutionError {
                step: label,
                exit_code: run.exit_code,
                timed_out: run.timed_out,
            }
            .into());
        }

        let warning = settle(&self.paths)?.map(|detail| {
            warn!(step = %label, %detail, "manifest drift after successful step");
            ManifestDriftWarning {
                step: label.clone(),
                detail,
            }
        });
        let commit = if self.checkpoints.commit_if_dirty(&commit_message)? {
            Some(self.checkpoints.capture_checkpoint()?)
        } else {
            debug!(step = %label, "step left no changes");
            None
        };

        self.steps_executed += 1;
        let report = StepReport {
            phase,
            label,
            commit,
            duration_ms: run.duration_ms,
            cost_usd: run.cost_usd,
            warning: warning.clone(),
        };
        (self.on_step)(&report);
        self.warnings.extend(warning);
        Ok(())
    }
}

/// Check that the agent marked `group_name` complete and, for the last group
/// of a fully complete ledger, flip the feature's `completed` flag in the index.
fn settle_task_group(
    paths: &EpicPaths,
    feature_dir: &Path,
    number: &str,
    group_name: &str,
    is_final: bool,
) -> Result<Option<String>> {
    let ledger = read_progress_ledger(feature_dir);
    let done = ledger
        .as_ref()
        .and_then(|l| l.task_groups.iter().find(|g| g.name == group_name))
        .is_some_and(|g| g.completed);
    if !done {
        return Ok(Some(format!(
            "task group '{group_name}' is still incomplete in {}",
            feature_dir.join(crate::io::layout::LEDGER_FILE).display()
        )));
    }
    if is_final && ledger.is_some_and(|l| l.is_complete()) {
        if mark_feature_complete(&paths.root, number)? {
            debug!(number, "feature marked complete in index");
        } else {
            warn!(number, "feature missing from index, not marked complete");
        }
    }
    Ok(None)
}
