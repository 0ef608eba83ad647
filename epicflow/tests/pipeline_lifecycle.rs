//! Pipeline lifecycle scenarios.
//!
//! These tests drive `run_pipeline` against real git repositories in temp
//! dirs with a scripted adapter standing in for the agent. Each scripted step
//! writes the artifacts a real agent would, so resume points, commits and
//! rollbacks are checked end to end.

use std::fs;

use epicflow::core::types::ResumePoint;
use epicflow::core::usage::TokenUsageAggregate;
use epicflow::detect::detect;
use epicflow::errors::{AdapterExecutionError, LoopDetectedError};
use epicflow::io::git::Git;
use epicflow::io::manifest_store::read_feature_index;
use epicflow::pipeline::{PipelineConfig, SNAPSHOT_MESSAGE, run_pipeline};
use epicflow::test_support::{EpicFiles, ScriptedAdapter, ScriptedStep, TestRepo, file_sha256};

fn quiet_config() -> PipelineConfig {
    PipelineConfig {
        stream_logs: false,
        ..PipelineConfig::default()
    }
}

/// Scripted step that applies `f` to the epic and succeeds.
fn writes(epic: &EpicFiles, f: impl Fn(&EpicFiles) -> anyhow::Result<()> + 'static) -> ScriptedStep {
    let epic = epic.clone();
    ScriptedStep::succeeding(move |_| f(&epic))
}

/// Drives a fresh epic (requirements only) through every phase.
///
/// Sequence:
/// 1. create-features writes `features.yaml` with `01-cart` and `02-payment`
/// 2. create-tasks runs once per feature
/// 3. create-task-prompts writes ledgers (2 groups, then 1) and prompt files
/// 4. implement runs three task groups
/// 5. finalize writes `verification.md`
#[test]
fn fresh_epic_runs_every_phase_to_completion() {
    let repo = TestRepo::new().expect("repo");
    let epic = repo.epic("checkout").expect("epic");
    epic.write_requirements().expect("requirements");
    repo.commit_all("add requirements").expect("commit");

    let adapter = ScriptedAdapter::new(vec![
        writes(&epic, |e| e.plan_features(&[("01", "cart"), ("02", "payment")])),
        writes(&epic, |e| e.write_tasks("01-cart")),
        writes(&epic, |e| e.write_tasks("02-payment")),
        writes(&epic, |e| {
            e.write_ledger("01-cart", &[false, false])?;
            e.write_prompt("01-cart", 0, "Build the cart model.")?;
            e.write_prompt("01-cart", 1, "Expose cart totals over HTTP.")
        }),
        writes(&epic, |e| {
            e.write_ledger("02-payment", &[false])?;
            e.write_prompt("02-payment", 0, "Integrate the payment provider.")
        }),
        ScriptedStep::completing(&epic, "01-cart", "group-1"),
        ScriptedStep::completing(&epic, "01-cart", "group-2"),
        ScriptedStep::completing(&epic, "02-payment", "group-1"),
        writes(&epic, EpicFiles::write_verification),
    ]);

    let mut usage = TokenUsageAggregate::default();
    let mut phases = Vec::new();
    let outcome = run_pipeline(&epic.paths().root, &adapter, &quiet_config(), &mut usage, |step| {
        phases.push(step.phase.number());
    })
    .expect("run");

    assert_eq!(outcome.start, ResumePoint::CreateFeatures);
    assert_eq!(outcome.end, ResumePoint::Complete);
    assert_eq!(outcome.steps_executed, 9);
    assert!(outcome.warnings.is_empty());
    assert_eq!(phases, vec![3, 4, 4, 5, 5, 6, 6, 6, 7]);

    let requests = adapter.requests();
    let labels: Vec<&str> = requests.iter().map(|r| r.step.as_str()).collect();
    assert_eq!(
        labels,
        vec![
            "create-features",
            "create-tasks-01-cart",
            "create-tasks-02-payment",
            "create-task-prompts-01-cart",
            "create-task-prompts-02-payment",
            "implement-01-cart-01",
            "implement-01-cart-02",
            "implement-02-payment-01",
            "finalize",
        ]
    );
    assert!(requests[6].instruction.contains("Expose cart totals over HTTP."));
    assert!(requests[2].instruction.contains("01-cart"));

    assert_eq!(
        repo.commit_subjects(9).expect("log"),
        vec![
            "chore(epicflow): finalize checkout",
            "feat(02-payment): group-1",
            "feat(01-cart): group-2",
            "wip(01-cart): group-1",
            "chore(epicflow): create-task-prompts for 02-payment",
            "chore(epicflow): create-task-prompts for 01-cart",
            "chore(epicflow): create-tasks for 02-payment",
            "chore(epicflow): create-tasks for 01-cart",
            "chore(epicflow): create-features for checkout",
        ]
    );

    let index = read_feature_index(&epic.paths().root).expect("index");
    assert!(index.features.iter().all(|f| f.completed));
    assert_eq!(usage.step_count, 9);
    assert_eq!(usage.input_tokens, 900);
    assert_eq!(detect(&epic.paths().root).expect("detect"), ResumePoint::Complete);
    assert!(!Git::new(repo.path()).is_dirty().expect("status"));
}

/// Two features, the first done, the second with one open group and no
/// verification: resume at `Implement{1, 0}`, then `Finalize`, then complete.
#[test]
fn resumes_second_feature_then_finalizes() {
    let repo = TestRepo::new().expect("repo");
    let epic = repo.epic("checkout").expect("epic");
    epic.write_requirements().expect("requirements");
    epic.plan_features(&[("01", "cart"), ("02", "payment")])
        .expect("plan");
    epic.write_tasks("01-cart").expect("tasks");
    epic.write_ledger("01-cart", &[true, true]).expect("ledger");
    epic.write_tasks("02-payment").expect("tasks");
    epic.write_ledger("02-payment", &[false]).expect("ledger");
    repo.commit_all("planned").expect("commit");

    assert_eq!(
        detect(&epic.paths().root).expect("detect"),
        ResumePoint::Implement {
            feature_index: 1,
            task_group_index: 0
        }
    );

    let adapter = ScriptedAdapter::new(vec![ScriptedStep::completing(
        &epic,
        "02-payment",
        "group-1",
    )]);
    let mut usage = TokenUsageAggregate::default();
    let err = run_pipeline(&epic.paths().root, &adapter, &quiet_config(), &mut usage, |_| {})
        .expect_err("adapter runs out before finalize");
    assert!(format!("{err:#}").contains("scripted adapter exhausted at finalize"));
    assert_eq!(detect(&epic.paths().root).expect("detect"), ResumePoint::Finalize);

    let adapter = ScriptedAdapter::new(vec![writes(&epic, EpicFiles::write_verification)]);
    let outcome = run_pipeline(&epic.paths().root, &adapter, &quiet_config(), &mut usage, |_| {})
        .expect("run");
    assert_eq!(outcome.start, ResumePoint::Finalize);
    assert_eq!(outcome.end, ResumePoint::Complete);
    assert_eq!(usage.step_count, 3);
    assert_eq!(
        repo.commit_subjects(2).expect("log"),
        vec![
            "chore(epicflow): finalize checkout",
            "feat(02-payment): group-1"
        ]
    );
}

/// A looping agent is killed, its edits are rolled back byte for byte, and
/// the next invocation resumes at the same task group.
#[test]
fn loop_rollback_then_resume() {
    let repo = TestRepo::new().expect("repo");
    let epic = repo.epic("checkout").expect("epic");
    epic.write_requirements().expect("requirements");
    epic.plan_features(&[("01", "cart")]).expect("plan");
    epic.write_tasks("01-cart").expect("tasks");
    epic.write_ledger("01-cart", &[true, false]).expect("ledger");
    repo.commit_all("planned").expect("commit");

    let readme = repo.path().join("README.md");
    let readme_before = file_sha256(&readme).expect("hash");
    let head_before = Git::new(repo.path()).head_sha().expect("head");

    let root = repo.path().to_path_buf();
    let adapter = ScriptedAdapter::new(vec![ScriptedStep::looping(move |_| {
        fs::write(root.join("README.md"), "half-rewritten\n")?;
        fs::create_dir_all(root.join("src"))?;
        fs::write(root.join("src/partial.rs"), "fn broken(\n")?;
        Ok(())
    })]);
    let mut usage = TokenUsageAggregate::default();
    let err = run_pipeline(&epic.paths().root, &adapter, &quiet_config(), &mut usage, |_| {})
        .expect_err("loop");

    let looped = err.downcast_ref::<LoopDetectedError>().expect("loop error");
    assert_eq!(looped.checkpoint, head_before);
    assert_eq!(looped.step, "implement-01-cart-02");
    assert_eq!(file_sha256(&readme).expect("hash"), readme_before);
    assert!(!repo.path().join("src/partial.rs").exists());
    assert_eq!(Git::new(repo.path()).head_sha().expect("head"), head_before);

    let resume = detect(&epic.paths().root).expect("detect");
    assert_eq!(
        resume,
        ResumePoint::Implement {
            feature_index: 0,
            task_group_index: 1
        }
    );

    let adapter = ScriptedAdapter::new(vec![
        ScriptedStep::completing(&epic, "01-cart", "group-2"),
        writes(&epic, EpicFiles::write_verification),
    ]);
    let outcome = run_pipeline(&epic.paths().root, &adapter, &quiet_config(), &mut usage, |_| {})
        .expect("run");
    assert_eq!(outcome.start, resume);
    assert_eq!(outcome.end, ResumePoint::Complete);
}

/// A failing agent stops the run without committing; the committed work of
/// earlier steps in the same phase is kept and skipped on the next run.
#[test]
fn adapter_failure_resumes_mid_phase() {
    let repo = TestRepo::new().expect("repo");
    let epic = repo.epic("checkout").expect("epic");
    epic.write_requirements().expect("requirements");
    epic.plan_features(&[("01", "cart"), ("02", "payment")])
        .expect("plan");
    repo.commit_all("planned").expect("commit");

    let adapter = ScriptedAdapter::new(vec![
        writes(&epic, |e| e.write_tasks("01-cart")),
        ScriptedStep::failing(1, |_| Ok(())),
    ]);
    let mut usage = TokenUsageAggregate::default();
    let err = run_pipeline(&epic.paths().root, &adapter, &quiet_config(), &mut usage, |_| {})
        .expect_err("adapter failure");
    let failed = err
        .downcast_ref::<AdapterExecutionError>()
        .expect("adapter error");
    assert_eq!(failed.step, "create-tasks-02-payment");
    assert_eq!(
        repo.commit_subjects(1).expect("log"),
        vec!["chore(epicflow): create-tasks for 01-cart"]
    );
    assert_eq!(
        detect(&epic.paths().root).expect("detect"),
        ResumePoint::CreateTasks { feature_index: 1 }
    );

    let adapter = ScriptedAdapter::new(vec![writes(&epic, |e| e.write_tasks("02-payment"))]);
    let err = run_pipeline(&epic.paths().root, &adapter, &quiet_config(), &mut usage, |_| {})
        .expect_err("adapter runs out in phase 5");
    assert!(format!("{err:#}").contains("exhausted at create-task-prompts-01-cart"));
    assert_eq!(adapter.requests()[0].step, "create-tasks-02-payment");
}

/// With stream logs on, each step gets a tee path under `.epicflow/logs/`
/// and the logs directory is git-ignored.
#[test]
fn stream_logs_live_under_ignored_state_dir() {
    let repo = TestRepo::new().expect("repo");
    let epic = repo.epic("checkout").expect("epic");
    epic.write_requirements().expect("requirements");
    repo.commit_all("add requirements").expect("commit");

    let adapter = ScriptedAdapter::new(vec![ScriptedStep::failing(1, |request| {
        let path = request.stream_path.as_ref().expect("stream path");
        fs::create_dir_all(path.parent().expect("parent"))?;
        fs::write(path, "{}\n")?;
        Ok(())
    })]);
    let mut usage = TokenUsageAggregate::default();
    run_pipeline(
        &epic.paths().root,
        &adapter,
        &PipelineConfig::default(),
        &mut usage,
        |_| {},
    )
    .expect_err("adapter failure");

    let repo_root = fs::canonicalize(repo.path()).expect("canonical");
    let stream_path = adapter.requests()[0]
        .stream_path
        .clone()
        .expect("stream path");
    assert!(stream_path.starts_with(repo_root.join(".epicflow/logs")));
    assert!(stream_path.ends_with("001-create-features.jsonl"));
    assert!(stream_path.is_file());
    assert!(repo.path().join(".epicflow/.gitignore").is_file());
    assert!(!Git::new(repo.path()).is_dirty().expect("status"));
}

/// A repository without any commits: the pending epic becomes the root
/// snapshot commit and the run starts at create-features.
#[test]
fn unborn_repository_starts_from_snapshot_root_commit() {
    let repo = TestRepo::unborn().expect("repo");
    let epic = repo.epic("checkout").expect("epic");
    epic.write_requirements().expect("requirements");

    let adapter = ScriptedAdapter::new(vec![writes(&epic, |e| {
        e.plan_features(&[("01", "cart")])
    })]);
    let mut usage = TokenUsageAggregate::default();
    let err = run_pipeline(&epic.paths().root, &adapter, &quiet_config(), &mut usage, |_| {})
        .expect_err("adapter runs out in create-tasks");

    assert!(format!("{err:#}").contains("exhausted at create-tasks-01-cart"));
    assert_eq!(adapter.requests()[0].step, "create-features");
    assert_eq!(
        repo.commit_subjects(5).expect("log"),
        vec!["chore(epicflow): create-features for checkout", SNAPSHOT_MESSAGE]
    );
}
