//! `epicflow` command-line entry point.

use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use epicflow::core::types::ResumePoint;
use epicflow::core::usage::TokenUsageAggregate;
use epicflow::detect::{detect, validate_epic};
use epicflow::errors::{AdapterExecutionError, LoopDetectedError, PhaseStalledError};
use epicflow::exit_codes;
use epicflow::io::adapter::StreamJsonAdapter;
use epicflow::io::config::{default_config_path, load_config};
use epicflow::io::git::Git;
use epicflow::io::manifest_store::{mark_feature_complete, mark_task_group_complete};
use epicflow::logging;
use epicflow::pipeline::{PipelineConfig, StepReport, run_pipeline};

#[derive(Parser)]
#[command(
    name = "epicflow",
    version,
    about = "Resume and drive an epic from planning artifacts to committed code"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print where the next run would resume.
    Status {
        /// Epic directory (`YYYY-MM-DD-slug`).
        epic: PathBuf,
    },
    /// Cross-check `features.yaml` against the feature folders.
    Validate { epic: PathBuf },
    /// Run the pipeline from its resume point until the epic is complete.
    Run {
        epic: PathBuf,
        /// Config file (default: `<repo>/.epicflow/config.toml`).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },
    /// Set `completed: true` for one task group in a feature's progress.yaml.
    MarkGroup { feature_dir: PathBuf, name: String },
    /// Set `completed: true` for one feature in an epic's features.yaml.
    MarkFeature { epic: PathBuf, number: String },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Status { epic } => cmd_status(&epic),
        Command::Validate { epic } => cmd_validate(&epic),
        Command::Run { epic, config, yes } => cmd_run(&epic, config.as_deref(), yes),
        Command::MarkGroup { feature_dir, name } => {
            report_mark(mark_task_group_complete(&feature_dir, &name)?, || {
                format!("no task group '{name}' in {}", feature_dir.display())
            })
        }
        Command::MarkFeature { epic, number } => {
            report_mark(mark_feature_complete(&epic, &number)?, || {
                format!("no feature '{number}' in {}", epic.display())
            })
        }
    }
}

fn cmd_status(epic: &Path) -> Result<i32> {
    let point = detect(epic)?;
    println!("{point}");
    Ok(exit_codes::OK)
}

fn cmd_validate(epic: &Path) -> Result<i32> {
    let errors = validate_epic(epic)?;
    if errors.is_empty() {
        println!("ok");
        return Ok(exit_codes::OK);
    }
    for error in &errors {
        eprintln!("- {error}");
    }
    Ok(exit_codes::INVALID)
}

fn cmd_run(epic: &Path, config_path: Option<&Path>, yes: bool) -> Result<i32> {
    let start = detect(epic)?;
    if start.is_complete() {
        println!("{start}: nothing to do");
        return Ok(exit_codes::OK);
    }

    let repo_root = Git::new(epic).toplevel()?;
    let config_path = config_path.map_or_else(|| default_config_path(&repo_root), Path::to_path_buf);
    let mut config = load_config(&config_path)?;
    config.apply_env();

    println!("resuming at {start}");
    if !(yes || config.headless) && !confirm(&start)? {
        println!("not started");
        return Ok(exit_codes::OK);
    }

    let adapter = StreamJsonAdapter::from_config(&config.agent)?;
    let mut usage = TokenUsageAggregate::default();
    let result = run_pipeline(
        epic,
        &adapter,
        &PipelineConfig::from_engine(&config),
        &mut usage,
        print_step,
    );
    print!("{}", usage.render_summary());

    match result {
        Ok(outcome) => {
            println!(
                "{} ({} steps, {} drift warnings)",
                outcome.end,
                outcome.steps_executed,
                outcome.warnings.len()
            );
            Ok(exit_codes::OK)
        }
        Err(err) => {
            report_failure(epic, &err);
            Err(err)
        }
    }
}

fn print_step(step: &StepReport) {
    let commit = step
        .commit
        .as_deref()
        .map_or("no changes", |sha| &sha[..sha.len().min(12)]);
    println!("[{}] {} -> {commit}", step.phase.number(), step.label);
    if let Some(warning) = &step.warning {
        println!("    warning: {}", warning.detail);
    }
}

/// Print rollback details and where the next invocation will pick up.
fn report_failure(epic: &Path, err: &anyhow::Error) {
    if let Some(looped) = err.downcast_ref::<LoopDetectedError>() {
        eprintln!("rolled back to checkpoint {}", looped.checkpoint);
        if !(looped.reset_ok && looped.clean_ok) {
            eprintln!(
                "rollback incomplete (reset ok: {}, clean ok: {}); inspect the working tree",
                looped.reset_ok, looped.clean_ok
            );
        }
    }
    match detect(epic) {
        Ok(next) => eprintln!("next run resumes at {next}"),
        Err(detect_err) => eprintln!("next run cannot resume: {detect_err:#}"),
    }
}

/// Ask before starting; a non-interactive stdin proceeds.
fn confirm(start: &ResumePoint) -> Result<bool> {
    let stdin = std::io::stdin();
    if !stdin.is_terminal() {
        return Ok(true);
    }
    print!("run pipeline from {start}? [Y/n] ");
    std::io::stdout().flush().context("flush stdout")?;
    let mut answer = String::new();
    stdin.lock().read_line(&mut answer).context("read answer")?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "" | "y" | "yes"))
}

fn report_mark(found: bool, missing: impl FnOnce() -> String) -> Result<i32> {
    if found {
        println!("ok");
        Ok(exit_codes::OK)
    } else {
        eprintln!("{}", missing());
        Ok(exit_codes::INVALID)
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<LoopDetectedError>().is_some() {
        exit_codes::LOOP_DETECTED
    } else if err.downcast_ref::<AdapterExecutionError>().is_some() {
        exit_codes::ADAPTER_FAILED
    } else if err.downcast_ref::<PhaseStalledError>().is_some() {
        exit_codes::STALLED
    } else {
        exit_codes::INVALID
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epicflow::core::types::PipelinePhase;
    use epicflow::errors::StructuralValidationError;

    #[test]
    fn parse_run_with_flags() {
        let cli = Cli::parse_from(["epicflow", "run", "epics/x", "--config", "c.toml", "-y"]);
        match cli.command {
            Command::Run { epic, config, yes } => {
                assert_eq!(epic, PathBuf::from("epics/x"));
                assert_eq!(config, Some(PathBuf::from("c.toml")));
                assert!(yes);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_mark_group() {
        let cli = Cli::parse_from(["epicflow", "mark-group", "features/01-cart", "schema"]);
        assert!(matches!(
            cli.command,
            Command::MarkGroup { ref name, .. } if name == "schema"
        ));
    }

    #[test]
    fn typed_errors_map_to_exit_codes() {
        let looped: anyhow::Error = LoopDetectedError::new("s", "abc", None, true, true).into();
        assert_eq!(exit_code_for(&looped), exit_codes::LOOP_DETECTED);

        let failed: anyhow::Error = AdapterExecutionError {
            step: "s".to_string(),
            exit_code: Some(1),
            timed_out: false,
        }
        .into();
        assert_eq!(exit_code_for(&failed), exit_codes::ADAPTER_FAILED);

        let stalled: anyhow::Error = PhaseStalledError {
            phase: PipelinePhase::Implement,
            next: ResumePoint::Finalize,
        }
        .into();
        assert_eq!(exit_code_for(&stalled), exit_codes::STALLED);

        let invalid: anyhow::Error = StructuralValidationError { errors: Vec::new() }.into();
        assert_eq!(exit_code_for(&invalid), exit_codes::INVALID);
        assert_eq!(
            exit_code_for(&invalid.context("while running")),
            exit_codes::INVALID
        );
    }
}
