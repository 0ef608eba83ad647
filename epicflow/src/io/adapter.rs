//! Runtime adapter abstraction for agent invocation.
//!
//! The [`RuntimeAdapter`] trait decouples the pipeline from the agent CLI
//! that does the work. The pipeline only sees the uniform [`AdapterRun`] and
//! the [`ToolCallEvent`]s handed to the observer; tests use scripted adapters
//! that never spawn a process.

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::stream::StreamParser;
use crate::core::types::{TokenUsage, ToolCallEvent};
use crate::io::config::AgentConfig;
use crate::io::process::{StreamingCommand, run_streaming};

/// Parameters for one adapter invocation.
#[derive(Debug, Clone)]
pub struct InstructionRequest {
    /// Short label used in logs and commit messages.
    pub step: String,
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Instruction text fed to the agent.
    pub instruction: String,
    /// Maximum time to wait for the agent to complete.
    pub timeout: Duration,
    /// Bound on stdout/stderr kept in memory.
    pub output_limit_bytes: usize,
    /// When set, the raw agent stream is copied here line by line.
    pub stream_path: Option<PathBuf>,
}

/// Structured result of one agent run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AdapterRun {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// The observer broke the run and the process was killed.
    pub loop_detected: bool,
    pub timed_out: bool,
    pub token_usage: Option<TokenUsage>,
    pub cost_usd: Option<f64>,
}

/// Receives each tool call as it completes; `Break` force-terminates the run.
pub type EventObserver<'a> = dyn FnMut(&ToolCallEvent) -> ControlFlow<()> + 'a;

/// Abstraction over agent runtimes.
///
/// Implementations that cannot produce structured events simply never call
/// `observer`.
pub trait RuntimeAdapter {
    fn run_instruction(
        &self,
        request: &InstructionRequest,
        observer: &mut EventObserver<'_>,
    ) -> Result<AdapterRun>;
}

/// Adapter for agent CLIs that emit newline-delimited JSON events
/// (e.g. `claude -p --output-format stream-json`).
#[derive(Debug, Clone)]
pub struct StreamJsonAdapter {
    program: String,
    args: Vec<String>,
}

impl StreamJsonAdapter {
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let (program, rest) = config
            .command
            .split_first()
            .context("agent.command must not be empty")?;
        let mut args = rest.to_vec();
        if let Some(model) = &config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        Ok(Self {
            program: program.clone(),
            args,
        })
    }

    fn command(&self, request: &InstructionRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).current_dir(&request.workdir);
        cmd
    }
}

impl RuntimeAdapter for StreamJsonAdapter {
    #[instrument(skip_all, fields(step = %request.step, timeout_secs = request.timeout.as_secs()))]
    fn run_instruction(
        &self,
        request: &InstructionRequest,
        observer: &mut EventObserver<'_>,
    ) -> Result<AdapterRun> {
        info!(program = %self.program, workdir = %request.workdir.display(), "starting agent");
        let started = Instant::now();
        let mut parser = StreamParser::new();

        let output = run_streaming(
            StreamingCommand {
                cmd: self.command(request),
                stdin: Some(request.instruction.as_bytes()),
                timeout: request.timeout,
                output_limit_bytes: request.output_limit_bytes,
                tee_path: request.stream_path.as_deref(),
            },
            |line| {
                for event in parser.feed_line(line) {
                    debug!(tool = %event.tool_name, is_error = event.result.is_error, "tool call");
                    observer(&event)?;
                }
                ControlFlow::Continue(())
            },
        )
        .with_context(|| format!("run {}", self.program))?;

        let summary = parser.into_summary();
        let wall_ms = started.elapsed().as_millis() as u64;
        let success = output.status.success()
            && !output.aborted
            && !output.timed_out
            && summary.is_error != Some(true);

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
        } else if !success && !output.aborted {
            warn!(
                exit_code = ?output.status.code(),
                stderr = %output.stderr_tail(2_000),
                "agent failed"
            );
        }

        Ok(AdapterRun {
            success,
            exit_code: output.status.code(),
            duration_ms: summary.duration_ms.unwrap_or(wall_ms),
            loop_detected: output.aborted,
            timed_out: output.timed_out,
            token_usage: summary.usage,
            cost_usd: summary.cost_usd,
        })
    }
}
