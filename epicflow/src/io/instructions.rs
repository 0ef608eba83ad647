//! Instruction text handed to the agent for each pipeline step.
//!
//! The wording lives in `prompts/*.md` templates; this module only assembles
//! the paths and manifest data they reference.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::io::layout::{EpicPaths, FeaturePaths};
use crate::manifest::ProgressLedger;

const CREATE_FEATURES_TEMPLATE: &str = include_str!("prompts/create_features.md");
const CREATE_TASKS_TEMPLATE: &str = include_str!("prompts/create_tasks.md");
const CREATE_TASK_PROMPTS_TEMPLATE: &str = include_str!("prompts/create_task_prompts.md");
const IMPLEMENT_TEMPLATE: &str = include_str!("prompts/implement.md");
const FINALIZE_TEMPLATE: &str = include_str!("prompts/finalize.md");

#[derive(Debug, Clone, Serialize)]
struct EpicContext {
    root: String,
    slug: String,
    requirements: String,
    feature_index: String,
    features_dir: String,
    verification: String,
}

impl EpicContext {
    fn new(paths: &EpicPaths) -> Self {
        Self {
            root: display(&paths.root),
            slug: paths.slug(),
            requirements: display(&paths.requirements_path),
            feature_index: display(&paths.feature_index_path),
            features_dir: display(&paths.features_dir),
            verification: display(&paths.verification_path),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct FeatureContext {
    folder: String,
    dir: String,
    prd: String,
    tasks: String,
    ledger: String,
    prompts_dir: String,
}

impl FeatureContext {
    fn new(folder: &str, paths: &FeaturePaths) -> Self {
        Self {
            folder: folder.to_string(),
            dir: display(&paths.dir),
            prd: display(&paths.prd_path),
            tasks: display(&paths.tasks_path),
            ledger: display(&paths.ledger_path),
            prompts_dir: display(&paths.prompts_dir),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct GroupContext {
    name: String,
    /// One-based.
    position: usize,
    total: usize,
    prompt_path: String,
}

/// Renders step instructions from the built-in templates.
pub struct InstructionRenderer {
    env: Environment<'static>,
}

impl InstructionRenderer {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        for (name, source) in [
            ("create_features", CREATE_FEATURES_TEMPLATE),
            ("create_tasks", CREATE_TASKS_TEMPLATE),
            ("create_task_prompts", CREATE_TASK_PROMPTS_TEMPLATE),
            ("implement", IMPLEMENT_TEMPLATE),
            ("finalize", FINALIZE_TEMPLATE),
        ] {
            env.add_template(name, source)
                .with_context(|| format!("load {name} template"))?;
        }
        Ok(Self { env })
    }

    pub fn create_features(&self, epic: &EpicPaths) -> Result<String> {
        let today = chrono::Local::now().date_naive().format("%Y-%m-%d").to_string();
        self.render(
            "create_features",
            context! { epic => EpicContext::new(epic), today => today },
        )
    }

    /// `previous` lists the folders planned before this one.
    pub fn create_tasks(&self, epic: &EpicPaths, folder: &str, previous: &[String]) -> Result<String> {
        let feature = FeatureContext::new(folder, &epic.feature(folder));
        self.render(
            "create_tasks",
            context! {
                epic => EpicContext::new(epic),
                feature => feature,
                previous => (!previous.is_empty()).then_some(previous),
            },
        )
    }

    pub fn create_task_prompts(&self, epic: &EpicPaths, folder: &str) -> Result<String> {
        let feature = FeatureContext::new(folder, &epic.feature(folder));
        self.render(
            "create_task_prompts",
            context! { epic => EpicContext::new(epic), feature => feature },
        )
    }

    /// Embeds `prompts/NN.md` for the group when it exists.
    pub fn implement(
        &self,
        epic: &EpicPaths,
        folder: &str,
        ledger: &ProgressLedger,
        task_group_index: usize,
    ) -> Result<String> {
        let paths = epic.feature(folder);
        let group = ledger
            .task_groups
            .get(task_group_index)
            .with_context(|| format!("{folder} has no task group #{}", task_group_index + 1))?;
        let prompt_path = paths.prompt_path(task_group_index);
        let prompt = read_optional(&prompt_path)?;
        if prompt.is_none() {
            debug!(path = %prompt_path.display(), "prompt file missing, using fallback wording");
        }
        self.render(
            "implement",
            context! {
                epic => EpicContext::new(epic),
                feature => FeatureContext::new(folder, &paths),
                group => GroupContext {
                    name: group.name.clone(),
                    position: task_group_index + 1,
                    total: ledger.task_groups.len(),
                    prompt_path: display(&prompt_path),
                },
                prompt => prompt.as_deref().map(str::trim).filter(|p| !p.is_empty()),
            },
        )
    }

    pub fn finalize(&self, epic: &EpicPaths, features: &[String]) -> Result<String> {
        self.render(
            "finalize",
            context! { epic => EpicContext::new(epic), features => features },
        )
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let template = self.env.get_template(name)?;
        let rendered = template
            .render(ctx)
            .with_context(|| format!("render {name} instruction"))?;
        Ok(rendered)
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}
