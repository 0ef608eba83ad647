//! Resume-point detection for `epicflow status`, `epicflow validate` and the
//! pipeline itself.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::detector::{DetectError, decide};
use crate::core::types::ResumePoint;
use crate::core::validation::validate_feature_index;
use crate::errors::StructuralValidationError;
use crate::io::layout::{EpicPaths, REQUIREMENTS_FILE, scan_epic};

/// Derive where the pipeline should resume for the epic at `epic_dir`.
///
/// Reads disk only. Fails with [`StructuralValidationError`] when the
/// requirements artifact is missing or the feature index disagrees with the
/// folder tree.
pub fn detect(epic_dir: &Path) -> Result<ResumePoint> {
    detect_paths(&EpicPaths::new(epic_dir))
}

#[instrument(skip_all, fields(epic = %paths.root.display()))]
pub fn detect_paths(paths: &EpicPaths) -> Result<ResumePoint> {
    let snapshot = scan_epic(paths).context("scan epic")?;
    match decide(&snapshot) {
        Ok(point) => {
            debug!(%point, "resume point detected");
            Ok(point)
        }
        Err(DetectError::MissingRequirements) => Err(StructuralValidationError {
            errors: vec![format!(
                "{REQUIREMENTS_FILE} not found in {}",
                paths.root.display()
            )],
        }
        .into()),
        Err(DetectError::IndexMismatch(errors)) => Err(StructuralValidationError { errors }.into()),
    }
}

/// Cross-check `features.yaml` against the folder tree without deciding a
/// resume point. An absent index yields no errors.
pub fn validate_epic(epic_dir: &Path) -> Result<Vec<String>> {
    let paths = EpicPaths::new(epic_dir);
    let snapshot = scan_epic(&paths).context("scan epic")?;
    let mut errors = Vec::new();
    if !snapshot.has_requirements {
        errors.push(format!(
            "{REQUIREMENTS_FILE} not found in {}",
            paths.root.display()
        ));
    }
    if let Some(index) = &snapshot.index {
        errors.extend(validate_feature_index(index, &snapshot.features));
    }
    Ok(errors)
}
