//! Workflow validation
//!
//! Pure checks run before any execution. Errors block a run; warnings are
//! reported but do not.

use std::collections::HashSet;

use serde::Serialize;

use super::workflow::{referenced_vars, Workflow};

/// Variables every run defines
pub const BUILTIN_VARS: &[&str] = &["session", "run_id"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub workflow_id: String,
    pub step_count: usize,
}

pub fn validate(workflow: &Workflow) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if workflow.name.trim().is_empty() {
        errors.push("workflow name is required".to_string());
    }
    if workflow.steps.is_empty() {
        errors.push("workflow has no steps".to_string());
    }
    if workflow.schema_version.is_none() {
        warnings.push("no version specified".to_string());
    }
    if workflow.description.as_deref().map_or(true, |d| d.trim().is_empty()) {
        warnings.push("no description".to_string());
    }

    // Output variables of earlier steps count as declared for later ones
    let mut known: HashSet<&str> = workflow.vars.keys().map(String::as_str).collect();
    known.extend(BUILTIN_VARS.iter().copied());

    let mut seen = HashSet::new();
    for (index, step) in workflow.steps.iter().enumerate() {
        let label = if step.id.is_empty() {
            format!("step {}", index + 1)
        } else {
            format!("step '{}'", step.id)
        };

        if step.id.trim().is_empty() {
            errors.push(format!("{} has an empty id", label));
        } else if !seen.insert(step.id.as_str()) {
            errors.push(format!("duplicate step id '{}'", step.id));
        }

        match (&step.command, &step.prompt) {
            (None, None) => errors.push(format!("{} has neither command nor prompt", label)),
            (Some(_), Some(_)) => errors.push(format!("{} has both command and prompt", label)),
            _ => {}
        }

        if step.timeout.is_some_and(|t| t.is_zero()) {
            errors.push(format!("{} has a zero timeout", label));
        }

        for text in step.command.iter().chain(step.prompt.iter()) {
            for var in referenced_vars(text) {
                if !known.contains(var.as_str()) {
                    warnings.push(format!("{} references undeclared variable '{}'", label, var));
                }
            }
        }

        if let Some(var) = &step.output_var {
            known.insert(var.as_str());
        }
    }

    ValidationReport {
        valid: errors.is_empty(),
        errors,
        warnings,
        workflow_id: workflow.id().to_string(),
        step_count: workflow.steps.len(),
    }
}
