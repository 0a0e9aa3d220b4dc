//! Load-time validation of workflow documents.
//!
//! Serde already rejects documents missing fields every step of a kind
//! needs (e.g. a loop without `loopSteps`). This pass covers the rules
//! that depend on other fields or on the whole tree.

use crate::error::ConfigurationError;
use crate::model::{LoopType, Step, StepKind, Workflow};
use std::collections::HashSet;

/// Validate a parsed workflow. The first problem found is returned.
pub fn validate_workflow(workflow: &Workflow) -> Result<(), ConfigurationError> {
    let mut seen = HashSet::new();
    validate_steps(&workflow.steps, "steps", &mut seen)
}

fn validate_steps<'a>(
    steps: &'a [Step],
    location: &str,
    seen: &mut HashSet<&'a str>,
) -> Result<(), ConfigurationError> {
    for (idx, step) in steps.iter().enumerate() {
        let path = format!("{location}[{idx}]");
        if step.id.trim().is_empty() {
            return Err(ConfigurationError::EmptyStepId { path });
        }
        if !seen.insert(step.id.as_str()) {
            return Err(ConfigurationError::DuplicateStepId(step.id.clone()));
        }
        validate_step(step)?;
        if let StepKind::Loop(loop_step) = &step.kind {
            validate_steps(&loop_step.loop_steps, &format!("{path}.loopSteps"), seen)?;
        }
    }
    Ok(())
}

fn validate_step(step: &Step) -> Result<(), ConfigurationError> {
    let missing = |field: &'static str| ConfigurationError::MissingField {
        step: step.id.clone(),
        field,
    };
    let invalid = |reason: String| ConfigurationError::InvalidField {
        step: step.id.clone(),
        reason,
    };

    match &step.kind {
        StepKind::Request(request) => {
            if request.endpoint.trim().is_empty() {
                return Err(missing("endpoint"));
            }
            for (idx, ext) in request.extractors.iter().enumerate() {
                if ext.variable.trim().is_empty() {
                    return Err(invalid(format!("extractor {idx} has an empty variable")));
                }
                if ext.path.trim().is_empty() {
                    return Err(invalid(format!(
                        "extractor for '{}' has an empty path",
                        ext.variable
                    )));
                }
            }
        }
        StepKind::Loop(loop_step) => {
            if loop_step.iterator_variable.trim().is_empty() {
                return Err(missing("iteratorVariable"));
            }
            match loop_step.loop_type {
                LoopType::Count if loop_step.count.is_none() => {
                    return Err(missing("count"));
                }
                LoopType::List
                    if loop_step
                        .list_variable
                        .as_deref()
                        .map_or(true, |name| name.trim().is_empty()) =>
                {
                    return Err(missing("listVariable"));
                }
                LoopType::While if loop_step.condition.is_none() => {
                    return Err(missing("condition"));
                }
                _ => {}
            }
        }
        StepKind::Delay(_) | StepKind::Condition(_) | StepKind::Script(_) => {}
    }
    Ok(())
}
