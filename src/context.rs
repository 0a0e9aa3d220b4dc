//! Chain-variable context built from the steps that precede a given
//! step in document order.

use crate::extractor;
use crate::model::{ExecutionLog, Step, StepKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Where a context value came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Provenance {
    /// Extracted from the step's recorded response.
    #[serde(rename_all = "camelCase")]
    Extracted { step_id: String },
    /// Extraction failed and the extractor's default was used.
    #[serde(rename_all = "camelCase")]
    DefaultAfterFailure { step_id: String, reason: String },
    /// The step has no recorded response yet.
    #[serde(rename_all = "camelCase")]
    DefaultNotRun { step_id: String },
}

/// Output of [`build_context`].
#[derive(Debug, Clone, Default)]
pub struct ChainContext {
    pub variables: HashMap<String, String>,
    pub provenance: HashMap<String, Provenance>,
    pub warnings: Vec<String>,
}

/// Build the chain variables visible to the step at `path` (index
/// path from the root of `steps`).
///
/// Request steps strictly before the target are visited in document
/// order, descending into earlier loops completely and into enclosing
/// loops up to the target. The first producer of a variable wins.
pub fn build_context(
    steps: &[Step],
    path: &[usize],
    log: &ExecutionLog,
) -> ChainContext {
    let mut context = ChainContext::default();
    walk(steps, path, log, &mut context);
    context
}

fn walk(steps: &[Step], path: &[usize], log: &ExecutionLog, context: &mut ChainContext) {
    let Some((&current, rest)) = path.split_first() else {
        return;
    };

    for step in &steps[..current.min(steps.len())] {
        collect_subtree(step, log, context);
    }

    if let Some(container) = steps.get(current) {
        walk(container.children(), rest, log, context);
    }
}

fn collect_subtree(step: &Step, log: &ExecutionLog, context: &mut ChainContext) {
    if let StepKind::Request(_) = step.kind {
        collect_step(step, log, context);
    }
    for child in step.children() {
        collect_subtree(child, log, context);
    }
}

fn collect_step(step: &Step, log: &ExecutionLog, context: &mut ChainContext) {
    let response = log.response(&step.id);

    for ext in step.extractors() {
        if context.variables.contains_key(&ext.variable) {
            continue;
        }

        let Some(response) = response else {
            if let Some(default) = &ext.default_value {
                debug!(
                    "Using default for '{}' (step '{}' not run)",
                    ext.variable, step.id
                );
                context.warnings.push(format!(
                    "'{}' = '{}' from default: step '{}' has not run",
                    ext.variable, default, step.id
                ));
                context.variables.insert(ext.variable.clone(), default.clone());
                context.provenance.insert(
                    ext.variable.clone(),
                    Provenance::DefaultNotRun {
                        step_id: step.id.clone(),
                    },
                );
            }
            continue;
        };

        match extractor::evaluate(ext, response) {
            Ok(value) => {
                debug!(
                    "Extracted '{}' = '{}' from step '{}'",
                    ext.variable, value, step.id
                );
                context.variables.insert(ext.variable.clone(), value);
                context.provenance.insert(
                    ext.variable.clone(),
                    Provenance::Extracted {
                        step_id: step.id.clone(),
                    },
                );
            }
            Err(failure) => match &ext.default_value {
                Some(default) => {
                    warn!(
                        "Extraction of '{}' from step '{}' failed ({}); using default",
                        ext.variable, step.id, failure
                    );
                    context.warnings.push(format!(
                        "'{}' = '{}' from default: extraction from step '{}' failed: {}",
                        ext.variable, default, step.id, failure
                    ));
                    context.variables.insert(ext.variable.clone(), default.clone());
                    context.provenance.insert(
                        ext.variable.clone(),
                        Provenance::DefaultAfterFailure {
                            step_id: step.id.clone(),
                            reason: failure.to_string(),
                        },
                    );
                }
                None => {
                    warn!(
                        "Extraction of '{}' from step '{}' failed ({}); left unbound",
                        ext.variable, step.id, failure
                    );
                    context.warnings.push(format!(
                        "'{}' unbound: extraction from step '{}' failed: {}",
                        ext.variable, step.id, failure
                    ));
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResponseInfo, Workflow};

    const DOC: &str = r#"
id: wf
name: ctx
steps:
  - id: login
    type: request
    endpoint: /login
    extractors:
      - type: XPath
        path: //token
        variable: token
        defaultValue: PENDING
      - type: Regex
        path: "sid=(\\w+)"
        variable: sid
  - id: again
    type: request
    endpoint: /login2
    extractors:
      - type: XPath
        path: //token
        variable: token
        defaultValue: STALE
      - type: JSONPath
        path: $.user
        variable: user
  - id: outer
    type: loop
    loopType: count
    count: 2
    loopSteps:
      - id: inner-req
        type: request
        endpoint: /inner
        extractors:
          - type: Header
            source: header
            path: X-Inner
            variable: inner
            defaultValue: none-yet
      - id: inner-use
        type: delay
        delayMs: 0
  - id: use
    type: request
    endpoint: /use
"#;

    fn workflow() -> Workflow {
        Workflow::from_yaml(DOC).unwrap()
    }

    fn response(body: &str) -> ResponseInfo {
        ResponseInfo {
            status: 200,
            headers: HashMap::new(),
            body: body.to_string(),
        }
    }

    #[test]
    fn test_defaults_when_nothing_has_run() {
        let wf = workflow();
        let ctx = build_context(&wf.steps, &[3], &ExecutionLog::new());
        assert_eq!(ctx.variables.get("token").map(String::as_str), Some("PENDING"));
        assert_eq!(ctx.variables.get("inner").map(String::as_str), Some("none-yet"));
        // no default, no response: absent rather than empty
        assert!(!ctx.variables.contains_key("sid"));
        assert!(!ctx.variables.contains_key("user"));
        assert_eq!(
            ctx.provenance.get("token"),
            Some(&Provenance::DefaultNotRun {
                step_id: "login".to_string()
            })
        );
    }

    #[test]
    fn test_first_producer_wins() {
        let wf = workflow();
        let mut log = ExecutionLog::new();
        log.record("login", response("<r><token>abc123</token></r>"));
        log.record("again", response("<r><token>later</token></r>"));
        let ctx = build_context(&wf.steps, &[3], &log);
        assert_eq!(ctx.variables.get("token").map(String::as_str), Some("abc123"));
    }

    #[test]
    fn test_failure_falls_back_to_default_with_warning() {
        let wf = workflow();
        let mut log = ExecutionLog::new();
        log.record("login", response("not xml"));
        let ctx = build_context(&wf.steps, &[1], &log);
        assert_eq!(ctx.variables.get("token").map(String::as_str), Some("PENDING"));
        assert!(matches!(
            ctx.provenance.get("token"),
            Some(Provenance::DefaultAfterFailure { .. })
        ));
        assert!(!ctx.variables.contains_key("sid"));
        assert_eq!(ctx.warnings.len(), 2);
    }

    #[test]
    fn test_only_preceding_steps_contribute() {
        let wf = workflow();
        let mut log = ExecutionLog::new();
        log.record("again", response(r#"{"user":"bob"}"#));
        let ctx = build_context(&wf.steps, &[1], &log);
        assert!(!ctx.variables.contains_key("user"));
        let ctx = build_context(&wf.steps, &[0], &log);
        assert!(ctx.variables.is_empty());
    }

    #[test]
    fn test_rendered_chain_value_matches_direct_evaluation() {
        use crate::template::{render, TemplateScope};

        let wf = workflow();
        let login = response("<r><meta><token>abc 123</token></meta><token>x</token></r>");
        let again = response(r#"{"user": {"name": "bob", "roles": ["a", "b"]}}"#);
        let mut log = ExecutionLog::new();
        log.record("login", login.clone());
        log.record("again", again.clone());

        let ctx = build_context(&wf.steps, &[3], &log);
        let env: HashMap<String, String> = HashMap::new();
        let scope = TemplateScope::new(&env, &ctx.variables);

        for (step_id, recorded) in [("login", &login), ("again", &again)] {
            let (step, _) = wf.find_step(step_id).unwrap();
            for ext in step.extractors() {
                let Ok(direct) = extractor::evaluate(ext, recorded) else {
                    continue;
                };
                if ctx.provenance.get(&ext.variable)
                    != Some(&Provenance::Extracted {
                        step_id: step_id.to_string(),
                    })
                {
                    continue;
                }
                let rendered = render(&format!("${{{}}}", ext.variable), &scope);
                assert!(rendered.is_complete());
                assert_eq!(rendered.text, direct, "variable '{}'", ext.variable);
            }
        }
        assert_eq!(ctx.variables.get("token").map(String::as_str), Some("abc 123"));
        assert_eq!(
            ctx.variables.get("user").map(String::as_str),
            Some(r#"{"name":"bob","roles":["a","b"]}"#)
        );
    }

    #[test]
    fn test_descends_along_nesting_path() {
        let wf = workflow();
        let mut log = ExecutionLog::new();
        let mut inner = response("");
        inner.headers.insert("x-inner".to_string(), "v1".to_string());
        log.record("inner-req", inner);

        let ctx = build_context(&wf.steps, &[2, 1], &log);
        assert_eq!(ctx.variables.get("inner").map(String::as_str), Some("v1"));

        let ctx = build_context(&wf.steps, &[2, 0], &log);
        assert!(!ctx.variables.contains_key("inner"));
    }
}
