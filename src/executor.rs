//! Recursive interpreter over the step tree.
//!
//! Steps run strictly one after another, loop iterations included. The
//! run-scoped [`RunState`] is passed down the recursion by mutable
//! reference; nested loop bodies share it rather than owning copies.

use crate::context::build_context;
use crate::environment::VariableSource;
use crate::error::TransportError;
use crate::extractor;
use crate::model::{
    Condition, ConditionOperator, ExecutionLog, LoopStep, LoopType, RequestInfo, RequestStep,
    ScriptStep, Step, StepKind, StepRecord, StepStatus, WorkflowConfig,
};
use crate::script::{ScriptLog, ScriptSandbox, ScriptVariables};
use crate::template::{render, Rendered, TemplateScope};
use crate::transport::{HttpTransport, TransportRequest};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Why a run stopped before reaching its last step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Halt {
    Cancelled,
    /// A step failed while `abortOnFailure` was set.
    Aborted { step_id: String },
}

/// Mutable state of one run. Only the executor writes to it.
#[derive(Debug, Default)]
pub struct RunState {
    /// Run-scoped variable store; newest write wins.
    pub store: HashMap<String, String>,
    pub log: ExecutionLog,
    pub records: Vec<StepRecord>,
    pub halted: Option<Halt>,
}

impl RunState {
    pub fn new(seed: HashMap<String, String>) -> Self {
        Self {
            store: seed,
            ..Self::default()
        }
    }

    pub fn with_log(mut self, log: ExecutionLog) -> Self {
        self.log = log;
        self
    }
}

/// What the enclosing sequence does after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// A condition was not met: the remaining siblings are skipped.
    SkipSiblings,
}

/// Executes steps against one run's state.
pub struct StepExecutor<'r> {
    transport: &'r dyn HttpTransport,
    sandbox: &'r dyn ScriptSandbox,
    environment: &'r dyn VariableSource,
    config: &'r WorkflowConfig,
    /// Root of the step tree; index paths are relative to it.
    root: &'r [Step],
    cancel: &'r CancellationToken,
}

impl<'r> StepExecutor<'r> {
    pub fn new(
        transport: &'r dyn HttpTransport,
        sandbox: &'r dyn ScriptSandbox,
        environment: &'r dyn VariableSource,
        config: &'r WorkflowConfig,
        root: &'r [Step],
        cancel: &'r CancellationToken,
    ) -> Self {
        Self {
            transport,
            sandbox,
            environment,
            config,
            root,
            cancel,
        }
    }

    /// Run `steps` in order. `parent` is the index path of the sequence
    /// owner (empty for the root), `iteration` the enclosing loop
    /// indices.
    pub fn execute_sequence<'a>(
        &'a self,
        steps: &'a [Step],
        parent: Vec<usize>,
        iteration: Vec<u32>,
        state: &'a mut RunState,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            for (idx, step) in steps.iter().enumerate() {
                if state.halted.is_none() && self.cancel.is_cancelled() {
                    info!("Run cancelled before step '{}'", step.id);
                    state.halted = Some(Halt::Cancelled);
                }
                if let Some(halt) = &state.halted {
                    let reason = match halt {
                        Halt::Cancelled => "run cancelled".to_string(),
                        Halt::Aborted { step_id } => {
                            format!("run aborted after step '{step_id}' failed")
                        }
                    };
                    skip_all(&steps[idx..], &iteration, &reason, state);
                    return;
                }

                let mut path = parent.clone();
                path.push(idx);
                let flow = self.execute_step(step, path, iteration.clone(), state).await;

                if flow == Flow::SkipSiblings {
                    let reason = format!("condition step '{}' was not met", step.id);
                    skip_all(&steps[idx + 1..], &iteration, &reason, state);
                    return;
                }
            }
        })
    }

    /// Run one step and record its outcome.
    pub fn execute_step<'a>(
        &'a self,
        step: &'a Step,
        path: Vec<usize>,
        iteration: Vec<u32>,
        state: &'a mut RunState,
    ) -> BoxFuture<'a, Flow> {
        Box::pin(async move {
            let started = Instant::now();
            info!("Running step '{}' ({})", step.name, step.kind_name());

            let slot = state.records.len();
            let mut record = StepRecord::new(step, &iteration);
            record.status = StepStatus::Running;
            state.records.push(record.clone());

            let mut flow = Flow::Continue;
            match &step.kind {
                StepKind::Request(request) => {
                    self.run_request(step, request, &path, &mut record, state).await;
                }
                StepKind::Delay(delay) => {
                    self.run_delay(delay.delay_ms, &mut record, state).await;
                }
                StepKind::Condition(condition) => {
                    let (scope_vars, warnings) = self.chain_variables(&path, state);
                    record.warnings.extend(warnings);
                    let scope = TemplateScope::new(self.environment, &scope_vars);
                    let (met, rendered) = evaluate_condition(condition, &scope);
                    record.warnings.extend(gap_warnings("expression", &rendered));
                    record.logs.push(format!(
                        "'{}' {:?} '{}' => {}",
                        rendered.text, condition.operator, condition.expected_value, met
                    ));
                    record.status = StepStatus::Succeeded;
                    if !met {
                        debug!("Condition '{}' not met; skipping siblings", step.id);
                        flow = Flow::SkipSiblings;
                    }
                }
                StepKind::Loop(loop_step) => {
                    self.run_loop(loop_step, &path, &iteration, &mut record, state)
                        .await;
                }
                StepKind::Script(script) => {
                    self.run_script(script, &mut record, state);
                }
            }

            record.duration_ms = started.elapsed().as_millis() as u64;
            if record.status == StepStatus::Failed && self.config.abort_on_failure {
                warn!("Aborting run: step '{}' failed", step.id);
                state.halted.get_or_insert(Halt::Aborted {
                    step_id: step.id.clone(),
                });
            }
            state.records[slot] = record;
            flow
        })
    }

    async fn run_request(
        &self,
        step: &Step,
        request: &RequestStep,
        path: &[usize],
        record: &mut StepRecord,
        state: &mut RunState,
    ) {
        let (chain, warnings) = self.chain_variables(path, state);
        record.warnings.extend(warnings);

        let transport_request = {
            let scope = TemplateScope::new(self.environment, &chain);

            let endpoint = render(&request.endpoint, &scope);
            record.warnings.extend(gap_warnings("endpoint", &endpoint));

            let mut headers = self.config.headers.clone();
            headers.extend(request.headers.clone());
            let headers: HashMap<String, String> = headers
                .into_iter()
                .map(|(name, value)| {
                    let rendered = render(&value, &scope);
                    record
                        .warnings
                        .extend(gap_warnings(&format!("header '{name}'"), &rendered));
                    (name, rendered.text)
                })
                .collect();

            let body = request.body.as_deref().map(|body| {
                let rendered = render(body, &scope);
                record.warnings.extend(gap_warnings("body", &rendered));
                rendered.text
            });

            let url = match self.join_endpoint(&endpoint.text) {
                Ok(url) => url,
                Err(err) => {
                    record.status = StepStatus::Failed;
                    record.error = Some(err.to_string());
                    return;
                }
            };

            record.request = Some(RequestInfo {
                method: request.method.as_str().to_string(),
                url: url.clone(),
                headers: headers.clone(),
                body: body.clone(),
            });

            TransportRequest {
                method: request.method,
                url,
                headers,
                body,
                timeout: Duration::from_secs(self.config.timeout),
            }
        };

        let response = match self.transport.send(&transport_request, self.cancel).await {
            Ok(response) => response,
            Err(TransportError::Cancelled) => {
                info!("Request step '{}' cancelled in flight", step.id);
                record.status = StepStatus::Skipped;
                record.warnings.push("cancelled while the request was in flight".to_string());
                state.halted = Some(Halt::Cancelled);
                return;
            }
            Err(err) => {
                warn!("Request step '{}' failed: {}", step.id, err);
                record.status = StepStatus::Failed;
                record.error = Some(err.to_string());
                return;
            }
        };

        debug!("Step '{}' received status {}", step.id, response.status);
        state.log.record(&step.id, response.clone());

        for ext in &request.extractors {
            match extractor::evaluate(ext, &response) {
                Ok(value) => {
                    debug!("Extracted '{}' = '{}'", ext.variable, value);
                    record.extracted.insert(ext.variable.clone(), value.clone());
                    state.store.insert(ext.variable.clone(), value);
                }
                Err(failure) => match &ext.default_value {
                    Some(default) => {
                        warn!("Extraction of '{}' failed ({}); using default", ext.variable, failure);
                        record.warnings.push(format!(
                            "'{}' = '{}' from default: {}",
                            ext.variable, default, failure
                        ));
                        record.extracted.insert(ext.variable.clone(), default.clone());
                        state.store.insert(ext.variable.clone(), default.clone());
                    }
                    None => {
                        warn!("Extraction of '{}' failed ({}); left unbound", ext.variable, failure);
                        record
                            .warnings
                            .push(format!("'{}' unbound: {}", ext.variable, failure));
                    }
                },
            }
        }

        record.response = Some(response);
        record.status = StepStatus::Succeeded;
    }

    async fn run_delay(&self, delay_ms: u64, record: &mut StepRecord, state: &mut RunState) {
        debug!("Waiting for {}ms", delay_ms);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                record.status = StepStatus::Skipped;
                record.warnings.push("cancelled during delay".to_string());
                state.halted = Some(Halt::Cancelled);
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {
                record.status = StepStatus::Succeeded;
            }
        }
    }

    async fn run_loop(
        &self,
        loop_step: &LoopStep,
        path: &[usize],
        iteration: &[u32],
        record: &mut StepRecord,
        state: &mut RunState,
    ) {
        let limit = loop_step.max_iterations;
        let iterator = loop_step.iterator_variable.as_str();
        let previous = state.store.get(iterator).cloned();

        // `None` for while loops, which decide per iteration.
        let items: Option<Vec<String>> = match loop_step.loop_type {
            LoopType::Count => {
                let requested = loop_step.count.unwrap_or(0);
                if requested > limit {
                    record.warnings.push(format!(
                        "count {requested} capped at maxIterations {limit}"
                    ));
                }
                Some((0..requested.min(limit)).map(|i| i.to_string()).collect())
            }
            LoopType::List => {
                let name = loop_step.list_variable.as_deref().unwrap_or_default();
                let (chain, warnings) = self.chain_variables(path, state);
                record.warnings.extend(warnings);
                let raw = chain
                    .get(name)
                    .cloned()
                    .or_else(|| self.environment.lookup(name));
                let mut elements = match raw {
                    Some(raw) => split_list(&raw),
                    None => {
                        record
                            .warnings
                            .push(format!("list variable '{name}' is not bound"));
                        Vec::new()
                    }
                };
                if elements.len() > limit as usize {
                    record.warnings.push(format!(
                        "{} list elements capped at maxIterations {limit}",
                        elements.len()
                    ));
                    elements.truncate(limit as usize);
                }
                Some(elements)
            }
            LoopType::While => None,
        };

        let mut completed: u32 = 0;
        loop {
            if state.halted.is_some() {
                break;
            }
            let value = match &items {
                Some(items) => match items.get(completed as usize) {
                    Some(value) => value.clone(),
                    None => break,
                },
                None => {
                    if completed >= limit {
                        record
                            .warnings
                            .push(format!("while loop stopped at maxIterations {limit}"));
                        break;
                    }
                    let Some(condition) = &loop_step.condition else {
                        break;
                    };
                    let (chain, _) = self.chain_variables(path, state);
                    let scope = TemplateScope::new(self.environment, &chain);
                    let (met, _) = evaluate_condition(condition, &scope);
                    if !met {
                        break;
                    }
                    completed.to_string()
                }
            };

            debug!("Loop iteration {} binds '{}' = '{}'", completed, iterator, value);
            state.store.insert(iterator.to_string(), value);
            let mut nested = iteration.to_vec();
            nested.push(completed);
            self.execute_sequence(&loop_step.loop_steps, path.to_vec(), nested, state)
                .await;
            completed += 1;
        }

        match previous {
            Some(value) => state.store.insert(iterator.to_string(), value),
            None => state.store.remove(iterator),
        };

        record.logs.push(format!("{completed} iteration(s)"));
        record.status = if state.halted == Some(Halt::Cancelled) {
            StepStatus::Skipped
        } else {
            StepStatus::Succeeded
        };
    }

    fn run_script(&self, script: &ScriptStep, record: &mut StepRecord, state: &mut RunState) {
        let mut variables = ScriptVariables::new(state.store.clone());
        let mut log = ScriptLog::default();

        match self.sandbox.run(&script.script, &mut variables, &mut log) {
            Ok(()) => {
                let writes = variables.into_writes();
                debug!("Script wrote {} variable(s)", writes.len());
                state.store.extend(writes);
                record.status = StepStatus::Succeeded;
            }
            Err(err) => {
                warn!("Script failed: {}", err);
                record.status = StepStatus::Failed;
                record.error = Some(err.to_string());
            }
        }
        record.logs.extend(log.into_lines());
    }

    /// Chain variables visible at `path`: the context built from
    /// earlier steps, overlaid by the run-scoped store.
    fn chain_variables(
        &self,
        path: &[usize],
        state: &RunState,
    ) -> (HashMap<String, String>, Vec<String>) {
        let context = build_context(self.root, path, &state.log);
        let mut variables = context.variables;
        variables.extend(state.store.iter().map(|(k, v)| (k.clone(), v.clone())));
        (variables, context.warnings)
    }

    /// Join a scheme-less endpoint onto the environment's endpoint URL.
    fn join_endpoint(&self, endpoint: &str) -> Result<String, TransportError> {
        if endpoint.contains("://") {
            return Ok(endpoint.to_string());
        }
        let Some(base_url) = self.environment.endpoint_url() else {
            return Err(TransportError::InvalidRequest(format!(
                "endpoint '{endpoint}' has no scheme and no environment endpoint URL is set"
            )));
        };

        let mut base = base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base).map_err(|e| {
            TransportError::InvalidRequest(format!("invalid endpoint URL '{base_url}': {e}"))
        })?;
        let joined = if endpoint.is_empty() {
            base
        } else {
            base.join(endpoint.trim_start_matches('/')).map_err(|e| {
                TransportError::InvalidRequest(format!(
                    "failed to join '{base_url}' with '{endpoint}': {e}"
                ))
            })?
        };
        Ok(joined.to_string())
    }
}

/// Resolve a condition's expression and expected value and compare
/// them. Numeric operators require both sides to parse as numbers.
pub fn evaluate_condition(condition: &Condition, scope: &TemplateScope<'_>) -> (bool, Rendered) {
    let rendered = render(&condition.expression, scope);
    let expected = render(&condition.expected_value, scope).text;
    let actual = rendered.text.as_str();
    let resolved = !actual.trim().is_empty() && rendered.is_complete();

    let met = match condition.operator {
        ConditionOperator::Equals => actual == expected,
        ConditionOperator::NotEquals => actual != expected,
        ConditionOperator::Contains => actual.contains(expected.as_str()),
        ConditionOperator::NotContains => !actual.contains(expected.as_str()),
        ConditionOperator::GreaterThan => numeric(actual, &expected).is_some_and(|(a, b)| a > b),
        ConditionOperator::LessThan => numeric(actual, &expected).is_some_and(|(a, b)| a < b),
        ConditionOperator::Exists => resolved,
        ConditionOperator::NotExists => !resolved,
    };
    (met, rendered)
}

fn numeric(actual: &str, expected: &str) -> Option<(f64, f64)> {
    let a = actual.trim().parse::<f64>().ok()?;
    let b = expected.trim().parse::<f64>().ok()?;
    Some((a, b))
}

/// Split a list value: a JSON array yields its elements, anything else
/// is comma-separated.
pub fn split_list(raw: &str) -> Vec<String> {
    if let Ok(serde_json::Value::Array(items)) = serde_json::from_str(raw.trim()) {
        return items
            .into_iter()
            .map(|item| match item {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .collect();
    }
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn gap_warnings(field: &str, rendered: &Rendered) -> Vec<String> {
    rendered
        .gaps
        .iter()
        .map(|gap| format!("{gap} in {field}"))
        .collect()
}

fn skip_all(steps: &[Step], iteration: &[u32], reason: &str, state: &mut RunState) {
    for step in steps {
        debug!("Skipping step '{}': {}", step.id, reason);
        state
            .records
            .push(StepRecord::skipped(step, iteration, reason));
    }
}
