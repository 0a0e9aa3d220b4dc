//! Workflow documents and run results.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A test workflow: an ordered tree of steps sharing one variable
/// context per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<Step>,
    /// Persisted variables. Seeds the run-scoped store; a run never
    /// writes back here.
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub config: WorkflowConfig,
}

/// Execution settings carried by a workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowConfig {
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Stop the run at the first failed step. Off by default so a
    /// diagnostics run shows the whole path.
    #[serde(default)]
    pub abort_on_failure: bool,
    /// Headers sent with every request unless the step overrides them.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            abort_on_failure: false,
            headers: HashMap::new(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}

/// A single node of the step tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Immutable join key between a step and its recorded execution.
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Position among siblings; recomputed by
    /// [`Workflow::normalize_order`].
    #[serde(default)]
    pub order: u32,
    #[serde(flatten)]
    pub kind: StepKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StepKind {
    Request(RequestStep),
    Delay(DelayStep),
    Condition(Condition),
    Loop(LoopStep),
    Script(ScriptStep),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStep {
    pub endpoint: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub extractors: Vec<Extractor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayStep {
    pub delay_ms: u64,
}

/// Comparison of a resolved expression against an expected value.
/// Used by condition steps and by `while` loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub expression: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub expected_value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    Exists,
    NotExists,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStep {
    pub loop_type: LoopType,
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default)]
    pub list_variable: Option<String>,
    #[serde(default = "default_iterator_variable")]
    pub iterator_variable: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Re-evaluated before every iteration of a `while` loop.
    #[serde(default)]
    pub condition: Option<Condition>,
    pub loop_steps: Vec<Step>,
}

fn default_iterator_variable() -> String {
    "i".to_string()
}

fn default_max_iterations() -> u32 {
    100
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopType {
    Count,
    List,
    While,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptStep {
    pub script: String,
}

/// Rule pulling one value out of a recorded response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extractor {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ExtractorKind,
    #[serde(default)]
    pub source: ExtractorSource,
    /// XPath / regex / JSONPath expression, or a literal header name.
    pub path: String,
    pub variable: String,
    #[serde(default)]
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractorKind {
    #[serde(rename = "XPath", alias = "xpath")]
    XPath,
    #[serde(rename = "Regex", alias = "regex")]
    Regex,
    #[serde(rename = "JSONPath", alias = "jsonpath")]
    JsonPath,
    #[serde(rename = "Header", alias = "header")]
    Header,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorSource {
    #[default]
    Body,
    Header,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl Step {
    /// Lower-case tag of the step kind, as written in documents.
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            StepKind::Request(_) => "request",
            StepKind::Delay(_) => "delay",
            StepKind::Condition(_) => "condition",
            StepKind::Loop(_) => "loop",
            StepKind::Script(_) => "script",
        }
    }

    /// Extractors of a request step; empty for every other kind.
    pub fn extractors(&self) -> &[Extractor] {
        match &self.kind {
            StepKind::Request(request) => &request.extractors,
            _ => &[],
        }
    }

    pub fn children(&self) -> &[Step] {
        match &self.kind {
            StepKind::Loop(loop_step) => &loop_step.loop_steps,
            _ => &[],
        }
    }
}

impl Workflow {
    /// Deserialize a workflow from YAML (JSON is accepted too, being a
    /// subset of YAML).
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Sort every sibling list by `order` (stable) and renumber
    /// `order` to match the resulting position.
    pub fn normalize_order(&mut self) {
        normalize_steps(&mut self.steps);
    }

    /// Locate a step anywhere in the tree. Returns the step and its
    /// index path from the root.
    pub fn find_step(&self, id: &str) -> Option<(&Step, Vec<usize>)> {
        let mut path = Vec::new();
        find_in(&self.steps, id, &mut path).map(|step| (step, path))
    }

    /// Copy discovered values into the persisted variables. This is
    /// the only way a run's values reach `Workflow::variables`.
    pub fn persist_variables<'a, I>(&mut self, discovered: I)
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (name, value) in discovered {
            self.variables.insert(name.clone(), value.clone());
        }
    }
}

fn normalize_steps(steps: &mut [Step]) {
    steps.sort_by_key(|step| step.order);
    for (position, step) in steps.iter_mut().enumerate() {
        step.order = position as u32;
        if let StepKind::Loop(loop_step) = &mut step.kind {
            normalize_steps(&mut loop_step.loop_steps);
        }
    }
}

fn find_in<'a>(
    steps: &'a [Step],
    id: &str,
    path: &mut Vec<usize>,
) -> Option<&'a Step> {
    for (idx, step) in steps.iter().enumerate() {
        path.push(idx);
        if step.id == id {
            return Some(step);
        }
        if let Some(found) = find_in(step.children(), id, path) {
            return Some(found);
        }
        path.pop();
    }
    None
}

/// Lifecycle state of one step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// Outcome of one execution of one step. Steps inside loops produce
/// one record per iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step_id: String,
    pub step_name: String,
    pub kind: String,
    pub status: StepStatus,
    /// Iteration indices of the enclosing loops, outermost first.
    #[serde(default)]
    pub iteration: Vec<u32>,
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Script log lines.
    #[serde(default)]
    pub logs: Vec<String>,
    /// Values bound by this step's extractors.
    #[serde(default)]
    pub extracted: HashMap<String, String>,
    #[serde(default)]
    pub request: Option<RequestInfo>,
    #[serde(default)]
    pub response: Option<ResponseInfo>,
}

impl StepRecord {
    pub fn new(step: &Step, iteration: &[u32]) -> Self {
        Self {
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            kind: step.kind_name().to_string(),
            status: StepStatus::Pending,
            iteration: iteration.to_vec(),
            duration_ms: 0,
            error: None,
            warnings: Vec::new(),
            logs: Vec::new(),
            extracted: HashMap::new(),
            request: None,
            response: None,
        }
    }

    pub fn skipped(step: &Step, iteration: &[u32], reason: &str) -> Self {
        let mut record = Self::new(step, iteration);
        record.status = StepStatus::Skipped;
        record.warnings.push(reason.to_string());
        record
    }
}

/// Materialized request as handed to the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestInfo {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

/// Raw response recorded against a step id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseInfo {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Result of an assertion evaluated by an external collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionResult {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Last recorded response of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedExecution {
    pub response: ResponseInfo,
    #[serde(default)]
    pub assertion_results: Option<Vec<AssertionResult>>,
}

/// Per-run record of step responses, keyed by step id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionLog {
    entries: HashMap<String, RecordedExecution>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a response, replacing any earlier one for the step.
    pub fn record(&mut self, step_id: &str, response: ResponseInfo) {
        self.entries.insert(
            step_id.to_string(),
            RecordedExecution {
                response,
                assertion_results: None,
            },
        );
    }

    /// Attach assertion results to a recorded step. Returns `false`
    /// if the step has no recorded response.
    pub fn attach_assertions(
        &mut self,
        step_id: &str,
        results: Vec<AssertionResult>,
    ) -> bool {
        match self.entries.get_mut(step_id) {
            Some(entry) => {
                entry.assertion_results = Some(results);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, step_id: &str) -> Option<&RecordedExecution> {
        self.entries.get(step_id)
    }

    pub fn response(&self, step_id: &str) -> Option<&ResponseInfo> {
        self.entries.get(step_id).map(|entry| &entry.response)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// Every executed step succeeded or was skipped by a condition.
    Completed,
    /// At least one step failed; the run continued.
    Failed,
    /// A step failed and `abortOnFailure` stopped the run.
    Aborted,
    Cancelled,
}

/// Result of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResult {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    pub steps: Vec<StepRecord>,
    /// Final state of the run-scoped store.
    pub variables: HashMap<String, String>,
    pub log: ExecutionLog,
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkflowResult {
    pub fn success(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }

    /// Records of a given step, in execution order.
    pub fn records_for<'a>(
        &'a self,
        step_id: &'a str,
    ) -> impl Iterator<Item = &'a StepRecord> + 'a {
        self.steps.iter().filter(move |r| r.step_id == step_id)
    }

    /// Every warning of the run, prefixed with its step id.
    pub fn warnings(&self) -> Vec<String> {
        self.steps
            .iter()
            .flat_map(|r| {
                r.warnings
                    .iter()
                    .map(move |w| format!("[{}] {}", r.step_id, w))
            })
            .collect()
    }
}
