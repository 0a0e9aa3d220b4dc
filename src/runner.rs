//! Workflow execution entry points

use crate::context::build_context;
use crate::environment::{Environment, VariableSource};
use crate::error::ConfigurationError;
use crate::executor::{Halt, RunState, StepExecutor};
use crate::model::*;
use crate::script::{CelScriptSandbox, ScriptSandbox};
use crate::transport::{HttpTransport, ReqwestTransport};
use crate::validator::validate_workflow;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

/// Workflow runner trait
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    /// Execute every step of a workflow in order.
    async fn run(
        &self,
        workflow: &Workflow,
        cancel: &CancellationToken,
    ) -> Result<WorkflowResult, ConfigurationError>;

    /// Execute a single step in isolation. Chain variables resolve
    /// against `prior_log`, usually the log of an earlier full run.
    async fn run_step(
        &self,
        workflow: &Workflow,
        step_id: &str,
        prior_log: &ExecutionLog,
        cancel: &CancellationToken,
    ) -> Result<WorkflowResult, ConfigurationError>;
}

/// Default runner: reqwest transport, CEL scripts, no environment.
pub struct DefaultWorkflowRunner {
    transport: Arc<dyn HttpTransport>,
    sandbox: Arc<dyn ScriptSandbox>,
    environment: Arc<dyn VariableSource>,
}

impl DefaultWorkflowRunner {
    pub fn new() -> Self {
        Self {
            transport: Arc::new(ReqwestTransport::new()),
            sandbox: Arc::new(CelScriptSandbox),
            environment: Arc::new(Environment::default()),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn ScriptSandbox>) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_environment(mut self, environment: Arc<dyn VariableSource>) -> Self {
        self.environment = environment;
        self
    }

    fn prepare(workflow: &Workflow) -> Result<Workflow, ConfigurationError> {
        validate_workflow(workflow)?;
        let mut workflow = workflow.clone();
        workflow.normalize_order();
        Ok(workflow)
    }

    fn finish(
        workflow: &Workflow,
        run_id: Uuid,
        state: RunState,
        started: Instant,
    ) -> WorkflowResult {
        let failed = state
            .records
            .iter()
            .filter(|r| r.status == StepStatus::Failed)
            .count();
        let (status, error) = match &state.halted {
            Some(Halt::Cancelled) => (WorkflowStatus::Cancelled, Some("run cancelled".to_string())),
            Some(Halt::Aborted { step_id }) => (
                WorkflowStatus::Aborted,
                Some(format!("step '{step_id}' failed and abortOnFailure is set")),
            ),
            None if failed > 0 => (
                WorkflowStatus::Failed,
                Some(format!("{failed} step execution(s) failed")),
            ),
            None => (WorkflowStatus::Completed, None),
        };

        WorkflowResult {
            run_id,
            workflow_id: workflow.id.clone(),
            workflow_name: workflow.name.clone(),
            status,
            steps: state.records,
            variables: state.store,
            log: state.log,
            duration_ms: started.elapsed().as_millis() as u64,
            error,
        }
    }
}

impl Default for DefaultWorkflowRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowRunner for DefaultWorkflowRunner {
    #[instrument(skip(self, workflow, cancel), fields(name = %workflow.name))]
    async fn run(
        &self,
        workflow: &Workflow,
        cancel: &CancellationToken,
    ) -> Result<WorkflowResult, ConfigurationError> {
        let started = Instant::now();
        let workflow = Self::prepare(workflow)?;
        let run_id = Uuid::new_v4();

        info!("Starting workflow: {} (run {})", workflow.name, run_id);

        let executor = StepExecutor::new(
            self.transport.as_ref(),
            self.sandbox.as_ref(),
            self.environment.as_ref(),
            &workflow.config,
            &workflow.steps,
            cancel,
        );
        let mut state = RunState::new(workflow.variables.clone());
        executor
            .execute_sequence(&workflow.steps, Vec::new(), Vec::new(), &mut state)
            .await;

        let result = Self::finish(&workflow, run_id, state, started);
        info!(
            "Workflow finished: {} ({} ms) - Status: {:?}",
            workflow.name, result.duration_ms, result.status
        );
        Ok(result)
    }

    #[instrument(skip(self, workflow, prior_log, cancel), fields(name = %workflow.name))]
    async fn run_step(
        &self,
        workflow: &Workflow,
        step_id: &str,
        prior_log: &ExecutionLog,
        cancel: &CancellationToken,
    ) -> Result<WorkflowResult, ConfigurationError> {
        let started = Instant::now();
        let workflow = Self::prepare(workflow)?;
        let (step, path) = workflow
            .find_step(step_id)
            .ok_or_else(|| ConfigurationError::UnknownStep(step_id.to_string()))?;
        let run_id = Uuid::new_v4();

        info!("Running step '{}' of {} in isolation", step_id, workflow.name);

        let executor = StepExecutor::new(
            self.transport.as_ref(),
            self.sandbox.as_ref(),
            self.environment.as_ref(),
            &workflow.config,
            &workflow.steps,
            cancel,
        );
        let mut seed = workflow.variables.clone();
        seed.extend(build_context(&workflow.steps, &path, prior_log).variables);
        let mut state = RunState::new(seed).with_log(prior_log.clone());
        executor
            .execute_step(step, path, Vec::new(), &mut state)
            .await;

        Ok(Self::finish(&workflow, run_id, state, started))
    }
}

/// Results of past runs, keyed by run id.
#[derive(Debug, Default)]
pub struct ExecutionHistory {
    runs: HashMap<Uuid, WorkflowResult>,
    latest: HashMap<String, Uuid>,
}

impl ExecutionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, result: WorkflowResult) {
        self.latest
            .insert(result.workflow_id.clone(), result.run_id);
        self.runs.insert(result.run_id, result);
    }

    pub fn get(&self, run_id: &Uuid) -> Option<&WorkflowResult> {
        self.runs.get(run_id)
    }

    /// Most recent run of a workflow.
    pub fn latest(&self, workflow_id: &str) -> Option<&WorkflowResult> {
        self.latest
            .get(workflow_id)
            .and_then(|run_id| self.runs.get(run_id))
    }

    /// Execution log of the most recent run, for isolated step runs.
    pub fn latest_log(&self, workflow_id: &str) -> Option<&ExecutionLog> {
        self.latest(workflow_id).map(|result| &result.log)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
