//! Error taxonomy for workflow loading and execution.
//!
//! Only [`ConfigurationError`] is fatal, and only while loading. The
//! remaining kinds are recorded against the step that produced them
//! and surface as warnings or step failures in the run result.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An extractor could not produce a value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionFailure {
    #[error("response body is not valid XML: {0}")]
    InvalidXml(String),
    #[error("response body is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("invalid expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },
    #[error("'{0}' matched nothing")]
    NoMatch(String),
    #[error("pattern '{0}' has no capture group")]
    NoCaptureGroup(String),
    #[error("header '{0}' not present in response")]
    MissingHeader(String),
}

/// Transport-level failure of a request step.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("request failed: {0}")]
    Network(String),
    #[error("request timed out after {0}s")]
    Timeout(u64),
    #[error("request cancelled")]
    Cancelled,
}

/// Malformed workflow document. Raised before execution starts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("failed to parse workflow document: {0}")]
    Parse(String),
    #[error("step at {path} has an empty id")]
    EmptyStepId { path: String },
    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),
    #[error("step '{step}' is missing required field '{field}'")]
    MissingField { step: String, field: &'static str },
    #[error("step '{step}': {reason}")]
    InvalidField { step: String, reason: String },
    #[error("no step with id '{0}'")]
    UnknownStep(String),
}

/// A script step raised an error; none of its writes were applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("line {line}: cannot parse statement '{statement}'")]
    Syntax { line: usize, statement: String },
    #[error("line {line}: {reason}")]
    Evaluation { line: usize, reason: String },
}

/// Which placeholder namespace a gap belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Namespace {
    /// `{{identifier}}`: functions and environment/global variables.
    Environment,
    /// `${identifier}`: chain variables.
    Chain,
}

/// A placeholder that matched no function or variable. Left verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionGap {
    pub placeholder: String,
    pub namespace: Namespace,
}

impl std::fmt::Display for ResolutionGap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unresolved placeholder {}", self.placeholder)
    }
}
