//! Loading workflow and environment documents from disk.

use crate::environment::Environment;
use crate::error::ConfigurationError;
use crate::model::Workflow;
use crate::validator::validate_workflow;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Yaml,
    Json,
}

impl DocumentFormat {
    /// `.json` is JSON, everything else is read as YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => DocumentFormat::Json,
            _ => DocumentFormat::Yaml,
        }
    }
}

/// Parse, validate and normalise a workflow document. Any problem is a
/// [`ConfigurationError`]; nothing executes for a rejected document.
pub fn parse_workflow(
    content: &str,
    format: DocumentFormat,
) -> Result<Workflow, ConfigurationError> {
    let mut workflow = match format {
        DocumentFormat::Yaml => Workflow::from_yaml(content)
            .map_err(|e| ConfigurationError::Parse(e.to_string()))?,
        DocumentFormat::Json => Workflow::from_json(content)
            .map_err(|e| ConfigurationError::Parse(e.to_string()))?,
    };
    validate_workflow(&workflow)?;
    workflow.normalize_order();
    Ok(workflow)
}

/// Discovers and loads workflow files.
#[derive(Debug)]
pub struct WorkflowLoader {
    pub workflow_paths: Vec<PathBuf>,
}

impl WorkflowLoader {
    pub fn new() -> Self {
        Self {
            workflow_paths: vec![PathBuf::from("workflows")],
        }
    }

    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.workflow_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Load a single workflow file.
    pub fn load_workflow<P: AsRef<Path>>(&self, path: P) -> Result<Workflow> {
        let path = path.as_ref();
        info!("Loading workflow from {}", path.display());

        let content = fs::read_to_string(path)
            .context(format!("Failed to read workflow file: {}", path.display()))?;
        let workflow = parse_workflow(&content, DocumentFormat::from_path(path))
            .context(format!("Invalid workflow document: {}", path.display()))?;

        debug!("Successfully loaded workflow: {}", workflow.name);
        Ok(workflow)
    }

    /// Load every workflow file in `dir`, in file name order. The first
    /// file that fails to load fails the whole directory.
    pub fn load_workflows_from_dir<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<Workflow>> {
        let dir = dir.as_ref();
        info!("Loading workflows from directory: {}", dir.display());

        let mut entries: Vec<PathBuf> = fs::read_dir(dir)
            .context(format!("Failed to read directory: {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_workflow_file(path))
            .collect();
        entries.sort();

        let workflows = entries
            .iter()
            .map(|path| self.load_workflow(path))
            .collect::<Result<Vec<_>>>()?;

        info!("Loaded {} workflows from {}", workflows.len(), dir.display());
        Ok(workflows)
    }

    pub fn load_all_workflows(&self) -> Result<Vec<Workflow>> {
        let mut all = Vec::new();
        for path in &self.workflow_paths {
            if path.is_dir() {
                all.extend(self.load_workflows_from_dir(path)?);
            }
        }
        info!("Loaded {} workflows in total", all.len());
        Ok(all)
    }
}

impl Default for WorkflowLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Load an environment file (YAML or JSON).
pub fn load_environment<P: AsRef<Path>>(path: P) -> Result<Environment> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .context(format!("Failed to read environment file: {}", path.display()))?;
    let environment: Environment = match DocumentFormat::from_path(path) {
        DocumentFormat::Json => serde_json::from_str(&content)
            .context(format!("Failed to parse environment JSON: {}", path.display()))?,
        DocumentFormat::Yaml => serde_yaml::from_str(&content)
            .context(format!("Failed to parse environment YAML: {}", path.display()))?,
    };
    debug!("Loaded environment '{}'", environment.name);
    Ok(environment)
}

fn is_workflow_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml" || ext == "json")
}
