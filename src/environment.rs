//! Environment and global variables, read-only to the engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Read-only lookup of `{{identifier}}` variables.
pub trait VariableSource: Send + Sync {
    fn lookup(&self, name: &str) -> Option<String>;

    /// Endpoint URL of the active environment, used by the `env`/`url`
    /// template functions and for joining relative endpoints.
    fn endpoint_url(&self) -> Option<String> {
        self.lookup("endpoint_url")
    }
}

impl VariableSource for HashMap<String, String> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// An environment as loaded from an environment file. Environment
/// variables shadow globals of the same name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub globals: HashMap<String, String>,
}

impl Environment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }

    pub fn with_variable(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_global(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.globals.insert(name.into(), value.into());
        self
    }
}

impl VariableSource for Environment {
    fn lookup(&self, name: &str) -> Option<String> {
        self.variables
            .get(name)
            .or_else(|| self.globals.get(name))
            .cloned()
            .or_else(|| {
                (name == "endpoint_url")
                    .then(|| self.endpoint_url.clone())
                    .flatten()
            })
    }

    fn endpoint_url(&self) -> Option<String> {
        self.endpoint_url
            .clone()
            .or_else(|| self.variables.get("endpoint_url").cloned())
    }
}
