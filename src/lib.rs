//! apiflow: a workflow engine for chained API test steps.
//!
//! A [`Workflow`] is an ordered tree of request, delay, condition, loop and
//! script steps. Request steps extract values from their responses and
//! later steps reference them through `${name}` placeholders, while
//! `{{name}}` placeholders resolve against the active [`Environment`].

pub mod config;
pub mod context;
pub mod environment;
pub mod error;
pub mod executor;
pub mod extractor;
pub mod model;
pub mod runner;
pub mod script;
pub mod template;
pub mod transport;
pub mod validator;

pub use config::*;
pub use environment::{Environment, VariableSource};
pub use error::*;
pub use model::*;
pub use runner::*;
pub use validator::*;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
