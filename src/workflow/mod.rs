//! Workflow definition, parsing, and validation.
//!
//! Workflows are defined in YAML (or JSON) and consist of:
//! - Trigger: what starts the workflow (entity event, schedule, webhook, manual, domain event)
//! - Nodes: the steps to execute, each a tagged action config
//! - Connections and error handler: routing between steps and on failure

mod parameters;
mod parser;
mod types;
mod validator;

pub use parameters::validate_parameters;
pub(crate) use parameters::json_type_name;
pub use parser::{parse_workflow, parse_workflow_file};
pub use types::*;
pub use validator::validate_workflow;
