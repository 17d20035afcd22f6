//! Action executors.
//!
//! Each built-in node kind has an executor implementing [`Action`]. The
//! [`ActionRegistry`] is built at startup and handed to the engine;
//! extension actions are registered into it by name.

mod ai;
pub mod approval;
mod branch;
mod data;
mod delay;
pub mod notification;
mod registry;
mod script;
mod subworkflow;
mod types;
mod webhook;

pub use ai::AiAction;
pub use approval::ApprovalAction;
pub use branch::BranchAction;
pub use data::DataMutationAction;
pub use delay::DelayAction;
pub use notification::{LogNotifier, Notification, NotificationAction, Notifier};
pub use registry::{ActionInfo, ActionRegistry};
pub use script::ScriptAction;
pub use subworkflow::SubWorkflowAction;
pub use types::*;
pub use webhook::WebhookAction;

#[cfg(test)]
pub(crate) use notification::RecordingNotifier;
