//! Action registry - maps action-type keys to executors.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use super::types::Action;
use super::{
    AiAction, ApprovalAction, BranchAction, DataMutationAction, DelayAction, NotificationAction,
    ScriptAction, SubWorkflowAction, WebhookAction,
};

/// Node kinds the engine runs itself rather than through an executor.
pub const CONTROL_FLOW: &[(&str, &str)] = &[
    ("parallel", "Run branches concurrently and wait for all of them"),
    ("loop", "Run a body sub-graph once per list item"),
];

/// Listing entry for the administrative surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionInfo {
    pub action_type: String,
    pub description: String,
    pub builtin: bool,
}

/// Registry of available action executors.
#[derive(Clone)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

const BUILTINS: &[&str] = &[
    "notification",
    "webhook",
    "delay",
    "approval",
    "script",
    "sub_workflow",
    "data_mutation",
    "ai",
    "branch",
];

impl ActionRegistry {
    /// Create a new registry with the built-in actions.
    pub fn new() -> Self {
        let mut registry = Self::empty();

        registry.register(Arc::new(NotificationAction));
        registry.register(Arc::new(WebhookAction));
        registry.register(Arc::new(DelayAction));
        registry.register(Arc::new(ApprovalAction));
        registry.register(Arc::new(ScriptAction));
        registry.register(Arc::new(SubWorkflowAction));
        registry.register(Arc::new(DataMutationAction));
        registry.register(Arc::new(AiAction));
        registry.register(Arc::new(BranchAction));

        registry
    }

    /// Create an empty registry (for testing).
    pub fn empty() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Register an action. A later registration replaces an earlier one
    /// with the same key.
    pub fn register(&mut self, action: Arc<dyn Action>) {
        self.actions.insert(action.action_type().to_string(), action);
    }

    /// Get an action by type key.
    pub fn get(&self, action_type: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(action_type).cloned()
    }

    /// Check if an action type is registered.
    pub fn has(&self, action_type: &str) -> bool {
        self.actions.contains_key(action_type)
    }

    /// All registered actions plus the engine's control-flow kinds, sorted.
    pub fn list(&self) -> Vec<ActionInfo> {
        let mut infos: Vec<ActionInfo> = self
            .actions
            .iter()
            .map(|(key, action)| ActionInfo {
                action_type: key.clone(),
                description: action.description().to_string(),
                builtin: BUILTINS.contains(&key.as_str()),
            })
            .chain(CONTROL_FLOW.iter().map(|(key, description)| ActionInfo {
                action_type: key.to_string(),
                description: description.to_string(),
                builtin: true,
            }))
            .collect();
        infos.sort_by(|a, b| a.action_type.cmp(&b.action_type));
        infos
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
