//! Manual triggers.

use serde_json::Value;
use tracing::info;

use super::TriggerHub;
use crate::engine::RunMode;
use crate::error::{Error, Result};
use crate::metrics;
use crate::storage::{ExecutionContext, WorkflowExecution};
use crate::workflow::{validate_parameters, TriggerKind, TriggerType};

/// Who is asking, as established by the host application.
#[derive(Debug, Clone, Default)]
pub struct Caller {
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub role: Option<String>,
}

impl Caller {
    pub fn new(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.role = Some(role.to_string());
        self
    }
}

impl TriggerHub {
    /// Start a manually triggered workflow.
    ///
    /// Checks run in order: existence, tenant, ACTIVE status, manual trigger
    /// type, caller role, declared parameters. Nothing is persisted until all
    /// of them pass.
    pub async fn trigger_manual(
        &self,
        workflow_id: &str,
        parameters: Value,
        caller: &Caller,
        mode: RunMode,
    ) -> Result<WorkflowExecution> {
        let result = self.admit_manual(workflow_id, parameters, caller).await;
        let data = match result {
            Ok(data) => data,
            Err(e) => {
                metrics::record_trigger("manual", "rejected");
                return Err(e);
            }
        };

        let context = ExecutionContext::new(TriggerType::Manual, &caller.tenant_id, data)
            .with_user(caller.user_id.as_deref());
        let execution = self
            .engine()
            .trigger_workflow(workflow_id, context, mode)
            .await?;
        metrics::record_trigger("manual", "started");
        info!(
            workflow_id,
            execution_id = %execution.id,
            user = ?caller.user_id,
            "Manual trigger accepted"
        );
        Ok(execution)
    }

    /// Validate a manual call and return the parameters with defaults applied.
    async fn admit_manual(
        &self,
        workflow_id: &str,
        parameters: Value,
        caller: &Caller,
    ) -> Result<Value> {
        let workflow = self
            .engine()
            .store()
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Workflow {}", workflow_id)))?;

        if workflow.tenant_id != caller.tenant_id {
            return Err(Error::Permission(format!(
                "Workflow {} does not belong to tenant {}",
                workflow_id, caller.tenant_id
            )));
        }
        if !workflow.is_active() {
            return Err(Error::Validation(format!(
                "Workflow '{}' is {}, not active",
                workflow.name, workflow.status
            )));
        }
        let TriggerKind::Manual {
            allowed_roles,
            parameters: specs,
        } = &workflow.trigger.kind
        else {
            return Err(Error::Validation(format!(
                "Workflow '{}' is not manually triggered",
                workflow.name
            )));
        };

        if !allowed_roles.is_empty() {
            let allowed = caller
                .role
                .as_ref()
                .is_some_and(|role| allowed_roles.contains(role));
            if !allowed {
                return Err(Error::Permission(format!(
                    "Role {} may not trigger workflow '{}'",
                    caller.role.as_deref().unwrap_or("(none)"),
                    workflow.name
                )));
            }
        }

        validate_parameters(specs, &parameters)
    }
}
