//! opsflow - embedded workflow automation engine
//!
//! Business modules describe automations as workflows: a trigger plus a
//! graph of typed nodes. Entity and domain events, cron schedules, manual
//! calls and inbound webhooks start executions that run asynchronously
//! under a global concurrency ceiling, persist every step, and survive
//! delays and human approvals across restarts.
//!
//! ## Key Features
//!
//! - **Event-driven**: `emit_entity_event` fans out to every subscribed workflow of the tenant
//! - **Durable waits**: delays and approvals suspend to storage and resume from the scheduler
//! - **Retries and routing**: per-node retry budgets with backoff, `on_failure` edges, escalation
//! - **Versioned definitions**: every save is a snapshot; compare and roll back
//!
//! ## Example
//!
//! ```yaml
//! name: invoice-approval
//! trigger:
//!   type: entity_event
//!   entity: invoice
//!   event: created
//!   conditions:
//!     mode: all
//!     rules:
//!       - field: invoice.amount
//!         operator: greater_than
//!         value: 1000
//!
//! nodes:
//!   - id: approve
//!     type: approval
//!     config:
//!       title: "Approve invoice {{invoice.number}}"
//!       approvers: [finance-lead]
//!       timeout_hours: 24
//!       on_approved: notify
//!
//!   - id: notify
//!     type: notification
//!     config:
//!       recipients: ["{{invoice.owner_id}}"]
//!       title: Invoice approved
//! ```

pub mod actions;
pub mod admin;
pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod expr;
pub mod metrics;
pub mod shutdown;
pub mod storage;
pub mod telemetry;
pub mod triggers;
pub mod versioning;
pub mod workflow;

pub use admin::AdminService;
pub use engine::{Engine, RunMode};
pub use error::{Error, Result};
pub use triggers::TriggerHub;
