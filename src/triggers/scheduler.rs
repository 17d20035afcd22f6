//! Scheduler loop.
//!
//! On every poll it fires ACTIVE schedule-triggered workflows whose next
//! cron occurrence after `last_executed_at` (or creation) has passed, then
//! resumes WAITING executions whose `resume_at` is due. Firing is
//! at-least-once and only as precise as the poll interval.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use croner::Cron;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerSettings;
use crate::engine::{Engine, RunMode};
use crate::error::{Error, Result};
use crate::metrics;
use crate::shutdown::ShutdownCoordinator;
use crate::storage::{ExecutionContext, WorkflowFilter};
use crate::workflow::{TriggerKind, TriggerType, Workflow, WorkflowStatus};

/// Timezone a cron expression is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum CronTimezone {
    Utc,
    Named(Tz),
    FixedOffset(FixedOffset),
}

pub(crate) fn parse_cron(expr: &str) -> Result<Cron> {
    expr.trim()
        .parse::<Cron>()
        .map_err(|e| Error::Validation(format!("Invalid cron expression '{}': {}", expr, e)))
}

/// `UTC`, an IANA name, or a fixed offset such as `+08:00` or `-0530`.
pub(crate) fn parse_timezone(raw: &str) -> Result<CronTimezone> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("utc") {
        return Ok(CronTimezone::Utc);
    }
    if let Ok(tz) = trimmed.parse::<Tz>() {
        return Ok(CronTimezone::Named(tz));
    }
    if let Some(offset) = parse_fixed_offset(trimmed) {
        return Ok(CronTimezone::FixedOffset(offset));
    }
    Err(Error::Validation(format!(
        "Invalid timezone '{}'. Use an IANA name (e.g. 'Europe/Berlin') or a UTC offset (e.g. '+08:00')",
        raw
    )))
}

fn parse_fixed_offset(raw: &str) -> Option<FixedOffset> {
    let sign = match raw.chars().next()? {
        '+' => 1,
        '-' => -1,
        _ => return None,
    };
    let rest = &raw[1..];
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None if rest.len() == 4 => (rest[0..2].parse::<i32>().ok()?, rest[2..4].parse::<i32>().ok()?),
        None => return None,
    };
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// First occurrence strictly after `after`, evaluated in `tz`.
pub(crate) fn next_fire_after(
    cron: &Cron,
    tz: CronTimezone,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match tz {
        CronTimezone::Utc => cron.iter_after(after).next(),
        CronTimezone::Named(tz) => cron
            .iter_after(after.with_timezone(&tz))
            .next()
            .map(|t| t.with_timezone(&Utc)),
        CronTimezone::FixedOffset(offset) => cron
            .iter_after(after.with_timezone(&offset))
            .next()
            .map(|t| t.with_timezone(&Utc)),
    }
}

/// What one poll did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fired: usize,
    pub resumed: usize,
}

pub struct Scheduler {
    engine: Engine,
    settings: SchedulerSettings,
    /// `(workflow id, version)` pairs with a broken schedule, logged once.
    disabled: Mutex<HashSet<(String, u32)>>,
}

impl Scheduler {
    pub fn new(engine: Engine, settings: SchedulerSettings) -> Self {
        Self {
            engine,
            settings,
            disabled: Mutex::new(HashSet::new()),
        }
    }

    /// Run the loop on its own task until shutdown is requested.
    pub fn spawn(self: Arc<Self>, shutdown: ShutdownCoordinator) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    pub async fn run(&self, shutdown: ShutdownCoordinator) {
        let mut interval = tokio::time::interval(self.settings.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            poll_interval_seconds = self.settings.poll_interval_seconds,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.wait_for_shutdown() => {
                    info!("Scheduler stopped");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.tick(Utc::now()).await;
                    if report != TickReport::default() {
                        debug!(fired = report.fired, resumed = report.resumed, "Scheduler tick");
                    }
                }
            }
        }
    }

    /// One poll at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        TickReport {
            fired: self.fire_due_schedules(now).await,
            resumed: self.resume_due(now).await,
        }
    }

    async fn fire_due_schedules(&self, now: DateTime<Utc>) -> usize {
        let workflows = match self
            .engine
            .store()
            .list_workflows(&WorkflowFilter {
                tenant_id: None,
                status: Some(WorkflowStatus::Active),
            })
            .await
        {
            Ok(workflows) => workflows,
            Err(e) => {
                error!("Scheduler could not list workflows: {}", e);
                return 0;
            }
        };

        let mut fired = 0;
        for workflow in &workflows {
            let TriggerKind::Schedule { cron, timezone } = &workflow.trigger.kind else {
                continue;
            };
            let schedule = parse_cron(cron).and_then(|c| {
                let tz = match timezone {
                    Some(raw) => parse_timezone(raw)?,
                    None => CronTimezone::Utc,
                };
                Ok((c, tz))
            });
            let (cron_schedule, tz) = match schedule {
                Ok(parsed) => parsed,
                Err(e) => {
                    self.disable_once(workflow, &e).await;
                    continue;
                }
            };

            let baseline = workflow
                .last_executed_at
                .unwrap_or(workflow.metadata.created_at);
            let Some(due) = next_fire_after(&cron_schedule, tz, baseline) else {
                continue;
            };
            if due > now {
                continue;
            }

            let context = ExecutionContext::new(
                TriggerType::Schedule,
                &workflow.tenant_id,
                json!({ "scheduled_at": due, "cron": cron }),
            )
            .with_source(cron);
            match self
                .engine
                .trigger_workflow(&workflow.id, context, RunMode::Async)
                .await
            {
                Ok(execution) => {
                    fired += 1;
                    metrics::record_trigger("schedule", "started");
                    info!(
                        workflow = %workflow.name,
                        execution_id = %execution.id,
                        scheduled_at = %due,
                        "Scheduled workflow fired"
                    );
                }
                Err(e) => {
                    metrics::record_trigger("schedule", "failed");
                    warn!(workflow = %workflow.name, "Scheduled trigger failed: {}", e);
                }
            }
        }
        fired
    }

    async fn disable_once(&self, workflow: &Workflow, cause: &Error) {
        let key = (workflow.id.clone(), workflow.version);
        if self.disabled.lock().await.insert(key) {
            warn!(
                workflow = %workflow.name,
                version = workflow.version,
                "Schedule disabled: {}",
                cause
            );
        }
    }

    async fn resume_due(&self, now: DateTime<Utc>) -> usize {
        let due = match self.engine.store().due_waiting(now).await {
            Ok(ids) => ids,
            Err(e) => {
                error!("Scheduler could not load due executions: {}", e);
                return 0;
            }
        };

        let mut resumed = 0;
        for id in due {
            match self.engine.resume_execution(&id).await {
                Ok(_) => resumed += 1,
                // Another caller claimed it first.
                Err(Error::InvalidState(msg)) => debug!(execution_id = %id, "{}", msg),
                Err(e) => warn!(execution_id = %id, "Failed to resume execution: {}", e),
            }
        }
        resumed
    }
}
