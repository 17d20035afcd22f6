//! SQLite storage implementation.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use super::models::*;
use super::Store;
use crate::error::Result;
use crate::workflow::Workflow;

/// Parse an RFC 3339 datetime string into a `chrono::DateTime<Utc>`.
///
/// Returns a `rusqlite::Error` on parse failure instead of panicking,
/// so it is safe to use inside `query_row` / `query_map` closures.
fn parse_datetime_utc(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_optional_datetime(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_datetime_utc).transpose()
}

fn parse_json<T: DeserializeOwned>(s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> rusqlite::Result<T> {
    s.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

/// Fixed-width UTC timestamp so text comparison matches time order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Default query limit.
const DEFAULT_QUERY_LIMIT: usize = 50;
/// Maximum query limit to prevent abuse.
const MAX_QUERY_LIMIT: usize = 1000;

const EXECUTION_COLUMNS: &str = "id, workflow_id, workflow_name, workflow_version, tenant_id, status, \
     snapshot, context, variables, current_node_id, error, error_node_id, retry_count, output, \
     waiting_for, resume_at, created_at, started_at, finished_at";

const STEP_COLUMNS: &str = "id, node_id, node_type, node_name, status, started_at, finished_at, \
     duration_ms, input, output, error, retry_count";

/// SQLite-based storage.
#[derive(Clone)]
pub struct SqliteStorage {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let mut conn = Connection::open(path)?;

        // Initialize schema synchronously before wrapping in async mutex
        Self::init_schema_sync(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        Self::init_schema_sync(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema_sync(conn: &mut Connection) -> Result<()> {
        // WAL mode must be set before any transaction begins
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                status TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                version INTEGER NOT NULL,
                definition TEXT NOT NULL,
                last_executed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS workflow_versions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                definition TEXT NOT NULL,
                created_at TEXT NOT NULL,
                created_by TEXT,
                note TEXT,
                FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE,
                UNIQUE(workflow_id, version)
            );

            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                workflow_name TEXT NOT NULL,
                workflow_version INTEGER NOT NULL,
                tenant_id TEXT NOT NULL,
                status TEXT NOT NULL,
                snapshot TEXT NOT NULL,
                context TEXT NOT NULL,
                variables TEXT NOT NULL,
                current_node_id TEXT,
                error TEXT,
                error_node_id TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                output TEXT,
                waiting_for TEXT,
                resume_at TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS execution_steps (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                node_id TEXT NOT NULL,
                node_type TEXT NOT NULL,
                node_name TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                duration_ms INTEGER,
                input TEXT NOT NULL,
                output TEXT,
                error TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS execution_logs (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                step_id TEXT,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                data TEXT,
                timestamp TEXT NOT NULL,
                FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS approvals (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                status TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                definition TEXT NOT NULL,
                FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_workflows_tenant ON workflows(tenant_id, status);
            CREATE INDEX IF NOT EXISTS idx_executions_workflow ON executions(workflow_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_executions_waiting ON executions(status, resume_at);
            CREATE INDEX IF NOT EXISTS idx_steps_execution ON execution_steps(execution_id, seq);
            CREATE INDEX IF NOT EXISTS idx_logs_execution ON execution_logs(execution_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_approvals_tenant ON approvals(tenant_id, status);
            "#,
        )?;
        Ok(())
    }

    fn row_to_workflow(row: &rusqlite::Row<'_>) -> rusqlite::Result<Workflow> {
        let definition: String = row.get(0)?;
        let mut workflow: Workflow = parse_json(&definition)?;
        workflow.last_executed_at = parse_optional_datetime(row.get(1)?)?;
        Ok(workflow)
    }

    fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowVersion> {
        Ok(WorkflowVersion {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            version: row.get(2)?,
            snapshot: parse_json(&row.get::<_, String>(3)?)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(4)?)?,
            created_by: row.get(5)?,
            note: row.get(6)?,
        })
    }

    fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowExecution> {
        Ok(WorkflowExecution {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            workflow_name: row.get(2)?,
            workflow_version: row.get(3)?,
            tenant_id: row.get(4)?,
            status: parse_enum(&row.get::<_, String>(5)?)?,
            snapshot: parse_json(&row.get::<_, String>(6)?)?,
            context: parse_json(&row.get::<_, String>(7)?)?,
            steps: Vec::new(),
            variables: parse_json(&row.get::<_, String>(8)?)?,
            current_node_id: row.get(9)?,
            error: row.get(10)?,
            error_node_id: row.get(11)?,
            retry_count: row.get(12)?,
            output: row
                .get::<_, Option<String>>(13)?
                .as_deref()
                .map(parse_json)
                .transpose()?,
            waiting_for: row.get(14)?,
            resume_at: parse_optional_datetime(row.get(15)?)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(16)?)?,
            started_at: parse_optional_datetime(row.get(17)?)?,
            finished_at: parse_optional_datetime(row.get(18)?)?,
        })
    }

    fn row_to_step(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionStep> {
        Ok(ExecutionStep {
            id: row.get(0)?,
            node_id: row.get(1)?,
            node_type: row.get(2)?,
            node_name: row.get(3)?,
            status: parse_enum(&row.get::<_, String>(4)?)?,
            started_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
            finished_at: parse_optional_datetime(row.get(6)?)?,
            duration_ms: row.get(7)?,
            input: parse_json(&row.get::<_, String>(8)?)?,
            output: row
                .get::<_, Option<String>>(9)?
                .as_deref()
                .map(parse_json)
                .transpose()?,
            error: row.get(10)?,
            retry_count: row.get(11)?,
        })
    }

    fn upsert_step(
        conn: &Connection,
        execution_id: &str,
        seq: Option<usize>,
        step: &ExecutionStep,
    ) -> Result<()> {
        let output = step.output.as_ref().map(serde_json::to_string).transpose()?;
        conn.execute(
            "INSERT INTO execution_steps
             (id, execution_id, seq, node_id, node_type, node_name, status, started_at, finished_at,
              duration_ms, input, output, error, retry_count)
             VALUES (?1, ?2,
                     COALESCE(?3, (SELECT COALESCE(MAX(seq) + 1, 0) FROM execution_steps WHERE execution_id = ?2)),
                     ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(id) DO UPDATE SET
                seq = COALESCE(?3, seq),
                status = excluded.status,
                finished_at = excluded.finished_at,
                duration_ms = excluded.duration_ms,
                input = excluded.input,
                output = excluded.output,
                error = excluded.error,
                retry_count = excluded.retry_count",
            params![
                step.id,
                execution_id,
                seq.map(|s| s as i64),
                step.node_id,
                step.node_type,
                step.node_name,
                step.status.to_string(),
                ts(&step.started_at),
                step.finished_at.as_ref().map(ts),
                step.duration_ms,
                serde_json::to_string(&step.input)?,
                output,
                step.error,
                step.retry_count,
            ],
        )?;
        Ok(())
    }

    fn load_steps(conn: &Connection, execution_id: &str) -> Result<Vec<ExecutionStep>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM execution_steps WHERE execution_id = ?1 ORDER BY seq",
            STEP_COLUMNS
        ))?;
        let steps = stmt
            .query_map([execution_id], Self::row_to_step)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(steps)
    }
}

#[async_trait]
impl Store for SqliteStorage {
    // ========================================================================
    // Workflow operations
    // ========================================================================

    async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        let definition = serde_json::to_string(workflow)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO workflows
             (id, name, tenant_id, status, trigger_type, version, definition, last_executed_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                tenant_id = excluded.tenant_id,
                status = excluded.status,
                trigger_type = excluded.trigger_type,
                version = excluded.version,
                definition = excluded.definition,
                last_executed_at = COALESCE(excluded.last_executed_at, workflows.last_executed_at),
                updated_at = excluded.updated_at",
            params![
                workflow.id,
                workflow.name,
                workflow.tenant_id,
                workflow.status.to_string(),
                workflow.trigger.kind.trigger_type().to_string(),
                workflow.version,
                definition,
                workflow.last_executed_at.as_ref().map(ts),
                ts(&workflow.metadata.created_at),
                ts(&workflow.metadata.updated_at),
            ],
        )?;
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let conn = self.conn.lock().await;
        let workflow = conn
            .query_row(
                "SELECT definition, last_executed_at FROM workflows WHERE id = ?1",
                [id],
                Self::row_to_workflow,
            )
            .optional()?;
        Ok(workflow)
    }

    async fn list_workflows(&self, filter: &WorkflowFilter) -> Result<Vec<Workflow>> {
        let mut sql = String::from("SELECT definition, last_executed_at FROM workflows WHERE 1=1");
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(tenant) = &filter.tenant_id {
            sql.push_str(" AND tenant_id = ?");
            values.push(SqlValue::Text(tenant.clone()));
        }
        if let Some(status) = &filter.status {
            sql.push_str(" AND status = ?");
            values.push(SqlValue::Text(status.to_string()));
        }
        sql.push_str(" ORDER BY name");

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let workflows = stmt
            .query_map(params_from_iter(values), Self::row_to_workflow)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(workflows)
    }

    async fn delete_workflow(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM workflows WHERE id = ?1", [id])?;
        Ok(())
    }

    async fn touch_last_executed(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE workflows SET last_executed_at = ?1 WHERE id = ?2",
            params![ts(&at), id],
        )?;
        Ok(())
    }

    // ========================================================================
    // Version operations
    // ========================================================================

    async fn save_version(&self, version: &WorkflowVersion) -> Result<()> {
        let definition = serde_json::to_string(&version.snapshot)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO workflow_versions (id, workflow_id, version, definition, created_at, created_by, note)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                version.id,
                version.workflow_id,
                version.version,
                definition,
                ts(&version.created_at),
                version.created_by,
                version.note,
            ],
        )?;
        Ok(())
    }

    async fn list_versions(&self, workflow_id: &str) -> Result<Vec<WorkflowVersion>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, workflow_id, version, definition, created_at, created_by, note
             FROM workflow_versions
             WHERE workflow_id = ?1
             ORDER BY version DESC",
        )?;
        let versions = stmt
            .query_map([workflow_id], Self::row_to_version)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(versions)
    }

    async fn get_version(&self, workflow_id: &str, version: u32) -> Result<Option<WorkflowVersion>> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                "SELECT id, workflow_id, version, definition, created_at, created_by, note
                 FROM workflow_versions
                 WHERE workflow_id = ?1 AND version = ?2",
                params![workflow_id, version],
                Self::row_to_version,
            )
            .optional()?;
        Ok(record)
    }

    async fn latest_version_number(&self, workflow_id: &str) -> Result<Option<u32>> {
        let conn = self.conn.lock().await;
        let version = conn
            .query_row(
                "SELECT MAX(version) FROM workflow_versions WHERE workflow_id = ?1",
                [workflow_id],
                |row| row.get::<_, Option<u32>>(0),
            )
            .optional()?
            .flatten();
        Ok(version)
    }

    async fn prune_versions(&self, workflow_id: &str, keep: usize) -> Result<usize> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM workflow_versions
             WHERE workflow_id = ?1 AND version NOT IN (
                SELECT version FROM workflow_versions
                WHERE workflow_id = ?1
                ORDER BY version DESC
                LIMIT ?2
             )",
            params![workflow_id, keep as i64],
        )?;
        Ok(removed)
    }

    // ========================================================================
    // Execution operations
    // ========================================================================

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let snapshot = serde_json::to_string(&execution.snapshot)?;
        let context = serde_json::to_string(&execution.context)?;
        let variables = serde_json::to_string(&execution.variables)?;
        let output = execution.output.as_ref().map(serde_json::to_string).transpose()?;

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO executions ({})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    variables = excluded.variables,
                    current_node_id = excluded.current_node_id,
                    error = excluded.error,
                    error_node_id = excluded.error_node_id,
                    retry_count = excluded.retry_count,
                    output = excluded.output,
                    waiting_for = excluded.waiting_for,
                    resume_at = excluded.resume_at,
                    started_at = excluded.started_at,
                    finished_at = excluded.finished_at",
                EXECUTION_COLUMNS
            ),
            params![
                execution.id,
                execution.workflow_id,
                execution.workflow_name,
                execution.workflow_version,
                execution.tenant_id,
                execution.status.to_string(),
                snapshot,
                context,
                variables,
                execution.current_node_id,
                execution.error,
                execution.error_node_id,
                execution.retry_count,
                output,
                execution.waiting_for,
                execution.resume_at.as_ref().map(ts),
                ts(&execution.created_at),
                execution.started_at.as_ref().map(ts),
                execution.finished_at.as_ref().map(ts),
            ],
        )?;
        for (seq, step) in execution.steps.iter().enumerate() {
            Self::upsert_step(&tx, &execution.id, Some(seq), step)?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<WorkflowExecution>> {
        let conn = self.conn.lock().await;
        let execution = conn
            .query_row(
                &format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS),
                [id],
                Self::row_to_execution,
            )
            .optional()?;

        match execution {
            Some(mut execution) => {
                execution.steps = Self::load_steps(&conn, id)?;
                Ok(Some(execution))
            }
            None => Ok(None),
        }
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecution>> {
        let mut sql = format!("SELECT {} FROM executions WHERE 1=1", EXECUTION_COLUMNS);
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(tenant) = &filter.tenant_id {
            sql.push_str(" AND tenant_id = ?");
            values.push(SqlValue::Text(tenant.clone()));
        }
        if let Some(workflow_id) = &filter.workflow_id {
            sql.push_str(" AND workflow_id = ?");
            values.push(SqlValue::Text(workflow_id.clone()));
        }
        if let Some(status) = &filter.status {
            sql.push_str(" AND status = ?");
            values.push(SqlValue::Text(status.to_string()));
        }
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT);
        sql.push_str(" ORDER BY created_at DESC LIMIT ?");
        values.push(SqlValue::Integer(limit as i64));

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let executions = stmt
            .query_map(params_from_iter(values), Self::row_to_execution)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(executions)
    }

    async fn transition_status(
        &self,
        id: &str,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE executions SET status = ?, finished_at = ? WHERE id = ? AND status IN ({})",
            placeholders
        );
        let finished = to.is_terminal().then(|| ts(&Utc::now()));
        let mut values: Vec<SqlValue> = vec![
            SqlValue::Text(to.to_string()),
            finished.map(SqlValue::Text).unwrap_or(SqlValue::Null),
            SqlValue::Text(id.to_string()),
        ];
        values.extend(from.iter().map(|s| SqlValue::Text(s.to_string())));

        let conn = self.conn.lock().await;
        let changed = conn.execute(&sql, params_from_iter(values))?;
        Ok(changed > 0)
    }

    async fn due_waiting(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id FROM executions
             WHERE status = 'waiting' AND resume_at IS NOT NULL AND resume_at <= ?1
             ORDER BY resume_at",
        )?;
        let ids = stmt
            .query_map([ts(&now)], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    async fn save_step(&self, execution_id: &str, step: &ExecutionStep) -> Result<()> {
        let conn = self.conn.lock().await;
        Self::upsert_step(&conn, execution_id, None, step)
    }

    // ========================================================================
    // Log operations
    // ========================================================================

    async fn append_log(&self, log: &ExecutionLog) -> Result<()> {
        let data = serde_json::to_string(&log.data)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO execution_logs (id, execution_id, step_id, level, message, data, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                log.id,
                log.execution_id,
                log.step_id,
                log.level.to_string(),
                log.message,
                data,
                ts(&log.timestamp),
            ],
        )?;
        Ok(())
    }

    async fn list_logs(&self, execution_id: &str) -> Result<Vec<ExecutionLog>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, execution_id, step_id, level, message, data, timestamp
             FROM execution_logs WHERE execution_id = ?1 ORDER BY timestamp, rowid",
        )?;
        let logs = stmt
            .query_map([execution_id], |row| {
                Ok(ExecutionLog {
                    id: row.get(0)?,
                    execution_id: row.get(1)?,
                    step_id: row.get(2)?,
                    level: parse_enum(&row.get::<_, String>(3)?)?,
                    message: row.get(4)?,
                    data: row
                        .get::<_, Option<String>>(5)?
                        .as_deref()
                        .map(parse_json)
                        .transpose()?
                        .unwrap_or(serde_json::Value::Null),
                    timestamp: parse_datetime_utc(&row.get::<_, String>(6)?)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(logs)
    }

    // ========================================================================
    // Approval operations
    // ========================================================================

    async fn save_approval(&self, approval: &ApprovalRequest) -> Result<()> {
        let definition = serde_json::to_string(approval)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO approvals (id, execution_id, tenant_id, status, expires_at, definition)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                expires_at = excluded.expires_at,
                definition = excluded.definition",
            params![
                approval.id,
                approval.execution_id,
                approval.tenant_id,
                approval.status.to_string(),
                ts(&approval.expires_at),
                definition,
            ],
        )?;
        Ok(())
    }

    async fn get_approval(&self, id: &str) -> Result<Option<ApprovalRequest>> {
        let conn = self.conn.lock().await;
        let approval = conn
            .query_row("SELECT definition FROM approvals WHERE id = ?1", [id], |row| {
                parse_json(&row.get::<_, String>(0)?)
            })
            .optional()?;
        Ok(approval)
    }

    async fn list_approvals(
        &self,
        tenant_id: &str,
        status: Option<ApprovalStatus>,
    ) -> Result<Vec<ApprovalRequest>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT definition FROM approvals
             WHERE tenant_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY expires_at",
        )?;
        let approvals = stmt
            .query_map(params![tenant_id, status.map(|s| s.to_string())], |row| {
                parse_json(&row.get::<_, String>(0)?)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(approvals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{
        ApprovalMode, DataMutationConfig, ExpiryPolicy, NodeAction, TriggerConfig, TriggerKind,
        TriggerType, WorkflowNode, WorkflowStatus,
    };
    use serde_json::json;

    fn workflow(id: &str, tenant: &str) -> Workflow {
        Workflow {
            id: id.to_string(),
            name: format!("wf-{}", id),
            description: String::new(),
            version: 1,
            status: WorkflowStatus::Active,
            tenant_id: tenant.to_string(),
            trigger: TriggerConfig::new(TriggerKind::Manual {
                allowed_roles: vec![],
                parameters: vec![],
            }),
            nodes: vec![WorkflowNode::new(
                "a",
                NodeAction::DataMutation(DataMutationConfig::default()),
            )],
            connections: vec![],
            error_handler: Default::default(),
            metadata: Default::default(),
            last_executed_at: None,
        }
    }

    fn execution(wf: &Workflow) -> WorkflowExecution {
        WorkflowExecution::new(
            wf.clone(),
            ExecutionContext::new(TriggerType::Manual, &wf.tenant_id, json!({"x": 1})),
        )
    }

    #[tokio::test]
    async fn test_workflow_round_trip_and_filters() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let w1 = workflow("w1", "acme");
        storage.save_workflow(&w1).await.unwrap();
        let mut draft = workflow("w2", "acme");
        draft.status = WorkflowStatus::Draft;
        storage.save_workflow(&draft).await.unwrap();
        storage.save_workflow(&workflow("w3", "other")).await.unwrap();

        let loaded = storage.get_workflow("w1").await.unwrap().unwrap();
        assert_eq!(loaded, w1);

        let active = storage
            .list_workflows(&WorkflowFilter {
                tenant_id: Some("acme".into()),
                status: Some(WorkflowStatus::Active),
            })
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "w1");
    }

    #[tokio::test]
    async fn test_touch_last_executed_survives_save() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let wf = workflow("w1", "acme");
        storage.save_workflow(&wf).await.unwrap();
        let at = Utc::now();
        storage.touch_last_executed("w1", at).await.unwrap();
        storage.save_workflow(&wf).await.unwrap();
        let loaded = storage.get_workflow("w1").await.unwrap().unwrap();
        assert_eq!(
            loaded.last_executed_at.map(|t| t.timestamp_micros()),
            Some(at.timestamp_micros())
        );
    }

    #[tokio::test]
    async fn test_execution_steps_and_cascade() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let wf = workflow("w1", "acme");
        storage.save_workflow(&wf).await.unwrap();

        let mut exec = execution(&wf);
        let mut step = ExecutionStep::start("a", "data_mutation", "a", json!({}));
        step.finish(StepStatus::Completed);
        exec.steps.push(step.clone());
        storage.save_execution(&exec).await.unwrap();

        let mut second = ExecutionStep::start("b", "notification", "b", json!({}));
        second.retry_count = 2;
        storage.save_step(&exec.id, &second).await.unwrap();
        storage
            .append_log(&ExecutionLog::new(&exec.id, LogLevel::Info, "started"))
            .await
            .unwrap();

        let loaded = storage.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.steps.len(), 2);
        assert_eq!(loaded.steps[0].node_id, "a");
        assert_eq!(loaded.steps[1].retry_count, 2);
        assert_eq!(loaded.context.trigger_data, json!({"x": 1}));

        storage.delete_workflow("w1").await.unwrap();
        assert!(storage.get_execution(&exec.id).await.unwrap().is_none());
        assert!(storage.list_logs(&exec.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transition_status_is_conditional() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let wf = workflow("w1", "acme");
        storage.save_workflow(&wf).await.unwrap();
        let mut exec = execution(&wf);
        exec.status = ExecutionStatus::Waiting;
        exec.resume_at = Some(Utc::now() - chrono::Duration::seconds(5));
        storage.save_execution(&exec).await.unwrap();

        assert_eq!(storage.due_waiting(Utc::now()).await.unwrap(), vec![exec.id.clone()]);

        let first = storage
            .transition_status(&exec.id, &[ExecutionStatus::Waiting], ExecutionStatus::Pending)
            .await
            .unwrap();
        let second = storage
            .transition_status(&exec.id, &[ExecutionStatus::Waiting], ExecutionStatus::Pending)
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
        assert!(storage.due_waiting(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_version_prune_keeps_newest() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let wf = workflow("w1", "acme");
        storage.save_workflow(&wf).await.unwrap();
        for v in 1..=5 {
            storage
                .save_version(&WorkflowVersion {
                    id: format!("v{}", v),
                    workflow_id: "w1".into(),
                    version: v,
                    snapshot: wf.clone(),
                    created_at: Utc::now(),
                    created_by: None,
                    note: None,
                })
                .await
                .unwrap();
        }
        assert_eq!(storage.prune_versions("w1", 3).await.unwrap(), 2);
        let versions = storage.list_versions("w1").await.unwrap();
        assert_eq!(
            versions.iter().map(|v| v.version).collect::<Vec<_>>(),
            vec![5, 4, 3]
        );
        assert_eq!(storage.latest_version_number("w1").await.unwrap(), Some(5));
        assert_eq!(storage.latest_version_number("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_approval_save_update_and_list() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let wf = workflow("w1", "acme");
        storage.save_workflow(&wf).await.unwrap();
        let exec = execution(&wf);
        storage.save_execution(&exec).await.unwrap();

        let mut approval = ApprovalRequest {
            id: "ap-1".into(),
            execution_id: exec.id.clone(),
            node_id: "a".into(),
            tenant_id: "acme".into(),
            title: "Sign off".into(),
            description: String::new(),
            approvers: vec!["lead".into()],
            mode: ApprovalMode::Any,
            responses: vec![],
            status: ApprovalStatus::Pending,
            expires_at: Utc::now() + chrono::Duration::hours(1),
            on_timeout: ExpiryPolicy::AutoReject,
            created_at: Utc::now(),
        };
        storage.save_approval(&approval).await.unwrap();
        let pending = storage
            .list_approvals("acme", Some(ApprovalStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);

        approval.record(ApprovalResponse {
            approver: "lead".into(),
            decision: ApprovalDecision::Approve,
            comment: None,
            responded_at: Utc::now(),
        });
        storage.save_approval(&approval).await.unwrap();

        let loaded = storage.get_approval("ap-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, ApprovalStatus::Approved);
        assert_eq!(loaded.responses.len(), 1);
        assert!(storage
            .list_approvals("acme", Some(ApprovalStatus::Pending))
            .await
            .unwrap()
            .is_empty());
        assert!(storage.list_approvals("other", None).await.unwrap().is_empty());
    }
}
