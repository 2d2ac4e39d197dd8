use super::{Store, StoreError};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "cancelled" => Ok(StepStatus::Cancelled),
            other => Err(format!("unknown step status `{other}`")),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Cancelled
        )
    }
}

/// A step declaration as received from the flow, before persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStep {
    pub id: String,
    pub name: String,
    pub depends_on: Vec<String>,
    pub max_retries: u32,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub id: String,
    pub run_id: String,
    pub stage_id: String,
    pub name: String,
    pub status: StepStatus,
    pub depends_on: Vec<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

/// Marker prefix on the stderr of steps failed by cascade rather than by
/// their own execution. The orchestrator uses it to keep cascade-failed
/// steps out of the attempt-retry path.
pub const CASCADE_SKIP_PREFIX: &str = "skipped: dependency";

/// One fields entry for the `GET /runs/:runId/fields` query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepFieldEntry {
    pub step_id: String,
    pub step_name: String,
    pub name: String,
    pub value: Value,
}

const STEP_COLUMNS: &str = "id, run_id, stage_id, name, status, depends_on, retry_count, \
     max_retries, env, fields, error, stdout, stderr, termination_reason, created_at, \
     started_at, completed_at, duration_ms, queued_at, claimed_at, heartbeat_at, worker_id";

fn step_from_row(row: &Row<'_>) -> Result<StepRecord, rusqlite::Error> {
    let status_raw: String = row.get("status")?;
    let depends_raw: String = row.get("depends_on")?;
    let env_raw: Option<String> = row.get("env")?;
    let fields_raw: Option<String> = row.get("fields")?;
    let error_raw: Option<String> = row.get("error")?;

    Ok(StepRecord {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        stage_id: row.get("stage_id")?,
        name: row.get("name")?,
        status: StepStatus::parse(&status_raw).map_err(|err| {
            rusqlite::Error::InvalidColumnType(0, err, rusqlite::types::Type::Text)
        })?,
        depends_on: decode_column("depends_on", &depends_raw)?,
        retry_count: row.get::<_, i64>("retry_count")? as u32,
        max_retries: row.get::<_, i64>("max_retries")? as u32,
        env: env_raw
            .map(|raw| decode_column("env", &raw))
            .transpose()?,
        fields: fields_raw
            .map(|raw| decode_column("fields", &raw))
            .transpose()?,
        error: error_raw
            .map(|raw| decode_column("error", &raw))
            .transpose()?,
        stdout: row.get("stdout")?,
        stderr: row.get("stderr")?,
        termination_reason: row.get("termination_reason")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        duration_ms: row.get("duration_ms")?,
        queued_at: row.get("queued_at")?,
        claimed_at: row.get("claimed_at")?,
        heartbeat_at: row.get("heartbeat_at")?,
        worker_id: row.get("worker_id")?,
    })
}

fn decode_column<T: serde::de::DeserializeOwned>(
    column: &str,
    raw: &str,
) -> Result<T, rusqlite::Error> {
    serde_json::from_str(raw).map_err(|err| {
        rusqlite::Error::InvalidColumnType(
            0,
            format!("invalid json in {column}: {err}"),
            rusqlite::types::Type::Text,
        )
    })
}

impl Store {
    /// Persists a stage's declared steps as one atomic batch.
    ///
    /// Rows are inserted without `queued_at` and only marked queued once
    /// every sibling is in place, so a failure mid-batch leaves nothing the
    /// scheduler would pick up. Re-declared ids (run retry re-planning) are
    /// left untouched.
    pub fn insert_stage_steps(
        &self,
        run_id: &str,
        stage_id: &str,
        steps: &[NewStep],
        now: i64,
    ) -> Result<(), StoreError> {
        let mut connection = self.lock();
        let tx = connection.transaction().map_err(StoreError::sql)?;
        for step in steps {
            let depends_on =
                serde_json::to_string(&step.depends_on).unwrap_or_else(|_| "[]".to_string());
            let env = if step.env.is_empty() {
                None
            } else {
                serde_json::to_string(&step.env).ok()
            };
            tx.execute(
                "INSERT INTO step (id, run_id, stage_id, name, status, depends_on,
                                   retry_count, max_retries, env, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, 0, ?6, ?7, ?8)
                 ON CONFLICT(run_id, id) DO NOTHING",
                params![
                    step.id,
                    run_id,
                    stage_id,
                    step.name,
                    depends_on,
                    step.max_retries as i64,
                    env,
                    now
                ],
            )
            .map_err(StoreError::sql)?;
        }
        tx.execute(
            "UPDATE step SET queued_at = ?2
             WHERE stage_id = ?1 AND status = 'pending' AND queued_at IS NULL",
            params![stage_id, now],
        )
        .map_err(StoreError::sql)?;
        tx.commit().map_err(StoreError::sql)
    }

    pub fn find_step(&self, run_id: &str, step_id: &str) -> Result<Option<StepRecord>, StoreError> {
        let connection = self.lock();
        connection
            .query_row(
                &format!("SELECT {STEP_COLUMNS} FROM step WHERE run_id = ?1 AND id = ?2"),
                params![run_id, step_id],
                step_from_row,
            )
            .optional()
            .map_err(StoreError::sql)
    }

    pub fn load_step(&self, run_id: &str, step_id: &str) -> Result<StepRecord, StoreError> {
        self.find_step(run_id, step_id)?
            .ok_or_else(|| StoreError::NotFound {
                entity: "step",
                id: step_id.to_string(),
            })
    }

    pub fn steps_for_stage(&self, stage_id: &str) -> Result<Vec<StepRecord>, StoreError> {
        self.collect_steps(
            &format!(
                "SELECT {STEP_COLUMNS} FROM step WHERE stage_id = ?1 ORDER BY created_at ASC, id ASC"
            ),
            params![stage_id],
        )
    }

    pub fn steps_for_run(&self, run_id: &str) -> Result<Vec<StepRecord>, StoreError> {
        self.collect_steps(
            &format!(
                "SELECT {STEP_COLUMNS} FROM step WHERE run_id = ?1 ORDER BY created_at ASC, id ASC"
            ),
            params![run_id],
        )
    }

    fn collect_steps(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<StepRecord>, StoreError> {
        let connection = self.lock();
        let mut statement = connection.prepare(sql).map_err(StoreError::sql)?;
        let rows = statement
            .query_map(args, step_from_row)
            .map_err(StoreError::sql)?;
        let mut steps = Vec::new();
        for row in rows {
            steps.push(row.map_err(StoreError::sql)?);
        }
        Ok(steps)
    }

    pub fn count_running_steps(&self) -> Result<usize, StoreError> {
        let connection = self.lock();
        connection
            .query_row(
                "SELECT COUNT(*) FROM step WHERE status = 'running'",
                [],
                |row| row.get::<_, i64>(0).map(|count| count as usize),
            )
            .map_err(StoreError::sql)
    }

    /// Scheduler candidate scan: queued pending steps whose owning run is
    /// live, oldest queue entries first. Dependency readiness is checked by
    /// the caller against the sibling rows.
    pub fn claim_candidates(&self, limit: usize) -> Result<Vec<StepRecord>, StoreError> {
        self.collect_steps(
            &format!(
                "SELECT {STEP_COLUMNS} FROM step
                 WHERE status = 'pending' AND queued_at IS NOT NULL
                   AND run_id IN (SELECT id FROM run
                                  WHERE status = 'running'
                                    AND termination_reason IS NULL)
                 ORDER BY queued_at ASC, created_at ASC, id ASC
                 LIMIT {limit}"
            ),
            [],
        )
    }

    /// The atomic claim. Zero rows changed means another tick got there
    /// first, or the row left `pending` in the meantime; the caller skips
    /// silently either way.
    pub fn try_claim_step(
        &self,
        run_id: &str,
        step_id: &str,
        worker_id: &str,
        now: i64,
    ) -> Result<bool, StoreError> {
        let connection = self.lock();
        let changed = connection
            .execute(
                "UPDATE step SET status = 'running', claimed_at = ?3, heartbeat_at = ?3,
                        worker_id = ?4, started_at = ?3
                 WHERE run_id = ?1 AND id = ?2 AND status = 'pending'
                   AND claimed_at IS NULL AND queued_at IS NOT NULL",
                params![run_id, step_id, now, worker_id],
            )
            .map_err(StoreError::sql)?;
        Ok(changed == 1)
    }

    pub fn step_heartbeat(&self, run_id: &str, step_id: &str, now: i64) -> Result<(), StoreError> {
        let connection = self.lock();
        connection
            .execute(
                "UPDATE step SET heartbeat_at = ?3
                 WHERE run_id = ?1 AND id = ?2 AND status = 'running'",
                params![run_id, step_id, now],
            )
            .map_err(StoreError::sql)?;
        Ok(())
    }

    /// Terminal transition on child exit. Only applies while the row is
    /// still `running`; an abort that beat the executor to it wins.
    pub fn record_step_result(
        &self,
        run_id: &str,
        step_id: &str,
        status: StepStatus,
        error: Option<&Value>,
        stdout: Option<&str>,
        stderr: Option<&str>,
        duration_ms: i64,
        now: i64,
    ) -> Result<bool, StoreError> {
        let connection = self.lock();
        let changed = connection
            .execute(
                "UPDATE step SET status = ?3, error = ?4, stdout = ?5, stderr = ?6,
                        duration_ms = ?7, completed_at = ?8
                 WHERE run_id = ?1 AND id = ?2 AND status = 'running'",
                params![
                    run_id,
                    step_id,
                    status.as_str(),
                    error.map(|value| value.to_string()),
                    stdout,
                    stderr,
                    duration_ms,
                    now
                ],
            )
            .map_err(StoreError::sql)?;
        Ok(changed == 1)
    }

    /// Automatic attempt retry: back to `pending` with claim state and
    /// captured output cleared, and the attempt counter bumped.
    pub fn reset_step_attempt(
        &self,
        run_id: &str,
        step_id: &str,
        now: i64,
    ) -> Result<(), StoreError> {
        let connection = self.lock();
        connection
            .execute(
                "UPDATE step SET status = 'pending', queued_at = ?3, claimed_at = NULL,
                        heartbeat_at = NULL, worker_id = NULL, started_at = NULL,
                        completed_at = NULL, duration_ms = NULL, stdout = NULL,
                        stderr = NULL, error = NULL, retry_count = retry_count + 1
                 WHERE run_id = ?1 AND id = ?2 AND status = 'failed'",
                params![run_id, step_id, now],
            )
            .map_err(StoreError::sql)?;
        Ok(())
    }

    /// Manual retry reset: fresh attempt budget, queued immediately.
    pub fn reset_step_manual(
        &self,
        run_id: &str,
        step_id: &str,
        now: i64,
    ) -> Result<(), StoreError> {
        let connection = self.lock();
        connection
            .execute(
                "UPDATE step SET status = 'pending', queued_at = ?3, claimed_at = NULL,
                        heartbeat_at = NULL, worker_id = NULL, started_at = NULL,
                        completed_at = NULL, duration_ms = NULL, stdout = NULL,
                        stderr = NULL, error = NULL, termination_reason = NULL,
                        retry_count = 0
                 WHERE run_id = ?1 AND id = ?2",
                params![run_id, step_id, now],
            )
            .map_err(StoreError::sql)?;
        Ok(())
    }

    /// Cascade failure: the step never ran, it is skipped because an
    /// upstream dependency failed. No termination reason; cascades are an
    /// organic outcome of the DAG.
    pub fn cascade_fail_step(
        &self,
        run_id: &str,
        step_id: &str,
        failed_dependency: &str,
        now: i64,
    ) -> Result<(), StoreError> {
        let connection = self.lock();
        connection
            .execute(
                "UPDATE step SET status = 'failed',
                        stderr = ?3, completed_at = ?4
                 WHERE run_id = ?1 AND id = ?2 AND status IN ('pending', 'running')",
                params![
                    run_id,
                    step_id,
                    format!("{CASCADE_SKIP_PREFIX} {failed_dependency} failed"),
                    now
                ],
            )
            .map_err(StoreError::sql)?;
        Ok(())
    }

    pub fn merge_step_fields(
        &self,
        run_id: &str,
        step_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<StepRecord, StoreError> {
        let existing = self.load_step(run_id, step_id)?;
        let mut merged = match existing.fields {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for (key, value) in fields {
            merged.insert(key.clone(), value.clone());
        }
        let connection = self.lock();
        connection
            .execute(
                "UPDATE step SET fields = ?3 WHERE run_id = ?1 AND id = ?2",
                params![run_id, step_id, Value::Object(merged).to_string()],
            )
            .map_err(StoreError::sql)?;
        drop(connection);
        self.load_step(run_id, step_id)
    }

    pub fn query_step_fields(
        &self,
        run_id: &str,
        step_id: Option<&str>,
        field_name: Option<&str>,
    ) -> Result<Vec<StepFieldEntry>, StoreError> {
        let steps = match step_id {
            Some(step_id) => vec![self.load_step(run_id, step_id)?],
            None => self.steps_for_run(run_id)?,
        };
        let mut entries = Vec::new();
        for step in steps {
            let Some(Value::Object(fields)) = step.fields else {
                continue;
            };
            for (name, value) in fields {
                if let Some(wanted) = field_name {
                    if wanted != name {
                        continue;
                    }
                }
                entries.push(StepFieldEntry {
                    step_id: step.id.clone(),
                    step_name: step.name.clone(),
                    name,
                    value,
                });
            }
        }
        Ok(entries)
    }
}
