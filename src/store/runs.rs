use super::{json_to_text, Store, StoreError};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "paused" => Ok(RunStatus::Paused),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status `{other}`")),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: String,
    pub flow_name: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_title: Option<String>,
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
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default)]
pub struct ListRunsQuery {
    pub flow_name: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub sort_by: Option<String>,
    pub sort_order: Option<SortOrder>,
}

#[derive(Debug, Clone)]
pub struct RunPage {
    pub data: Vec<RunRecord>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

pub const LIST_RUNS_DEFAULT_LIMIT: usize = 50;
pub const LIST_RUNS_MAX_LIMIT: usize = 200;

const RUN_COLUMNS: &str = "id, flow_name, status, input, output, error, metadata, name, \
     description, flow_title, stdout, stderr, termination_reason, created_at, started_at, \
     completed_at, duration_ms";

const SORTABLE_COLUMNS: &[&str] = &[
    "created_at",
    "started_at",
    "completed_at",
    "status",
    "flow_name",
];

pub(crate) fn run_from_row(row: &Row<'_>) -> Result<RunRecord, rusqlite::Error> {
    Ok(RunRecord {
        id: row.get("id")?,
        flow_name: row.get("flow_name")?,
        status: parse_status_column(row.get::<_, String>("status")?)?,
        input: raw_json(row, "input")?,
        output: raw_json(row, "output")?,
        error: raw_json(row, "error")?,
        metadata: raw_json(row, "metadata")?,
        name: row.get("name")?,
        description: row.get("description")?,
        flow_title: row.get("flow_title")?,
        stdout: row.get("stdout")?,
        stderr: row.get("stderr")?,
        termination_reason: row.get("termination_reason")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        duration_ms: row.get("duration_ms")?,
    })
}

fn parse_status_column(raw: String) -> Result<RunStatus, rusqlite::Error> {
    RunStatus::parse(&raw)
        .map_err(|err| rusqlite::Error::InvalidColumnType(0, err, rusqlite::types::Type::Text))
}

fn raw_json(row: &Row<'_>, column: &str) -> Result<Option<Value>, rusqlite::Error> {
    let raw: Option<String> = row.get(column)?;
    match raw {
        None => Ok(None),
        Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|_| {
            rusqlite::Error::InvalidColumnType(
                0,
                format!("invalid json in {column}"),
                rusqlite::types::Type::Text,
            )
        }),
    }
}

impl Store {
    pub fn insert_run(
        &self,
        id: &str,
        flow_name: &str,
        input: Option<&Value>,
        metadata: Option<&Value>,
        now: i64,
    ) -> Result<RunRecord, StoreError> {
        let connection = self.lock();
        connection
            .execute(
                "INSERT INTO run (id, flow_name, status, input, metadata, created_at)
                 VALUES (?1, ?2, 'pending', ?3, ?4, ?5)",
                params![id, flow_name, json_to_text(input), json_to_text(metadata), now],
            )
            .map_err(StoreError::sql)?;
        drop(connection);
        self.load_run(id)
    }

    pub fn find_run(&self, id: &str) -> Result<Option<RunRecord>, StoreError> {
        let connection = self.lock();
        connection
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM run WHERE id = ?1"),
                params![id],
                run_from_row,
            )
            .optional()
            .map_err(StoreError::sql)
    }

    pub fn load_run(&self, id: &str) -> Result<RunRecord, StoreError> {
        self.find_run(id)?.ok_or_else(|| StoreError::NotFound {
            entity: "run",
            id: id.to_string(),
        })
    }

    pub fn list_runs(&self, query: &ListRunsQuery) -> Result<RunPage, StoreError> {
        let limit = query
            .limit
            .unwrap_or(LIST_RUNS_DEFAULT_LIMIT)
            .min(LIST_RUNS_MAX_LIMIT);
        let offset = query.offset.unwrap_or(0);
        let sort_by = match &query.sort_by {
            Some(column) if SORTABLE_COLUMNS.contains(&column.as_str()) => column.clone(),
            Some(column) => {
                return Err(StoreError::InvalidColumn {
                    column: "sort_by",
                    value: column.clone(),
                })
            }
            None => "created_at".to_string(),
        };
        let order = match query.sort_order.unwrap_or(SortOrder::Desc) {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };

        let mut predicates = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(flow_name) = &query.flow_name {
            predicates.push(format!("flow_name = ?{}", args.len() + 1));
            args.push(Box::new(flow_name.clone()));
        }
        if let Some(status) = query.status {
            predicates.push(format!("status = ?{}", args.len() + 1));
            args.push(Box::new(status.as_str().to_string()));
        }
        let where_clause = if predicates.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", predicates.join(" AND "))
        };

        let connection = self.lock();
        let total: usize = connection
            .query_row(
                &format!("SELECT COUNT(*) FROM run{where_clause}"),
                rusqlite::params_from_iter(args.iter().map(|arg| arg.as_ref())),
                |row| row.get::<_, i64>(0).map(|count| count as usize),
            )
            .map_err(StoreError::sql)?;

        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM run{where_clause} \
             ORDER BY {sort_by} {order} LIMIT {limit} OFFSET {offset}"
        );
        let mut statement = connection.prepare(&sql).map_err(StoreError::sql)?;
        let rows = statement
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|arg| arg.as_ref())),
                run_from_row,
            )
            .map_err(StoreError::sql)?;
        let mut data = Vec::new();
        for row in rows {
            data.push(row.map_err(StoreError::sql)?);
        }

        Ok(RunPage {
            data,
            total,
            limit,
            offset,
        })
    }

    /// `pending -> running` at orchestrator start; `started_at` is only set
    /// on the first transition so a resume keeps the original start time.
    /// Termination state is wiped: a re-engaged run must be visible to the
    /// scheduler's candidate scan again. Idempotent on an already-running
    /// row (a step retry marks the run before the driver thread does).
    pub fn mark_run_running(&self, id: &str, now: i64) -> Result<(), StoreError> {
        let connection = self.lock();
        let changed = connection
            .execute(
                "UPDATE run SET status = 'running',
                        started_at = COALESCE(started_at, ?2),
                        termination_reason = NULL, error = NULL,
                        completed_at = NULL, duration_ms = NULL
                 WHERE id = ?1 AND status IN ('pending', 'running', 'paused', 'failed')",
                params![id, now],
            )
            .map_err(StoreError::sql)?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "run",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// `paused -> pending` on resume; the restarted orchestrator takes it
    /// from there.
    pub fn mark_run_pending(&self, id: &str) -> Result<(), StoreError> {
        let connection = self.lock();
        let changed = connection
            .execute(
                "UPDATE run SET status = 'pending', termination_reason = NULL
                 WHERE id = ?1 AND status = 'paused'",
                params![id],
            )
            .map_err(StoreError::sql)?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "run",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn set_run_flow_capture(
        &self,
        id: &str,
        stdout: Option<&str>,
        stderr: Option<&str>,
    ) -> Result<(), StoreError> {
        let connection = self.lock();
        connection
            .execute(
                "UPDATE run SET stdout = ?2, stderr = ?3 WHERE id = ?1",
                params![id, stdout, stderr],
            )
            .map_err(StoreError::sql)?;
        Ok(())
    }

    pub fn mark_run_completed(&self, id: &str, now: i64) -> Result<(), StoreError> {
        let connection = self.lock();
        connection
            .execute(
                "UPDATE run SET status = 'completed', completed_at = ?2,
                        duration_ms = CASE WHEN started_at IS NULL THEN NULL
                                           ELSE ?2 - started_at END
                 WHERE id = ?1",
                params![id, now],
            )
            .map_err(StoreError::sql)?;
        Ok(())
    }

    pub fn mark_run_failed(
        &self,
        id: &str,
        error: Option<&Value>,
        termination_reason: Option<&str>,
        now: i64,
    ) -> Result<(), StoreError> {
        let connection = self.lock();
        connection
            .execute(
                "UPDATE run SET status = 'failed',
                        error = COALESCE(?2, error),
                        termination_reason = COALESCE(?3, termination_reason),
                        completed_at = ?4,
                        duration_ms = CASE WHEN started_at IS NULL THEN NULL
                                           ELSE ?4 - started_at END
                 WHERE id = ?1",
                params![id, json_to_text(error), termination_reason, now],
            )
            .map_err(StoreError::sql)?;
        Ok(())
    }

    pub fn update_run_display(
        &self,
        id: &str,
        name: Option<&str>,
        description: Option<&str>,
        flow_title: Option<&str>,
        output: Option<&Value>,
        metadata: Option<&Value>,
    ) -> Result<RunRecord, StoreError> {
        let connection = self.lock();
        let changed = connection
            .execute(
                "UPDATE run SET
                        name = COALESCE(?2, name),
                        description = COALESCE(?3, description),
                        flow_title = COALESCE(?4, flow_title),
                        output = COALESCE(?5, output),
                        metadata = COALESCE(?6, metadata)
                 WHERE id = ?1",
                params![
                    id,
                    name,
                    description,
                    flow_title,
                    json_to_text(output),
                    json_to_text(metadata)
                ],
            )
            .map_err(StoreError::sql)?;
        drop(connection);
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "run",
                id: id.to_string(),
            });
        }
        self.load_run(id)
    }

    pub fn run_ids_with_status(&self, status: RunStatus) -> Result<Vec<String>, StoreError> {
        let connection = self.lock();
        let mut statement = connection
            .prepare("SELECT id FROM run WHERE status = ?1 ORDER BY created_at ASC")
            .map_err(StoreError::sql)?;
        let rows = statement
            .query_map(params![status.as_str()], |row| row.get::<_, String>(0))
            .map_err(StoreError::sql)?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.map_err(StoreError::sql)?);
        }
        Ok(ids)
    }
}
