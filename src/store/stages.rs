use super::{Store, StoreError};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "pending" => Ok(StageStatus::Pending),
            "running" => Ok(StageStatus::Running),
            "completed" => Ok(StageStatus::Completed),
            "failed" => Ok(StageStatus::Failed),
            other => Err(format!("unknown stage status `{other}`")),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub id: String,
    pub run_id: String,
    pub name: String,
    pub r#final: bool,
    pub status: StageStatus,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,
}

const STAGE_COLUMNS: &str =
    "id, run_id, name, final, status, created_at, started_at, completed_at, termination_reason";

fn stage_from_row(row: &Row<'_>) -> Result<StageRecord, rusqlite::Error> {
    let status_raw: String = row.get("status")?;
    Ok(StageRecord {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        name: row.get("name")?,
        r#final: row.get::<_, i64>("final")? != 0,
        status: StageStatus::parse(&status_raw).map_err(|err| {
            rusqlite::Error::InvalidColumnType(0, err, rusqlite::types::Type::Text)
        })?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        termination_reason: row.get("termination_reason")?,
    })
}

impl Store {
    /// Inserts the stage already `running`; stages only exist once the flow
    /// has declared them, at which point execution begins immediately.
    pub fn insert_stage(
        &self,
        id: &str,
        run_id: &str,
        name: &str,
        is_final: bool,
        now: i64,
    ) -> Result<StageRecord, StoreError> {
        let connection = self.lock();
        connection
            .execute(
                "INSERT INTO stage (id, run_id, name, final, status, created_at, started_at)
                 VALUES (?1, ?2, ?3, ?4, 'running', ?5, ?5)",
                params![id, run_id, name, is_final as i64, now],
            )
            .map_err(StoreError::sql)?;
        drop(connection);
        self.load_stage(id)
    }

    pub fn find_stage(&self, id: &str) -> Result<Option<StageRecord>, StoreError> {
        let connection = self.lock();
        connection
            .query_row(
                &format!("SELECT {STAGE_COLUMNS} FROM stage WHERE id = ?1"),
                params![id],
                stage_from_row,
            )
            .optional()
            .map_err(StoreError::sql)
    }

    pub fn load_stage(&self, id: &str) -> Result<StageRecord, StoreError> {
        self.find_stage(id)?.ok_or_else(|| StoreError::NotFound {
            entity: "stage",
            id: id.to_string(),
        })
    }

    pub fn find_stage_by_name(
        &self,
        run_id: &str,
        name: &str,
    ) -> Result<Option<StageRecord>, StoreError> {
        let connection = self.lock();
        connection
            .query_row(
                &format!("SELECT {STAGE_COLUMNS} FROM stage WHERE run_id = ?1 AND name = ?2"),
                params![run_id, name],
                stage_from_row,
            )
            .optional()
            .map_err(StoreError::sql)
    }

    pub fn stages_for_run(&self, run_id: &str) -> Result<Vec<StageRecord>, StoreError> {
        let connection = self.lock();
        let mut statement = connection
            .prepare(&format!(
                "SELECT {STAGE_COLUMNS} FROM stage WHERE run_id = ?1 ORDER BY created_at ASC"
            ))
            .map_err(StoreError::sql)?;
        let rows = statement
            .query_map(params![run_id], stage_from_row)
            .map_err(StoreError::sql)?;
        let mut stages = Vec::new();
        for row in rows {
            stages.push(row.map_err(StoreError::sql)?);
        }
        Ok(stages)
    }

    pub fn mark_stage_completed(&self, id: &str, now: i64) -> Result<(), StoreError> {
        let connection = self.lock();
        connection
            .execute(
                "UPDATE stage SET status = 'completed', completed_at = ?2 WHERE id = ?1",
                params![id, now],
            )
            .map_err(StoreError::sql)?;
        Ok(())
    }

    pub fn mark_stage_failed(
        &self,
        id: &str,
        termination_reason: Option<&str>,
        now: i64,
    ) -> Result<(), StoreError> {
        let connection = self.lock();
        connection
            .execute(
                "UPDATE stage SET status = 'failed', completed_at = ?2,
                        termination_reason = COALESCE(?3, termination_reason)
                 WHERE id = ?1",
                params![id, now, termination_reason],
            )
            .map_err(StoreError::sql)?;
        Ok(())
    }

    /// Re-arms a stage that is being replayed after a retry or resume.
    /// Completed stages are never reopened.
    pub fn reopen_stage(&self, id: &str, now: i64) -> Result<(), StoreError> {
        let connection = self.lock();
        connection
            .execute(
                "UPDATE stage SET status = 'running', termination_reason = NULL,
                        completed_at = NULL, started_at = COALESCE(started_at, ?2)
                 WHERE id = ?1 AND status != 'completed'",
                params![id, now],
            )
            .map_err(StoreError::sql)?;
        Ok(())
    }
}
