use super::{Store, StoreError};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunLogEntity {
    Run,
    Stage,
    Step,
}

impl RunLogEntity {
    pub fn as_str(self) -> &'static str {
        match self {
            RunLogEntity::Run => "run",
            RunLogEntity::Stage => "stage",
            RunLogEntity::Step => "step",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "run" => Ok(RunLogEntity::Run),
            "stage" => Ok(RunLogEntity::Stage),
            "step" => Ok(RunLogEntity::Step),
            other => Err(format!("unknown log entity `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl RunLogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RunLogLevel::Debug => "debug",
            RunLogLevel::Info => "info",
            RunLogLevel::Warn => "warn",
            RunLogLevel::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "debug" => Ok(RunLogLevel::Debug),
            "info" => Ok(RunLogLevel::Info),
            "warn" => Ok(RunLogLevel::Warn),
            "error" => Ok(RunLogLevel::Error),
            other => Err(format!("unknown log level `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogRecord {
    pub id: i64,
    pub run_id: String,
    pub entity_type: RunLogEntity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub level: RunLogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: i64,
}

fn run_log_from_row(row: &Row<'_>) -> Result<RunLogRecord, rusqlite::Error> {
    let entity_raw: String = row.get("entity_type")?;
    let level_raw: String = row.get("level")?;
    let metadata_raw: Option<String> = row.get("metadata")?;
    Ok(RunLogRecord {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        entity_type: RunLogEntity::parse(&entity_raw).map_err(|err| {
            rusqlite::Error::InvalidColumnType(0, err, rusqlite::types::Type::Text)
        })?,
        entity_id: row.get("entity_id")?,
        level: RunLogLevel::parse(&level_raw).map_err(|err| {
            rusqlite::Error::InvalidColumnType(0, err, rusqlite::types::Type::Text)
        })?,
        message: row.get("message")?,
        metadata: metadata_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
        created_at: row.get("created_at")?,
    })
}

impl Store {
    pub fn append_run_log(
        &self,
        run_id: &str,
        entity_type: RunLogEntity,
        entity_id: Option<&str>,
        level: RunLogLevel,
        message: &str,
        metadata: Option<&Value>,
    ) -> Result<(), StoreError> {
        let connection = self.lock();
        connection
            .execute(
                "INSERT INTO run_log (run_id, entity_type, entity_id, level, message,
                                      metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run_id,
                    entity_type.as_str(),
                    entity_id,
                    level.as_str(),
                    message,
                    metadata.map(|value| value.to_string()),
                    crate::shared::now_ms()
                ],
            )
            .map_err(StoreError::sql)?;
        Ok(())
    }

    pub fn logs_for_run(
        &self,
        run_id: &str,
        limit: usize,
    ) -> Result<Vec<RunLogRecord>, StoreError> {
        let connection = self.lock();
        let mut statement = connection
            .prepare(
                "SELECT id, run_id, entity_type, entity_id, level, message, metadata, created_at
                 FROM run_log WHERE run_id = ?1
                 ORDER BY created_at ASC, id ASC LIMIT ?2",
            )
            .map_err(StoreError::sql)?;
        let rows = statement
            .query_map(params![run_id, limit as i64], run_log_from_row)
            .map_err(StoreError::sql)?;
        let mut logs = Vec::new();
        for row in rows {
            logs.push(row.map_err(StoreError::sql)?);
        }
        Ok(logs)
    }
}
