use super::{Store, StoreError};
use rusqlite::params;

/// Multi-row control transitions. Each operation is one transaction so a
/// crash mid-way never leaves a run half terminated.
impl Store {
    /// Fails the run and every non-terminal stage and step under it,
    /// recording `termination_reason`. `clear_claims` additionally wipes
    /// scheduler claim fields (used by startup reconciliation, where no
    /// claimed process can still exist).
    ///
    /// Returns `false` when the run was already terminal (idempotent no-op).
    pub fn terminate_run_rows(
        &self,
        run_id: &str,
        reason: &str,
        clear_claims: bool,
        now: i64,
    ) -> Result<bool, StoreError> {
        let mut connection = self.lock();
        let tx = connection.transaction().map_err(StoreError::sql)?;

        let run_changed = tx
            .execute(
                "UPDATE run SET status = 'failed', termination_reason = ?2,
                        completed_at = ?3,
                        duration_ms = CASE WHEN started_at IS NULL THEN NULL
                                           ELSE ?3 - started_at END
                 WHERE id = ?1 AND status IN ('pending', 'running', 'paused')",
                params![run_id, reason, now],
            )
            .map_err(StoreError::sql)?;

        tx.execute(
            "UPDATE stage SET status = 'failed', termination_reason = ?2, completed_at = ?3
             WHERE run_id = ?1 AND status IN ('pending', 'running')",
            params![run_id, reason, now],
        )
        .map_err(StoreError::sql)?;

        let step_sql = if clear_claims {
            "UPDATE step SET status = 'failed', termination_reason = ?2, completed_at = ?3,
                    claimed_at = NULL, heartbeat_at = NULL, worker_id = NULL
             WHERE run_id = ?1 AND status IN ('pending', 'running')"
        } else {
            "UPDATE step SET status = 'failed', termination_reason = ?2, completed_at = ?3
             WHERE run_id = ?1 AND status IN ('pending', 'running')"
        };
        tx.execute(step_sql, params![run_id, reason, now])
            .map_err(StoreError::sql)?;

        tx.commit().map_err(StoreError::sql)?;
        Ok(run_changed == 1)
    }

    /// Pause: the run parks as `paused` and every in-flight step returns to
    /// `pending` with `queued_at` cleared, which keeps the scheduler away
    /// until resume re-queues the stage.
    pub fn pause_run_rows(&self, run_id: &str) -> Result<bool, StoreError> {
        let mut connection = self.lock();
        let tx = connection.transaction().map_err(StoreError::sql)?;

        let run_changed = tx
            .execute(
                "UPDATE run SET status = 'paused' WHERE id = ?1 AND status = 'running'",
                params![run_id],
            )
            .map_err(StoreError::sql)?;
        if run_changed == 1 {
            tx.execute(
                "UPDATE step SET status = 'pending', queued_at = NULL, claimed_at = NULL,
                        heartbeat_at = NULL, worker_id = NULL, started_at = NULL
                 WHERE run_id = ?1 AND status IN ('pending', 'running')",
                params![run_id],
            )
            .map_err(StoreError::sql)?;
        }

        tx.commit().map_err(StoreError::sql)?;
        Ok(run_changed == 1)
    }

    /// Run retry: everything that did not complete goes back to `pending`
    /// with timing, output and attempt counters cleared. Completed stages
    /// and steps are kept so the re-planned run settles through them
    /// instantly.
    pub fn reset_run_rows_for_retry(&self, run_id: &str) -> Result<(), StoreError> {
        let mut connection = self.lock();
        let tx = connection.transaction().map_err(StoreError::sql)?;

        tx.execute(
            "UPDATE run SET status = 'pending', error = NULL, termination_reason = NULL,
                    completed_at = NULL, duration_ms = NULL, stdout = NULL, stderr = NULL,
                    output = NULL
             WHERE id = ?1",
            params![run_id],
        )
        .map_err(StoreError::sql)?;

        tx.execute(
            "UPDATE stage SET status = 'pending', termination_reason = NULL,
                    completed_at = NULL, started_at = NULL
             WHERE run_id = ?1 AND status != 'completed'",
            params![run_id],
        )
        .map_err(StoreError::sql)?;

        tx.execute(
            "UPDATE step SET status = 'pending', retry_count = 0, error = NULL,
                    stdout = NULL, stderr = NULL, termination_reason = NULL,
                    started_at = NULL, completed_at = NULL, duration_ms = NULL,
                    queued_at = NULL, claimed_at = NULL, heartbeat_at = NULL,
                    worker_id = NULL
             WHERE run_id = ?1 AND status != 'completed'",
            params![run_id],
        )
        .map_err(StoreError::sql)?;

        tx.commit().map_err(StoreError::sql)
    }
}
