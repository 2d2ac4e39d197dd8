use super::{step_runner, Engine, EngineError};
use crate::shared::{now_ms, LogLevel};
use crate::store::{StepRecord, StepStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickOutcome {
    pub claimed: usize,
    pub at_capacity: bool,
}

/// One scheduler pass: count live claims, select queued candidates within
/// the remaining budget, dependency-filter them, claim atomically and
/// detach an executor thread per claim.
///
/// Steps inserted without `queued_at` are invisible here; the orchestrator
/// only queues a stage once the whole batch is committed.
pub fn scheduler_tick(engine: &Arc<Engine>) -> Result<TickOutcome, EngineError> {
    let running = engine.store.count_running_steps()?;
    let cap = engine.settings.max_concurrent_steps;
    if running >= cap {
        return Ok(TickOutcome {
            claimed: 0,
            at_capacity: true,
        });
    }

    let budget = engine.settings.scheduler_batch_size.min(cap - running);
    let candidates = engine.store.claim_candidates(budget)?;
    if candidates.is_empty() {
        return Ok(TickOutcome::default());
    }

    let mut siblings_by_stage: BTreeMap<String, Vec<StepRecord>> = BTreeMap::new();
    let mut claimed = 0usize;

    for candidate in candidates {
        if !siblings_by_stage.contains_key(&candidate.stage_id) {
            let rows = engine.store.steps_for_stage(&candidate.stage_id)?;
            siblings_by_stage.insert(candidate.stage_id.clone(), rows);
        }
        let siblings = &siblings_by_stage[&candidate.stage_id];
        let deps_satisfied = candidate.depends_on.iter().all(|dependency| {
            siblings
                .iter()
                .any(|row| &row.id == dependency && row.status == StepStatus::Completed)
        });
        if !deps_satisfied {
            continue;
        }

        if !engine.store.try_claim_step(
            &candidate.run_id,
            &candidate.id,
            &engine.worker_id,
            now_ms(),
        )? {
            // Lost the claim race; another tick owns this row now.
            continue;
        }
        claimed += 1;

        let step = engine.store.load_step(&candidate.run_id, &candidate.id)?;
        engine.log(
            LogLevel::Debug,
            "scheduler.claimed",
            &format!("run_id={} step_id={}", step.run_id, step.id),
        );
        let worker = engine.clone();
        thread::spawn(move || step_runner::execute_claimed_step(&worker, step));
    }

    if claimed > 0 {
        engine.log(
            LogLevel::Debug,
            "scheduler.tick",
            &format!("claimed={claimed}"),
        );
    }
    Ok(TickOutcome {
        claimed,
        at_capacity: false,
    })
}
