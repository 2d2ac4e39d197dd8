use crate::store::{NewStep, StepRecord, StepStatus};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DagError {
    #[error("duplicate step id `{step_id}` in stage")]
    DuplicateStepId { step_id: String },
    #[error("step `{step_id}` depends on unknown step `{dependency}`")]
    UnknownDependency { step_id: String, dependency: String },
    #[error("dependency cycle detected through step `{step_id}`")]
    Cycle { step_id: String },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Validates a declared stage before anything is persisted: ids are unique,
/// every `depends_on` edge points at a sibling, and the edges are acyclic.
pub fn validate_stage_plan(steps: &[NewStep]) -> Result<(), DagError> {
    let mut ids = BTreeSet::new();
    for step in steps {
        if !ids.insert(step.id.as_str()) {
            return Err(DagError::DuplicateStepId {
                step_id: step.id.clone(),
            });
        }
    }
    for step in steps {
        for dependency in &step.depends_on {
            if !ids.contains(dependency.as_str()) {
                return Err(DagError::UnknownDependency {
                    step_id: step.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    let edges: BTreeMap<&str, &[String]> = steps
        .iter()
        .map(|step| (step.id.as_str(), step.depends_on.as_slice()))
        .collect();
    let mut colors: BTreeMap<&str, Color> =
        steps.iter().map(|step| (step.id.as_str(), Color::White)).collect();

    for step in steps {
        if colors[step.id.as_str()] == Color::White {
            visit(step.id.as_str(), &edges, &mut colors)?;
        }
    }
    Ok(())
}

fn visit<'a>(
    node: &'a str,
    edges: &BTreeMap<&'a str, &'a [String]>,
    colors: &mut BTreeMap<&'a str, Color>,
) -> Result<(), DagError> {
    colors.insert(node, Color::Gray);
    if let Some(dependencies) = edges.get(node) {
        for dependency in dependencies.iter() {
            match colors.get(dependency.as_str()) {
                Some(Color::Gray) => {
                    return Err(DagError::Cycle {
                        step_id: dependency.clone(),
                    })
                }
                Some(Color::White) => visit(dependency.as_str(), edges, colors)?,
                _ => {}
            }
        }
    }
    colors.insert(node, Color::Black);
    Ok(())
}

/// A step is ready when it is pending, committed for scheduling, and every
/// dependency within the slice has completed.
pub fn ready_steps<'a>(steps: &'a [StepRecord]) -> Vec<&'a StepRecord> {
    let by_id: BTreeMap<&str, &StepRecord> =
        steps.iter().map(|step| (step.id.as_str(), step)).collect();
    steps
        .iter()
        .filter(|step| step.status == StepStatus::Pending && step.queued_at.is_some())
        .filter(|step| {
            step.depends_on.iter().all(|dependency| {
                by_id
                    .get(dependency.as_str())
                    .map(|dep| dep.status == StepStatus::Completed)
                    .unwrap_or(false)
            })
        })
        .collect()
}

/// Transitive dependents of `root` within the slice, in breadth-first
/// order. Used for cascade failure and for cascading manual retries.
pub fn downstream_closure(steps: &[StepRecord], root: &str) -> Vec<String> {
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for step in steps {
        for dependency in &step.depends_on {
            dependents
                .entry(dependency.as_str())
                .or_default()
                .push(step.id.as_str());
        }
    }

    let mut seen = BTreeSet::new();
    let mut closure = Vec::new();
    let mut queue = VecDeque::new();
    queue.push_back(root);
    while let Some(node) = queue.pop_front() {
        if let Some(children) = dependents.get(node) {
            for child in children {
                if seen.insert(*child) {
                    closure.push(child.to_string());
                    queue.push_back(child);
                }
            }
        }
    }
    closure
}
