use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum FlowsError {
    #[error("invalid {kind} `{value}`: {reason}")]
    InvalidName {
        kind: &'static str,
        value: String,
        reason: String,
    },
    #[error("failed to read flows root {path}: {source}")]
    ReadRoot {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Manifest {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Flow and step directory names are a strict allowlist. Anything that
/// could traverse outside the flows root (separators, `..`, NUL) fails
/// before a path is ever built from it.
pub fn validate_name(kind: &'static str, value: &str) -> Result<(), FlowsError> {
    let invalid = |reason: &str| FlowsError::InvalidName {
        kind,
        value: value.to_string(),
        reason: reason.to_string(),
    };
    if value.is_empty() {
        return Err(invalid("must be non-empty"));
    }
    if value == "." || value == ".." {
        return Err(invalid("must not be a relative path component"));
    }
    if !value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'))
    {
        return Err(invalid(
            "must use only ASCII letters, digits, '.', '_' or '-'",
        ));
    }
    Ok(())
}

pub fn build_flow_path(flows_root: &Path, flow_name: &str) -> Result<PathBuf, FlowsError> {
    validate_name("flow name", flow_name)?;
    Ok(flows_root.join(flow_name).join("flow.sh"))
}

pub fn build_step_path(
    flows_root: &Path,
    flow_name: &str,
    step_name: &str,
) -> Result<PathBuf, FlowsError> {
    validate_name("flow name", flow_name)?;
    validate_name("step name", step_name)?;
    Ok(flows_root
        .join(flow_name)
        .join("steps")
        .join(step_name)
        .join("step.sh"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FlowManifest {
    #[serde(default)]
    title: Option<String>,
}

/// Owner-executable check. Meaningless off unix, where discovery falls
/// back to listing the entry and the spawn attempt decides.
#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o100 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Lists valid flow directories under the flows root. Entries without an
/// executable `flow.sh`, or whose directory name fails validation, are
/// skipped silently.
pub fn discover_flows(flows_root: &Path) -> Result<Vec<FlowInfo>, FlowsError> {
    let entries = match fs::read_dir(flows_root) {
        Ok(entries) => entries,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(FlowsError::ReadRoot {
                path: flows_root.display().to_string(),
                source,
            })
        }
    };

    let mut flows = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| FlowsError::ReadRoot {
            path: flows_root.display().to_string(),
            source,
        })?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|value| value.to_str()) else {
            continue;
        };
        if validate_name("flow name", name).is_err() {
            continue;
        }
        if !is_executable(&path.join("flow.sh")) {
            continue;
        }
        flows.push(FlowInfo {
            name: name.to_string(),
            title: read_flow_title(&path)?,
        });
    }
    flows.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(flows)
}

pub fn read_flow_title(flow_dir: &Path) -> Result<Option<String>, FlowsError> {
    let manifest_path = flow_dir.join("flow.yaml");
    let raw = match fs::read_to_string(&manifest_path) {
        Ok(raw) => raw,
        Err(_) => return Ok(None),
    };
    let manifest: FlowManifest =
        serde_yaml::from_str(&raw).map_err(|source| FlowsError::Manifest {
            path: manifest_path.display().to_string(),
            source,
        })?;
    Ok(manifest.title)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_name_accepts_allowlisted_charset() {
        for name in ["deploy", "build-all", "v1.2_final", "A9"] {
            validate_name("flow name", name).expect("valid name");
        }
    }

    #[test]
    fn validate_name_rejects_traversal_and_separators() {
        for name in ["", ".", "..", "a/b", "a\\b", "a\0b", "../etc", "a b"] {
            assert!(
                validate_name("flow name", name).is_err(),
                "accepted `{name}`"
            );
        }
    }

    #[test]
    fn build_step_path_nests_under_steps_dir() {
        let path = build_step_path(Path::new("/flows"), "deploy", "compile").expect("path");
        assert_eq!(path, PathBuf::from("/flows/deploy/steps/compile/step.sh"));
    }

    #[test]
    fn build_flow_path_rejects_dotdot() {
        let err = build_flow_path(Path::new("/flows"), "..").expect_err("must reject");
        assert!(err.to_string().contains("relative path"));
    }
}
