use maxq::flows::{build_flow_path, discover_flows, validate_name};
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn write_flow(root: &Path, name: &str, executable: bool) {
    let dir = root.join(name);
    fs::create_dir_all(&dir).expect("flow dir");
    let script = dir.join("flow.sh");
    fs::write(&script, "#!/bin/sh\nexit 0\n").expect("write flow.sh");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if executable { 0o755 } else { 0o644 };
        let mut perms = fs::metadata(&script).expect("metadata").permissions();
        perms.set_mode(mode);
        fs::set_permissions(&script, perms).expect("chmod");
    }
    let _ = executable;
}

#[test]
fn discovery_lists_executable_flows_sorted() {
    let dir = tempdir().expect("tempdir");
    write_flow(dir.path(), "zeta", true);
    write_flow(dir.path(), "alpha", true);
    fs::create_dir_all(dir.path().join("empty-dir")).expect("dir without flow.sh");

    let flows = discover_flows(dir.path()).expect("discover");
    let names: Vec<&str> = flows.iter().map(|flow| flow.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "zeta"]);
}

#[cfg(unix)]
#[test]
fn discovery_skips_non_executable_entries() {
    let dir = tempdir().expect("tempdir");
    write_flow(dir.path(), "runnable", true);
    write_flow(dir.path(), "disabled", false);

    let flows = discover_flows(dir.path()).expect("discover");
    let names: Vec<&str> = flows.iter().map(|flow| flow.name.as_str()).collect();
    assert_eq!(names, vec!["runnable"]);
}

#[test]
fn discovery_reads_flow_yaml_title() {
    let dir = tempdir().expect("tempdir");
    write_flow(dir.path(), "deploy", true);
    fs::write(
        dir.path().join("deploy/flow.yaml"),
        "title: Deploy to production\n",
    )
    .expect("write manifest");

    let flows = discover_flows(dir.path()).expect("discover");
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].title.as_deref(), Some("Deploy to production"));
}

#[test]
fn discovery_of_missing_root_is_empty() {
    let dir = tempdir().expect("tempdir");
    let flows = discover_flows(&dir.path().join("nope")).expect("discover");
    assert!(flows.is_empty());
}

#[test]
fn flow_paths_refuse_traversal() {
    let root = Path::new("/srv/flows");
    assert!(build_flow_path(root, "ok-flow").is_ok());
    for bad in ["../up", "a/b", "", ".", "..", "nul\0byte"] {
        assert!(build_flow_path(root, bad).is_err(), "accepted `{bad}`");
    }
    assert!(validate_name("step name", "compile.v2").is_ok());
}
