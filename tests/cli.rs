//! Integration tests: run the skiff binary and check exit codes and output.
//! Everything here stays off the network.

use std::path::Path;
use std::process::Command;

fn skiff(dir: &Path, cache: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_skiff"));
    cmd.current_dir(dir);
    cmd.env("SKIFF_CACHE_DIR", cache.join("cache"));
    cmd.env("SKIFF_STORE_DIR", cache.join("store"));
    cmd.env("SKIFF_QUIET", "1");
    cmd
}

#[test]
fn help_lists_subcommands() {
    let td = tempfile::tempdir().expect("tmp");
    let out = skiff(td.path(), td.path()).arg("--help").output().expect("run");
    assert!(out.status.success(), "skiff --help should succeed");
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("install"));
    assert!(stdout.contains("cache"));
    assert!(stdout.contains("store"));
    assert!(stdout.contains("run"));
}

#[test]
fn version_prints() {
    let td = tempfile::tempdir().expect("tmp");
    let out = skiff(td.path(), td.path()).arg("--version").output().expect("run");
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("skiff"));
}

#[test]
fn cache_commands_work_on_empty_cache() {
    let td = tempfile::tempdir().expect("tmp");
    let out = skiff(td.path(), td.path()).args(["cache", "list"]).output().expect("run");
    assert!(out.status.success(), "cache list should succeed on an empty cache");

    let out = skiff(td.path(), td.path()).args(["cache", "size"]).output().expect("run");
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("0 bytes"));
}

#[test]
fn store_size_works_on_empty_store() {
    let td = tempfile::tempdir().expect("tmp");
    let out = skiff(td.path(), td.path()).args(["store", "size"]).output().expect("run");
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("0 bytes"));
}

#[test]
fn run_executes_scripts_and_mirrors_exit_codes() {
    let td = tempfile::tempdir().expect("tmp");
    std::fs::write(
        td.path().join("package.json"),
        r#"{"name": "t", "version": "1.0.0", "scripts": {"ok": "echo fine", "bad": "exit 4"}}"#,
    )
    .expect("write manifest");

    let out = skiff(td.path(), td.path()).args(["run", "ok"]).output().expect("run");
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("fine"));

    let out = skiff(td.path(), td.path()).args(["run", "bad"]).output().expect("run");
    assert_eq!(out.status.code(), Some(4), "script exit code is mirrored");

    let out = skiff(td.path(), td.path()).args(["run", "ghost"]).output().expect("run");
    assert!(!out.status.success(), "missing script must fail");
}

#[test]
fn run_exposes_npm_environment() {
    let td = tempfile::tempdir().expect("tmp");
    std::fs::write(
        td.path().join("package.json"),
        r#"{"name": "envpkg", "version": "2.0.0", "scripts": {"show": "echo $npm_package_name@$npm_package_version:$npm_lifecycle_event"}}"#,
    )
    .expect("write manifest");

    let out = skiff(td.path(), td.path()).args(["run", "show"]).output().expect("run");
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("envpkg@2.0.0:show"));
}

#[test]
fn workspaces_lists_declared_members() {
    let td = tempfile::tempdir().expect("tmp");
    std::fs::write(
        td.path().join("package.json"),
        r#"{"name": "root", "workspaces": ["packages/*"]}"#,
    )
    .expect("write root");
    std::fs::create_dir_all(td.path().join("packages/alpha")).expect("dirs");
    std::fs::write(
        td.path().join("packages/alpha/package.json"),
        r#"{"name": "alpha", "version": "0.1.0"}"#,
    )
    .expect("write member");

    let out = skiff(td.path(), td.path()).arg("workspaces").output().expect("run");
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("alpha"));
    assert!(stdout.contains("packages/alpha"));
}

#[test]
fn import_lockfile_converts_npm_to_canonical() {
    let td = tempfile::tempdir().expect("tmp");
    std::fs::write(
        td.path().join("package-lock.json"),
        r#"{
            "name": "fixture",
            "lockfileVersion": 3,
            "packages": {
                "": { "name": "fixture", "version": "1.0.0" },
                "node_modules/lodash": {
                    "version": "4.17.21",
                    "resolved": "https://registry.npmjs.org/lodash/-/lodash-4.17.21.tgz",
                    "integrity": "sha512-lodash"
                }
            }
        }"#,
    )
    .expect("write lockfile");

    let out = skiff(td.path(), td.path()).arg("import-lockfile").output().expect("run");
    assert!(out.status.success(), "import should succeed: {}", String::from_utf8_lossy(&out.stderr));

    let canonical = std::fs::read_to_string(td.path().join("skiff-lock.json")).expect("canonical");
    assert!(canonical.contains("lodash@4.17.21"));
    assert!(canonical.contains("sha512-lodash"));
}

#[test]
fn install_without_package_json_fails() {
    let td = tempfile::tempdir().expect("tmp");
    let out = skiff(td.path(), td.path()).arg("install").output().expect("run");
    assert!(!out.status.success());
}
