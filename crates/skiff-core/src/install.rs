//! End-to-end install: resolve the graph, fetch tarballs cache-first, feed
//! the store, materialise `node_modules`, write the lockfile, link bins and
//! run the root lifecycle scripts through the pool.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cache::PackageCache;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::integrity;
use crate::lockfile::{LockFile, LockFilePackage};
use crate::manifest::PackageManifest;
use crate::pool::{PoolConfig, ScriptPool, ScriptRequest};
use crate::registry::Registry;
use crate::resolver::{self, DependencyGraph, ResolvedPackage, Resolver};
use crate::runner::ProcessRequest;
use crate::scripts;
use crate::store::{link_dir, LinkStrategy, Store};
use crate::version::parse_version;

#[derive(Clone, Debug)]
pub struct InstallOptions {
    /// Walk devDependencies of the root manifest.
    pub include_dev: bool,
    /// Stop after writing the lockfile.
    pub lockfile_only: bool,
    /// Run preinstall/install/postinstall of the root manifest.
    pub run_scripts: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self { include_dev: true, lockfile_only: false, run_scripts: true }
    }
}

#[derive(Clone, Debug, Default)]
pub struct InstallReport {
    pub resolved: usize,
    pub downloaded: usize,
    pub linked: usize,
    pub bins: usize,
    pub scripts_run: Vec<String>,
}

/// Build the canonical lockfile from a resolved graph.
pub fn lockfile_from_graph(graph: &DependencyGraph) -> Result<LockFile> {
    let mut lock = LockFile::new();
    for (spec, package) in &graph.packages {
        lock.insert(
            spec.clone(),
            LockFilePackage {
                version: package.version.clone(),
                resolved: package.resolved.clone(),
                integrity: package.integrity.clone(),
                dependencies: package.dependencies.clone(),
                dev: package.dev,
                optional: package.optional,
                ..Default::default()
            },
        )?;
    }
    Ok(lock)
}

/// Pick the package that owns the top-level `node_modules/<name>` slot when
/// the graph holds several versions of a name: the highest version wins,
/// with parseable versions ranked above pseudo-versions.
fn select_top_level(graph: &DependencyGraph) -> HashMap<&str, &ResolvedPackage> {
    let mut chosen: HashMap<&str, &ResolvedPackage> = HashMap::new();
    for package in graph.packages.values() {
        match chosen.entry(package.name.as_str()) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(package);
            }
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                let incumbent = *slot.get();
                let incoming_wins = match (
                    parse_version(&package.version),
                    parse_version(&incumbent.version),
                ) {
                    (Ok(a), Ok(b)) => a > b,
                    _ => false,
                };
                if incoming_wins {
                    slot.insert(package);
                }
            }
        }
    }
    chosen
}

fn is_registry_package(package: &ResolvedPackage) -> bool {
    !package.integrity.is_empty()
        || package.resolved.starts_with("http://")
        || package.resolved.starts_with("https://")
}

async fn fetch_one<R: Registry>(
    registry: &R,
    cache: &PackageCache,
    store: &Store,
    package: &ResolvedPackage,
    token: &CancellationToken,
) -> Result<bool> {
    let (name, version, spec) = (&package.name, &package.version, package.spec());

    let mut downloaded = false;
    let bytes = match cache.get(name, version, &package.integrity).await? {
        Some(bytes) => bytes,
        None => {
            let bytes = registry.tarball(name, version, token).await?;
            if !package.integrity.is_empty() && !integrity::verify(&bytes, &package.integrity) {
                return Err(Error::IntegrityMismatch {
                    package: spec,
                    expected: package.integrity.clone(),
                });
            }
            cache.put(name, version, &package.integrity, bytes.as_slice()).await?;
            downloaded = true;
            bytes
        }
    };

    if !store.exists(name, version) {
        store.add(name, version, &bytes)?;
    }
    Ok(downloaded)
}

async fn run_lifecycle_scripts(
    project_dir: &Path,
    manifest: &PackageManifest,
    token: &CancellationToken,
    report: &mut InstallReport,
) -> Result<()> {
    let events = ["preinstall", "install", "postinstall"];
    if !events.iter().any(|e| manifest.scripts.contains_key(*e)) {
        return Ok(());
    }
    let pool = ScriptPool::new(PoolConfig::default());
    for event in events {
        let Ok(command) = scripts::script_command(manifest, event) else {
            continue;
        };
        let mut process = ProcessRequest::shell(&command, project_dir);
        process.env = scripts::script_env(manifest, Some(event));
        process.workspace_dir = Some(project_dir.to_path_buf());
        process.timeout = Some(scripts::timeout_for(event));
        let mut request = ScriptRequest::new(process, 0);
        request.token = token.child_token();

        let result = pool.execute(request).await?;
        if result.success {
            report.scripts_run.push(event.to_string());
        } else if event.starts_with("post") {
            // npm convention: post* failures do not fail the install.
            crate::log::warn(&format!(
                "{} script failed with exit code {}",
                event, result.exit_code
            ));
        } else {
            return Err(Error::ProcessFailed {
                code: result.exit_code,
                detail: format!("{} script failed", event),
            });
        }
    }
    Ok(())
}

/// Install the project at `project_dir`.
pub async fn install<R: Registry>(
    project_dir: &Path,
    config: Arc<Config>,
    registry: Arc<R>,
    options: InstallOptions,
    token: CancellationToken,
) -> Result<InstallReport> {
    let mut manifest = PackageManifest::read_dir(project_dir)?;
    if !options.include_dev {
        manifest.dev_dependencies.clear();
    }

    let resolver = Resolver::new(
        Arc::clone(&registry),
        project_dir,
        manifest.clone(),
        token.child_token(),
    )?;
    let graph = resolver.resolve().await?;
    crate::log::log(&format!(
        "resolved {} packages for {}",
        graph.packages.len(),
        if manifest.name.is_empty() { "project" } else { manifest.name.as_str() }
    ));

    let mut report = InstallReport { resolved: graph.packages.len(), ..Default::default() };

    let lockfile = lockfile_from_graph(&graph)?;
    lockfile.write(project_dir)?;
    if options.lockfile_only {
        return Ok(report);
    }

    let cache = Arc::new(PackageCache::new(config.cache_dir.clone()));
    let store = Arc::new(Store::from_config(&config));
    let optional_roots = manifest.optional_dependencies.clone();

    // Fetch phase: bounded fan-out over every registry-sourced package.
    let fetch_limit = Arc::new(tokio::sync::Semaphore::new(config.max_sockets.max(1)));
    let mut fetches: JoinSet<(String, Result<bool>)> = JoinSet::new();
    for package in graph.packages.values() {
        if !is_registry_package(package) {
            continue;
        }
        let registry = Arc::clone(&registry);
        let cache = Arc::clone(&cache);
        let store = Arc::clone(&store);
        let limit = Arc::clone(&fetch_limit);
        let token = token.child_token();
        let package = package.clone();
        fetches.spawn(async move {
            let _permit = limit.acquire().await;
            let outcome = fetch_one(registry.as_ref(), &cache, &store, &package, &token).await;
            (package.name.clone(), outcome)
        });
    }

    let mut skipped: Vec<String> = Vec::new();
    while let Some(joined) = fetches.join_next().await {
        let Ok((name, outcome)) = joined else {
            continue;
        };
        match outcome {
            Ok(downloaded) => {
                if downloaded {
                    report.downloaded += 1;
                }
            }
            Err(e) if optional_roots.contains_key(&name) && e.is_optional_recoverable() => {
                crate::log::warn(&format!("skipping optional dependency {}: {}", name, e));
                skipped.push(name);
            }
            Err(e) => {
                token.cancel();
                while fetches.join_next().await.is_some() {}
                return Err(e);
            }
        }
    }

    // Link phase: one top-level slot per package name.
    let node_modules = project_dir.join("node_modules");
    for (name, package) in select_top_level(&graph) {
        if skipped.iter().any(|s| s.as_str() == name) {
            continue;
        }
        let target = node_modules.join(name);
        if is_registry_package(package) {
            store.link_package(&package.name, &package.version, &target)?;
        } else if let Some(rel) = package.resolved.strip_prefix("workspace:") {
            link_dir(&project_dir.join(rel), &target, LinkStrategy::Symlink)?;
        } else if let Some(path) = package.resolved.strip_prefix("link:") {
            link_dir(&resolve_local(project_dir, path), &target, LinkStrategy::Symlink)?;
        } else if let Some(path) = package.resolved.strip_prefix("file:") {
            link_dir(&resolve_local(project_dir, path), &target, LinkStrategy::Copy)?;
        } else if let Some(rest) = package.resolved.strip_prefix("git+") {
            let (url, reference) = match rest.split_once('#') {
                Some((url, r)) => (url, Some(r)),
                None => (rest, None),
            };
            if target.exists() {
                let _ = std::fs::remove_dir_all(&target);
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(Error::store_io)?;
            }
            resolver::clone_git(url, reference, &target, &token).await?;
        } else {
            crate::log::warn(&format!(
                "not materialising {}: unrecognised source {}",
                package.spec(),
                package.resolved
            ));
            continue;
        }
        report.linked += 1;
        report.bins += crate::bin_links::link_package_bins(&node_modules, &target)?.len();
    }

    if options.run_scripts {
        run_lifecycle_scripts(project_dir, &manifest, &token, &mut report).await?;
    }
    Ok(report)
}

fn resolve_local(project_dir: &Path, path: &str) -> std::path::PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        project_dir.join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockRegistry;

    fn write_project(dir: &Path, manifest: &str) {
        std::fs::write(dir.join("package.json"), manifest).expect("write package.json");
    }

    fn test_config(td: &Path) -> Arc<Config> {
        let mut config = Config::default();
        config.cache_dir = td.join("cache");
        config.store_dir = td.join("store");
        config.use_symlinks = false;
        config.use_hardlinks = true;
        Arc::new(config)
    }

    fn no_scripts() -> InstallOptions {
        InstallOptions { run_scripts: false, ..Default::default() }
    }

    #[tokio::test]
    async fn full_install_materialises_node_modules() {
        let td = tempfile::tempdir().expect("tmp");
        let project = td.path().join("proj");
        std::fs::create_dir_all(&project).expect("dirs");
        write_project(&project, r#"{"name": "app", "dependencies": {"a": "^1.0.0"}}"#);

        let mut reg = MockRegistry::default();
        reg.add("a", "1.2.0", &[("b", "^2.0.0")]);
        reg.add("b", "2.3.1", &[]);

        let report = install(
            &project,
            test_config(td.path()),
            Arc::new(reg),
            no_scripts(),
            CancellationToken::new(),
        )
        .await
        .expect("install");

        assert_eq!(report.resolved, 2);
        assert_eq!(report.downloaded, 2);
        assert_eq!(report.linked, 2);
        assert!(project.join("node_modules/a/package.json").is_file());
        assert!(project.join("node_modules/b/package.json").is_file());
        assert!(project.join(crate::lockfile::LOCKFILE_NAME).is_file());

        // Lockfile round-trips through the canonical parser.
        let lock = LockFile::read(&project).expect("lockfile");
        assert_eq!(lock.packages.len(), 2);
        assert!(lock.packages.contains_key("a@1.2.0"));
    }

    #[tokio::test]
    async fn second_install_hits_the_cache() {
        let td = tempfile::tempdir().expect("tmp");
        let project = td.path().join("proj");
        std::fs::create_dir_all(&project).expect("dirs");
        write_project(&project, r#"{"name": "app", "dependencies": {"a": "1.0.0"}}"#);

        let mut reg = MockRegistry::default();
        reg.add("a", "1.0.0", &[]);
        let reg = Arc::new(reg);
        let config = test_config(td.path());

        let first = install(&project, Arc::clone(&config), Arc::clone(&reg), no_scripts(), CancellationToken::new())
            .await
            .expect("first install");
        assert_eq!(first.downloaded, 1);

        std::fs::remove_dir_all(project.join("node_modules")).expect("wipe");
        let second = install(&project, config, reg, no_scripts(), CancellationToken::new())
            .await
            .expect("second install");
        assert_eq!(second.downloaded, 0, "tarball must come from the cache");
        assert!(project.join("node_modules/a/package.json").is_file());
    }

    #[tokio::test]
    async fn integrity_mismatch_is_fatal_for_required_deps() {
        let td = tempfile::tempdir().expect("tmp");
        let project = td.path().join("proj");
        std::fs::create_dir_all(&project).expect("dirs");
        write_project(&project, r#"{"name": "app", "dependencies": {"a": "1.0.0"}}"#);

        let mut reg = MockRegistry::default();
        reg.add("a", "1.0.0", &[]);
        reg.corrupt_tarball("a", "1.0.0");

        let err = install(
            &project,
            test_config(td.path()),
            Arc::new(reg),
            no_scripts(),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::IntegrityMismatch { .. }));
    }

    #[tokio::test]
    async fn integrity_mismatch_on_optional_dep_is_skipped() {
        let td = tempfile::tempdir().expect("tmp");
        let project = td.path().join("proj");
        std::fs::create_dir_all(&project).expect("dirs");
        write_project(
            &project,
            r#"{"name": "app", "dependencies": {"a": "1.0.0"}, "optionalDependencies": {"flaky": "1.0.0"}}"#,
        );

        let mut reg = MockRegistry::default();
        reg.add("a", "1.0.0", &[]);
        reg.add("flaky", "1.0.0", &[]);
        reg.corrupt_tarball("flaky", "1.0.0");

        let report = install(
            &project,
            test_config(td.path()),
            Arc::new(reg),
            no_scripts(),
            CancellationToken::new(),
        )
        .await
        .expect("install");
        assert!(project.join("node_modules/a/package.json").is_file());
        assert!(!project.join("node_modules/flaky").exists());
        assert_eq!(report.linked, 1);
    }

    #[tokio::test]
    async fn lockfile_only_skips_node_modules() {
        let td = tempfile::tempdir().expect("tmp");
        let project = td.path().join("proj");
        std::fs::create_dir_all(&project).expect("dirs");
        write_project(&project, r#"{"name": "app", "dependencies": {"a": "1.0.0"}}"#);

        let mut reg = MockRegistry::default();
        reg.add("a", "1.0.0", &[]);

        let options = InstallOptions { lockfile_only: true, ..no_scripts() };
        install(
            &project,
            test_config(td.path()),
            Arc::new(reg),
            options,
            CancellationToken::new(),
        )
        .await
        .expect("install");

        assert!(project.join(crate::lockfile::LOCKFILE_NAME).is_file());
        assert!(!project.join("node_modules").exists());
    }

    #[tokio::test]
    async fn bins_are_linked() {
        let td = tempfile::tempdir().expect("tmp");
        let project = td.path().join("proj");
        std::fs::create_dir_all(&project).expect("dirs");
        write_project(&project, r#"{"name": "app", "dependencies": {"tool": "1.0.0"}}"#);

        let mut reg = MockRegistry::default();
        reg.add_with_manifest_extras("tool", "1.0.0", &[], r#""bin": {"tool": "package.json"}"#);

        let report = install(
            &project,
            test_config(td.path()),
            Arc::new(reg),
            no_scripts(),
            CancellationToken::new(),
        )
        .await
        .expect("install");
        assert_eq!(report.bins, 1);
        #[cfg(unix)]
        assert!(project.join("node_modules/.bin/tool").exists());
    }

    #[tokio::test]
    async fn lifecycle_scripts_run_in_order() {
        let td = tempfile::tempdir().expect("tmp");
        let project = td.path().join("proj");
        std::fs::create_dir_all(&project).expect("dirs");
        write_project(
            &project,
            r#"{
                "name": "app",
                "dependencies": {},
                "scripts": {
                    "preinstall": "echo pre >> events.log",
                    "install": "echo main >> events.log",
                    "postinstall": "echo post >> events.log"
                }
            }"#,
        );

        let report = install(
            &project,
            test_config(td.path()),
            Arc::new(MockRegistry::default()),
            InstallOptions::default(),
            CancellationToken::new(),
        )
        .await
        .expect("install");

        assert_eq!(report.scripts_run, vec!["preinstall", "install", "postinstall"]);
        let log = std::fs::read_to_string(project.join("events.log")).expect("log");
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines, vec!["pre", "main", "post"]);
    }

    #[tokio::test]
    async fn failing_postinstall_is_only_a_warning() {
        let td = tempfile::tempdir().expect("tmp");
        let project = td.path().join("proj");
        std::fs::create_dir_all(&project).expect("dirs");
        write_project(
            &project,
            r#"{"name": "app", "scripts": {"postinstall": "exit 1"}}"#,
        );

        let report = install(
            &project,
            test_config(td.path()),
            Arc::new(MockRegistry::default()),
            InstallOptions::default(),
            CancellationToken::new(),
        )
        .await
        .expect("install succeeds despite postinstall");
        assert!(report.scripts_run.is_empty());
    }

    #[tokio::test]
    async fn failing_preinstall_fails_the_install() {
        let td = tempfile::tempdir().expect("tmp");
        let project = td.path().join("proj");
        std::fs::create_dir_all(&project).expect("dirs");
        write_project(
            &project,
            r#"{"name": "app", "scripts": {"preinstall": "exit 9"}}"#,
        );

        let err = install(
            &project,
            test_config(td.path()),
            Arc::new(MockRegistry::default()),
            InstallOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ProcessFailed { code: 9, .. }));
    }

    #[test]
    fn top_level_selection_takes_the_highest_version() {
        let mut graph = DependencyGraph::default();
        graph.roots.insert("dup".to_string());
        for version in ["1.0.0", "2.0.0", "1.5.0"] {
            let package = ResolvedPackage {
                name: "dup".to_string(),
                version: version.to_string(),
                resolved: String::new(),
                integrity: "sha512-x".to_string(),
                dependencies: Default::default(),
                dev: false,
                optional: false,
            };
            graph.packages.insert(package.spec(), package);
        }
        let selected = select_top_level(&graph);
        assert_eq!(selected["dup"].version, "2.0.0");
    }
}
