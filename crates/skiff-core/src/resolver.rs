//! Concurrent dependency resolution.
//!
//! Direct dependencies seed a task set; every task resolves one
//! `(name, range)` pair to a concrete package, claims its `name@version` key
//! in an insert-if-absent admission map, and enqueues the package's own
//! dependencies. Each admitted key also records how the winning expansion
//! ended, so concurrent requesters of the same key share one fetch and one
//! outcome. Cycles terminate naturally at the admission map. The first
//! unrecoverable failure cancels the shared token and aborts the siblings.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::integrity::sha256_hex;
use crate::manifest::PackageManifest;
use crate::overrides;
use crate::registry::Registry;
use crate::version::{is_exact_version, parse_version, Range};
use crate::workspaces::{self, WorkspaceInfo};

/// One package admitted into the dependency graph.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedPackage {
    pub name: String,
    pub version: String,
    /// Tarball URL for registry packages; `git+`/`file:`/`link:`/`workspace:`
    /// specs for the other sources.
    pub resolved: String,
    /// SRI spec; empty for non-registry sources.
    pub integrity: String,
    pub dependencies: BTreeMap<String, String>,
    pub dev: bool,
    pub optional: bool,
}

impl ResolvedPackage {
    pub fn spec(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    /// `name@version` -> package. Exactly one entry per spec.
    pub packages: HashMap<String, ResolvedPackage>,
    /// Names of the direct dependencies that seeded resolution.
    pub roots: BTreeSet<String>,
}

/// Where a dependency specifier points.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Source {
    Registry,
    Git { url: String, reference: Option<String> },
    File { path: String },
    Link { path: String },
    Workspace { name: String },
}

fn is_path_spec(spec: &str) -> bool {
    if spec.starts_with("./") || spec.starts_with("../") || spec.starts_with('/') || spec.starts_with("~/") {
        return true;
    }
    // Windows drive path: "C:\..." or "C:/...".
    let bytes = spec.as_bytes();
    bytes.len() > 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
}

fn github_shorthand(spec: &str) -> Option<Source> {
    // "user/repo#ref": exactly one slash, a ref marker, no scheme or spaces.
    let (repo, reference) = spec.split_once('#')?;
    if repo.contains(':') || repo.contains(char::is_whitespace) {
        return None;
    }
    let mut parts = repo.split('/');
    let (user, name) = (parts.next()?, parts.next()?);
    if user.is_empty() || name.is_empty() || parts.next().is_some() {
        return None;
    }
    Some(Source::Git {
        url: format!("https://github.com/{}/{}.git", user, name),
        reference: Some(reference.to_string()),
    })
}

/// Classify a dependency specifier. Workspace names shadow the registry.
pub fn classify(name: &str, spec: &str, workspace_names: &HashMap<String, WorkspaceInfo>) -> Source {
    if spec.starts_with("workspace:") {
        return Source::Workspace { name: name.to_string() };
    }
    if let Some(rest) = spec.strip_prefix("git+") {
        let (url, reference) = match rest.split_once('#') {
            Some((url, r)) => (url.to_string(), Some(r.to_string())),
            None => (rest.to_string(), None),
        };
        return Source::Git { url, reference };
    }
    if spec.starts_with("git://") || spec.starts_with("ssh://") {
        let (url, reference) = match spec.split_once('#') {
            Some((url, r)) => (url.to_string(), Some(r.to_string())),
            None => (spec.to_string(), None),
        };
        return Source::Git { url, reference };
    }
    if let Some(rest) = spec.strip_prefix("github:") {
        let (repo, reference) = match rest.split_once('#') {
            Some((repo, r)) => (repo, Some(r.to_string())),
            None => (rest, None),
        };
        return Source::Git {
            url: format!("https://github.com/{}.git", repo),
            reference,
        };
    }
    if let Some(source) = github_shorthand(spec) {
        return source;
    }
    if let Some(path) = spec.strip_prefix("link:") {
        return Source::Link { path: path.to_string() };
    }
    if let Some(path) = spec.strip_prefix("file:") {
        return Source::File { path: path.to_string() };
    }
    if is_path_spec(spec) {
        return Source::File { path: spec.to_string() };
    }
    if workspace_names.contains_key(name) {
        return Source::Workspace { name: name.to_string() };
    }
    Source::Registry
}

/// Deterministic pseudo-version for git/file/link specs, so the dedup key is
/// stable across processes.
fn pseudo_version(spec: &str) -> String {
    format!("0.0.0-{}", &sha256_hex(spec)[..12])
}

#[derive(Clone, Debug)]
struct DepRequest {
    name: String,
    range: String,
    dev: bool,
    /// Recoverable on registry 404 / integrity mismatch.
    optional: bool,
}

/// Final outcome of one admitted expansion, shared with every requester of
/// the same key.
type Settlement = std::result::Result<(), Error>;

struct ResolverState<R> {
    registry: Arc<R>,
    project_dir: PathBuf,
    root_manifest: PackageManifest,
    workspace_map: HashMap<String, WorkspaceInfo>,
    /// Admission map: the first inserter of a `name@version` key expands it;
    /// the watch channel publishes how that expansion ended.
    admitted: DashMap<String, watch::Sender<Option<Settlement>>>,
    packages: DashMap<String, ResolvedPackage>,
    token: CancellationToken,
}

pub struct Resolver<R: Registry> {
    state: Arc<ResolverState<R>>,
}

impl<R: Registry> Resolver<R> {
    pub fn new(
        registry: Arc<R>,
        project_dir: &Path,
        root_manifest: PackageManifest,
        token: CancellationToken,
    ) -> Result<Self> {
        let discovered = workspaces::discover(project_dir, &root_manifest)?;
        Ok(Self {
            state: Arc::new(ResolverState {
                registry,
                project_dir: project_dir.to_path_buf(),
                root_manifest,
                workspace_map: workspaces::by_name(&discovered),
                admitted: DashMap::new(),
                packages: DashMap::new(),
                token,
            }),
        })
    }

    /// Resolve the full graph for the root manifest's direct dependencies.
    pub async fn resolve(&self) -> Result<DependencyGraph> {
        let mut roots = BTreeSet::new();
        let mut seeds = Vec::new();
        for (name, range) in &self.state.root_manifest.dependencies {
            roots.insert(name.clone());
            seeds.push(DepRequest {
                name: name.clone(),
                range: range.clone(),
                dev: false,
                optional: false,
            });
        }
        for (name, range) in &self.state.root_manifest.dev_dependencies {
            roots.insert(name.clone());
            seeds.push(DepRequest {
                name: name.clone(),
                range: range.clone(),
                dev: true,
                optional: false,
            });
        }
        for (name, range) in &self.state.root_manifest.optional_dependencies {
            roots.insert(name.clone());
            seeds.push(DepRequest {
                name: name.clone(),
                range: range.clone(),
                dev: false,
                optional: true,
            });
        }

        let mut tasks: JoinSet<(DepRequest, Result<Vec<DepRequest>>)> = JoinSet::new();
        for req in seeds {
            let state = Arc::clone(&self.state);
            tasks.spawn(async move {
                let outcome = resolve_one(&state, &req).await;
                (req, outcome)
            });
        }

        let mut first_error: Option<Error> = None;
        while let Some(joined) = tasks.join_next().await {
            let (req, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    first_error.get_or_insert(Error::Unsupported(format!(
                        "resolver task failed: {}",
                        e
                    )));
                    continue;
                }
            };
            match outcome {
                Ok(transitive) => {
                    if first_error.is_some() {
                        continue;
                    }
                    for next in transitive {
                        let state = Arc::clone(&self.state);
                        tasks.spawn(async move {
                            let outcome = resolve_one(&state, &next).await;
                            (next, outcome)
                        });
                    }
                }
                Err(e) if req.optional && e.is_optional_recoverable() => {
                    crate::log::warn(&format!(
                        "skipping optional dependency {}@{}: {}",
                        req.name, req.range, e
                    ));
                }
                Err(Error::Canceled) => {
                    first_error.get_or_insert(Error::Canceled);
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                        // Abort the siblings; in-flight HTTP observes the token.
                        self.state.token.cancel();
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        let packages = self
            .state
            .packages
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        Ok(DependencyGraph { packages, roots })
    }
}

/// Resolve one request to a concrete package and return its transitive
/// dependency requests. Returns an empty list when another task already
/// expanded the same `name@version` successfully; a failed expansion
/// surfaces its error to this requester too.
async fn resolve_one<R: Registry>(
    state: &ResolverState<R>,
    req: &DepRequest,
) -> Result<Vec<DepRequest>> {
    if state.token.is_cancelled() {
        return Err(Error::Canceled);
    }

    // Root-level overrides and resolutions substitute the requested range.
    let range = overrides::replacement_for(&state.root_manifest, &req.name)
        .unwrap_or_else(|| req.range.clone());

    let source = classify(&req.name, &range, &state.workspace_map);
    let resolved = match source {
        Source::Registry => resolve_registry(state, &req.name, &range, req).await?,
        Source::Git { url, reference } => {
            resolve_git(state, &req.name, &range, url, reference, req).await?
        }
        Source::File { path } => resolve_path(state, &req.name, &range, &path, false, req).await?,
        Source::Link { path } => resolve_path(state, &req.name, &range, &path, true, req).await?,
        Source::Workspace { name } => resolve_workspace(state, &name, &range, req).await?,
    };

    let Some(package) = resolved else {
        return Ok(Vec::new()); // an earlier winner expanded this key
    };

    let transitive = package
        .dependencies
        .iter()
        .map(|(name, range)| DepRequest {
            name: name.clone(),
            range: range.clone(),
            dev: req.dev,
            optional: req.optional,
        })
        .collect();
    Ok(transitive)
}

/// Either this task claimed the key and must expand it, or another task did
/// and this is how its expansion ended.
enum Admission {
    Winner,
    Settled(Settlement),
}

/// Claim a graph key, or wait for the claimant's outcome. Admission means
/// someone is doing the work, not that the work already succeeded: a loser
/// observes the winner's actual result, so a required edge still fails when
/// the winning expansion failed.
async fn admit<R>(state: &ResolverState<R>, key: &str) -> Admission {
    let waiter = match state.admitted.entry(key.to_string()) {
        Entry::Occupied(entry) => Some(entry.get().subscribe()),
        Entry::Vacant(entry) => {
            let (tx, _) = watch::channel(None);
            entry.insert(tx);
            None
        }
    };
    let Some(mut waiter) = waiter else {
        return Admission::Winner;
    };
    let result = match waiter.wait_for(|outcome| outcome.is_some()).await {
        Ok(outcome) => Admission::Settled((*outcome).clone().unwrap_or(Ok(()))),
        // Winner torn down before settling.
        Err(_) => Admission::Settled(Err(Error::Canceled)),
    };
    result
}

fn settle<R>(state: &ResolverState<R>, key: &str, outcome: Settlement) {
    if let Some(slot) = state.admitted.get(key) {
        let _ = slot.send(Some(outcome));
    }
}

/// Admission wrapper around one expansion. On success the package joins the
/// graph before the key settles, so a settled Ok implies the package is
/// present; on failure every requester of the key sees the same error.
async fn finish_admitted<R, F>(
    state: &ResolverState<R>,
    key: String,
    fetch: F,
) -> Result<Option<ResolvedPackage>>
where
    F: std::future::Future<Output = Result<ResolvedPackage>>,
{
    match admit(state, &key).await {
        Admission::Settled(Ok(())) => return Ok(None),
        Admission::Settled(Err(e)) => return Err(e),
        Admission::Winner => {}
    }
    match fetch.await {
        Ok(package) => {
            state.packages.insert(key.clone(), package.clone());
            settle(state, &key, Ok(()));
            Ok(Some(package))
        }
        Err(e) => {
            settle(state, &key, Err(e.clone()));
            Err(e)
        }
    }
}

async fn resolve_registry<R: Registry>(
    state: &ResolverState<R>,
    name: &str,
    range: &str,
    req: &DepRequest,
) -> Result<Option<ResolvedPackage>> {
    let version = if is_exact_version(range) {
        parse_version(range)?.to_string()
    } else {
        let parsed = Range::parse(range)?;
        let versions = state.registry.versions(name, &state.token).await?;
        parsed
            .max_satisfying(versions.iter().map(String::as_str))
            .ok_or_else(|| Error::RegistryNotFound {
                package: format!("{}@{}", name, range),
            })?
            .to_string()
    };

    let key = format!("{}@{}", name, version);
    finish_admitted(state, key, async {
        let manifest = state.registry.manifest(name, &version, &state.token).await?;
        let integrity = match manifest.dist_integrity() {
            Some(spec) => spec,
            None => state.registry.integrity(name, &version, &state.token).await?,
        };
        Ok(ResolvedPackage {
            name: name.to_string(),
            version: version.clone(),
            resolved: manifest.dist_tarball().unwrap_or_default(),
            integrity,
            dependencies: manifest.dependencies,
            dev: req.dev,
            optional: false,
        })
    })
    .await
}

async fn resolve_git<R>(
    state: &ResolverState<R>,
    name: &str,
    range: &str,
    url: String,
    reference: Option<String>,
    req: &DepRequest,
) -> Result<Option<ResolvedPackage>> {
    let version = pseudo_version(range);
    let key = format!("{}@{}", name, version);
    finish_admitted(state, key, async {
        let manifest = fetch_git_manifest(&url, reference.as_deref(), &state.token).await?;
        let resolved = match &reference {
            Some(r) => format!("git+{}#{}", url, r),
            None => format!("git+{}", url),
        };
        Ok(ResolvedPackage {
            name: name.to_string(),
            version: version.clone(),
            resolved,
            integrity: String::new(),
            dependencies: manifest.dependencies,
            dev: req.dev,
            optional: false,
        })
    })
    .await
}

async fn resolve_path<R>(
    state: &ResolverState<R>,
    name: &str,
    range: &str,
    path: &str,
    link: bool,
    req: &DepRequest,
) -> Result<Option<ResolvedPackage>> {
    let version = pseudo_version(range);
    let key = format!("{}@{}", name, version);
    finish_admitted(state, key, async {
        let dir = if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            state.project_dir.join(path)
        };
        let manifest = PackageManifest::read_dir(&dir)?;
        let scheme = if link { "link" } else { "file" };
        Ok(ResolvedPackage {
            name: name.to_string(),
            version: version.clone(),
            resolved: format!("{}:{}", scheme, path),
            integrity: String::new(),
            dependencies: manifest.dependencies,
            dev: req.dev,
            optional: false,
        })
    })
    .await
}

async fn resolve_workspace<R>(
    state: &ResolverState<R>,
    name: &str,
    range: &str,
    req: &DepRequest,
) -> Result<Option<ResolvedPackage>> {
    let info = state
        .workspace_map
        .get(name)
        .ok_or_else(|| Error::WorkspaceNotFound { name: name.to_string() })?;
    let declared = if info.manifest.version.is_empty() {
        "0.0.0".to_string()
    } else {
        info.manifest.version.clone()
    };

    // "workspace:1.2.3" pins an exact version; a mismatch is fatal.
    if let Some(wanted) = range.strip_prefix("workspace:") {
        if is_exact_version(wanted) {
            let wanted = parse_version(wanted)?;
            let actual = parse_version(&declared)?;
            if wanted != actual {
                return Err(Error::ManifestMalformed {
                    package: name.to_string(),
                    detail: format!(
                        "workspace pins {} but {} is checked out",
                        wanted, actual
                    ),
                });
            }
        }
    }

    let key = format!("{}@{}", name, declared);
    finish_admitted(state, key, async {
        Ok(ResolvedPackage {
            name: name.to_string(),
            version: declared.clone(),
            resolved: format!("workspace:{}", info.relative_path),
            integrity: String::new(),
            dependencies: info.manifest.dependencies.clone(),
            dev: req.dev,
            optional: false,
        })
    })
    .await
}

/// Shallow-clone a git dependency into `dest`, checking out a ref when one
/// is given. The clone goes through the system `git` binary.
pub(crate) async fn clone_git(
    url: &str,
    reference: Option<&str>,
    dest: &Path,
    token: &CancellationToken,
) -> Result<()> {
    let dest_str = dest.to_string_lossy().into_owned();
    run_git(&["clone", "--depth", "1", url, &dest_str], token).await?;
    if let Some(reference) = reference {
        run_git(&["-C", &dest_str, "fetch", "--depth", "1", "origin", reference], token).await?;
        run_git(&["-C", &dest_str, "checkout", "FETCH_HEAD"], token).await?;
    }
    Ok(())
}

/// Clone into a scratch directory just long enough to read the manifest.
async fn fetch_git_manifest(
    url: &str,
    reference: Option<&str>,
    token: &CancellationToken,
) -> Result<PackageManifest> {
    let scratch = std::env::temp_dir().join(format!(
        "skiff-git-{:016x}",
        rand::thread_rng().gen::<u64>()
    ));
    let result = match clone_git(url, reference, &scratch, token).await {
        Ok(()) => PackageManifest::read_dir(&scratch),
        Err(e) => Err(e),
    };
    let _ = tokio::fs::remove_dir_all(&scratch).await;
    result
}

async fn run_git(args: &[&str], token: &CancellationToken) -> Result<()> {
    let mut child = tokio::process::Command::new("git")
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| Error::ProcessFailed { code: -1, detail: format!("git: {}", e) })?;

    let status = tokio::select! {
        _ = token.cancelled() => {
            let _ = child.kill().await;
            return Err(Error::Canceled);
        }
        status = child.wait() => {
            status.map_err(|e| Error::ProcessFailed { code: -1, detail: e.to_string() })?
        }
    };
    if !status.success() {
        return Err(Error::ProcessFailed {
            code: status.code().unwrap_or(-1),
            detail: format!("git {}", args.join(" ")),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockRegistry;

    fn root(json: &str) -> PackageManifest {
        PackageManifest::parse("root", json).expect("root manifest")
    }

    fn resolver(registry: MockRegistry, dir: &Path, manifest: PackageManifest) -> Resolver<MockRegistry> {
        Resolver::new(Arc::new(registry), dir, manifest, CancellationToken::new())
            .expect("resolver")
    }

    #[tokio::test]
    async fn resolves_transitive_and_shared_dependencies() {
        let mut reg = MockRegistry::default();
        reg.add("express", "4.18.2", &[("accepts", "~1.3.8"), ("array-flatten", "1.1.1")]);
        reg.add("accepts", "1.3.8", &[]);
        reg.add("array-flatten", "1.1.1", &[]);

        let td = tempfile::tempdir().expect("tmp");
        let r = resolver(reg, td.path(), root(r#"{"dependencies": {"express": "^4.18.0"}}"#));
        let graph = r.resolve().await.expect("resolve");

        assert_eq!(graph.packages.len(), 3);
        assert!(graph.packages.contains_key("express@4.18.2"));
        assert!(graph.packages.contains_key("accepts@1.3.8"));
        assert!(graph.packages.contains_key("array-flatten@1.1.1"));
        assert_eq!(graph.roots, BTreeSet::from(["express".to_string()]));

        let express = &graph.packages["express@4.18.2"];
        assert!(express.resolved.ends_with("express-4.18.2.tgz"));
        assert!(express.integrity.starts_with("sha512-"));
    }

    #[tokio::test]
    async fn dev_dependencies_are_flagged() {
        let mut reg = MockRegistry::default();
        reg.add("express", "4.18.2", &[]);
        reg.add("typescript", "5.0.0", &[]);

        let td = tempfile::tempdir().expect("tmp");
        let r = resolver(
            reg,
            td.path(),
            root(r#"{
                "dependencies": {"express": "^4.18.0"},
                "devDependencies": {"typescript": "^5.0.0"}
            }"#),
        );
        let graph = r.resolve().await.expect("resolve");

        assert!(graph.packages["typescript@5.0.0"].dev);
        assert!(!graph.packages["express@4.18.2"].dev);
    }

    #[tokio::test]
    async fn range_resolution_picks_maximum_satisfying() {
        let mut reg = MockRegistry::default();
        for v in ["1.0.0", "1.0.5", "1.1.0", "2.0.0"] {
            reg.add("lib", v, &[]);
        }
        let td = tempfile::tempdir().expect("tmp");
        let r = resolver(reg, td.path(), root(r#"{"dependencies": {"lib": "^1.0.0"}}"#));
        let graph = r.resolve().await.expect("resolve");

        assert_eq!(graph.packages.len(), 1);
        assert!(graph.packages.contains_key("lib@1.1.0"));
    }

    #[tokio::test]
    async fn exact_versions_skip_the_versions_fetch() {
        let mut reg = MockRegistry::default();
        reg.add("lib", "1.0.5", &[]);
        let td = tempfile::tempdir().expect("tmp");
        let r = resolver(reg, td.path(), root(r#"{"dependencies": {"lib": "1.0.5"}}"#));
        let graph = r.resolve().await.expect("resolve");

        assert!(graph.packages.contains_key("lib@1.0.5"));
        let calls = r.state.registry.calls.lock().unwrap().clone();
        assert!(!calls.iter().any(|c| c.starts_with("versions")));
    }

    #[tokio::test]
    async fn duplicate_ranges_resolve_to_one_entry() {
        let mut reg = MockRegistry::default();
        reg.add("a", "1.0.0", &[("shared", "^2.0.0")]);
        reg.add("b", "1.0.0", &[("shared", "^2.1.0")]);
        reg.add("shared", "2.1.3", &[]);

        let td = tempfile::tempdir().expect("tmp");
        let r = resolver(
            reg,
            td.path(),
            root(r#"{"dependencies": {"a": "1.0.0", "b": "1.0.0"}}"#),
        );
        let graph = r.resolve().await.expect("resolve");

        assert_eq!(graph.packages.len(), 3);
        // Exactly one manifest fetch for the shared dep despite two requests.
        let calls = r.state.registry.calls.lock().unwrap().clone();
        let shared_fetches =
            calls.iter().filter(|c| c.as_str() == "manifest shared@2.1.3").count();
        assert_eq!(shared_fetches, 1);
    }

    #[tokio::test]
    async fn missing_required_dependency_is_fatal() {
        let mut reg = MockRegistry::default();
        reg.add("a", "1.0.0", &[("ghost", "^1.0.0")]);
        let td = tempfile::tempdir().expect("tmp");
        let r = resolver(reg, td.path(), root(r#"{"dependencies": {"a": "1.0.0"}}"#));
        let err = r.resolve().await.unwrap_err();
        assert!(matches!(err, Error::RegistryNotFound { .. }));
    }

    #[tokio::test]
    async fn missing_optional_dependency_is_skipped() {
        let mut reg = MockRegistry::default();
        reg.add("a", "1.0.0", &[]);
        let td = tempfile::tempdir().expect("tmp");
        let r = resolver(
            reg,
            td.path(),
            root(r#"{
                "dependencies": {"a": "1.0.0"},
                "optionalDependencies": {"fsevents": "^2.0.0"}
            }"#),
        );
        let graph = r.resolve().await.expect("resolve");
        assert_eq!(graph.packages.len(), 1);
        assert!(graph.packages.contains_key("a@1.0.0"));
        // Optional roots still count as roots even when omitted.
        assert!(graph.roots.contains("fsevents"));
    }

    #[tokio::test]
    async fn settled_failure_reaches_required_requesters_of_same_version() {
        // "foo" is listed but its manifest 404s. The root wants it as an
        // optional dependency while "bar" needs the exact same version as a
        // required one, so two requests race for the foo@1.0.0 key. The
        // required edge must fail the resolution no matter which request
        // claims the key first; the package must never be dropped silently.
        let mut reg = MockRegistry::default();
        reg.add("bar", "1.0.0", &[("foo", "1.0.0")]);
        reg.add("foo", "1.0.0", &[]);
        reg.drop_manifest("foo", "1.0.0");

        let td = tempfile::tempdir().expect("tmp");
        let r = resolver(
            reg,
            td.path(),
            root(r#"{
                "dependencies": {"bar": "1.0.0"},
                "optionalDependencies": {"foo": "^1.0.0"}
            }"#),
        );
        let err = r.resolve().await.unwrap_err();
        assert!(matches!(err, Error::RegistryNotFound { .. }));
    }

    #[tokio::test]
    async fn settled_failure_is_still_recoverable_for_optional_requesters() {
        // Same race, but every edge to the failing package is optional: the
        // failure settles once and each requester swallows it, so the rest
        // of the graph resolves.
        let mut reg = MockRegistry::default();
        reg.add("a", "1.0.0", &[]);
        reg.add("foo", "1.0.0", &[]);
        reg.drop_manifest("foo", "1.0.0");

        let td = tempfile::tempdir().expect("tmp");
        let r = resolver(
            reg,
            td.path(),
            root(r#"{
                "dependencies": {"a": "1.0.0"},
                "optionalDependencies": {"foo": "1.0.0"}
            }"#),
        );
        let graph = r.resolve().await.expect("resolve");
        assert_eq!(graph.packages.len(), 1);
        assert!(graph.packages.contains_key("a@1.0.0"));
    }

    #[tokio::test]
    async fn overrides_substitute_the_requested_range() {
        let mut reg = MockRegistry::default();
        reg.add("a", "1.0.0", &[("minimist", "^0.0.8")]);
        reg.add("minimist", "0.0.8", &[]);
        reg.add("minimist", "1.2.8", &[]);

        let td = tempfile::tempdir().expect("tmp");
        let r = resolver(
            reg,
            td.path(),
            root(r#"{
                "dependencies": {"a": "1.0.0"},
                "overrides": {"minimist": "1.2.8"}
            }"#),
        );
        let graph = r.resolve().await.expect("resolve");
        assert!(graph.packages.contains_key("minimist@1.2.8"));
        assert!(!graph.packages.contains_key("minimist@0.0.8"));
    }

    #[tokio::test]
    async fn dependency_cycles_terminate() {
        let mut reg = MockRegistry::default();
        reg.add("ping", "1.0.0", &[("pong", "1.0.0")]);
        reg.add("pong", "1.0.0", &[("ping", "1.0.0")]);
        let td = tempfile::tempdir().expect("tmp");
        let r = resolver(reg, td.path(), root(r#"{"dependencies": {"ping": "1.0.0"}}"#));
        let graph = r.resolve().await.expect("resolve");
        assert_eq!(graph.packages.len(), 2);
    }

    #[tokio::test]
    async fn workspace_dependencies_resolve_locally() {
        let td = tempfile::tempdir().expect("tmp");
        std::fs::create_dir_all(td.path().join("packages/ui")).expect("dirs");
        std::fs::write(
            td.path().join("packages/ui/package.json"),
            r#"{"name": "ui", "version": "3.1.0", "dependencies": {"lodash": "4.17.21"}}"#,
        )
        .expect("write");

        let mut reg = MockRegistry::default();
        reg.add("lodash", "4.17.21", &[]);

        let r = resolver(
            reg,
            td.path(),
            root(r#"{
                "workspaces": ["packages/*"],
                "dependencies": {"ui": "workspace:*"}
            }"#),
        );
        let graph = r.resolve().await.expect("resolve");

        let ui = &graph.packages["ui@3.1.0"];
        assert_eq!(ui.resolved, "workspace:packages/ui");
        assert!(ui.integrity.is_empty());
        // The workspace's own dependencies were walked.
        assert!(graph.packages.contains_key("lodash@4.17.21"));
    }

    #[tokio::test]
    async fn workspace_exact_version_mismatch_is_fatal() {
        let td = tempfile::tempdir().expect("tmp");
        std::fs::create_dir_all(td.path().join("packages/ui")).expect("dirs");
        std::fs::write(
            td.path().join("packages/ui/package.json"),
            r#"{"name": "ui", "version": "3.1.0"}"#,
        )
        .expect("write");

        let r = resolver(
            MockRegistry::default(),
            td.path(),
            root(r#"{
                "workspaces": ["packages/*"],
                "dependencies": {"ui": "workspace:2.0.0"}
            }"#),
        );
        let err = r.resolve().await.unwrap_err();
        assert!(matches!(err, Error::ManifestMalformed { .. }));
    }

    #[tokio::test]
    async fn file_dependencies_use_pseudo_versions() {
        let td = tempfile::tempdir().expect("tmp");
        std::fs::create_dir_all(td.path().join("vendor/local-lib")).expect("dirs");
        std::fs::write(
            td.path().join("vendor/local-lib/package.json"),
            r#"{"name": "local-lib", "version": "0.5.0"}"#,
        )
        .expect("write");

        let r = resolver(
            MockRegistry::default(),
            td.path(),
            root(r#"{"dependencies": {"local-lib": "file:vendor/local-lib"}}"#),
        );
        let graph = r.resolve().await.expect("resolve");

        let (spec, pkg) = graph.packages.iter().next().expect("one package");
        assert!(spec.starts_with("local-lib@0.0.0-"));
        assert_eq!(pkg.resolved, "file:vendor/local-lib");
        assert!(pkg.integrity.is_empty());
        // Pseudo-versions are deterministic.
        assert_eq!(pkg.version, pseudo_version("file:vendor/local-lib"));
    }

    #[tokio::test]
    async fn cancellation_aborts_resolution() {
        let mut reg = MockRegistry::default();
        reg.add("a", "1.0.0", &[]);
        let td = tempfile::tempdir().expect("tmp");
        let token = CancellationToken::new();
        token.cancel();
        let r = Resolver::new(
            Arc::new(reg),
            td.path(),
            root(r#"{"dependencies": {"a": "1.0.0"}}"#),
            token,
        )
        .expect("resolver");
        let err = r.resolve().await.unwrap_err();
        assert_eq!(err, Error::Canceled);
    }

    #[test]
    fn classification_table() {
        let no_ws = HashMap::new();
        assert_eq!(classify("a", "^1.0.0", &no_ws), Source::Registry);
        assert_eq!(classify("a", "latest", &no_ws), Source::Registry);
        assert_eq!(
            classify("a", "git+https://github.com/u/r.git#main", &no_ws),
            Source::Git {
                url: "https://github.com/u/r.git".into(),
                reference: Some("main".into())
            }
        );
        assert_eq!(
            classify("a", "github:u/r", &no_ws),
            Source::Git { url: "https://github.com/u/r.git".into(), reference: None }
        );
        assert_eq!(
            classify("a", "u/r#v2", &no_ws),
            Source::Git {
                url: "https://github.com/u/r.git".into(),
                reference: Some("v2".into())
            }
        );
        assert_eq!(classify("a", "file:../lib", &no_ws), Source::File { path: "../lib".into() });
        assert_eq!(classify("a", "./lib", &no_ws), Source::File { path: "./lib".into() });
        assert_eq!(classify("a", "C:\\dev\\lib", &no_ws), Source::File { path: "C:\\dev\\lib".into() });
        assert_eq!(classify("a", "link:../lib", &no_ws), Source::Link { path: "../lib".into() });
        assert_eq!(
            classify("a", "workspace:^1.0.0", &no_ws),
            Source::Workspace { name: "a".into() }
        );
    }
}
