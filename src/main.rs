//! Thin CLI layer: parse args, styled output, and call into skiff-core.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Arg, ArgAction, Command};
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use skiff_core::install::{install, InstallOptions};
use skiff_core::lockfile;
use skiff_core::registry::RegistryClient;
use skiff_core::runner::{self, ProcessRequest};
use skiff_core::scripts;
use skiff_core::store::Store;
use skiff_core::{workspaces, PackageCache, PackageManifest};

// ---- UI helpers (no-op when stdout isn't a TTY) ----

fn use_color() -> bool {
    std::io::stdout().is_terminal()
        && std::env::var("NO_COLOR").unwrap_or_default().is_empty()
}

fn success(msg: &str) {
    if use_color() {
        println!("{}", msg.green());
    } else {
        println!("{}", msg);
    }
}

fn error(msg: &str) {
    if use_color() {
        eprintln!("{}", msg.red());
    } else {
        eprintln!("{}", msg);
    }
}

fn info(msg: &str) {
    if use_color() {
        println!("{}", msg.cyan());
    } else {
        println!("{}", msg);
    }
}

fn cli() -> Command {
    Command::new("skiff")
        .version(env!("CARGO_PKG_VERSION"))
        .about("npm-compatible package manager with a shared content-addressed store")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("install")
                .about("Install dependencies from package.json")
                .arg(
                    Arg::new("lockfile-only")
                        .long("lockfile-only")
                        .action(ArgAction::SetTrue)
                        .help("Resolve and write the lockfile without touching node_modules"),
                )
                .arg(
                    Arg::new("no-dev")
                        .long("no-dev")
                        .action(ArgAction::SetTrue)
                        .help("Skip devDependencies"),
                )
                .arg(
                    Arg::new("ignore-scripts")
                        .long("ignore-scripts")
                        .action(ArgAction::SetTrue)
                        .help("Do not run lifecycle scripts"),
                ),
        )
        .subcommand(
            Command::new("add")
                .about("Add a dependency to package.json and install it")
                .arg(Arg::new("spec").required(true).help("name or name@range"))
                .arg(
                    Arg::new("dev")
                        .long("dev")
                        .short('D')
                        .action(ArgAction::SetTrue)
                        .help("Add to devDependencies"),
                ),
        )
        .subcommand(
            Command::new("run")
                .about("Run a package.json script")
                .arg(Arg::new("script").required(true)),
        )
        .subcommand(
            Command::new("cache")
                .about("Inspect or clear the tarball cache")
                .subcommand_required(true)
                .subcommand(Command::new("list"))
                .subcommand(Command::new("size"))
                .subcommand(Command::new("clear")),
        )
        .subcommand(
            Command::new("store")
                .about("Inspect or prune the content-addressable store")
                .subcommand_required(true)
                .subcommand(Command::new("size"))
                .subcommand(Command::new("prune")),
        )
        .subcommand(Command::new("workspaces").about("List workspaces declared by the root manifest"))
        .subcommand(
            Command::new("import-lockfile")
                .about("Convert a foreign lockfile (npm/yarn/pnpm) to the canonical format"),
        )
}

async fn cmd_install(
    dir: &Path,
    lockfile_only: bool,
    no_dev: bool,
    ignore_scripts: bool,
) -> skiff_core::Result<()> {
    let config = Arc::new(skiff_core::load_config(dir));
    let registry = Arc::new(RegistryClient::new(Arc::clone(&config))?);
    let options = InstallOptions {
        include_dev: !no_dev,
        lockfile_only,
        run_scripts: !ignore_scripts,
    };
    let report = install(dir, config, registry, options, CancellationToken::new()).await?;
    success(&format!(
        "resolved {} packages ({} downloaded, {} linked, {} bins)",
        report.resolved, report.downloaded, report.linked, report.bins
    ));
    Ok(())
}

/// Split "name@range" / "@scope/name@range" / bare name.
fn split_spec(spec: &str) -> (String, String) {
    if let Some(at) = spec.rfind('@') {
        if at > 0 {
            return (spec[..at].to_string(), spec[at + 1..].to_string());
        }
    }
    (spec.to_string(), "latest".to_string())
}

fn manifest_io_error(path: &Path, err: impl std::fmt::Display) -> skiff_core::Error {
    skiff_core::Error::ManifestMalformed {
        package: path.display().to_string(),
        detail: err.to_string(),
    }
}

async fn cmd_add(dir: &Path, spec: &str, dev: bool) -> skiff_core::Result<()> {
    let (name, range) = split_spec(spec);
    let path = dir.join("package.json");
    let text = std::fs::read_to_string(&path).map_err(|e| manifest_io_error(&path, e))?;
    let mut doc: serde_json::Value =
        serde_json::from_str(&text).map_err(|e| manifest_io_error(&path, e))?;
    let section = if dev { "devDependencies" } else { "dependencies" };
    if !doc[section].is_object() {
        doc[section] = serde_json::json!({});
    }
    doc[section][&name] = serde_json::Value::String(range.clone());
    let updated = serde_json::to_string_pretty(&doc).map_err(|e| manifest_io_error(&path, e))?;
    std::fs::write(&path, updated).map_err(|e| manifest_io_error(&path, e))?;
    info(&format!("added {}@{} to {}", name, range, section));
    cmd_install(dir, false, false, false).await
}

async fn cmd_run(dir: &Path, script: &str) -> skiff_core::Result<i32> {
    let manifest = PackageManifest::read_dir(dir)?;
    let command = scripts::script_command(&manifest, script)?;
    let mut process = ProcessRequest::shell(&command, dir);
    process.env = scripts::script_env(&manifest, Some(script));
    process.workspace_dir = Some(dir.to_path_buf());
    process.timeout = Some(scripts::timeout_for(script));
    let result = runner::execute(&process, &CancellationToken::new()).await?;
    if !result.standard_output.is_empty() {
        println!("{}", result.standard_output);
    }
    if !result.standard_error.is_empty() {
        eprintln!("{}", result.standard_error);
    }
    Ok(result.exit_code)
}

async fn cmd_cache(dir: &Path, action: &str) -> skiff_core::Result<()> {
    let config = skiff_core::load_config(dir);
    let cache = PackageCache::new(config.cache_dir);
    match action {
        "size" => println!("{} bytes", cache.size().await?),
        "clear" => {
            cache.clear().await?;
            success("cache cleared");
        }
        _ => {
            for entry in cache.list().await? {
                println!("{}@{}  {} bytes", entry.name, entry.version, entry.size);
            }
        }
    }
    Ok(())
}

async fn cmd_store(dir: &Path, action: &str) -> skiff_core::Result<()> {
    let config = skiff_core::load_config(dir);
    let store = Store::from_config(&config);
    match action {
        "prune" => {
            let lock = lockfile::LockFile::read(dir)?;
            let keep: std::collections::HashSet<String> = lock.packages.keys().cloned().collect();
            let removed = store.prune(&keep)?;
            success(&format!("pruned {} store entries", removed));
        }
        _ => println!("{} bytes", store.size()?),
    }
    Ok(())
}

fn cmd_workspaces(dir: &Path) -> skiff_core::Result<()> {
    let manifest = PackageManifest::read_dir(dir)?;
    for ws in workspaces::discover(dir, &manifest)? {
        println!("{}  {}", ws.name, ws.relative_path);
    }
    Ok(())
}

fn cmd_import_lockfile(dir: &Path) -> skiff_core::Result<()> {
    let lock = lockfile::import_dir(dir)?;
    lock.write(dir)?;
    success(&format!(
        "imported {} packages into {}",
        lock.packages.len(),
        lockfile::LOCKFILE_NAME
    ));
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    let outcome: skiff_core::Result<i32> = match matches.subcommand() {
        Some(("install", sub)) => cmd_install(
            &cwd,
            sub.get_flag("lockfile-only"),
            sub.get_flag("no-dev"),
            sub.get_flag("ignore-scripts"),
        )
        .await
        .map(|_| 0),
        Some(("add", sub)) => {
            let spec = sub.get_one::<String>("spec").map(String::as_str).unwrap_or_default();
            cmd_add(&cwd, spec, sub.get_flag("dev")).await.map(|_| 0)
        }
        Some(("run", sub)) => {
            let script = sub.get_one::<String>("script").map(String::as_str).unwrap_or_default();
            cmd_run(&cwd, script).await
        }
        Some(("cache", sub)) => {
            let action = sub.subcommand_name().unwrap_or("list");
            cmd_cache(&cwd, action).await.map(|_| 0)
        }
        Some(("store", sub)) => {
            let action = sub.subcommand_name().unwrap_or("size");
            cmd_store(&cwd, action).await.map(|_| 0)
        }
        Some(("workspaces", _)) => cmd_workspaces(&cwd).map(|_| 0),
        Some(("import-lockfile", _)) => cmd_import_lockfile(&cwd).map(|_| 0),
        _ => Ok(2),
    };

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error(&format!("error: {}", e));
            std::process::exit(1);
        }
    }
}
