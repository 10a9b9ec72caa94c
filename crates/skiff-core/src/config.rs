//! Configuration from .npmrc files and environment.
//! Project .npmrc wins over ~/.npmrc; SKIFF_* environment variables win over both.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org";
const DEFAULT_MAX_RETRIES: usize = 3;
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_SOCKETS: usize = 32;

/// Cache directory: SKIFF_CACHE_DIR, else ~/.skiff-cache.
pub fn default_cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SKIFF_CACHE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".skiff-cache")
}

/// Store directory: SKIFF_STORE_DIR, else ~/.skiff-store.
pub fn default_store_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SKIFF_STORE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".skiff-store")
}

/// Resolved configuration. CLI flags and env have already been folded in by `load`.
#[derive(Clone, Debug)]
pub struct Config {
    pub registry: String,
    /// "@scope" -> registry base URL.
    pub scoped_registries: HashMap<String, String>,
    /// registry host -> bearer token, from `//host/:_authToken=...` lines.
    pub auth_tokens: HashMap<String, String>,
    pub proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
    pub strict_ssl: bool,
    pub ca: Option<String>,
    pub user_agent: String,
    pub max_sockets: usize,
    pub cache_dir: PathBuf,
    pub store_dir: PathBuf,
    pub use_symlinks: bool,
    pub use_hardlinks: bool,
    pub max_retries: usize,
    pub http_timeout: Duration,
    pub verify_signatures: bool,
    pub delta_updates: bool,
    pub zero_installs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry: DEFAULT_REGISTRY.to_string(),
            scoped_registries: HashMap::new(),
            auth_tokens: HashMap::new(),
            proxy: None,
            https_proxy: None,
            no_proxy: None,
            strict_ssl: true,
            ca: None,
            user_agent: format!("skiff/{}", env!("CARGO_PKG_VERSION")),
            max_sockets: DEFAULT_MAX_SOCKETS,
            cache_dir: default_cache_dir(),
            store_dir: default_store_dir(),
            use_symlinks: false,
            use_hardlinks: true,
            max_retries: DEFAULT_MAX_RETRIES,
            http_timeout: Duration::from_millis(DEFAULT_HTTP_TIMEOUT_MS),
            verify_signatures: false,
            delta_updates: false,
            zero_installs: false,
        }
    }
}

impl Config {
    /// Registry base URL for a package name, honouring scoped registries.
    pub fn registry_for(&self, name: &str) -> &str {
        if let Some(scope) = name.strip_prefix('@').and_then(|rest| rest.split('/').next()) {
            let key = format!("@{}", scope);
            if let Some(url) = self.scoped_registries.get(&key) {
                return url;
            }
        }
        &self.registry
    }

    /// Bearer token for the host of a registry URL, if configured.
    pub fn auth_token_for(&self, url: &str) -> Option<&str> {
        let host = url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .split('/')
            .next()?;
        self.auth_tokens.get(host).map(String::as_str)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Apply a single `key=value` pair from an rc file. Unknown keys are ignored.
fn apply_pair(cfg: &mut Config, key: &str, value: &str) {
    let value = value.trim().trim_matches('"');
    match key {
        "registry" => cfg.registry = value.trim_end_matches('/').to_string(),
        "proxy" => cfg.proxy = Some(value.to_string()),
        "https-proxy" => cfg.https_proxy = Some(value.to_string()),
        "no-proxy" | "noproxy" => cfg.no_proxy = Some(value.to_string()),
        "strict-ssl" => {
            if let Some(b) = parse_bool(value) {
                cfg.strict_ssl = b;
            }
        }
        "ca" => cfg.ca = Some(value.to_string()),
        "user-agent" => cfg.user_agent = value.to_string(),
        "maxsockets" => {
            if let Ok(n) = value.parse::<usize>() {
                cfg.max_sockets = n.max(1);
            }
        }
        "cache-dir" => cfg.cache_dir = PathBuf::from(value),
        "store-dir" => cfg.store_dir = PathBuf::from(value),
        "use-symlinks" => {
            if let Some(b) = parse_bool(value) {
                cfg.use_symlinks = b;
            }
        }
        "use-hardlinks" => {
            if let Some(b) = parse_bool(value) {
                cfg.use_hardlinks = b;
            }
        }
        "max-retries" => {
            if let Ok(n) = value.parse::<usize>() {
                cfg.max_retries = n;
            }
        }
        "http-timeout" => {
            if let Ok(ms) = value.parse::<u64>() {
                cfg.http_timeout = Duration::from_millis(ms);
            }
        }
        "verify-signatures" => {
            if let Some(b) = parse_bool(value) {
                cfg.verify_signatures = b;
            }
        }
        "delta-updates" => {
            if let Some(b) = parse_bool(value) {
                cfg.delta_updates = b;
            }
        }
        "zero-installs" => {
            if let Some(b) = parse_bool(value) {
                cfg.zero_installs = b;
            }
        }
        _ => {
            if let Some(scope) = key.strip_suffix(":registry") {
                if scope.starts_with('@') {
                    cfg.scoped_registries
                        .insert(scope.to_string(), value.trim_end_matches('/').to_string());
                }
            } else if key.starts_with("//") {
                // //registry.npmjs.org/:_authToken=TOKEN
                if let Some(host_part) = key.strip_prefix("//") {
                    if let Some(host) = host_part.strip_suffix("/:_authToken") {
                        cfg.auth_tokens
                            .insert(host.trim_end_matches('/').to_string(), value.to_string());
                    }
                }
            }
        }
    }
}

fn apply_file(cfg: &mut Config, path: &Path, seen: &mut std::collections::HashSet<String>) {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        // First file to set a key wins; project rc is applied before the user rc.
        if seen.insert(key.to_string()) {
            apply_pair(cfg, key, value);
        }
    }
}

fn apply_env(cfg: &mut Config) {
    if let Ok(url) = std::env::var("SKIFF_REGISTRY") {
        if !url.is_empty() {
            cfg.registry = url.trim_end_matches('/').to_string();
        }
    }
    if let Ok(n) = std::env::var("SKIFF_HTTP_RETRIES") {
        if let Ok(n) = n.parse::<usize>() {
            cfg.max_retries = n;
        }
    }
    if let Ok(n) = std::env::var("SKIFF_NETWORK_CONCURRENCY") {
        if let Ok(n) = n.parse::<usize>() {
            cfg.max_sockets = n.max(1);
        }
    }
    if let Ok(dir) = std::env::var("SKIFF_CACHE_DIR") {
        cfg.cache_dir = PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("SKIFF_STORE_DIR") {
        cfg.store_dir = PathBuf::from(dir);
    }
}

/// Load configuration for a project directory: `<dir>/.npmrc`, then `~/.npmrc`,
/// then environment overrides.
pub fn load(dir: &Path) -> Config {
    let mut cfg = Config::default();
    let mut seen = std::collections::HashSet::new();
    apply_file(&mut cfg, &dir.join(".npmrc"), &mut seen);
    if let Some(home) = dirs::home_dir() {
        apply_file(&mut cfg, &home.join(".npmrc"), &mut seen);
    }
    apply_env(&mut cfg);
    cfg
}
