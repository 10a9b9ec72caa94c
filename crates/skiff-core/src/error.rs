//! Error types shared by every skiff subsystem.
//! One enum, one variant per failure kind, with the offending package spec
//! carried wherever it is known.

use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for skiff operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A version string did not parse as SemVer.
    InvalidVersion(String),
    /// A range expression did not parse.
    InvalidRange(String),
    /// package.json or a packument was not usable JSON.
    ManifestMalformed { package: String, detail: String },
    /// Registry answered with a non-success status that is not 404.
    RegistryHttp { package: String, status: u16 },
    /// Registry answered 404.
    RegistryNotFound { package: String },
    /// Transport-level failure talking to the registry.
    Network { package: String, detail: String },
    /// Downloaded bytes did not match the expected integrity spec.
    IntegrityMismatch { package: String, expected: String },
    /// Two lockfile entries share a spec but disagree on version/resolved/integrity.
    LockfileMismatch { spec: String, detail: String },
    /// Lockfile format not recognised or not parseable.
    LockfileUnsupported(String),
    /// I/O failure inside the package cache.
    CacheIo { detail: String },
    /// I/O failure inside the content-addressable store.
    StoreIo { detail: String },
    /// Unsupported algorithm, platform, or protocol.
    Unsupported(String),
    /// An operation exceeded its deadline.
    Timeout { what: String, after_ms: u64 },
    /// The shared cancellation token fired.
    Canceled,
    /// Script pool queue is at capacity.
    ScriptQueueFull { capacity: usize },
    /// A child process failed to launch or exited non-zero where that is fatal.
    ProcessFailed { code: i32, detail: String },
    /// A workspace: dependency names no discovered workspace.
    WorkspaceNotFound { name: String },
}

impl Error {
    /// Wrap an I/O error from the cache layer.
    pub fn cache_io(err: impl fmt::Display) -> Self {
        Error::CacheIo { detail: err.to_string() }
    }

    /// Wrap an I/O error from the store layer.
    pub fn store_io(err: impl fmt::Display) -> Self {
        Error::StoreIo { detail: err.to_string() }
    }

    /// True for failures that an optionalDependencies entry is allowed to swallow.
    pub fn is_optional_recoverable(&self) -> bool {
        matches!(
            self,
            Error::RegistryNotFound { .. } | Error::IntegrityMismatch { .. }
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidVersion(v) => write!(f, "Invalid version \"{}\"", v),
            Error::InvalidRange(r) => write!(f, "Invalid range \"{}\"", r),
            Error::ManifestMalformed { package, detail } => {
                write!(f, "Malformed manifest for {}: {}", package, detail)
            }
            Error::RegistryHttp { package, status } => {
                write!(f, "Registry returned HTTP {} for {}", status, package)
            }
            Error::RegistryNotFound { package } => {
                write!(f, "Package not found in registry: {}", package)
            }
            Error::Network { package, detail } => {
                write!(f, "Network error fetching {}: {}", package, detail)
            }
            Error::IntegrityMismatch { package, expected } => {
                write!(f, "Integrity mismatch for {} (expected {})", package, expected)
            }
            Error::LockfileMismatch { spec, detail } => {
                write!(f, "Conflicting lockfile entries for {}: {}", spec, detail)
            }
            Error::LockfileUnsupported(detail) => write!(f, "Unsupported lockfile: {}", detail),
            Error::CacheIo { detail } => write!(f, "Cache I/O error: {}", detail),
            Error::StoreIo { detail } => write!(f, "Store I/O error: {}", detail),
            Error::Unsupported(what) => write!(f, "Unsupported: {}", what),
            Error::Timeout { what, after_ms } => {
                write!(f, "{} timed out after {}ms", what, after_ms)
            }
            Error::Canceled => write!(f, "Operation canceled"),
            Error::ScriptQueueFull { capacity } => {
                write!(f, "Script queue is full ({} pending)", capacity)
            }
            Error::ProcessFailed { code, detail } => {
                write!(f, "Process failed with exit code {}: {}", code, detail)
            }
            Error::WorkspaceNotFound { name } => {
                write!(f, "Workspace \"{}\" is not declared by the root manifest", name)
            }
        }
    }
}

impl std::error::Error for Error {}
