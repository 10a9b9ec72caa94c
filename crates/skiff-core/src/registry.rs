//! npm registry client: packuments, manifests and tarballs over HTTP with
//! bounded retries, scoped registry routing and bearer auth.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::manifest::PackageManifest;

const RETRY_BASE_DELAY_MS: u64 = 250;
const RETRY_MAX_DELAY_MS: u64 = 30_000;
const RETRY_JITTER_MS: u64 = 1_000;

/// The registry operations the resolver and installer consume. One concrete
/// implementation talks HTTP; tests substitute an in-process double.
pub trait Registry: Send + Sync + 'static {
    /// All published version strings for a package.
    fn versions(
        &self,
        name: &str,
        ct: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// The manifest of one published version.
    fn manifest(
        &self,
        name: &str,
        version: &str,
        ct: &CancellationToken,
    ) -> impl Future<Output = Result<PackageManifest>> + Send;

    /// The `dist.integrity` SRI spec of one published version.
    fn integrity(
        &self,
        name: &str,
        version: &str,
        ct: &CancellationToken,
    ) -> impl Future<Output = Result<String>> + Send;

    /// The gzipped tarball bytes of one published version.
    fn tarball(
        &self,
        name: &str,
        version: &str,
        ct: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// HTTP registry client. Holds one `reqwest::Client` so connections are
/// pooled across all concurrent fetches, and memoises version manifests so
/// a resolve does not fetch the same document twice.
pub struct RegistryClient {
    http: reqwest::Client,
    config: Arc<Config>,
    manifest_cache: dashmap::DashMap<String, PackageManifest>,
}

/// Scoped names are percent-encoded in packument paths: `@scope/pkg` -> `@scope%2Fpkg`.
fn encode_name(name: &str) -> String {
    if name.starts_with('@') {
        name.replace('/', "%2F")
    } else {
        name.to_string()
    }
}

fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

impl RegistryClient {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .pool_max_idle_per_host(config.max_sockets)
            .user_agent(config.user_agent.clone());
        if !config.strict_ssl {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let no_proxy = config.no_proxy.as_deref().and_then(reqwest::NoProxy::from_string);
        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::http(proxy)
                .map_err(|e| Error::Unsupported(format!("proxy {}: {}", proxy, e)))?
                .no_proxy(no_proxy.clone());
            builder = builder.proxy(proxy);
        }
        if let Some(proxy) = &config.https_proxy {
            let proxy = reqwest::Proxy::https(proxy)
                .map_err(|e| Error::Unsupported(format!("https-proxy {}: {}", proxy, e)))?
                .no_proxy(no_proxy);
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|e| Error::Network { package: String::new(), detail: e.to_string() })?;
        Ok(Self { http, config, manifest_cache: dashmap::DashMap::new() })
    }

    fn backoff_delay(&self, attempt: usize) -> Duration {
        let exp = RETRY_BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(16));
        let jitter = rand::thread_rng().gen_range(0..RETRY_JITTER_MS);
        Duration::from_millis(exp.saturating_add(jitter).min(RETRY_MAX_DELAY_MS))
    }

    /// GET with retries. Retries transport errors and 408/429/5xx up to
    /// `max_retries` extra attempts; other statuses are surfaced to the
    /// caller on the first response. Cancellation aborts between and during
    /// attempts.
    async fn get_with_retry(&self, package: &str, url: &str, ct: &CancellationToken) -> Result<reqwest::Response> {
        let mut last_err: Option<Error> = None;
        for attempt in 0..=self.config.max_retries {
            if ct.is_cancelled() {
                return Err(Error::Canceled);
            }
            // The request is rebuilt each attempt: method, URI and headers.
            let mut req = self.http.get(url);
            if let Some(token) = self.config.auth_token_for(url) {
                req = req.bearer_auth(token);
            }
            let outcome = tokio::select! {
                _ = ct.cancelled() => return Err(Error::Canceled),
                res = req.send() => res,
            };
            match outcome {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if resp.status().is_success() {
                        return Ok(resp);
                    }
                    if status == 404 {
                        return Err(Error::RegistryNotFound { package: package.to_string() });
                    }
                    if !is_retryable_status(status) {
                        return Err(Error::RegistryHttp { package: package.to_string(), status });
                    }
                    last_err = Some(Error::RegistryHttp { package: package.to_string(), status });
                }
                Err(e) => {
                    last_err = Some(Error::Network {
                        package: package.to_string(),
                        detail: e.to_string(),
                    });
                }
            }
            if attempt < self.config.max_retries {
                tokio::select! {
                    _ = ct.cancelled() => return Err(Error::Canceled),
                    _ = tokio::time::sleep(self.backoff_delay(attempt)) => {}
                }
            }
        }
        Err(last_err.unwrap_or(Error::Network {
            package: package.to_string(),
            detail: "request failed".to_string(),
        }))
    }

    async fn get_json(&self, package: &str, url: &str, ct: &CancellationToken) -> Result<serde_json::Value> {
        let resp = self.get_with_retry(package, url, ct).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::Network { package: package.to_string(), detail: e.to_string() })?;
        serde_json::from_slice(&bytes).map_err(|e| Error::ManifestMalformed {
            package: package.to_string(),
            detail: e.to_string(),
        })
    }

    /// Fetch the full packument for a package.
    pub async fn packument(&self, name: &str, ct: &CancellationToken) -> Result<serde_json::Value> {
        let base = self.config.registry_for(name).trim_end_matches('/');
        let url = format!("{}/{}", base, encode_name(name));
        self.get_json(name, &url, ct).await
    }

    async fn version_manifest(
        &self,
        name: &str,
        version: &str,
        ct: &CancellationToken,
    ) -> Result<PackageManifest> {
        let spec = format!("{}@{}", name, version);
        if let Some(cached) = self.manifest_cache.get(&spec) {
            return Ok(cached.clone());
        }
        let base = self.config.registry_for(name).trim_end_matches('/');
        let url = format!("{}/{}/{}", base, encode_name(name), version);
        let value = self.get_json(&spec, &url, ct).await?;
        let manifest: PackageManifest =
            serde_json::from_value(value).map_err(|e| Error::ManifestMalformed {
                package: spec.clone(),
                detail: e.to_string(),
            })?;
        self.manifest_cache.insert(spec, manifest.clone());
        Ok(manifest)
    }
}

impl Registry for RegistryClient {
    async fn versions(&self, name: &str, ct: &CancellationToken) -> Result<Vec<String>> {
        let packument = self.packument(name, ct).await?;
        let versions = packument
            .get("versions")
            .and_then(|v| v.as_object())
            .ok_or_else(|| Error::ManifestMalformed {
                package: name.to_string(),
                detail: "packument has no versions object".to_string(),
            })?;
        Ok(versions.keys().cloned().collect())
    }

    async fn manifest(&self, name: &str, version: &str, ct: &CancellationToken) -> Result<PackageManifest> {
        self.version_manifest(name, version, ct).await
    }

    async fn integrity(&self, name: &str, version: &str, ct: &CancellationToken) -> Result<String> {
        let manifest = self.version_manifest(name, version, ct).await?;
        Ok(manifest.dist_integrity().unwrap_or_default())
    }

    async fn tarball(&self, name: &str, version: &str, ct: &CancellationToken) -> Result<Vec<u8>> {
        let spec = format!("{}@{}", name, version);
        let manifest = self.version_manifest(name, version, ct).await?;
        let url = manifest.dist_tarball().ok_or_else(|| Error::ManifestMalformed {
            package: spec.clone(),
            detail: "manifest has no dist.tarball".to_string(),
        })?;
        let resp = self.get_with_retry(&spec, &url, ct).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::Network { package: spec, detail: e.to_string() })?;
        Ok(bytes.to_vec())
    }
}
