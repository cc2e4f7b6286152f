//! The Fetcher (spec §4.B): `Fetch(url, expected_hash?, dest_path)`.
//!
//! Relative URLs resolve against `cfg.repo_url`. A present `expected_hash`
//! plus an existing `dest_path` short-circuits the network call when the
//! on-disk digest already matches. Transient failures (connection errors,
//! 5xx, 429) retry up to 3 times with exponential backoff (base 1s, cap
//! 30s); everything else (4xx other than 408/429, hash mismatch, disk-full)
//! fails immediately. Concurrent writers to the same `dest_path` serialize
//! on an advisory lock held on a `.lock` sidecar file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::StreamExt;
use reqwest::{StatusCode, Url};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::config::Config;

#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn bearer_token(&self, repo_url: &Url) -> Option<String>;
    async fn basic_auth(&self, repo_url: &Url) -> Option<(String, String)>;
}

/// Default `CredentialProvider`: anonymous, with an optional bearer token
/// read from the environment. Real credential-store integration (Windows
/// Credential Manager) is an external collaborator per spec §4.B.
pub struct AnonymousCredentialProvider;

#[async_trait::async_trait]
impl CredentialProvider for AnonymousCredentialProvider {
    async fn bearer_token(&self, _repo_url: &Url) -> Option<String> {
        std::env::var("CIMIAN_BEARER_TOKEN").ok()
    }

    async fn basic_auth(&self, _repo_url: &Url) -> Option<(String, String)> {
        None
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("network error fetching {url}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("server responded {status} for {url}")]
    Status { url: String, status: StatusCode },
    #[error("downloaded content hash did not match the expected value for {0}")]
    HashMismatch(String),
    #[error("could not acquire a lock for {0}")]
    LockFailure(PathBuf),
    #[error("io error writing {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    /// Transience per spec §4.B: connection errors, 5xx, and 429 retry;
    /// 4xx (except 408/429), hash mismatch, and disk-full do not.
    fn is_transient(&self) -> bool {
        match self {
            FetchError::Network { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            FetchError::Status { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchOutcome {
    pub bytes_written: u64,
    pub cached: bool,
}

pub struct Fetcher<'a> {
    client: reqwest::Client,
    cfg: &'a Config,
    credentials: &'a dyn CredentialProvider,
}

impl<'a> Fetcher<'a> {
    pub fn new(cfg: &'a Config, credentials: &'a dyn CredentialProvider) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5 * 60))
            .build()
            .expect("reqwest client builds");

        Fetcher {
            client,
            cfg,
            credentials,
        }
    }

    fn resolve_url(&self, url: &str) -> Result<Url, FetchError> {
        if let Ok(u) = Url::parse(url) {
            return Ok(u);
        }
        self.cfg
            .repo_url
            .join(url)
            .map_err(|_| FetchError::InvalidUrl(url.to_string()))
    }

    pub async fn fetch(
        &self,
        url: &str,
        expected_hash: Option<&str>,
        dest_path: &Path,
    ) -> Result<FetchOutcome, FetchError> {
        let resolved = self.resolve_url(url)?;

        if let Some(hash) = expected_hash {
            if dest_path.exists() {
                if let Ok(actual) = sha256_file(dest_path).await {
                    if actual.eq_ignore_ascii_case(hash) {
                        return Ok(FetchOutcome {
                            bytes_written: 0,
                            cached: true,
                        });
                    }
                }
            }
        }

        let lock_path = sidecar_lock_path(dest_path);
        if let Some(parent) = lock_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|_| FetchError::LockFailure(lock_path.clone()))?;
        let mut file_lock = fd_lock::RwLock::new(lock_file);
        let _guard = file_lock
            .write()
            .map_err(|_| FetchError::LockFailure(lock_path.clone()))?;

        let mut backoff = ExponentialBackoff {
            current_interval: Duration::from_secs(1),
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.attempt_fetch(&resolved, dest_path).await {
                Ok(bytes_written) => {
                    if let Some(hash) = expected_hash {
                        let actual = sha256_file(dest_path)
                            .await
                            .map_err(|source| FetchError::Io {
                                path: dest_path.to_path_buf(),
                                source,
                            })?;
                        if !actual.eq_ignore_ascii_case(hash) {
                            let _ = tokio::fs::remove_file(dest_path).await;
                            return Err(FetchError::HashMismatch(resolved.to_string()));
                        }
                    }
                    return Ok(FetchOutcome {
                        bytes_written,
                        cached: false,
                    });
                }
                Err(e) if attempt < 3 && e.is_transient() => {
                    let delay = backoff.next_backoff().unwrap_or_else(|| Duration::from_secs(30));
                    log::warn!("fetch attempt {} for {} failed transiently: {}", attempt, resolved, e);
                    tokio::time::delay_for(delay).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt_fetch(&self, url: &Url, dest_path: &Path) -> Result<u64, FetchError> {
        let mut req = self.client.get(url.clone());

        if self.cfg.force_basic_auth {
            if let Some((user, pass)) = self.credentials.basic_auth(url).await {
                req = req.basic_auth(user, Some(pass));
            }
        } else if let Some(token) = self.credentials.bearer_token(url).await {
            req = req.bearer_auth(token);
        }

        let response = req.send().await.map_err(|source| FetchError::Network {
            url: url.to_string(),
            source,
        })?;

        if response.status() == StatusCode::UNAUTHORIZED && !self.cfg.force_basic_auth {
            // Server challenged for Basic; spec §4.B treats this as a mode switch.
            if let Some((user, pass)) = self.credentials.basic_auth(url).await {
                let retried = self
                    .client
                    .get(url.clone())
                    .basic_auth(user, Some(pass))
                    .send()
                    .await
                    .map_err(|source| FetchError::Network {
                        url: url.to_string(),
                        source,
                    })?;
                return self.write_response(retried, url, dest_path).await;
            }
        }

        self.write_response(response, url, dest_path).await
    }

    async fn write_response(
        &self,
        response: reqwest::Response,
        url: &Url,
        dest_path: &Path,
    ) -> Result<u64, FetchError> {
        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }

        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| FetchError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let tmp_path = dest_path.with_extension("part");
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|source| FetchError::Io {
                path: tmp_path.clone(),
                source,
            })?;

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| FetchError::Network {
                url: url.to_string(),
                source,
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|source| map_write_error(tmp_path.clone(), source))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|source| FetchError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        drop(file);

        tokio::fs::rename(&tmp_path, dest_path)
            .await
            .map_err(|source| FetchError::Io {
                path: dest_path.to_path_buf(),
                source,
            })?;

        Ok(written)
    }
}

fn map_write_error(path: PathBuf, source: std::io::Error) -> FetchError {
    FetchError::Io { path, source }
}

async fn sha256_file(path: &Path) -> Result<String, std::io::Error> {
    let bytes = tokio::fs::read(path).await?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

fn sidecar_lock_path(dest_path: &Path) -> PathBuf {
    let mut s = dest_path.as_os_str().to_owned();
    s.push(".lock");
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecar_lock_path_appends_suffix() {
        let path = Path::new("/tmp/cache/installer.msi");
        assert_eq!(
            sidecar_lock_path(path),
            Path::new("/tmp/cache/installer.msi.lock")
        );
    }

    #[test]
    fn test_status_5xx_is_transient() {
        let err = FetchError::Status {
            url: "https://example.org".into(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        };
        assert!(err.is_transient());
    }

    #[test]
    fn test_status_404_is_not_transient() {
        let err = FetchError::Status {
            url: "https://example.org".into(),
            status: StatusCode::NOT_FOUND,
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn test_status_429_is_transient() {
        let err = FetchError::Status {
            url: "https://example.org".into(),
            status: StatusCode::TOO_MANY_REQUESTS,
        };
        assert!(err.is_transient());
    }
}
