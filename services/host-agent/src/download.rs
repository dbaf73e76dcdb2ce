//! Fetching base images and guest binaries.
//!
//! Remote files are streamed to a `.partial` file next to the destination,
//! verified against their declared digest, and renamed into place. Verified
//! downloads are also kept in the shared cache, keyed by URL.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use hearth_spec::RemoteFile;
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::fsutil::ensure_dir;

/// Errors from downloads.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GET {url} returned {status}")]
    Status { url: String, status: u16 },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("digest mismatch for {location}: expected {expected}, got {actual}")]
    DigestMismatch {
        location: String,
        expected: String,
        actual: String,
    },

    #[error("unsupported digest {0:?}, only sha256 is accepted")]
    UnsupportedDigest(String),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> DownloadError + '_ {
    move |source| DownloadError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// What [`Downloader::fetch`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetched {
    /// Destination already existed.
    AlreadyPresent,
    /// Copied from the download cache.
    FromCache,
    /// Copied from a local path.
    Copied,
    /// Downloaded over HTTP.
    Downloaded,
}

/// Download client with a shared on-disk cache.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    cache_dir: Option<PathBuf>,
}

impl Downloader {
    pub fn new(cache_dir: Option<PathBuf>) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, cache_dir })
    }

    /// Make `file` available at `dest`; existing destinations are left untouched.
    pub async fn fetch(&self, file: &RemoteFile, dest: &Path) -> Result<Fetched, DownloadError> {
        if dest.exists() {
            debug!(dest = %dest.display(), "Already present");
            return Ok(Fetched::AlreadyPresent);
        }
        if let Some(parent) = dest.parent() {
            ensure_dir(parent).map_err(io_err(parent))?;
        }

        let location = file.location.as_str();
        if let Some(path) = local_path(location) {
            copy_verified(&path, dest, &file.digest, location)?;
            info!(src = %path.display(), dest = %dest.display(), "Copied local file");
            return Ok(Fetched::Copied);
        }

        let cached = self.cache_path(location);
        if let Some(cached) = cached.as_deref().filter(|p| p.exists()) {
            copy_verified(cached, dest, &file.digest, location)?;
            info!(url = %location, dest = %dest.display(), "Using cached download");
            return Ok(Fetched::FromCache);
        }

        self.download(location, &file.digest, dest).await?;

        if let Some(cached) = cached {
            if let Some(parent) = cached.parent() {
                ensure_dir(parent).map_err(io_err(parent))?;
            }
            std::fs::copy(dest, &cached).map_err(io_err(&cached))?;
        }
        Ok(Fetched::Downloaded)
    }

    async fn download(&self, url: &str, digest: &str, dest: &Path) -> Result<(), DownloadError> {
        let expected = parse_digest(digest)?;
        debug!(url = %url, dest = %dest.display(), "Downloading");

        let mut response = self.client.get(url).send().await?;
        if response.status() != StatusCode::OK {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let partial = partial_path(dest);
        let mut out = std::fs::File::create(&partial).map_err(io_err(&partial))?;
        let mut hasher = Sha256::new();
        let mut total: u64 = 0;

        while let Some(chunk) = response.chunk().await? {
            hasher.update(&chunk);
            out.write_all(&chunk).map_err(io_err(&partial))?;
            total += chunk.len() as u64;
        }
        out.sync_all().map_err(io_err(&partial))?;
        drop(out);

        let actual = hex::encode(hasher.finalize());
        if let Some(expected) = expected {
            if actual != expected {
                std::fs::remove_file(&partial).ok();
                return Err(DownloadError::DigestMismatch {
                    location: url.to_string(),
                    expected: format!("sha256:{expected}"),
                    actual: format!("sha256:{actual}"),
                });
            }
        }

        std::fs::rename(&partial, dest).map_err(io_err(dest))?;
        info!(url = %url, size = total, digest = %format!("sha256:{actual}"), "Downloaded");
        Ok(())
    }

    fn cache_path(&self, url: &str) -> Option<PathBuf> {
        let dir = self.cache_dir.as_ref()?;
        let key = hex::encode(Sha256::digest(url.as_bytes()));
        Some(dir.join("download").join("by-url-sha256").join(key).join("data"))
    }
}

/// `file:///x` and plain paths resolve locally.
fn local_path(location: &str) -> Option<PathBuf> {
    if let Some(path) = location.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    if location.contains("://") {
        return None;
    }
    Some(PathBuf::from(location))
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    dest.with_file_name(name)
}

/// Returns the expected hex digest, or `None` when verification is skipped.
fn parse_digest(digest: &str) -> Result<Option<String>, DownloadError> {
    if digest.is_empty() {
        return Ok(None);
    }
    match digest.split_once(':') {
        Some(("sha256", hex)) => Ok(Some(hex.to_ascii_lowercase())),
        _ => Err(DownloadError::UnsupportedDigest(digest.to_string())),
    }
}

fn copy_verified(
    src: &Path,
    dest: &Path,
    digest: &str,
    location: &str,
) -> Result<(), DownloadError> {
    if let Some(expected) = parse_digest(digest)? {
        let actual = sha256_file(src)?;
        if actual != expected {
            return Err(DownloadError::DigestMismatch {
                location: location.to_string(),
                expected: format!("sha256:{expected}"),
                actual: format!("sha256:{actual}"),
            });
        }
    }
    let partial = partial_path(dest);
    std::fs::copy(src, &partial).map_err(io_err(src))?;
    std::fs::rename(&partial, dest).map_err(io_err(dest))
}

fn sha256_file(path: &Path) -> Result<String, DownloadError> {
    let mut file = std::fs::File::open(path).map_err(io_err(path))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(io_err(path))?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sha(body: &[u8]) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(body)))
    }

    #[tokio::test]
    async fn test_http_download_verifies_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img.raw"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"disk-bytes".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let downloader = Downloader::new(Some(tmp.path().join("cache"))).unwrap();
        let file = RemoteFile {
            location: format!("{}/img.raw", server.uri()),
            digest: sha(b"disk-bytes"),
            ..Default::default()
        };

        let first = tmp.path().join("a/basedisk");
        assert_eq!(
            downloader.fetch(&file, &first).await.unwrap(),
            Fetched::Downloaded
        );
        assert_eq!(std::fs::read(&first).unwrap(), b"disk-bytes");
        assert_eq!(
            downloader.fetch(&file, &first).await.unwrap(),
            Fetched::AlreadyPresent
        );

        let second = tmp.path().join("b/basedisk");
        assert_eq!(
            downloader.fetch(&file, &second).await.unwrap(),
            Fetched::FromCache
        );
    }

    #[tokio::test]
    async fn test_digest_mismatch_leaves_nothing_behind() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let downloader = Downloader::new(None).unwrap();
        let file = RemoteFile {
            location: format!("{}/img.raw", server.uri()),
            digest: sha(b"original"),
            ..Default::default()
        };
        let dest = tmp.path().join("basedisk");

        let err = downloader.fetch(&file, &dest).await.unwrap_err();
        assert!(matches!(err, DownloadError::DigestMismatch { .. }));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_not_found_status() {
        let server = MockServer::start().await;
        let tmp = TempDir::new().unwrap();
        let downloader = Downloader::new(None).unwrap();
        let file = RemoteFile {
            location: format!("{}/missing", server.uri()),
            ..Default::default()
        };

        let err = downloader
            .fetch(&file, &tmp.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_local_copy() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src.img");
        std::fs::write(&src, b"local").unwrap();

        let downloader = Downloader::new(None).unwrap();
        let file = RemoteFile {
            location: format!("file://{}", src.display()),
            digest: sha(b"local"),
            ..Default::default()
        };
        let dest = tmp.path().join("dest.img");
        assert_eq!(downloader.fetch(&file, &dest).await.unwrap(), Fetched::Copied);
        assert_eq!(std::fs::read(&dest).unwrap(), b"local");
    }

    #[test]
    fn test_parse_digest() {
        assert_eq!(parse_digest("").unwrap(), None);
        assert_eq!(parse_digest("sha256:AB").unwrap().as_deref(), Some("ab"));
        assert!(parse_digest("md5:00").is_err());
    }
}
