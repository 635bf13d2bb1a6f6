//! Discovery source watching a declarative document for content changes.

use crate::fleet::{
    domain::DiscoveryDocument,
    ports::{DiscoverySource, DiscoverySourceError},
};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::Duration;

/// Where a watched document lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentLocation {
    /// Local file.
    File(Utf8PathBuf),
    /// Remote document fetched with `GET`.
    Url(String),
}

/// Re-reads a document every interval and yields it only when its
/// SHA-256 digest differs from the last successfully parsed version.
#[derive(Debug)]
pub struct DocumentWatchSource {
    name: String,
    location: DocumentLocation,
    interval: Duration,
    client: reqwest::Client,
    last_digest: Mutex<Option<[u8; 32]>>,
}

impl DocumentWatchSource {
    /// Creates a watch over `location`.
    #[must_use]
    pub fn new(name: impl Into<String>, location: DocumentLocation, interval: Duration) -> Self {
        Self {
            name: name.into(),
            location,
            interval,
            client: reqwest::Client::new(),
            last_digest: Mutex::new(None),
        }
    }

    /// Returns the watched location.
    #[must_use]
    pub const fn location(&self) -> &DocumentLocation {
        &self.location
    }

    fn fetch_error(&self, reason: impl ToString) -> DiscoverySourceError {
        DiscoverySourceError::Fetch {
            source_name: self.name.clone(),
            reason: reason.to_string(),
        }
    }

    async fn read_bytes(&self) -> Result<Vec<u8>, DiscoverySourceError> {
        match &self.location {
            DocumentLocation::File(path) => {
                let owned = path.clone();
                tokio::task::spawn_blocking(move || read_file(&owned))
                    .await
                    .map_err(|err| self.fetch_error(err))?
                    .map_err(|err| self.fetch_error(err))
            }
            DocumentLocation::Url(url) => {
                let response = self
                    .client
                    .get(url)
                    .timeout(self.interval)
                    .send()
                    .await
                    .map_err(|err| self.fetch_error(err))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(DiscoverySourceError::UnexpectedStatus {
                        source_name: self.name.clone(),
                        status: status.as_u16(),
                    });
                }
                let body = response.bytes().await.map_err(|err| self.fetch_error(err))?;
                Ok(body.to_vec())
            }
        }
    }

    fn digest_unchanged(&self, digest: &[u8; 32]) -> bool {
        self.last_digest
            .lock()
            .map(|last| last.as_ref() == Some(digest))
            .unwrap_or(false)
    }

    fn remember_digest(&self, digest: [u8; 32]) {
        if let Ok(mut last) = self.last_digest.lock() {
            *last = Some(digest);
        }
    }
}

fn read_file(path: &Utf8Path) -> std::io::Result<Vec<u8>> {
    let file_name = path
        .file_name()
        .ok_or_else(|| std::io::Error::other("document path must include a file name"))?;
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
    dir.read(file_name)
}

#[async_trait]
impl DiscoverySource for DocumentWatchSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn poll(&self) -> Result<Option<DiscoveryDocument>, DiscoverySourceError> {
        let bytes = self.read_bytes().await?;
        let digest: [u8; 32] = Sha256::digest(&bytes).into();
        if self.digest_unchanged(&digest) {
            return Ok(None);
        }

        let document =
            DiscoveryDocument::from_slice(&bytes).map_err(|err| DiscoverySourceError::Parse {
                source_name: self.name.clone(),
                reason: err.to_string(),
            })?;
        self.remember_digest(digest);
        Ok(Some(document))
    }
}
