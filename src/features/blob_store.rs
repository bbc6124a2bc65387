//! Remote blob-store collaborator.
//!
//! Session artifacts (credentials, session snapshot) can be mirrored to a
//! simple HTTP blob store: `PUT <base>/<name>` to store, `GET <base>/<name>`
//! to fetch. Both directions are best-effort — a failure is logged and
//! reported as `false`, never raised, and the store is disabled entirely when
//! no base URL is configured.

use std::path::{Path, PathBuf};
use tracing::{info, warn};
use url::Url;

pub struct BlobStore {
    base: Url,
    http: reqwest::Client,
    state_dir: PathBuf,
}

impl BlobStore {
    pub fn new(base: Url, http: reqwest::Client, state_dir: &Path) -> Self {
        Self {
            base,
            http,
            state_dir: state_dir.to_path_buf(),
        }
    }

    fn object_url(&self, name: &str) -> Option<Url> {
        self.base.join(name).ok()
    }

    /// Upload `<state_dir>/<name>` to the store. `true` on success.
    pub async fn store(&self, name: &str) -> bool {
        let path = self.state_dir.join(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) => {
                warn!("blob_store: cannot read {} for upload: {}", path.display(), e);
                return false;
            }
        };
        let Some(url) = self.object_url(name) else {
            warn!("blob_store: invalid object name '{}'", name);
            return false;
        };
        match self.http.put(url.clone()).body(bytes).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!("blob_store: ⬆ stored '{}'", name);
                true
            }
            Ok(resp) => {
                warn!("blob_store: store '{}' returned {}", name, resp.status());
                false
            }
            Err(e) => {
                warn!("blob_store: store '{}' failed: {}", name, e);
                false
            }
        }
    }

    /// Download `<name>` into the state dir. `true` on success.
    pub async fn fetch(&self, name: &str) -> bool {
        let Some(url) = self.object_url(name) else {
            warn!("blob_store: invalid object name '{}'", name);
            return false;
        };
        let resp = match self.http.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("blob_store: fetch '{}' failed: {}", name, e);
                return false;
            }
        };
        if !resp.status().is_success() {
            warn!("blob_store: fetch '{}' returned {}", name, resp.status());
            return false;
        }
        let bytes = match resp.bytes().await {
            Ok(b) => b,
            Err(e) => {
                warn!("blob_store: fetch '{}' body error: {}", name, e);
                return false;
            }
        };
        if let Err(e) = tokio::fs::create_dir_all(&self.state_dir).await {
            warn!("blob_store: cannot create state dir: {}", e);
            return false;
        }
        let path = self.state_dir.join(name);
        match tokio::fs::write(&path, &bytes).await {
            Ok(()) => {
                info!("blob_store: ⬇ fetched '{}' ({} bytes)", name, bytes.len());
                true
            }
            Err(e) => {
                warn!("blob_store: cannot write {}: {}", path.display(), e);
                false
            }
        }
    }
}
