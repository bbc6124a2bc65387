//! Execution contexts — the heavyweight per-worker session scope.
//!
//! An [`ExecutionContext`] is an isolated HTTP session: its own cookie jar
//! (seeded from the persisted portal snapshot), its own client, its own id for
//! log correlation. Contexts are what the global concurrency gate counts, so
//! at most `context_capacity` of them exist at any moment. Cookies observed on
//! responses are recorded so the dispatcher can merge them back into the
//! session snapshot after the run.

use reqwest::cookie::Jar;
use reqwest::header::SET_COOKIE;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::features::session_store::{self, CookieRecord};
use crate::sources::WorkerError;

const USER_AGENT: &str = concat!("task-warden/", env!("CARGO_PKG_VERSION"));

/// A fetched document plus the facts callers branch on.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    /// URL after redirects — sign-in detection keys off this.
    pub final_url: Url,
    pub body: String,
}

impl FetchedPage {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct ExecutionContext {
    pub id: Uuid,
    client: reqwest::Client,
    portal_host: String,
    observed: Mutex<Vec<CookieRecord>>,
    state_dir: PathBuf,
}

impl ExecutionContext {
    /// Build an isolated context, seeding its jar from the session snapshot.
    pub fn new(
        portal_base: &Url,
        seed: &[CookieRecord],
        state_dir: &Path,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let jar = Arc::new(Jar::default());
        for cookie in seed {
            jar.add_cookie_str(&cookie.to_cookie_string(), portal_base);
        }

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .cookie_provider(jar)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let id = Uuid::new_v4();
        debug!("execution context {} created ({} seed cookies)", id, seed.len());

        Ok(Self {
            id,
            client,
            portal_host: portal_base.host_str().unwrap_or_default().to_string(),
            observed: Mutex::new(Vec::new()),
            state_dir: state_dir.to_path_buf(),
        })
    }

    /// GET a page, following redirects, recording any cookies set on the way.
    pub async fn fetch(&self, url: &str) -> Result<FetchedPage, WorkerError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        self.finish(resp).await
    }

    /// POST a urlencoded form and return the resulting page.
    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, String)],
    ) -> Result<FetchedPage, WorkerError> {
        let resp = self
            .client
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        self.finish(resp).await
    }

    async fn finish(&self, resp: reqwest::Response) -> Result<FetchedPage, WorkerError> {
        self.observe(&resp);
        let status = resp.status().as_u16();
        let final_url = resp.url().clone();
        let body = resp.text().await.map_err(map_reqwest_error)?;
        Ok(FetchedPage {
            status,
            final_url,
            body,
        })
    }

    /// Record `Set-Cookie` headers for later merge into the session snapshot.
    fn observe(&self, resp: &reqwest::Response) {
        let host = resp
            .url()
            .host_str()
            .unwrap_or(&self.portal_host)
            .to_string();
        let fresh: Vec<CookieRecord> = resp
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|raw| session_store::parse_set_cookie(raw, &host))
            .collect();
        if !fresh.is_empty() {
            let mut observed = self.observed.lock().unwrap();
            session_store::merge(&mut observed, fresh);
        }
    }

    /// Cookies observed during this context's lifetime.
    pub fn observed_cookies(&self) -> Vec<CookieRecord> {
        self.observed.lock().unwrap().clone()
    }

    /// Write a proof artifact under `<state_dir>/proof/` and return its path.
    pub async fn write_proof(&self, task_id: &str, content: &str) -> anyhow::Result<PathBuf> {
        let dir = self.state_dir.join("proof");
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.html", task_id));
        tokio::fs::write(&path, content).await?;
        Ok(path)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> WorkerError {
    if e.is_timeout() {
        WorkerError::Network("request timed out".to_string())
    } else {
        WorkerError::Network(e.to_string())
    }
}
