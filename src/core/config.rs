use anyhow::Context;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use url::Url;

use crate::sources::SourceKind;

// ---------------------------------------------------------------------------
// WardenConfig — file-based config loader (task-warden.json) with env-var
// fallback for every field, resolved once at startup into `Settings`.
// ---------------------------------------------------------------------------

/// Portal sub-config (mirrors the `portal` key in task-warden.json).
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct PortalFileConfig {
    /// Base URL of the upstream portal, e.g. `https://portal.example`.
    pub base_url: Option<String>,
    /// Path the portal redirects to when the session is gone.
    pub signin_path: Option<String>,
    /// Path proving the session is valid when reachable without a redirect.
    pub dashboard_path: Option<String>,
    /// Listing page of completed tasks (posted-total gauge).
    pub done_path: Option<String>,
    /// Availability listing path; also the `next=` redirect target after a
    /// submission.
    pub available_path: Option<String>,
    /// Substring that marks an anchor href as a work-item reference.
    pub available_marker: Option<String>,
    /// Submission path prefix; the task id is appended.
    pub submit_path: Option<String>,
    /// Per-request timeout in seconds.
    pub http_timeout_secs: Option<u64>,
}

impl PortalFileConfig {
    pub fn resolve_base_url(&self) -> String {
        if let Some(u) = &self.base_url {
            if !u.trim().is_empty() {
                return u.trim().trim_end_matches('/').to_string();
            }
        }
        std::env::var("WARDEN_PORTAL_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .unwrap_or_else(|| "http://127.0.0.1:8800".to_string())
    }
}

/// Dispatcher sub-config.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct DispatchFileConfig {
    /// Seconds between polling cycles. Default: 10.
    pub poll_interval_secs: Option<u64>,
    /// Max simultaneous heavyweight execution contexts. Default: 1.
    pub context_capacity: Option<usize>,
    /// Max simultaneous submission flows. Default: 5.
    pub submit_capacity: Option<usize>,
    /// Extra attempts when a detail view fails transiently. Default: 2.
    pub detail_retries: Option<u32>,
    /// Consecutive session-validation failures before the run goes idle.
    /// Default: 3.
    pub auth_failure_limit: Option<u32>,
    /// Optional hard cap on one run's wall-clock duration, seconds.
    pub run_duration_limit_secs: Option<u64>,
    /// Metrics feed push interval, seconds. Default: 3.
    pub metrics_interval_secs: Option<u64>,
    /// Max seconds to wait for running sources to drain on shutdown.
    /// Default: 60.
    pub drain_timeout_secs: Option<u64>,
}

/// Storage sub-config.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct StorageFileConfig {
    /// State directory for the session snapshot, credentials and proof
    /// artifacts. Default: `~/.task-warden`.
    pub state_dir: Option<String>,
    /// Remote blob-store base URL for best-effort session artifact mirroring.
    /// Absent → mirroring disabled.
    pub blob_base_url: Option<String>,
    /// Append a structured, timestamped log file at this path.
    pub log_file: Option<String>,
}

/// One source entry in the `sources` array.
#[derive(serde::Deserialize, Clone, Debug)]
pub struct SourceFileEntry {
    pub name: String,
    pub endpoint: Option<String>,
    pub enabled: Option<bool>,
    pub kinds: Option<Vec<String>>,
}

/// Top-level config loaded from `task-warden.json`.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct WardenConfig {
    #[serde(default)]
    pub portal: PortalFileConfig,
    #[serde(default)]
    pub dispatch: DispatchFileConfig,
    #[serde(default)]
    pub storage: StorageFileConfig,
    pub sources: Option<Vec<SourceFileEntry>>,
}

/// Load `task-warden.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `WARDEN_CONFIG` env var path
/// 2. `./task-warden.json`
/// 3. `../task-warden.json`
///
/// Missing file → `WardenConfig::default()` (silent, env-var fallbacks apply).
/// Parse error → log a warning, return `WardenConfig::default()`.
pub fn load_warden_config() -> WardenConfig {
    let candidates: Vec<PathBuf> = {
        let mut v = vec![
            PathBuf::from("task-warden.json"),
            PathBuf::from("../task-warden.json"),
        ];
        if let Ok(env_path) = std::env::var("WARDEN_CONFIG") {
            v.insert(0, PathBuf::from(env_path));
        }
        v
    };

    for path in &candidates {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<WardenConfig>(&contents) {
                Ok(cfg) => {
                    tracing::info!("task-warden.json loaded from {}", path.display());
                    return cfg;
                }
                Err(e) => {
                    tracing::warn!(
                        "task-warden.json parse error at {}: {} — using defaults",
                        path.display(),
                        e
                    );
                    return WardenConfig::default();
                }
            },
            Err(_) => continue, // not found at this path — try next
        }
    }

    WardenConfig::default()
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

// ---------------------------------------------------------------------------
// Resolved settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PortalSettings {
    pub base: Url,
    pub signin_path: String,
    pub dashboard_path: String,
    pub done_path: String,
    pub available_path: String,
    pub available_marker: String,
    pub submit_path: String,
    pub http_timeout: Duration,
}

impl PortalSettings {
    pub fn dashboard_url(&self) -> String {
        format!("{}{}", self.base_str(), self.dashboard_path)
    }

    pub fn done_url(&self) -> String {
        format!("{}{}", self.base_str(), self.done_path)
    }

    /// Submission URL for a task id; `next=` sends the portal back to the
    /// availability listing afterwards.
    pub fn submit_url(&self, task_id: &str) -> String {
        format!(
            "{}{}/{}?next={}",
            self.base_str(),
            self.submit_path,
            task_id,
            self.available_path
        )
    }

    /// Absolutize an href extracted from a listing page.
    pub fn absolute(&self, href: &str) -> String {
        match self.base.join(href) {
            Ok(u) => u.to_string(),
            Err(_) => href.to_string(),
        }
    }

    /// Does this (post-redirect) URL land on the sign-in page?
    pub fn is_signin(&self, url: &Url) -> bool {
        url.host_str() == self.base.host_str() && url.path().starts_with(&self.signin_path)
    }

    /// Is this URL the availability listing (submission redirect target)?
    pub fn is_available_listing(&self, url: &Url) -> bool {
        url.host_str() == self.base.host_str() && url.path().starts_with(&self.available_path)
    }

    fn base_str(&self) -> &str {
        self.base.as_str().trim_end_matches('/')
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub poll_interval: Duration,
    pub context_capacity: usize,
    pub submit_capacity: usize,
    pub detail_retries: u32,
    pub auth_failure_limit: u32,
    pub run_duration_limit: Option<Duration>,
    pub metrics_interval: Duration,
    pub drain_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub state_dir: PathBuf,
    pub blob_base_url: Option<Url>,
    pub log_file: Option<PathBuf>,
}

/// A source with its runtime enable flag and prebuilt kind matcher.
#[derive(Debug)]
pub struct SourceSettings {
    pub kind: SourceKind,
    pub endpoint: String,
    pub kinds: Vec<String>,
    enabled: AtomicBool,
    matcher: aho_corasick::AhoCorasick,
}

impl SourceSettings {
    pub fn new(
        kind: SourceKind,
        endpoint: String,
        kinds: Vec<String>,
        enabled: bool,
    ) -> anyhow::Result<Self> {
        let matcher = aho_corasick::AhoCorasick::new(&kinds)
            .with_context(|| format!("invalid work-kind patterns for source '{}'", kind))?;
        Ok(Self {
            kind,
            endpoint,
            kinds,
            enabled: AtomicBool::new(enabled),
            matcher,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// The explicit external enable/disable signal (control API, or a worker
    /// hitting an authentication failure).
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Does this text mention any of the source's recognized work kinds?
    pub fn matches_kind(&self, text: &str) -> bool {
        self.matcher.is_match(text)
    }
}

#[derive(Debug)]
pub struct Settings {
    pub portal: PortalSettings,
    pub dispatch: DispatchSettings,
    pub storage: StorageSettings,
    pub sources: Vec<SourceSettings>,
}

impl Settings {
    pub fn source(&self, kind: SourceKind) -> Option<&SourceSettings> {
        self.sources.iter().find(|s| s.kind == kind)
    }
}

impl WardenConfig {
    /// Resolve file values, env fallbacks and defaults into usable settings.
    pub fn resolve(&self) -> anyhow::Result<Settings> {
        let base_str = self.portal.resolve_base_url();
        let base = Url::parse(&base_str)
            .with_context(|| format!("invalid portal base URL: {}", base_str))?;

        let portal = PortalSettings {
            base,
            signin_path: self
                .portal
                .signin_path
                .clone()
                .unwrap_or_else(|| "/sign-in".to_string()),
            dashboard_path: self
                .portal
                .dashboard_path
                .clone()
                .unwrap_or_else(|| "/board/dashboard".to_string()),
            done_path: self
                .portal
                .done_path
                .clone()
                .unwrap_or_else(|| "/board/done/tasks".to_string()),
            available_path: self
                .portal
                .available_path
                .clone()
                .unwrap_or_else(|| "/board/available/tasks".to_string()),
            available_marker: self
                .portal
                .available_marker
                .clone()
                .unwrap_or_else(|| "next=/board/available/".to_string()),
            submit_path: self
                .portal
                .submit_path
                .clone()
                .unwrap_or_else(|| "/board/update/tasks/view".to_string()),
            http_timeout: Duration::from_secs(
                self.portal
                    .http_timeout_secs
                    .or_else(|| env_parse("WARDEN_HTTP_TIMEOUT_SECS"))
                    .unwrap_or(30),
            ),
        };

        let dispatch = DispatchSettings {
            poll_interval: Duration::from_secs(
                self.dispatch
                    .poll_interval_secs
                    .or_else(|| env_parse("WARDEN_POLL_INTERVAL_SECS"))
                    .unwrap_or(10),
            ),
            context_capacity: self
                .dispatch
                .context_capacity
                .or_else(|| env_parse("WARDEN_CONTEXT_CAPACITY"))
                .unwrap_or(1)
                .max(1),
            submit_capacity: self
                .dispatch
                .submit_capacity
                .or_else(|| env_parse("WARDEN_SUBMIT_CAPACITY"))
                .unwrap_or(5)
                .max(1),
            detail_retries: self.dispatch.detail_retries.unwrap_or(2),
            auth_failure_limit: self.dispatch.auth_failure_limit.unwrap_or(3).max(1),
            run_duration_limit: self
                .dispatch
                .run_duration_limit_secs
                .or_else(|| env_parse("WARDEN_RUN_DURATION_LIMIT_SECS"))
                .map(Duration::from_secs),
            metrics_interval: Duration::from_secs(
                self.dispatch.metrics_interval_secs.unwrap_or(3).max(1),
            ),
            drain_timeout: Duration::from_secs(self.dispatch.drain_timeout_secs.unwrap_or(60)),
        };

        let state_dir = self
            .storage
            .state_dir
            .clone()
            .or_else(|| std::env::var("WARDEN_STATE_DIR").ok())
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".task-warden")))
            .unwrap_or_else(|| PathBuf::from(".task-warden"));

        let blob_base_url = self
            .storage
            .blob_base_url
            .clone()
            .or_else(|| std::env::var("WARDEN_BLOB_URL").ok())
            .filter(|v| !v.trim().is_empty())
            .map(|v| Url::parse(v.trim()))
            .transpose()
            .context("invalid blob-store base URL")?;

        let log_file = self
            .storage
            .log_file
            .clone()
            .or_else(|| std::env::var("WARDEN_LOG_FILE").ok())
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let storage = StorageSettings {
            state_dir,
            blob_base_url,
            log_file,
        };

        let sources = self.resolve_sources(&portal)?;

        Ok(Settings {
            portal,
            dispatch,
            storage,
            sources,
        })
    }

    fn resolve_sources(&self, portal: &PortalSettings) -> anyhow::Result<Vec<SourceSettings>> {
        let mut out = Vec::new();
        for kind in SourceKind::ALL {
            let entry = self
                .sources
                .as_ref()
                .and_then(|v| v.iter().find(|e| SourceKind::parse(&e.name) == Some(kind)));

            let endpoint = entry
                .and_then(|e| e.endpoint.clone())
                .unwrap_or_else(|| {
                    format!(
                        "{}{}?channel={}",
                        portal.base.as_str().trim_end_matches('/'),
                        portal.available_path,
                        kind
                    )
                });
            let kinds = entry
                .and_then(|e| e.kinds.clone())
                .unwrap_or_else(|| default_kinds(kind));
            let enabled = entry.and_then(|e| e.enabled).unwrap_or(true);

            out.push(SourceSettings::new(kind, endpoint, kinds, enabled)?);
        }

        if let Some(entries) = &self.sources {
            for e in entries {
                if SourceKind::parse(&e.name).is_none() {
                    tracing::warn!("unknown source '{}' in config — ignored", e.name);
                }
            }
        }
        Ok(out)
    }
}

fn default_kinds(kind: SourceKind) -> Vec<String> {
    let kinds: &[&str] = match kind {
        SourceKind::Feed => &["FEED/Post", "FEED/Profile"],
        SourceKind::Invite => &["INVITE/Group", "INVITE/Channel"],
        SourceKind::Gallery => &["GALLERY/Album", "GALLERY/Snapshot"],
    };
    kinds.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

pub const CREDENTIALS_FILE: &str = "credentials.json";

/// Per-source account identifiers, loaded from `<state_dir>/credentials.json`.
#[derive(serde::Deserialize, Debug, Clone, Default)]
pub struct Credentials {
    #[serde(default)]
    pub accounts: HashMap<SourceKind, String>,
}

impl Credentials {
    pub fn account_for(&self, kind: SourceKind) -> Option<&str> {
        self.accounts.get(&kind).map(String::as_str)
    }
}

/// Load required credentials. Failure here is an unrecoverable startup error —
/// the run aborts before it starts.
pub fn load_credentials(state_dir: &Path) -> anyhow::Result<Credentials> {
    let path = state_dir.join(CREDENTIALS_FILE);
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("missing required credentials file {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("malformed credentials file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_resolves_to_defaults() {
        let settings = WardenConfig::default().resolve().unwrap();
        assert_eq!(settings.dispatch.poll_interval, Duration::from_secs(10));
        assert_eq!(settings.dispatch.context_capacity, 1);
        assert_eq!(settings.dispatch.submit_capacity, 5);
        assert_eq!(settings.portal.signin_path, "/sign-in");
        assert_eq!(settings.sources.len(), 3);
        assert!(settings.sources.iter().all(|s| s.is_enabled()));
        assert!(settings.storage.blob_base_url.is_none());
    }

    #[test]
    fn file_values_override_defaults() {
        let cfg: WardenConfig = serde_json::from_str(
            r#"{
                "portal": {"base_url": "https://portal.example/", "signin_path": "/login"},
                "dispatch": {"poll_interval_secs": 2, "context_capacity": 3},
                "sources": [
                    {"name": "invite", "enabled": false, "kinds": ["INVITE/Room"]},
                    {"name": "mystery", "enabled": true}
                ]
            }"#,
        )
        .unwrap();
        let settings = cfg.resolve().unwrap();

        assert_eq!(settings.portal.base.as_str(), "https://portal.example/");
        assert_eq!(settings.portal.signin_path, "/login");
        assert_eq!(settings.dispatch.poll_interval, Duration::from_secs(2));
        assert_eq!(settings.dispatch.context_capacity, 3);

        let invite = settings.source(SourceKind::Invite).unwrap();
        assert!(!invite.is_enabled());
        assert_eq!(invite.kinds, vec!["INVITE/Room".to_string()]);
        // Unknown entries are ignored, the three known sources remain.
        assert_eq!(settings.sources.len(), 3);
    }

    #[test]
    fn default_endpoints_carry_the_channel_query() {
        let settings = WardenConfig::default().resolve().unwrap();
        let feed = settings.source(SourceKind::Feed).unwrap();
        assert!(feed.endpoint.ends_with("/board/available/tasks?channel=feed"));
    }

    #[test]
    fn signin_detection_requires_matching_host() {
        let settings = WardenConfig::default().resolve().unwrap();
        let own = Url::parse("http://127.0.0.1:8800/sign-in?next=/x").unwrap();
        let foreign = Url::parse("https://elsewhere.example/sign-in").unwrap();
        assert!(settings.portal.is_signin(&own));
        assert!(!settings.portal.is_signin(&foreign));
    }

    #[test]
    fn kind_matcher_matches_listing_text() {
        let src = SourceSettings::new(
            SourceKind::Feed,
            "http://x/list".to_string(),
            vec!["FEED/Post".to_string(), "FEED/Profile".to_string()],
            true,
        )
        .unwrap();
        assert!(src.matches_kind("<td>FEED/Post</td>"));
        assert!(!src.matches_kind("<td>GALLERY/Album</td>"));
    }

    #[test]
    fn credentials_parse_by_source_name() {
        let creds: Credentials = serde_json::from_str(
            r#"{"accounts": {"feed": "1201", "invite": "778"}}"#,
        )
        .unwrap();
        assert_eq!(creds.account_for(SourceKind::Feed), Some("1201"));
        assert_eq!(creds.account_for(SourceKind::Gallery), None);
    }
}
