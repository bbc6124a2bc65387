//! Session snapshot persistence — shared load/save helpers.
//!
//! The portal session (cookies) is captured as a list of [`CookieRecord`]s and
//! written to `<state_dir>/session_state.json` after each source's run. At
//! execution-context creation the snapshot is loaded and seeded into the
//! context's cookie jar so every run starts authenticated without any
//! interactive step. The snapshot is also mirrored to the remote blob store by
//! the companion [`super::blob_store`] module, best-effort.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const SESSION_FILE: &str = "session_state.json";

/// One persisted cookie, as observed on a `Set-Cookie` response header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    /// When this cookie was last observed (informational only).
    pub captured_at: chrono::DateTime<chrono::Utc>,
}

fn default_path() -> String {
    "/".to_string()
}

impl CookieRecord {
    /// Render back into a `Set-Cookie`-shaped string suitable for seeding a
    /// cookie jar.
    pub fn to_cookie_string(&self) -> String {
        let mut s = format!(
            "{}={}; Domain={}; Path={}",
            self.name, self.value, self.domain, self.path
        );
        if self.secure {
            s.push_str("; Secure");
        }
        s
    }
}

/// Full path of the session snapshot under a state directory.
pub fn session_path(state_dir: &Path) -> PathBuf {
    state_dir.join(SESSION_FILE)
}

// ── Set-Cookie parsing ───────────────────────────────────────────────────────

/// Parse one `Set-Cookie` header value into a record.
///
/// Only the attributes the snapshot needs are kept (`Domain`, `Path`,
/// `Secure`); everything else — expiry, SameSite, HttpOnly — is dropped. A
/// header with no `name=value` pair yields `None`.
pub fn parse_set_cookie(header: &str, default_domain: &str) -> Option<CookieRecord> {
    let mut segments = header.split(';').map(str::trim);
    let (name, value) = segments.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut record = CookieRecord {
        name: name.to_string(),
        value: value.trim().to_string(),
        domain: default_domain.to_string(),
        path: default_path(),
        secure: false,
        captured_at: chrono::Utc::now(),
    };

    for seg in segments {
        if let Some((key, val)) = seg.split_once('=') {
            match key.trim().to_ascii_lowercase().as_str() {
                "domain" => record.domain = val.trim().trim_start_matches('.').to_string(),
                "path" => record.path = val.trim().to_string(),
                _ => {}
            }
        } else if seg.eq_ignore_ascii_case("secure") {
            record.secure = true;
        }
    }

    Some(record)
}

/// Merge newly-observed cookies into an existing snapshot. A cookie replaces
/// any previous record with the same `(name, domain, path)` key.
pub fn merge(existing: &mut Vec<CookieRecord>, observed: Vec<CookieRecord>) {
    for cookie in observed {
        if let Some(slot) = existing
            .iter_mut()
            .find(|c| c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path)
        {
            *slot = cookie;
        } else {
            existing.push(cookie);
        }
    }
}

// ── Load / save ──────────────────────────────────────────────────────────────

/// Load the stored session snapshot.
///
/// Returns `None` when the file is missing, unreadable, or empty — the caller
/// proceeds with a cold session and the portal validation step decides whether
/// the run can start.
pub fn load(state_dir: &Path) -> Option<Vec<CookieRecord>> {
    let path = session_path(state_dir);
    let content = std::fs::read_to_string(&path).ok()?;
    let cookies: Vec<CookieRecord> = serde_json::from_str(&content).ok()?;
    if cookies.is_empty() {
        return None;
    }
    info!(
        "session_store: 🍪 loaded {} cookies ({})",
        cookies.len(),
        path.display()
    );
    Some(cookies)
}

/// Write the snapshot, creating the state dir if needed.
pub fn save(state_dir: &Path, cookies: &[CookieRecord]) -> anyhow::Result<()> {
    std::fs::create_dir_all(state_dir)?;
    let path = session_path(state_dir);
    let json = serde_json::to_string_pretty(cookies)?;
    std::fs::write(&path, json)?;
    info!(
        "session_store: saved {} cookies ({})",
        cookies.len(),
        path.display()
    );
    Ok(())
}

/// Remove the stored snapshot so the next run starts from a cold session.
pub fn invalidate(state_dir: &Path) {
    let path = session_path(state_dir);
    if path.exists() {
        match std::fs::remove_file(&path) {
            Ok(()) => info!("session_store: 🗑️  removed stale session ({})", path.display()),
            Err(e) => warn!(
                "session_store: failed to remove session file {}: {}",
                path.display(),
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_keeps_domain_path_secure_and_drops_the_rest() {
        let rec = parse_set_cookie(
            "sid=abc123; Domain=.portal.example; Path=/board; Secure; HttpOnly; Max-Age=3600",
            "portal.example",
        )
        .expect("should parse");
        assert_eq!(rec.name, "sid");
        assert_eq!(rec.value, "abc123");
        assert_eq!(rec.domain, "portal.example");
        assert_eq!(rec.path, "/board");
        assert!(rec.secure);
    }

    #[test]
    fn parse_defaults_domain_and_path() {
        let rec = parse_set_cookie("tok=x", "portal.example").unwrap();
        assert_eq!(rec.domain, "portal.example");
        assert_eq!(rec.path, "/");
        assert!(!rec.secure);
    }

    #[test]
    fn parse_rejects_attribute_only_header() {
        assert!(parse_set_cookie("; Secure", "portal.example").is_none());
    }

    #[test]
    fn merge_replaces_matching_key_and_appends_new() {
        let old = parse_set_cookie("sid=old; Path=/", "portal.example").unwrap();
        let mut snapshot = vec![old];

        let newer = parse_set_cookie("sid=new; Path=/", "portal.example").unwrap();
        let other = parse_set_cookie("csrf=tok; Path=/", "portal.example").unwrap();
        merge(&mut snapshot, vec![newer, other]);

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].value, "new");
        assert_eq!(snapshot[1].name, "csrf");
    }

    #[test]
    fn cookie_string_round_trips_through_parse() {
        let rec = parse_set_cookie("sid=abc; Domain=portal.example; Secure", "x").unwrap();
        let reparsed = parse_set_cookie(&rec.to_cookie_string(), "x").unwrap();
        assert_eq!(reparsed.name, rec.name);
        assert_eq!(reparsed.value, rec.value);
        assert_eq!(reparsed.domain, rec.domain);
        assert!(reparsed.secure);
    }

    #[test]
    fn load_returns_none_for_missing_or_empty_snapshot() {
        let dir = std::env::temp_dir().join("task-warden-test-session-missing");
        let _ = std::fs::remove_dir_all(&dir);
        assert!(load(&dir).is_none());

        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(session_path(&dir), "[]").unwrap();
        assert!(load(&dir).is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
