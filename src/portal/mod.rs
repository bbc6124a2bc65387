//! Upstream portal client.
//!
//! The portal is the central site that lists available work, serves detail
//! views and accepts submissions. This module owns the *shared* portal
//! session (one execution context seeded from the persisted snapshot) and the
//! session-level operations: dashboard validation and the posted-total gauge.
//! Per-source probing lives in [`probe`], the submission flow in [`submit`].

pub mod probe;
pub mod submit;

use scraper::{Html, Selector};
use std::path::Path;
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::core::config::PortalSettings;
use crate::features::session_store::CookieRecord;
use crate::session::ExecutionContext;

/// Outcome of a dashboard validation fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCheck {
    /// Dashboard reachable without a sign-in redirect — session is live.
    Valid,
    /// Redirected to the sign-in page — session expired or logged out.
    Expired,
    /// Network failure or unexpected landing page.
    Unreachable,
}

pub struct PortalClient {
    ctx: ExecutionContext,
    settings: PortalSettings,
}

impl PortalClient {
    pub fn new(
        settings: PortalSettings,
        seed: &[CookieRecord],
        state_dir: &Path,
    ) -> anyhow::Result<Self> {
        let ctx = ExecutionContext::new(&settings.base, seed, state_dir, settings.http_timeout)?;
        Ok(Self { ctx, settings })
    }

    pub fn settings(&self) -> &PortalSettings {
        &self.settings
    }

    /// The shared session context (probing runs through it).
    pub fn ctx(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Cookies observed on the shared session since creation.
    pub fn observed_cookies(&self) -> Vec<CookieRecord> {
        self.ctx.observed_cookies()
    }

    /// One fetch of the dashboard to decide whether the stored session is
    /// still authenticated.
    pub async fn validate_session(&self) -> SessionCheck {
        let page = match self.ctx.fetch(&self.settings.dashboard_url()).await {
            Ok(p) => p,
            Err(e) => {
                warn!("portal: dashboard unreachable: {}", e);
                return SessionCheck::Unreachable;
            }
        };

        if self.settings.is_signin(&page.final_url) {
            info!("portal: session expired — landed on sign-in page");
            return SessionCheck::Expired;
        }
        if page.is_success() && page.final_url.path().starts_with(&self.settings.dashboard_path) {
            return SessionCheck::Valid;
        }

        warn!(
            "portal: unexpected landing page during validation: {} ({})",
            page.final_url, page.status
        );
        SessionCheck::Unreachable
    }

    /// Best-effort read of the portal's running posted-task total from the
    /// done-tasks page. `None` when the page or the marker is unavailable.
    pub async fn posted_total(&self) -> Option<u64> {
        let page = match self.ctx.fetch(&self.settings.done_url()).await {
            Ok(p) => p,
            Err(e) => {
                warn!("portal: posted-total fetch failed: {}", e);
                return None;
            }
        };
        if self.settings.is_signin(&page.final_url) || !page.is_success() {
            return None;
        }
        let total = parse_posted_total(&page.body);
        if total.is_none() {
            info!("portal: no posted-total marker on done-tasks page");
        }
        total
    }
}

/// Extract the running total from the done-tasks page: the first integer in
/// the `div.marquee span` banner.
pub fn parse_posted_total(html: &str) -> Option<u64> {
    static SEL: OnceLock<Selector> = OnceLock::new();
    let sel = SEL.get_or_init(|| Selector::parse("div.marquee span").expect("valid selector"));

    let doc = Html::parse_document(html);
    let text: String = doc.select(sel).next()?.text().collect();
    first_number(&text)
}

pub(crate) fn first_number(text: &str) -> Option<u64> {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"\d+").expect("valid regex"));
    re.find(text)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posted_total_reads_first_integer_in_marquee() {
        let html = r#"<div class="marquee"><span>4519 tasks posted so far</span></div>"#;
        assert_eq!(parse_posted_total(html), Some(4519));
    }

    #[test]
    fn posted_total_none_without_marker_element() {
        assert_eq!(parse_posted_total("<div><span>4519</span></div>"), None);
        assert_eq!(
            parse_posted_total(r#"<div class="marquee"><span>no numbers here</span></div>"#),
            None
        );
    }
}
