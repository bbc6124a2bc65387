//! Availability probing.
//!
//! One bounded fetch of a source's listing endpoint, one explicit outcome.
//! "Nothing there" and "couldn't look" are signals, not errors — the
//! dispatcher branches on the variant instead of catching exceptions.

use scraper::{Html, Selector};
use std::sync::OnceLock;
use tracing::{info, warn};

use super::PortalClient;
use crate::core::config::SourceSettings;
use crate::dispatch::{Blacklist, TaskTracker};
use crate::sources::WorkRef;

/// What a probe of one source's listing turned up.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    /// Actionable references survive filtering and a recognized kind is
    /// present on the listing.
    Available(Vec<WorkRef>),
    NoWork,
    /// Listing redirected to the sign-in page — the shared session is gone
    /// and the dispatcher must take the whole run idle.
    SessionInvalid,
    /// Non-success status or network failure; reported, never thrown.
    Unreachable(Option<u16>),
}

/// Probe one source's listing endpoint through the shared portal session.
pub async fn probe(
    portal: &PortalClient,
    source: &SourceSettings,
    tracker: &TaskTracker,
    blacklist: &Blacklist,
) -> ProbeOutcome {
    let page = match portal.ctx().fetch(&source.endpoint).await {
        Ok(p) => p,
        Err(e) => {
            warn!("probe '{}': {}", source.kind, e);
            return ProbeOutcome::Unreachable(None);
        }
    };

    if portal.settings().is_signin(&page.final_url) {
        info!(
            "probe '{}': redirected to sign-in — session may have expired or user was logged out",
            source.kind
        );
        return ProbeOutcome::SessionInvalid;
    }

    if !page.is_success() {
        warn!(
            "probe '{}': listing returned {} ({})",
            source.kind,
            page.status,
            page.body.chars().take(50).collect::<String>()
        );
        return ProbeOutcome::Unreachable(Some(page.status));
    }

    let refs = extract_refs(
        &page.body,
        &portal.settings().available_marker,
        |href| portal.settings().absolute(href),
    );

    let fresh: Vec<WorkRef> = refs
        .into_iter()
        .filter(|r| !tracker.is_tracked(&r.id))
        .filter(|r| !blacklist.contains(&r.url))
        .collect();

    if fresh.is_empty() {
        return ProbeOutcome::NoWork;
    }

    // The listing must also mention a kind this source knows how to execute;
    // references alone can belong to foreign task types.
    if source.matches_kind(&page.body) {
        ProbeOutcome::Available(fresh)
    } else {
        ProbeOutcome::NoWork
    }
}

/// Pull work-item references out of a listing document: every anchor whose
/// href contains the availability marker, keyed by its first numeric run.
/// Anchors without a numeric id are dropped.
pub fn extract_refs(
    html: &str,
    marker: &str,
    absolutize: impl Fn(&str) -> String,
) -> Vec<WorkRef> {
    static ANCHORS: OnceLock<Selector> = OnceLock::new();
    let anchors = ANCHORS.get_or_init(|| Selector::parse("a[href]").expect("valid selector"));

    let doc = Html::parse_document(html);
    let mut refs: Vec<WorkRef> = Vec::new();
    for el in doc.select(anchors) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        if !href.contains(marker) {
            continue;
        }
        let Some(id) = super::first_number(href).map(|n| n.to_string()) else {
            continue;
        };
        let url = absolutize(href);
        if refs.iter().any(|r| r.id == id) {
            continue; // listing repeats anchors for styling, keep one per id
        }
        refs.push(WorkRef { id, url });
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKER: &str = "next=/board/available/";

    fn absolutize(href: &str) -> String {
        format!("https://portal.example{}", href)
    }

    #[test]
    fn extracts_marked_anchors_with_numeric_ids() {
        let html = r#"
            <a href="/board/available/tasks/view/101?next=/board/available/tasks">FEED/Post</a>
            <a href="/board/available/tasks/view/102?next=/board/available/tasks">FEED/Profile</a>
            <a href="/about">about</a>
            <a href="/board/available/tasks/view/nothing?next=/board/available/tasks">odd</a>
        "#;
        let refs = extract_refs(html, MARKER, absolutize);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].id, "101");
        assert_eq!(
            refs[0].url,
            "https://portal.example/board/available/tasks/view/101?next=/board/available/tasks"
        );
        assert_eq!(refs[1].id, "102");
    }

    #[test]
    fn duplicate_ids_collapse_to_one_reference() {
        let html = r#"
            <a href="/v/7?next=/board/available/a">first</a>
            <a href="/v/7?next=/board/available/b">styled twin</a>
        "#;
        let refs = extract_refs(html, MARKER, absolutize);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].id, "7");
    }

    #[test]
    fn unmarked_or_empty_listing_yields_nothing() {
        assert!(extract_refs("<a href='/x/1'>x</a>", MARKER, absolutize).is_empty());
        assert!(extract_refs("", MARKER, absolutize).is_empty());
    }
}
