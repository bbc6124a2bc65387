//! Source variants and the worker capability seam.
//!
//! The dispatcher knows a **closed set** of upstream source kinds. Each kind
//! carries its own [`Worker`] implementation behind a common trait: classify a
//! fetched detail document, perform the interaction for an actionable item,
//! tear the session down. Adding a source means adding a variant here and a
//! sibling module — there is no runtime name→callable registry.

pub mod feed;
pub mod gallery;
pub mod invite;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::session::ExecutionContext;

// ── Source kinds ─────────────────────────────────────────────────────────────

/// The boards this dispatcher knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Microblog-style feed board (post / profile items).
    Feed,
    /// Invite board (group / channel join items).
    Invite,
    /// Gallery board (album / snapshot items).
    Gallery,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [SourceKind::Feed, SourceKind::Invite, SourceKind::Gallery];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Feed => "feed",
            SourceKind::Invite => "invite",
            SourceKind::Gallery => "gallery",
        }
    }

    /// Parse a source name as used in config files and API paths.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "feed" => Some(SourceKind::Feed),
            "invite" => Some(SourceKind::Invite),
            "gallery" => Some(SourceKind::Gallery),
            _ => None,
        }
    }

    /// The worker implementation for this variant.
    pub fn worker(&self) -> &'static dyn Worker {
        match self {
            SourceKind::Feed => &feed::FeedWorker,
            SourceKind::Invite => &invite::InviteWorker,
            SourceKind::Gallery => &gallery::GalleryWorker,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Work items ───────────────────────────────────────────────────────────────

/// A reference to one unit of work, as extracted from a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkRef {
    /// Numeric board identifier, unique per portal.
    pub id: String,
    /// Absolute URL of the detail view.
    pub url: String,
}

/// A fully-resolved actionable item (detail view parsed successfully).
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub reference: WorkRef,
    /// The matched work-kind label (one of the source's configured kinds).
    pub kind: String,
    /// Outbound target the interaction acts against.
    pub target_url: String,
    pub proof_required: bool,
}

/// What a detail document turned out to be.
///
/// `AlreadyDone` and `Gone` are distinct on purpose: the first is benign (the
/// record completes with its own message), the second permanently blacklists
/// the reference.
#[derive(Debug, Clone)]
pub enum ItemState {
    Actionable(WorkItem),
    AlreadyDone,
    Gone,
    /// No recognized work kind in the document — not for this worker, skip it
    /// permanently.
    NotRecognized,
}

/// Result of a completed interaction.
#[derive(Debug, Clone)]
pub struct Interaction {
    /// Human-readable confirmation extracted from the target.
    pub confirmation: String,
    /// Proof artifact written under the state dir, when one was captured.
    pub proof_path: Option<std::path::PathBuf>,
}

// ── Worker errors ────────────────────────────────────────────────────────────

/// Failure taxonomy at the worker boundary.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Transient network failure — retried a bounded number of times, then
    /// logged and dropped. Never fatal to the run.
    #[error("network: {0}")]
    Network(String),
    /// The source's session is no longer authenticated. Disables the source
    /// until it is re-enabled externally.
    #[error("authentication required")]
    Auth,
    /// The referenced target is gone or was never valid. Blacklists the
    /// reference.
    #[error("invalid or expired reference")]
    InvalidReference,
    /// Anything else — caught at the worker boundary and logged with context.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

// ── Worker trait ─────────────────────────────────────────────────────────────

/// Capability interface every source variant implements.
///
/// `classify` is synchronous by design: detail documents are parsed inside a
/// sync scope so no parser state is held across await points.
#[async_trait::async_trait]
pub trait Worker: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Decide what a fetched detail document is, against the source's
    /// recognized work kinds.
    fn classify(&self, kinds: &[String], reference: &WorkRef, detail_html: &str) -> ItemState;

    /// Act on an actionable item through the execution context.
    async fn interact(
        &self,
        ctx: &ExecutionContext,
        item: &WorkItem,
    ) -> Result<Interaction, WorkerError>;

    /// Post-run cleanup hook. The dispatcher persists the session snapshot
    /// after calling this.
    async fn teardown(&self, ctx: &ExecutionContext);
}

// ── Shared detail-document helpers ───────────────────────────────────────────

/// Portal detail-page markup contract, shared by all variants:
/// * a recognized kind label appears in the body text,
/// * the outbound target is the `a.task-target` anchor (legacy markup used a
///   bare `a[target="_blank"]`, still accepted),
/// * `div.task-state` carries "already completed" / "no longer available"
///   when the item is not actionable.
pub(crate) fn classify_detail(kinds: &[String], detail_html: &str) -> ItemState {
    use scraper::{Html, Selector};

    let doc = Html::parse_document(detail_html);
    let body_text: String = doc.root_element().text().collect();

    let state_sel = Selector::parse("div.task-state").expect("valid selector");
    if let Some(state) = doc.select(&state_sel).next() {
        let text: String = state.text().collect::<String>().to_ascii_lowercase();
        if text.contains("already completed") {
            return ItemState::AlreadyDone;
        }
        if text.contains("no longer available") || text.contains("expired") {
            return ItemState::Gone;
        }
    }

    let Some(kind) = kinds.iter().find(|k| body_text.contains(k.as_str())) else {
        return ItemState::NotRecognized;
    };

    let target = ["a.task-target", r#"a[target="_blank"]"#]
        .iter()
        .filter_map(|sel| Selector::parse(sel).ok())
        .find_map(|sel| {
            doc.select(&sel)
                .find_map(|el| el.value().attr("href"))
                .map(|href| href.trim().to_string())
        });

    match target {
        Some(target_url) if !target_url.is_empty() => {
            let proof_sel = Selector::parse("input#proof_img, input.proof-upload")
                .expect("valid selector");
            let proof_required = doc.select(&proof_sel).next().is_some();
            ItemState::Actionable(WorkItem {
                reference: WorkRef {
                    id: String::new(),
                    url: String::new(),
                },
                kind: kind.clone(),
                target_url,
                proof_required,
            })
        }
        // Kind matched but no outbound target — the item view is incomplete,
        // treat as gone rather than retrying forever.
        _ => ItemState::Gone,
    }
}

/// Fill in the reference on a classified item (classify_detail does not know
/// which listing entry produced the document).
pub(crate) fn with_reference(state: ItemState, reference: &WorkRef) -> ItemState {
    match state {
        ItemState::Actionable(mut item) => {
            item.reference = reference.clone();
            ItemState::Actionable(item)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KINDS: &[&str] = &["FEED/Post", "FEED/Profile"];

    fn kinds() -> Vec<String> {
        KINDS.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn detail_with_kind_and_target_is_actionable() {
        let html = r#"<html><body>
            <p>TASK DETAILS</p><span>FEED/Post</span>
            <a class="task-target" href="https://feeds.example/p/42">open</a>
        </body></html>"#;
        match classify_detail(&kinds(), html) {
            ItemState::Actionable(item) => {
                assert_eq!(item.kind, "FEED/Post");
                assert_eq!(item.target_url, "https://feeds.example/p/42");
                assert!(!item.proof_required);
            }
            other => panic!("expected actionable, got {:?}", other),
        }
    }

    #[test]
    fn legacy_blank_target_anchor_is_accepted() {
        let html = r#"<body><span>FEED/Profile</span>
            <a target="_blank" href="https://feeds.example/u/9">open</a></body>"#;
        assert!(matches!(
            classify_detail(&kinds(), html),
            ItemState::Actionable(_)
        ));
    }

    #[test]
    fn proof_upload_field_marks_proof_required() {
        let html = r#"<body><span>FEED/Post</span>
            <a class="task-target" href="https://feeds.example/p/1">open</a>
            <input type="file" id="proof_img"></body>"#;
        match classify_detail(&kinds(), html) {
            ItemState::Actionable(item) => assert!(item.proof_required),
            other => panic!("expected actionable, got {:?}", other),
        }
    }

    #[test]
    fn completed_state_is_benign_not_banned() {
        let html = r#"<body><div class="task-state">Already completed</div></body>"#;
        assert!(matches!(classify_detail(&kinds(), html), ItemState::AlreadyDone));
    }

    #[test]
    fn expired_state_is_gone() {
        let html = r#"<body><div class="task-state">This task is no longer available</div></body>"#;
        assert!(matches!(classify_detail(&kinds(), html), ItemState::Gone));
    }

    #[test]
    fn unknown_kind_is_not_recognized() {
        let html = r#"<body><span>INVITE/Group</span>
            <a class="task-target" href="https://x.example">open</a></body>"#;
        assert!(matches!(
            classify_detail(&kinds(), html),
            ItemState::NotRecognized
        ));
    }

    #[test]
    fn kind_without_target_is_gone() {
        let html = r#"<body><span>FEED/Post</span></body>"#;
        assert!(matches!(classify_detail(&kinds(), html), ItemState::Gone));
    }

    #[test]
    fn source_kind_parse_round_trips_names() {
        for kind in SourceKind::ALL {
            assert_eq!(SourceKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SourceKind::parse("Feed "), Some(SourceKind::Feed));
        assert_eq!(SourceKind::parse("forum"), None);
    }
}
