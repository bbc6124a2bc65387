//! Invite source — group and channel join items.
//!
//! Invite targets come in two shapes: private invite links carrying a `/+`
//! hash, and public handles. Both resolve to a join page whose response text
//! distinguishes "joined", "request pending", "already a member" (all benign)
//! from "expired / no longer valid" (permanent — the reference gets
//! blacklisted by the dispatcher).

use tracing::debug;

use super::{
    classify_detail, with_reference, Interaction, ItemState, SourceKind, WorkItem, WorkRef, Worker,
    WorkerError,
};
use crate::session::ExecutionContext;

pub struct InviteWorker;

#[async_trait::async_trait]
impl Worker for InviteWorker {
    fn kind(&self) -> SourceKind {
        SourceKind::Invite
    }

    fn classify(&self, kinds: &[String], reference: &WorkRef, detail_html: &str) -> ItemState {
        with_reference(classify_detail(kinds, detail_html), reference)
    }

    async fn interact(
        &self,
        ctx: &ExecutionContext,
        item: &WorkItem,
    ) -> Result<Interaction, WorkerError> {
        let target = normalize_target(&item.target_url);

        let page = ctx.fetch(&target).await?;
        match page.status {
            404 | 410 => return Err(WorkerError::InvalidReference),
            s if !(200..300).contains(&s) => {
                return Err(WorkerError::Network(format!("invite target returned {}", s)))
            }
            _ => {}
        }

        let confirmation = match read_join_signal(&page.body) {
            JoinSignal::Joined => "joined".to_string(),
            JoinSignal::Requested => "successfully requested to join".to_string(),
            JoinSignal::AlreadyMember => "already a member".to_string(),
            JoinSignal::Expired => return Err(WorkerError::InvalidReference),
            JoinSignal::AccessDenied => return Err(WorkerError::Auth),
            JoinSignal::Unrecognized => {
                return Err(WorkerError::Unexpected(anyhow::anyhow!(
                    "no recognizable join response at {}",
                    target
                )))
            }
        };

        let proof_path = if item.proof_required {
            Some(
                ctx.write_proof(&item.reference.id, &page.body)
                    .await?,
            )
        } else {
            None
        };

        Ok(Interaction {
            confirmation,
            proof_path,
        })
    }

    async fn teardown(&self, ctx: &ExecutionContext) {
        debug!("invite worker teardown (context {})", ctx.id);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum JoinSignal {
    Joined,
    Requested,
    AlreadyMember,
    Expired,
    AccessDenied,
    Unrecognized,
}

/// Map the join page's response text to a signal. Expired invites are the
/// only permanent condition; pending requests and existing membership are as
/// good as joined.
fn read_join_signal(body: &str) -> JoinSignal {
    let text = body.to_ascii_lowercase();
    if text.contains("expired") || text.contains("no longer valid") {
        JoinSignal::Expired
    } else if text.contains("sign in to continue") || text.contains("access denied") {
        JoinSignal::AccessDenied
    } else if text.contains("already a member") || text.contains("already a participant") {
        JoinSignal::AlreadyMember
    } else if text.contains("requested to join") {
        JoinSignal::Requested
    } else if text.contains("you joined") || text.contains("member-list") {
        JoinSignal::Joined
    } else {
        JoinSignal::Unrecognized
    }
}

/// Strip query noise from an invite handle or hash: keep the target up to the
/// first character that cannot be part of a handle (`[A-Za-z0-9_-]`).
fn sanitize_handle(handle: &str) -> &str {
    let end = handle
        .char_indices()
        .find(|(_, c)| !c.is_ascii_alphanumeric() && *c != '_' && *c != '-')
        .map(|(i, _)| i)
        .unwrap_or(handle.len());
    &handle[..end]
}

/// Normalize an invite target URL: private `/+hash` and public `/handle`
/// forms both get their trailing segment sanitized.
fn normalize_target(url: &str) -> String {
    if let Some(pos) = url.find("/+") {
        let (head, hash) = url.split_at(pos + 2);
        return format!("{}{}", head, sanitize_handle(hash));
    }
    let trimmed = url.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((head, last)) => format!("{}/{}", head, sanitize_handle(last)),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_invite_hash_is_sanitized() {
        assert_eq!(
            normalize_target("https://chat.example/+AbC-12_x?utm=promo"),
            "https://chat.example/+AbC-12_x"
        );
    }

    #[test]
    fn public_handle_drops_query_noise() {
        assert_eq!(
            normalize_target("https://chat.example/rustaceans?ref=board"),
            "https://chat.example/rustaceans"
        );
        assert_eq!(
            normalize_target("https://chat.example/rustaceans/"),
            "https://chat.example/rustaceans"
        );
    }

    #[test]
    fn join_signals_map_benign_and_permanent_cases() {
        assert_eq!(
            read_join_signal("You have successfully requested to join"),
            JoinSignal::Requested
        );
        assert_eq!(
            read_join_signal("user is already a participant of the chat"),
            JoinSignal::AlreadyMember
        );
        assert_eq!(
            read_join_signal("This invite link has expired"),
            JoinSignal::Expired
        );
        assert_eq!(
            read_join_signal("Please sign in to continue"),
            JoinSignal::AccessDenied
        );
        assert_eq!(read_join_signal("<p>weather report</p>"), JoinSignal::Unrecognized);
    }
}
