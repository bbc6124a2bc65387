//! Feed source — post and profile items on a microblog-style board.

use scraper::{Html, Selector};
use tracing::debug;

use super::{
    classify_detail, with_reference, Interaction, ItemState, SourceKind, WorkItem, WorkRef, Worker,
    WorkerError,
};
use crate::session::ExecutionContext;

pub struct FeedWorker;

#[async_trait::async_trait]
impl Worker for FeedWorker {
    fn kind(&self) -> SourceKind {
        SourceKind::Feed
    }

    fn classify(&self, kinds: &[String], reference: &WorkRef, detail_html: &str) -> ItemState {
        with_reference(classify_detail(kinds, detail_html), reference)
    }

    async fn interact(
        &self,
        ctx: &ExecutionContext,
        item: &WorkItem,
    ) -> Result<Interaction, WorkerError> {
        let page = ctx.fetch(&item.target_url).await?;
        match page.status {
            404 | 410 => return Err(WorkerError::InvalidReference),
            s if !(200..300).contains(&s) => {
                return Err(WorkerError::Network(format!(
                    "feed target returned {}",
                    s
                )))
            }
            _ => {}
        }

        // A feed target must actually be a post/profile page, not a parked or
        // error document.
        let Some(confirmation) = confirm_feed_target(&page.body) else {
            return Err(WorkerError::InvalidReference);
        };

        let proof_path = if item.proof_required {
            Some(
                ctx.write_proof(&item.reference.id, excerpt(&page.body))
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
        debug!("feed worker teardown (context {})", ctx.id);
    }
}

/// Verify the target looks like feed content and pull a confirmation label
/// out of it: the og:title, or the first heading, or the post element itself.
fn confirm_feed_target(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);

    let post = Selector::parse("article, div.post").expect("valid selector");
    doc.select(&post).next()?;

    let og = Selector::parse(r#"meta[property="og:title"]"#).expect("valid selector");
    if let Some(title) = doc
        .select(&og)
        .next()
        .and_then(|m| m.value().attr("content"))
        .filter(|t| !t.trim().is_empty())
    {
        return Some(title.trim().to_string());
    }

    let heading = Selector::parse("h1, h2").expect("valid selector");
    if let Some(h) = doc.select(&heading).next() {
        let text: String = h.text().collect::<String>().trim().to_string();
        if !text.is_empty() {
            return Some(text);
        }
    }

    Some("post reachable".to_string())
}

fn excerpt(body: &str) -> &str {
    let end = body
        .char_indices()
        .nth(2048)
        .map(|(i, _)| i)
        .unwrap_or(body.len());
    &body[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_page_confirms_with_og_title() {
        let html = r#"<head><meta property="og:title" content="morning update"></head>
            <body><article>hello</article></body>"#;
        assert_eq!(confirm_feed_target(html), Some("morning update".to_string()));
    }

    #[test]
    fn post_page_falls_back_to_heading_then_generic() {
        let html = "<body><article><h2>weekly digest</h2></article></body>";
        assert_eq!(confirm_feed_target(html), Some("weekly digest".to_string()));

        let html = "<body><div class='post'>bare</div></body>";
        assert_eq!(confirm_feed_target(html), Some("post reachable".to_string()));
    }

    #[test]
    fn non_post_page_is_rejected() {
        assert_eq!(confirm_feed_target("<body><h1>404</h1></body>"), None);
    }

    #[test]
    fn excerpt_is_bounded_and_char_safe() {
        let body = "é".repeat(5000);
        let ex = excerpt(&body);
        assert!(ex.chars().count() <= 2048);
        assert!(body.starts_with(ex));
    }
}
