//! Gallery source — album and snapshot items on a media board.

use scraper::{Html, Selector};
use tracing::debug;

use super::{
    classify_detail, with_reference, Interaction, ItemState, SourceKind, WorkItem, WorkRef, Worker,
    WorkerError,
};
use crate::session::ExecutionContext;

pub struct GalleryWorker;

#[async_trait::async_trait]
impl Worker for GalleryWorker {
    fn kind(&self) -> SourceKind {
        SourceKind::Gallery
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
                    "gallery target returned {}",
                    s
                )))
            }
            _ => {}
        }

        let Some(confirmation) = confirm_media_target(&page.body) else {
            return Err(WorkerError::InvalidReference);
        };

        let proof_path = if item.proof_required {
            Some(ctx.write_proof(&item.reference.id, &page.body).await?)
        } else {
            None
        };

        Ok(Interaction {
            confirmation,
            proof_path,
        })
    }

    async fn teardown(&self, ctx: &ExecutionContext) {
        debug!("gallery worker teardown (context {})", ctx.id);
    }
}

/// A gallery target must carry actual media markup. Confirmation label comes
/// from the figcaption, the og:title, or the first image's alt text.
fn confirm_media_target(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);

    let media = Selector::parse("figure, img").expect("valid selector");
    doc.select(&media).next()?;

    let caption = Selector::parse("figcaption").expect("valid selector");
    if let Some(c) = doc.select(&caption).next() {
        let text = c.text().collect::<String>().trim().to_string();
        if !text.is_empty() {
            return Some(text);
        }
    }

    let og = Selector::parse(r#"meta[property="og:title"]"#).expect("valid selector");
    if let Some(title) = doc
        .select(&og)
        .next()
        .and_then(|m| m.value().attr("content"))
        .filter(|t| !t.trim().is_empty())
    {
        return Some(title.trim().to_string());
    }

    let img = Selector::parse("img[alt]").expect("valid selector");
    if let Some(alt) = doc
        .select(&img)
        .next()
        .and_then(|i| i.value().attr("alt"))
        .filter(|a| !a.trim().is_empty())
    {
        return Some(alt.trim().to_string());
    }

    Some("media reachable".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn figcaption_wins_over_other_labels() {
        let html = r#"<figure><img src="a.jpg" alt="alt text">
            <figcaption>sunset over the bay</figcaption></figure>"#;
        assert_eq!(
            confirm_media_target(html),
            Some("sunset over the bay".to_string())
        );
    }

    #[test]
    fn bare_image_falls_back_to_alt_then_generic() {
        let html = r#"<img src="a.jpg" alt="city lights">"#;
        assert_eq!(confirm_media_target(html), Some("city lights".to_string()));

        let html = r#"<img src="a.jpg">"#;
        assert_eq!(confirm_media_target(html), Some("media reachable".to_string()));
    }

    #[test]
    fn page_without_media_is_rejected() {
        assert_eq!(confirm_media_target("<p>text only</p>"), None);
    }
}
