//! Task submission.
//!
//! Reaches a task's submission view, posts the account + proof form, and maps
//! the portal's alert banners to an explicit [`SubmitOutcome`]. "Already
//! recorded" is its own variant, distinct from both success and rejection, so
//! callers never infer intent from banner text.

use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use scraper::{Html, Selector};
use std::path::Path;
use std::sync::OnceLock;
use tracing::info;

use crate::core::config::PortalSettings;
use crate::session::{ExecutionContext, FetchedPage};
use crate::sources::WorkerError;

/// Terminal result of one submission flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The portal accepted the submission.
    Accepted(String),
    /// The portal already holds a record for this task — benign, the item is
    /// done as far as this run is concerned.
    AlreadyRecorded(String),
    /// The portal refused the submission.
    Rejected(String),
    /// No recognizable response banner — treated as failure.
    NoResponse,
}

const DUPLICATE_BANNER: &str = "already have a record";
const EXHAUSTED_BANNER: &str = "look for another available task";

/// Drive one submission: reach the view, post the form, read the banner.
pub async fn submit(
    ctx: &ExecutionContext,
    settings: &PortalSettings,
    task_id: &str,
    account_id: &str,
    proof_path: Option<&Path>,
) -> Result<SubmitOutcome, WorkerError> {
    let url = settings.submit_url(task_id);
    let page = fetch_with_retry(ctx, &url).await?;

    if settings.is_signin(&page.final_url) {
        return Err(WorkerError::Auth);
    }

    // Redirected away from the submission view: back on the availability
    // listing means the portal already processed this task.
    if !page.final_url.path().starts_with(&settings.submit_path) {
        if settings.is_available_listing(&page.final_url) {
            return Ok(parse_submit_response(&page.body));
        }
        return Ok(SubmitOutcome::Rejected(format!(
            "unexpected redirect — task may be invalid ({})",
            page.final_url
        )));
    }

    match inspect_form(&page.body, account_id) {
        FormCheck::Ready => {}
        FormCheck::MissingElements => {
            return Ok(SubmitOutcome::Rejected(
                "required submission elements not present".to_string(),
            ));
        }
        FormCheck::UnknownAccount => {
            return Ok(SubmitOutcome::Rejected(format!(
                "account {} not selectable on submission form",
                account_id
            )));
        }
    }

    let mut form: Vec<(&str, String)> = vec![("account", account_id.to_string())];
    if let Some(proof) = proof_path {
        let name = proof
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        form.push(("proof_img", name));
    }

    let resp = ctx.post_form(&url, &form).await?;
    if settings.is_signin(&resp.final_url) {
        return Err(WorkerError::Auth);
    }

    let outcome = parse_submit_response(&resp.body);
    info!("submission {} → {:?}", task_id, outcome);
    Ok(outcome)
}

async fn fetch_with_retry(ctx: &ExecutionContext, url: &str) -> Result<FetchedPage, WorkerError> {
    retry(
        ExponentialBackoffBuilder::new()
            .with_initial_interval(std::time::Duration::from_millis(200))
            .with_max_interval(std::time::Duration::from_secs(2))
            .with_max_elapsed_time(Some(std::time::Duration::from_secs(6)))
            .build(),
        || async {
            match ctx.fetch(url).await {
                Ok(page) => Ok(page),
                // Only network failures are transient; everything else is a
                // judgment for the caller.
                Err(e @ WorkerError::Network(_)) => Err(backoff::Error::transient(e)),
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        },
    )
    .await
}

enum FormCheck {
    Ready,
    MissingElements,
    UnknownAccount,
}

/// The submission view must carry the account selector and submit button, and
/// the selector must offer the caller's account id.
fn inspect_form(html: &str, account_id: &str) -> FormCheck {
    static SELECT: OnceLock<Selector> = OnceLock::new();
    static SUBMIT: OnceLock<Selector> = OnceLock::new();
    let select = SELECT.get_or_init(|| Selector::parse("select#select").expect("valid selector"));
    let submit =
        SUBMIT.get_or_init(|| Selector::parse("button[type=submit]").expect("valid selector"));

    let doc = Html::parse_document(html);
    let Some(select_el) = doc.select(select).next() else {
        return FormCheck::MissingElements;
    };
    if doc.select(submit).next().is_none() {
        return FormCheck::MissingElements;
    }

    let option = Selector::parse("option[value]").expect("valid selector");
    let has_account = select_el
        .select(&option)
        .any(|o| o.value().attr("value") == Some(account_id));
    if has_account {
        FormCheck::Ready
    } else {
        FormCheck::UnknownAccount
    }
}

/// Map the portal's alert banners to an outcome.
pub fn parse_submit_response(html: &str) -> SubmitOutcome {
    static SUCCESS: OnceLock<Selector> = OnceLock::new();
    static DANGER: OnceLock<Selector> = OnceLock::new();
    let success =
        SUCCESS.get_or_init(|| Selector::parse("div.alert.alert-success").expect("valid selector"));
    let danger =
        DANGER.get_or_init(|| Selector::parse("div.alert.alert-danger").expect("valid selector"));

    let doc = Html::parse_document(html);

    if let Some(el) = doc.select(success).next() {
        let text = collapse(el.text().collect::<String>());
        if text.contains(DUPLICATE_BANNER) || text.contains(EXHAUSTED_BANNER) {
            return SubmitOutcome::AlreadyRecorded(text);
        }
        // Any other success banner counts as accepted; the banner class is
        // authoritative, not its exact wording.
        return SubmitOutcome::Accepted(text);
    }

    if let Some(el) = doc.select(danger).next() {
        return SubmitOutcome::Rejected(collapse(el.text().collect::<String>()));
    }

    SubmitOutcome::NoResponse
}

fn collapse(text: String) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_banner_is_accepted() {
        let html = r#"<div class="alert alert-success" role="alert">
            Task submitted successfully
        </div>"#;
        assert_eq!(
            parse_submit_response(html),
            SubmitOutcome::Accepted("Task submitted successfully".to_string())
        );
    }

    #[test]
    fn duplicate_banner_is_already_recorded_not_accepted() {
        let html = r#"<div class="alert alert-success">You already have a record for this task</div>"#;
        assert!(matches!(
            parse_submit_response(html),
            SubmitOutcome::AlreadyRecorded(_)
        ));
    }

    #[test]
    fn exhausted_banner_is_already_recorded() {
        let html =
            r#"<div class="alert alert-success">All done — look for another available task</div>"#;
        assert!(matches!(
            parse_submit_response(html),
            SubmitOutcome::AlreadyRecorded(_)
        ));
    }

    #[test]
    fn danger_banner_is_rejected_with_its_text() {
        let html = r#"<div class="alert alert-danger">Proof image missing</div>"#;
        assert_eq!(
            parse_submit_response(html),
            SubmitOutcome::Rejected("Proof image missing".to_string())
        );
    }

    #[test]
    fn no_banner_is_no_response() {
        assert_eq!(parse_submit_response("<html></html>"), SubmitOutcome::NoResponse);
    }

    #[test]
    fn form_inspection_requires_account_option() {
        let html = r#"
            <select id="select"><option value="11">a</option></select>
            <button type="submit">Submit</button>
        "#;
        assert!(matches!(inspect_form(html, "11"), FormCheck::Ready));
        assert!(matches!(inspect_form(html, "99"), FormCheck::UnknownAccount));
        assert!(matches!(
            inspect_form("<p>empty</p>", "11"),
            FormCheck::MissingElements
        ));
    }
}
