use crate::transport::{header_pairs, HttpClient, HttpError};
use reqwest::Url;
use tracing::info;

/// Upload the ingested event ids as a newline-joined plain-text body.
/// One-shot collaborator; the ingestion engine only calls this after an
/// orderly completion.
pub async fn submit_event_ids(
    http: &HttpClient,
    origin: &str,
    api_key: &str,
    github_repo: &str,
    ids: &[String],
) -> Result<(), HttpError> {
    let mut url = Url::parse(&format!("{origin}/api/v1/submissions"))
        .map_err(|err| HttpError::network("POST", origin, format!("invalid url: {err}")))?;
    url.query_pairs_mut().append_pair("github_repo", github_repo);

    let headers = header_pairs(&[("x-api-key", api_key)]);
    let body = ids.join("\n");

    let response = http.post_text(url.as_str(), body, headers).await?;
    info!(
        "submitted {} event ids (status {})",
        ids.len(),
        response.status
    );
    Ok(())
}
