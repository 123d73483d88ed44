use skaldi_core::error::ApiError;

const SUGGEST_ENDPOINT: &str = "https://suggestqueries.google.com/complete/search";
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Proxy one autocomplete query to the upstream suggestion endpoint.
pub async fn fetch_suggestions(
    client: &reqwest::Client,
    query: &str,
) -> Result<Vec<String>, ApiError> {
    let response = client
        .get(SUGGEST_ENDPOINT)
        .query(&[("client", "firefox"), ("ds", "yt"), ("oe", "utf8"), ("q", query)])
        .send()
        .await
        .map_err(|e| ApiError::Upstream(format!("suggestion fetch failed: {e}")))?;

    if !response.status().is_success() {
        return Err(ApiError::Upstream(format!(
            "suggestion endpoint returned {}",
            response.status()
        )));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| ApiError::Upstream(format!("suggestion fetch failed: {e}")))?;
    if body.len() > MAX_BODY_BYTES {
        return Err(ApiError::Upstream("suggestion response too large".into()));
    }

    parse_suggest_body(&body)
}

/// The wire shape is `[query, [suggestion, …], …]`; only the second element
/// matters.
fn parse_suggest_body(body: &[u8]) -> Result<Vec<String>, ApiError> {
    let raw: Vec<serde_json::Value> = serde_json::from_slice(body)
        .map_err(|e| ApiError::Upstream(format!("unparseable suggestion response: {e}")))?;

    match raw.into_iter().nth(1) {
        Some(values) => serde_json::from_value(values)
            .map_err(|e| ApiError::Upstream(format!("unparseable suggestion list: {e}"))),
        None => Ok(Vec::new()),
    }
}
