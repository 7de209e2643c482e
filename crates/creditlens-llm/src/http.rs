//! Shared HTTP plumbing: client construction, status mapping and retries.

use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::backend::LlmError;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(8);

pub(crate) fn build_client(timeout: Duration) -> Result<reqwest::Client, LlmError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Turn a response into JSON, mapping error statuses onto `LlmError`.
pub(crate) async fn check_response_status(resp: reqwest::Response) -> Result<Value, LlmError> {
    let status = resp.status().as_u16();
    let text = resp.text().await?;

    if status == 429 {
        return Err(LlmError::RateLimitExceeded);
    }
    if status >= 400 {
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|body| {
                body["error"]["message"]
                    .as_str()
                    .or_else(|| body["message"].as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| truncate(&text, 200));
        return Err(LlmError::ApiError { status, message });
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
}

/// Send `request`, retrying rate limits, 5xx responses and transport errors
/// up to `max_retries` times with exponential backoff.
pub(crate) async fn send_with_retries(
    request: reqwest::RequestBuilder,
    max_retries: u32,
) -> Result<Value, LlmError> {
    let mut attempt = 0;
    loop {
        // Streaming bodies cannot be cloned; those get exactly one attempt.
        let Some(this_try) = request.try_clone() else {
            return check_response_status(request.send().await?).await;
        };

        let outcome = match this_try.send().await {
            Ok(resp) => check_response_status(resp).await,
            Err(e) => Err(LlmError::Http(e)),
        };

        match outcome {
            Err(e) if attempt < max_retries && is_retryable(&e) => {
                let delay = backoff_delay(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying backend request"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

pub(crate) fn is_retryable(err: &LlmError) -> bool {
    match err {
        LlmError::RateLimitExceeded => true,
        LlmError::ApiError { status, .. } => *status >= 500,
        LlmError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        _ => false,
    }
}

pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    INITIAL_BACKOFF
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(MAX_BACKOFF)
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
