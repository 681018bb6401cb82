use crate::ApiError;
use anyhow::Result;
use reqwest::{Response, StatusCode};
use tracing::trace;

/// Check the response status and map failures onto `ApiError`.
/// Returns Ok(Response) if successful.
pub async fn check_response_error(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let response_text = response
        .text()
        .await
        .map_err(|e| ApiError::NetworkError(e.to_string()))?;

    trace!("Error response ({}): {}", status, response_text);

    let error = match status {
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimit(response_text),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Authentication(response_text),
        StatusCode::BAD_REQUEST => ApiError::InvalidRequest(response_text),
        status if status.is_server_error() => ApiError::ServiceError(response_text),
        _ => ApiError::Unknown(format!("Status {status}: {response_text}")),
    };

    Err(error.into())
}

/// Read the body of a successful response and parse it as `T`.
pub async fn parse_response_body<T: serde::de::DeserializeOwned>(
    response: Response,
    provider: &str,
) -> Result<T> {
    let response_text = response
        .text()
        .await
        .map_err(|e| ApiError::NetworkError(e.to_string()))?;

    trace!("{} response: {}", provider, response_text);

    let parsed = serde_json::from_str(&response_text)
        .map_err(|e| ApiError::Unknown(format!("Failed to parse response: {e}")))?;
    Ok(parsed)
}
