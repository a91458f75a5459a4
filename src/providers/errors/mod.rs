use crate::errors::RuntimeError;
use serde_json::Value;
use tracing::{error, warn};

/// Shared HTTP error classification for model providers.
pub struct ProviderErrorHandler;

impl ProviderErrorHandler {
    /// Parse an API error body into a typed error.
    pub fn parse_api_error(status: u16, error_text: &str) -> RuntimeError {
        let retryable = matches!(status, 500 | 502 | 503 | 504);

        if let Ok(error_json) = serde_json::from_str::<Value>(error_text)
            && let Some(err) = error_json.get("error")
        {
            let error_type = err
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            let error_msg = err
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown error");

            if error_type == "not_found_error" || error_type == "model_not_found" {
                return RuntimeError::ModelUnavailable {
                    message: format!(
                        "{}. Check agent.model in your config file.",
                        error_msg
                    ),
                    retryable: false,
                };
            }

            return RuntimeError::ModelUnavailable {
                message: format!("API error ({}): {}", error_type, error_msg),
                retryable,
            };
        }

        RuntimeError::ModelUnavailable {
            message: format!("API error ({}): {}", status, error_text),
            retryable,
        }
    }

    /// Check HTTP status and return a typed error if the response is not successful.
    /// On success, returns the response unchanged for further processing.
    pub async fn check_http_status(
        resp: reqwest::Response,
        provider: &str,
    ) -> Result<reqwest::Response, anyhow::Error> {
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());

        let error_text = resp
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());

        if status == 429 {
            warn!(
                "{} rate limit hit (retry after {:?}s)",
                provider, retry_after
            );
            return Err(RuntimeError::RateLimited { retry_after }.into());
        }

        if status == 401 || status == 403 {
            warn!("{} authentication error ({}): {}", provider, status, error_text);
            return Err(RuntimeError::Auth(format!(
                "Authentication failed. Please check your API key. Error: {}",
                error_text
            ))
            .into());
        }

        error!("{} API error ({})", provider, status);
        Err(Self::parse_api_error(status, &error_text).into())
    }

    /// Check an HTTP response for errors, returning the body as JSON on success.
    pub async fn check_response(
        resp: reqwest::Response,
        provider: &str,
    ) -> Result<Value, anyhow::Error> {
        let resp = Self::check_http_status(resp, provider).await?;

        let json: Value = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse {} API response: {}", provider, e))?;

        // Some gateways report errors in a 200 body
        if let Some(error_val) = json.get("error") {
            let error_text =
                serde_json::to_string(error_val).unwrap_or_else(|_| "Unknown error".to_string());
            error!("{} returned an error payload", provider);
            return Err(Self::parse_api_error(200, &format!("{{\"error\":{}}}", error_text)).into());
        }

        Ok(json)
    }
}
