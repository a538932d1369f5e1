//! Result delivery to a caller-supplied callback URL.
//!
//! [`CallbackDelivery`] POSTs the final job result as JSON to the URL
//! the job named in its input. Delivery is single-attempt: the result
//! is also returned in the `/run` response body, so a missed callback
//! only costs the push, not the result.

use std::time::Duration;

/// HTTP request timeout for the delivery attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type for callback delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    /// The underlying HTTP request failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The remote server returned a non-2xx status code.
    #[error("Callback returned HTTP {0}")]
    HttpStatus(u16),
}

/// Delivers job results to external callback endpoints.
pub struct CallbackDelivery {
    client: reqwest::Client,
}

impl CallbackDelivery {
    pub fn new() -> Result<Self, CallbackError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// POST the result payload and check the response status.
    pub async fn deliver(
        &self,
        url: &str,
        payload: &serde_json::Value,
    ) -> Result<(), CallbackError> {
        let response = self.client.post(url).json(payload).send().await?;
        if !response.status().is_success() {
            return Err(CallbackError::HttpStatus(response.status().as_u16()));
        }
        tracing::info!(url, "Job result delivered to callback");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_does_not_panic() {
        let _delivery = CallbackDelivery::new().unwrap();
    }

    #[test]
    fn callback_error_display_http_status() {
        let err = CallbackError::HttpStatus(502);
        assert_eq!(err.to_string(), "Callback returned HTTP 502");
    }
}
