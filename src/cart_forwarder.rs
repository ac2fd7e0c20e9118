use std::fmt::Debug;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use mockall::automock;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use tracing::{event, Level};
use url::Url;

use crate::retry::{AttemptFailure, RetryError, RetryExecutor};

#[automock]
#[async_trait]
pub trait CartForwarderTrait: Send + Sync + Debug {
    /// Relays `payload` to the cart identified by `id` and returns the cart's
    /// answer untouched.
    async fn forward(&self, id: &str, payload: String) -> Result<String, RetryError>;
}

/// Posts shipping confirmations to the cart service.
///
/// Calls are not idempotency-checked, so a retry after a partially
/// successful attempt may reach the cart twice.
#[derive(Debug, Clone)]
pub struct CartForwarder {
    client: ClientWithMiddleware,
    cart_url: Url,
    retry: RetryExecutor,
}

impl CartForwarder {
    pub fn new(client: ClientWithMiddleware, cart_url: Url, retry: RetryExecutor) -> Self {
        Self {
            client,
            cart_url,
            retry,
        }
    }

    pub fn endpoint_for(&self, id: &str) -> anyhow::Result<Url> {
        let mut url = self.cart_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("cart url '{}' cannot take a path", self.cart_url))?
            .pop_if_empty()
            .push(id);
        Ok(url)
    }

    async fn post_once(&self, id: &str, payload: &str) -> Result<String, AttemptFailure> {
        let url = self.endpoint_for(id).map_err(AttemptFailure::Permanent)?;
        event!(Level::DEBUG, "Forwarding {} bytes to {}", payload.len(), url);

        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(payload.to_string())
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if status != StatusCode::OK {
            // dropping the response releases the connection without reading the body
            drop(response);
            let failure = anyhow!("Failed with code: {}", status.as_u16());
            return Err(if is_retryable_status(status) {
                AttemptFailure::Transient(failure)
            } else {
                AttemptFailure::Permanent(failure)
            });
        }

        response
            .text()
            .await
            .context("Failed to read cart response body")
            .map_err(AttemptFailure::Transient)
    }
}

#[async_trait]
impl CartForwarderTrait for CartForwarder {
    async fn forward(&self, id: &str, payload: String) -> Result<String, RetryError> {
        let payload = payload.as_str();
        self.retry
            .run("Cart service call", move || self.post_once(id, payload))
            .await
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS
}

fn classify_request_error(error: reqwest_middleware::Error) -> AttemptFailure {
    match &error {
        reqwest_middleware::Error::Reqwest(e) if e.is_builder() => AttemptFailure::permanent(error),
        _ => AttemptFailure::transient(error),
    }
}
