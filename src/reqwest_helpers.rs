use std::time::{Duration, Instant};

use axum::http::Extensions;
use reqwest::{Client, Request, Response};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next};
use tracing::{debug, error};

/// Client for calls to downstream services.
///
/// Retries are not configured here; callers wrap each call in a
/// [`crate::retry::RetryExecutor`] so every I/O path shares one policy.
pub fn create_client(connect_timeout: Duration) -> reqwest::Result<ClientWithMiddleware> {
    let reqwest_client = Client::builder().connect_timeout(connect_timeout).build()?;

    Ok(ClientBuilder::new(reqwest_client).with(RequestLoggingMiddleware).build())
}

/// Logs every outbound request with its outcome and duration.
pub struct RequestLoggingMiddleware;

#[async_trait::async_trait]
impl Middleware for RequestLoggingMiddleware {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let start = Instant::now();
        let method = req.method().clone();
        let url = req.url().clone();

        let result = next.run(req, extensions).await;

        let duration = start.elapsed();

        match &result {
            Ok(resp) if !resp.status().is_success() => {
                error!(%method, %url, status = %resp.status(), ?duration, "Downstream request failed");
            }
            Err(e) => {
                error!(%method, %url, error = %e, ?duration, "Downstream request error");
            }
            Ok(resp) => {
                debug!(%method, %url, status = %resp.status(), ?duration, "Downstream request succeeded");
            }
        }

        result
    }
}
