use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::info;

use crate::{ClientOptions, MetadataError, RequestContext, Result};

/// Header the GCE metadata server requires on every request.
pub const METADATA_FLAVOR: &str = "Metadata-Flavor";
const METADATA_FLAVOR_GOOGLE: &str = "Google";

/// Anything that can resolve a metadata URL to its value.
///
/// Handlers and the health probe only depend on this, so tests can stand in
/// a fake for the real [`MetadataClient`].
pub trait MetadataFetcher: Send + Sync + 'static {
    fn fetch(
        &self,
        ctx: &RequestContext,
        url: &str,
    ) -> impl Future<Output = Result<String>> + Send;
}

/// HTTP client for the instance metadata server with bounded retries.
#[derive(Clone, Debug)]
pub struct MetadataClient {
    http: reqwest::Client,
    options: ClientOptions,
}

impl MetadataClient {
    /// Creates a client with default timeout and retry policy.
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            options: ClientOptions::default(),
        }
    }

    /// Applies client options such as timeout and retry behavior.
    pub fn with_options(mut self, opts: ClientOptions) -> Self {
        self.options = opts;
        self
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Fetches the value behind `url`, retrying transient failures.
    ///
    /// Transport errors, `5xx` and `429` are retried with exponential
    /// backoff until `max_attempts` is used up. Any other non-success
    /// status, or a success whose body cannot be read, fails on the spot. Both the requests and the sleeps between
    /// them stop as soon as `ctx` is done.
    pub async fn fetch_metadata(&self, ctx: &RequestContext, url: &str) -> Result<String> {
        let policy = &self.options.retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            if let Some(err) = ctx.err() {
                return Err(MetadataError::Cancelled(err));
            }

            let request = self.build_request(ctx, url)?;
            let outcome = tokio::select! {
                biased;
                err = ctx.done() => return Err(MetadataError::Cancelled(err)),
                outcome = self.execute(request, url) => outcome,
            };
            attempt += 1;

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        info!(url, attempt, "metadata fetch succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if attempt >= max_attempts => {
                    return Err(MetadataError::ExhaustedRetries {
                        attempts: max_attempts,
                        source: Box::new(err),
                    });
                }
                Err(err) => {
                    let delay = policy.delay_before(attempt);
                    info!(
                        url,
                        attempt,
                        retry_in = ?delay,
                        error = %err,
                        "metadata fetch attempt failed, retrying"
                    );
                    self.wait_before_retry(ctx, delay).await?;
                }
            }
        }
    }

    fn build_request(&self, ctx: &RequestContext, url: &str) -> Result<reqwest::Request> {
        let timeout = ctx
            .remaining()
            .map_or(self.options.timeout, |left| left.min(self.options.timeout));

        self.http
            .get(url)
            .header(METADATA_FLAVOR, METADATA_FLAVOR_GOOGLE)
            .timeout(timeout)
            .build()
            .map_err(MetadataError::RequestConstruction)
    }

    async fn execute(&self, request: reqwest::Request, url: &str) -> Result<String> {
        let response = self.http.execute(request).await.map_err(|err| {
            if err.is_builder() {
                MetadataError::RequestConstruction(err)
            } else {
                MetadataError::Transport(err)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            // The body is only kept for diagnostics.
            let body = response.text().await.unwrap_or_default();
            return Err(MetadataError::UpstreamStatus {
                url: url.to_owned(),
                status: status.as_u16(),
                body,
            });
        }

        response.text().await.map_err(MetadataError::BodyRead)
    }

    /// Sleeps for `delay`, returning early if `ctx` is done first.
    async fn wait_before_retry(&self, ctx: &RequestContext, delay: Duration) -> Result<()> {
        tokio::select! {
            biased;
            err = ctx.done() => Err(MetadataError::Cancelled(err)),
            _ = sleep(delay) => Ok(()),
        }
    }
}

impl Default for MetadataClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataFetcher for MetadataClient {
    async fn fetch(&self, ctx: &RequestContext, url: &str) -> Result<String> {
        self.fetch_metadata(ctx, url).await
    }
}
