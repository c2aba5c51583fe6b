use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use http::Extensions;
use reqwest::{Request, Response, StatusCode};
use reqwest_middleware::{Middleware, Next};
use reqwest_retry::{policies::ExponentialBackoffTimed, RetryDecision, RetryPolicy};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A middleware that retries rate-limited requests.
///
/// Only HTTP 429 is retried; every other outcome, including transport
/// failures, is permanent and surfaced to the caller immediately. The backoff
/// schedule caps both the single interval and the total elapsed time, and each
/// retry logs one warning naming the delay before the next attempt.
pub struct RateLimitRetry {
    policy: ExponentialBackoffTimed,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RateLimitRetry {
    /// Creates the middleware with the given backoff schedule.
    pub fn new(policy: ExponentialBackoffTimed) -> Self {
        Self { policy }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Middleware for RateLimitRetry {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let started = SystemTime::now();
        let mut past_retries: u32 = 0;

        loop {
            // Streaming bodies cannot be replayed, so they get a single attempt.
            let attempt = match req.try_clone() {
                Some(cloned) => cloned,
                None => return next.run(req, extensions).await,
            };

            let result = next.clone().run(attempt, extensions).await;

            let rate_limited = matches!(
                &result,
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS
            );
            if !rate_limited {
                return result;
            }

            match self.policy.should_retry(started, past_retries) {
                RetryDecision::Retry { execute_after } => {
                    let delay = execute_after
                        .duration_since(SystemTime::now())
                        .unwrap_or(Duration::ZERO);
                    tracing::warn!(
                        "registry rate limited request to {}, retrying in {:.2?}",
                        req.url(),
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    past_retries += 1;
                }
                RetryDecision::DoNotRetry => return result,
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::Client;
    use reqwest_middleware::ClientBuilder;
    use reqwest_retry::policies::ExponentialBackoff;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn test_policy() -> ExponentialBackoffTimed {
        ExponentialBackoff::builder()
            .retry_bounds(Duration::from_millis(5), Duration::from_millis(50))
            .build_with_total_retry_duration(Duration::from_secs(5))
    }

    #[test_log::test(tokio::test)]
    async fn test_retry_resolves_rate_limited_requests() -> anyhow::Result<()> {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = ClientBuilder::new(Client::new())
            .with(RateLimitRetry::new(test_policy()))
            .build();

        let response = client.get(format!("{}/v2/", server.uri())).send().await?;
        assert_eq!(response.status(), 200);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_retry_passes_other_statuses_through() -> anyhow::Result<()> {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let client = ClientBuilder::new(Client::new())
            .with(RateLimitRetry::new(test_policy()))
            .build();

        let response = client.get(format!("{}/v2/", server.uri())).send().await?;
        assert_eq!(response.status(), 503);

        Ok(())
    }
}
