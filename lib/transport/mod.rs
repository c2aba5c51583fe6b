//! Rate-limit-aware HTTP transport shared by every registry and token-service call.

mod retry;

use reqwest::{Certificate, Client};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::policies::ExponentialBackoff;

use crate::{
    config::{
        EnvSnapshot, RETRY_INITIAL_INTERVAL, RETRY_INITIAL_INTERVAL_TEST, RETRY_MAX_ELAPSED,
        RETRY_MAX_INTERVAL, TEST_ENV_VAR,
    },
    RegistryImageResult,
};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use retry::*;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the HTTP client every remote call goes through.
///
/// The TLS roots are the system roots plus any PEM blocks from the source's
/// `domain_certs`. With `insecure` set, certificate verification is disabled
/// and plain-HTTP registries are accepted. The retry middleware backs off on
/// HTTP 429 with the production schedule, or with millisecond timings when the
/// `TEST` environment variable is present in the snapshot.
pub fn build_http_client(
    domain_certs: &[String],
    insecure: bool,
    env: &EnvSnapshot,
) -> RegistryImageResult<ClientWithMiddleware> {
    let mut builder = Client::builder();

    for pem in domain_certs {
        for certificate in Certificate::from_pem_bundle(pem.as_bytes())? {
            builder = builder.add_root_certificate(certificate);
        }
    }

    if insecure {
        builder = builder.danger_accept_invalid_certs(true);
    }

    let initial = if env.get(TEST_ENV_VAR).is_some() {
        RETRY_INITIAL_INTERVAL_TEST
    } else {
        RETRY_INITIAL_INTERVAL
    };
    let policy = ExponentialBackoff::builder()
        .retry_bounds(initial, RETRY_MAX_INTERVAL)
        .build_with_total_retry_duration(RETRY_MAX_ELAPSED);

    Ok(ClientBuilder::new(builder.build()?)
        .with(RateLimitRetry::new(policy))
        .build())
}

/// The URL scheme registry requests use, depending on the insecure setting.
pub fn url_scheme(insecure: bool) -> &'static str {
    if insecure {
        "http"
    } else {
        "https"
    }
}
