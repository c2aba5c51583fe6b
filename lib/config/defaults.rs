use std::time::Duration;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The host the OCI distribution API of the default registry is served from.
pub const DEFAULT_REGISTRY_HOST: &str = "registry-1.docker.io";

/// Host names that all refer to the default registry in image references.
pub const DEFAULT_REGISTRY_ALIASES: &[&str] =
    &["docker.io", "index.docker.io", "registry-1.docker.io"];

/// The repository namespace assumed for single-segment repository names.
pub const DEFAULT_REPO_NAMESPACE: &str = "library";

/// The tag assumed when the source does not configure one.
pub const DEFAULT_TAG: &str = "latest";

/// The host of the public ECR gallery, which does not use the ECR token service.
pub const ECR_PUBLIC_HOST: &str = "public.ecr.aws";

/// First backoff interval after a rate-limited response.
pub const RETRY_INITIAL_INTERVAL: Duration = Duration::from_secs(5);

/// First backoff interval when running under the test harness.
pub const RETRY_INITIAL_INTERVAL_TEST: Duration = Duration::from_millis(5);

/// Upper bound on a single backoff interval.
pub const RETRY_MAX_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Upper bound on the total time spent retrying one request.
pub const RETRY_MAX_ELAPSED: Duration = Duration::from_secs(60 * 60);

/// Environment variable that switches the retry schedule to test timings.
pub const TEST_ENV_VAR: &str = "TEST";

/// Page size requested from the tags-list endpoint.
pub const TAGS_PAGE_SIZE: usize = 1000;
