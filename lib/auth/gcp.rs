use std::time::SystemTime;

use aws_credential_types::provider::ProvideCredentials;
use aws_sigv4::{
    http_request::{sign, SignableBody, SignableRequest, SigningSettings},
    sign::v4::SigningParams,
};
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};

use crate::{
    auth::{ecr, RegistryCredential, ResolvedAuth},
    config::Source,
    RegistryImageError, RegistryImageResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The username GCP registry access tokens are valid for.
const GCP_USERNAME: &str = "oauth2accesstoken";

/// GCP's security token service, which accepts federated AWS caller identities.
const GCP_STS_TOKEN_URL: &str = "https://sts.googleapis.com/v1beta/token";

const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

const AWS4_SUBJECT_TOKEN_TYPE: &str = "urn:ietf:params:aws:token-type:aws4_request";

/// The header GCP requires inside the signed caller-identity request.
const TARGET_RESOURCE_HEADER: &str = "x-goog-cloud-target-resource";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SubjectTokenHeader {
    key: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct SubjectToken {
    url: String,
    method: String,
    headers: Vec<SubjectTokenHeader>,
}

#[derive(Debug, Deserialize)]
struct FederatedTokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceAccountTokenResponse {
    access_token: String,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves a GCP service-account access token through workload identity
/// federation from AWS STS.
///
/// The AWS caller identity is proven by a SigV4-signed `GetCallerIdentity`
/// request, which GCP's token service verifies by replaying it against AWS.
pub(super) async fn resolve(
    source: &Source,
    client: &ClientWithMiddleware,
) -> RegistryImageResult<ResolvedAuth> {
    let project = source
        .get_gcp_project()
        .clone()
        .ok_or_else(|| RegistryImageError::auth("gcp", "gcp_project is required"))?;
    let pool = source
        .get_gcp_workload_identity_pool()
        .clone()
        .ok_or_else(|| RegistryImageError::auth("gcp", "gcp_workload_identity_pool is required"))?;
    let provider = source.get_gcp_workload_identity_provider().clone().ok_or_else(|| {
        RegistryImageError::auth("gcp", "gcp_workload_identity_provider is required")
    })?;
    let service_account = source
        .get_gcp_service_account()
        .clone()
        .ok_or_else(|| RegistryImageError::auth("gcp", "gcp_service_account is required"))?;
    let region = source
        .get_aws_region()
        .clone()
        .ok_or_else(|| RegistryImageError::auth("gcp", "aws_region is required"))?;

    let audience = format!(
        "//iam.googleapis.com/projects/{}/locations/global/workloadIdentityPools/{}/providers/{}",
        project, pool, provider
    );

    let sdk_config = ecr::aws_sdk_config(source, "gcp").await?;
    let credentials = sdk_config
        .credentials_provider()
        .ok_or_else(|| RegistryImageError::auth("gcp", "no AWS credentials available"))?
        .provide_credentials()
        .await
        .map_err(|error| RegistryImageError::auth("gcp", error))?;

    let subject_token = caller_identity_subject_token(credentials, &region, &audience)?;
    let federated_token = exchange_federated_token(client, &audience, &subject_token).await?;
    let access_token =
        generate_service_account_token(client, &service_account, &federated_token).await?;

    Ok(ResolvedAuth::with_registry_override(
        RegistryCredential::basic(GCP_USERNAME, access_token),
        None,
    ))
}

/// Builds the URL-encoded subject token GCP verifies against AWS.
///
/// The token is the SigV4-signed `GetCallerIdentity` request serialized as a
/// JSON blob of method, url, and headers.
fn caller_identity_subject_token(
    credentials: aws_credential_types::Credentials,
    region: &str,
    audience: &str,
) -> RegistryImageResult<String> {
    let url = format!(
        "https://sts.{}.amazonaws.com/?Action=GetCallerIdentity&Version=2011-06-15",
        region
    );
    let host = format!("sts.{}.amazonaws.com", region);

    let mut request = http::Request::builder()
        .method("POST")
        .uri(url.as_str())
        .header("host", host.as_str())
        .header(TARGET_RESOURCE_HEADER, audience)
        .body(())
        .map_err(|error| RegistryImageError::auth("gcp", error))?;

    let identity = credentials.into();
    let signing_params = SigningParams::builder()
        .identity(&identity)
        .region(region)
        .name("sts")
        .time(SystemTime::now())
        .settings(SigningSettings::default())
        .build()
        .map_err(|error| RegistryImageError::auth("gcp", error))?
        .into();

    let signable_request = SignableRequest::new(
        request.method().as_str(),
        request.uri().to_string(),
        request
            .headers()
            .iter()
            .filter_map(|(key, value)| value.to_str().ok().map(|value| (key.as_str(), value))),
        SignableBody::Bytes(b""),
    )
    .map_err(|error| RegistryImageError::auth("gcp", error))?;

    let (instructions, _signature) = sign(signable_request, &signing_params)
        .map_err(|error| RegistryImageError::auth("gcp", error))?
        .into_parts();
    instructions.apply_to_request_http1x(&mut request);

    let headers = request
        .headers()
        .iter()
        .filter_map(|(key, value)| {
            value.to_str().ok().map(|value| SubjectTokenHeader {
                key: key.to_string(),
                value: value.to_string(),
            })
        })
        .collect();

    let token = SubjectToken {
        url,
        method: "POST".to_string(),
        headers,
    };

    Ok(urlencoding::encode(&serde_json::to_string(&token)?).into_owned())
}

/// Exchanges the signed caller identity for a GCP federated access token.
async fn exchange_federated_token(
    client: &ClientWithMiddleware,
    audience: &str,
    subject_token: &str,
) -> RegistryImageResult<String> {
    let body = serde_json::json!({
        "audience": audience,
        "grantType": TOKEN_EXCHANGE_GRANT,
        "requestedTokenType": ACCESS_TOKEN_TYPE,
        "scope": CLOUD_PLATFORM_SCOPE,
        "subjectTokenType": AWS4_SUBJECT_TOKEN_TYPE,
        "subjectToken": subject_token,
    });

    let response = client.post(GCP_STS_TOKEN_URL).json(&body).send().await?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(RegistryImageError::auth(
            "gcp",
            format!("federated token exchange returned {}: {}", status, body),
        ));
    }

    let token: FederatedTokenResponse = response.json().await?;
    Ok(token.access_token)
}

/// Exchanges the federated token for a service-account access token.
async fn generate_service_account_token(
    client: &ClientWithMiddleware,
    service_account: &str,
    federated_token: &str,
) -> RegistryImageResult<String> {
    let url = format!(
        "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/{}:generateAccessToken",
        service_account
    );
    let body = serde_json::json!({ "scope": [CLOUD_PLATFORM_SCOPE] });

    let response = client
        .post(&url)
        .bearer_auth(federated_token)
        .json(&body)
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(RegistryImageError::auth(
            "gcp",
            format!("generateAccessToken returned {}: {}", status, body),
        ));
    }

    let token: ServiceAccountTokenResponse = response.json().await?;
    Ok(token.access_token)
}
