use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_credential_types::Credentials;
use aws_sdk_ecr::Client as EcrClient;
use aws_sdk_sts::Client as StsClient;
use base64::Engine;

use crate::{
    auth::{RegistryCredential, ResolvedAuth},
    config::Source,
    RegistryImageError, RegistryImageResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The username ECR authorization tokens are valid for.
const ECR_USERNAME: &str = "AWS";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves an ECR authorization token into a basic credential.
///
/// The token service returns a base64-encoded `user:password` pair and the
/// registry endpoint the pair is valid for; the effective registry host is
/// rewritten to that endpoint.
pub(super) async fn resolve(source: &Source) -> RegistryImageResult<ResolvedAuth> {
    let sdk_config = aws_sdk_config(source, "ecr").await?;
    let client = EcrClient::new(&sdk_config);

    let response = client
        .get_authorization_token()
        .send()
        .await
        .map_err(|error| RegistryImageError::auth("ecr", error))?;

    let auth_data = response
        .authorization_data()
        .first()
        .ok_or_else(|| RegistryImageError::auth("ecr", "no authorization data returned"))?;

    let token = auth_data
        .authorization_token()
        .ok_or_else(|| RegistryImageError::auth("ecr", "no authorization token in response"))?;

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(token)
        .map_err(|error| RegistryImageError::auth("ecr", error))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|error| RegistryImageError::auth("ecr", error))?;

    let (_, password) = decoded
        .split_once(':')
        .ok_or_else(|| RegistryImageError::auth("ecr", "malformed authorization token"))?;

    let registry_override = auth_data.proxy_endpoint().map(|endpoint| {
        endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_string()
    });

    Ok(ResolvedAuth::with_registry_override(
        RegistryCredential::basic(ECR_USERNAME, password),
        registry_override,
    ))
}

/// Builds the AWS SDK configuration the ECR and GCP federation modes share.
///
/// Static keys from the source win over the default provider chain; when a
/// role ARN is configured the session is re-rooted on STS AssumeRole
/// credentials.
pub(super) async fn aws_sdk_config(
    source: &Source,
    mode: &'static str,
) -> RegistryImageResult<SdkConfig> {
    let region = source
        .get_aws_region()
        .clone()
        .ok_or_else(|| RegistryImageError::auth(mode, "aws_region is required"))?;

    let base_config = match (
        source.get_aws_access_key_id(),
        source.get_aws_secret_access_key(),
    ) {
        (Some(access_key), Some(secret_key)) => {
            let credentials = Credentials::new(
                access_key,
                secret_key,
                source.get_aws_session_token().clone(),
                None,
                "static",
            );
            aws_config::defaults(BehaviorVersion::latest())
                .credentials_provider(credentials)
                .region(Region::new(region.clone()))
                .load()
                .await
        }
        _ => {
            aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(region.clone()))
                .load()
                .await
        }
    };

    let Some(role_arn) = source.get_aws_role_arn() else {
        return Ok(base_config);
    };

    let sts_client = StsClient::new(&base_config);
    let assumed = sts_client
        .assume_role()
        .role_arn(role_arn)
        .role_session_name("registry-image")
        .send()
        .await
        .map_err(|error| RegistryImageError::auth(mode, error))?;

    let credentials = assumed
        .credentials()
        .ok_or_else(|| RegistryImageError::auth(mode, "no credentials in AssumeRole response"))?;

    let expiration = std::time::SystemTime::try_from(credentials.expiration().clone()).ok();
    let scoped = Credentials::new(
        credentials.access_key_id(),
        credentials.secret_access_key(),
        Some(credentials.session_token().to_string()),
        expiration,
        "assume_role",
    );

    Ok(aws_config::defaults(BehaviorVersion::latest())
        .credentials_provider(scoped)
        .region(Region::new(region))
        .load()
        .await)
}
