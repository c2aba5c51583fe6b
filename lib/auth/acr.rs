use reqwest::Url;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;

use crate::{
    auth::{RegistryCredential, ResolvedAuth},
    config::{EnvSnapshot, Source},
    registry::parse_www_authenticate,
    transport::url_scheme,
    RegistryImageError, RegistryImageResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The conventional username ACR refresh tokens are presented under.
const ACR_TOKEN_USERNAME: &str = "00000000-0000-0000-0000-000000000000";

/// The tenant used when discovery yields nothing.
const DEFAULT_TENANT: &str = "common";

/// The auth type that selects the federated-token-file exchange.
const WORKLOAD_IDENTITY: &str = "workload_identity";

const JWT_BEARER_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The authority and management scope of an Azure cloud environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AzureCloud {
    /// The AD authority tokens are requested from.
    pub authority_host: &'static str,

    /// The management endpoint whose `/.default` scope the AD token targets.
    pub management_endpoint: &'static str,
}

#[derive(Debug, Deserialize)]
struct AadTokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct AcrExchangeResponse {
    refresh_token: String,
}

//--------------------------------------------------------------------------------------------------
// Constants: Clouds
//--------------------------------------------------------------------------------------------------

const AZURE_PUBLIC: AzureCloud = AzureCloud {
    authority_host: "https://login.microsoftonline.com",
    management_endpoint: "https://management.azure.com",
};

const AZURE_GOVERNMENT: AzureCloud = AzureCloud {
    authority_host: "https://login.microsoftonline.us",
    management_endpoint: "https://management.usgovcloudapi.net",
};

const AZURE_CHINA: AzureCloud = AzureCloud {
    authority_host: "https://login.chinacloudapi.cn",
    management_endpoint: "https://management.chinacloudapi.cn",
};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Maps a registry host and optional environment override to an Azure cloud.
///
/// A recognized override wins verbatim; anything else falls back to detection
/// from the registry's domain suffix. Matching is case-insensitive.
pub fn resolve_azure_cloud(host: &str, environment: Option<&str>) -> AzureCloud {
    if let Some(environment) = environment {
        match environment.trim().to_ascii_lowercase().as_str() {
            "azurepublic" => return AZURE_PUBLIC,
            "azuregovernment" => return AZURE_GOVERNMENT,
            "azurechina" => return AZURE_CHINA,
            _ => {}
        }
    }

    let host = host.to_ascii_lowercase();
    if host.ends_with(".azurecr.us") {
        AZURE_GOVERNMENT
    } else if host.ends_with(".azurecr.cn") {
        AZURE_CHINA
    } else {
        AZURE_PUBLIC
    }
}

/// Resolves an ACR refresh token into a basic credential.
pub(super) async fn resolve(
    source: &Source,
    registry_host: &str,
    client: &ClientWithMiddleware,
    env: &EnvSnapshot,
    insecure: bool,
) -> RegistryImageResult<ResolvedAuth> {
    let cloud = resolve_azure_cloud(registry_host, source.get_azure_environment().as_deref());

    let tenant = match source
        .get_azure_tenant_id()
        .clone()
        .or_else(|| env.get("AZURE_TENANT_ID").map(str::to_string))
    {
        Some(tenant) => tenant,
        None => discover_tenant(client, registry_host, insecure).await?,
    };

    let aad_token = acquire_aad_token(source, &cloud, &tenant, client, env).await?;
    let refresh_token =
        exchange_refresh_token(client, registry_host, &tenant, &aad_token, insecure).await?;

    Ok(ResolvedAuth::with_registry_override(
        RegistryCredential::basic(ACR_TOKEN_USERNAME, refresh_token),
        None,
    ))
}

/// Discovers the registry's AD tenant from its unauthenticated bearer challenge.
///
/// The `realm` URL of the challenge carries the tenant as a query parameter;
/// an absent or malformed challenge falls back to the `common` tenant.
pub(super) async fn discover_tenant(
    client: &ClientWithMiddleware,
    registry_host: &str,
    insecure: bool,
) -> RegistryImageResult<String> {
    let url = format!("{}://{}/v2/", url_scheme(insecure), registry_host);
    let response = client.get(&url).send().await?;

    let tenant = response
        .headers()
        .get(reqwest::header::WWW_AUTHENTICATE)
        .and_then(|header| header.to_str().ok())
        .and_then(parse_www_authenticate)
        .filter(|challenge| challenge.scheme.eq_ignore_ascii_case("bearer"))
        .and_then(|challenge| challenge.params.get("realm").cloned())
        .and_then(|realm| Url::parse(&realm).ok())
        .and_then(|realm| {
            realm
                .query_pairs()
                .find(|(key, _)| key == "tenant")
                .map(|(_, value)| value.into_owned())
        })
        .filter(|tenant| !tenant.is_empty())
        .unwrap_or_else(|| DEFAULT_TENANT.to_string());

    Ok(tenant)
}

/// Acquires an Azure AD access token for the cloud's management scope.
async fn acquire_aad_token(
    source: &Source,
    cloud: &AzureCloud,
    tenant: &str,
    client: &ClientWithMiddleware,
    env: &EnvSnapshot,
) -> RegistryImageResult<String> {
    let auth_type = source
        .get_azure_auth_type()
        .as_deref()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    let scope = format!("{}/.default", cloud.management_endpoint);
    let token_url = format!("{}/{}/oauth2/v2.0/token", cloud.authority_host, tenant);

    let client_id = source
        .get_azure_client_id()
        .clone()
        .or_else(|| env.get("AZURE_CLIENT_ID").map(str::to_string))
        .ok_or_else(|| RegistryImageError::auth("acr", "no Azure client id configured"))?;

    let form: Vec<(&str, String)> = if auth_type == WORKLOAD_IDENTITY {
        let token_file = env.get("AZURE_FEDERATED_TOKEN_FILE").ok_or_else(|| {
            RegistryImageError::auth("acr", "AZURE_FEDERATED_TOKEN_FILE is not set")
        })?;
        let assertion = tokio::fs::read_to_string(token_file)
            .await
            .map_err(|error| RegistryImageError::auth("acr", error))?;

        vec![
            ("client_id", client_id),
            ("grant_type", "client_credentials".to_string()),
            ("scope", scope),
            ("client_assertion_type", JWT_BEARER_ASSERTION_TYPE.to_string()),
            ("client_assertion", assertion.trim().to_string()),
        ]
    } else {
        let client_secret = env.get("AZURE_CLIENT_SECRET").ok_or_else(|| {
            RegistryImageError::auth("acr", "AZURE_CLIENT_SECRET is not set")
        })?;

        vec![
            ("client_id", client_id),
            ("grant_type", "client_credentials".to_string()),
            ("scope", scope),
            ("client_secret", client_secret.to_string()),
        ]
    };

    let response = client.post(&token_url).form(&form).send().await?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(RegistryImageError::auth(
            "acr",
            format!("AD token request returned {}: {}", status, body),
        ));
    }

    let token: AadTokenResponse = response.json().await?;
    Ok(token.access_token)
}

/// Exchanges an AD token for an ACR refresh token on the registry itself.
pub(super) async fn exchange_refresh_token(
    client: &ClientWithMiddleware,
    registry_host: &str,
    tenant: &str,
    aad_token: &str,
    insecure: bool,
) -> RegistryImageResult<String> {
    let url = format!(
        "{}://{}/oauth2/exchange",
        url_scheme(insecure),
        registry_host
    );

    let form = [
        ("grant_type", "access_token"),
        ("service", registry_host),
        ("tenant", tenant),
        ("access_token", aad_token),
    ];

    let response = client.post(&url).form(&form).send().await?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(RegistryImageError::auth(
            "acr",
            format!("token exchange returned {}: {}", status, body),
        ));
    }

    let exchange: AcrExchangeResponse = response.json().await?;
    Ok(exchange.refresh_token)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use wiremock::{
        matchers::{body_string_contains, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use crate::{config::EnvSnapshot, transport::build_http_client};

    use super::*;

    #[test]
    fn test_resolve_azure_cloud_from_override() {
        assert_eq!(
            resolve_azure_cloud("anything.example.com", Some("AzureGovernment")),
            AZURE_GOVERNMENT
        );
        assert_eq!(
            resolve_azure_cloud("registry.azurecr.cn", Some("azurepublic")),
            AZURE_PUBLIC
        );
    }

    #[test]
    fn test_resolve_azure_cloud_from_host_suffix() {
        assert_eq!(resolve_azure_cloud("registry.azurecr.io", None), AZURE_PUBLIC);
        assert_eq!(
            resolve_azure_cloud("registry.AZURECR.US", None),
            AZURE_GOVERNMENT
        );
        assert_eq!(resolve_azure_cloud("registry.azurecr.cn", None), AZURE_CHINA);
    }

    #[test]
    fn test_resolve_azure_cloud_unknown_override_falls_back() {
        assert_eq!(
            resolve_azure_cloud("registry.azurecr.us", Some("AzureMoon")),
            AZURE_GOVERNMENT
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_tenant_discovery_feeds_exchange() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        let host = server.uri().replace("http://", "");

        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(401).insert_header(
                "Www-Authenticate",
                format!(
                    r#"Bearer realm="https://{host}/oauth2/exchange?tenant=expected-tenant",service="{host}""#
                )
                .as_str(),
            ))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/oauth2/exchange"))
            .and(body_string_contains("tenant=expected-tenant"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "refresh_token": "acr-refresh"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = build_http_client(&[], true, &EnvSnapshot::default())?;

        let tenant = discover_tenant(&client, &host, true).await?;
        assert_eq!(tenant, "expected-tenant");

        let refresh =
            exchange_refresh_token(&client, &host, &tenant, "aad-token", true).await?;
        assert_eq!(refresh, "acr-refresh");

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_tenant_discovery_defaults_to_common() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        let host = server.uri().replace("http://", "");

        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(401).insert_header(
                "Www-Authenticate",
                r#"Bearer realm="not a url",service="x""#,
            ))
            .mount(&server)
            .await;

        let client = build_http_client(&[], true, &EnvSnapshot::default())?;
        let tenant = discover_tenant(&client, &host, true).await?;
        assert_eq!(tenant, DEFAULT_TENANT);

        Ok(())
    }
}
