//! The OAuth 2.1 authorization-code round trip with PKCE.
//!
//! Discovery follows the protected-resource metadata (RFC 9728) to the
//! authorization server metadata (RFC 8414). Either document may be missing,
//! in which case the conventional `/authorize`, `/token` and `/register`
//! paths on the server origin are used.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use rand::rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};
use url::Url;

use super::{OAuthClientInformation, OAuthProvider, OAuthTokens, PopupBroker};
use crate::error::McpError;

const PROTECTED_RESOURCE_PATH: &str = "/.well-known/oauth-protected-resource";
const AUTHORIZATION_SERVER_PATH: &str = "/.well-known/oauth-authorization-server";

/// Endpoints of the authorization server guarding a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationEndpoints {
    /// Where the user is sent to authorize.
    pub authorization_endpoint: String,
    /// Where codes are exchanged for tokens.
    pub token_endpoint: String,
    /// Dynamic client registration, if supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProtectedResourceMetadata {
    #[serde(default)]
    authorization_servers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AuthorizationServerMetadata {
    authorization_endpoint: String,
    token_endpoint: String,
    #[serde(default)]
    registration_endpoint: Option<String>,
}

/// A PKCE verifier and its S256 challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pkce {
    /// Kept secret until the token exchange.
    pub verifier: String,
    /// `BASE64URL(SHA256(verifier))`.
    pub challenge: String,
}

impl Pkce {
    /// Generates a fresh verifier.
    #[must_use]
    pub fn generate() -> Self {
        let bytes: [u8; 32] = rng().random();
        Self::from_verifier(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Derives the S256 challenge for `verifier`.
    #[must_use]
    pub fn from_verifier(verifier: String) -> Self {
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
        }
    }
}

fn parse_url(url: &str) -> Result<Url, McpError> {
    Url::parse(url).map_err(|e| McpError::authorization(format!("invalid URL {url:?}: {e}")))
}

fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Base URL of `issuer` and its metadata URL. The well-known segment goes
/// between the host and the issuer's path (RFC 8414 section 3.1).
fn issuer_locations(issuer: &Url) -> (String, String) {
    let origin = origin_of(issuer);
    let path = issuer.path().trim_end_matches('/');
    (
        format!("{origin}{path}"),
        format!("{origin}{AUTHORIZATION_SERVER_PATH}{path}"),
    )
}

async fn fetch_json<T: for<'de> Deserialize<'de>>(
    client: &reqwest::Client,
    url: &str,
) -> Option<T> {
    let response = match client.get(url).send().await {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            debug!(url, status = %response.status(), "metadata not available");
            return None;
        }
        Err(error) => {
            debug!(url, %error, "metadata unreachable");
            return None;
        }
    };
    response.json().await.ok()
}

/// Discovers the authorization endpoints for `server_url`.
///
/// # Errors
///
/// Returns an authorization error only if `server_url` is not a valid URL.
#[instrument(name = "paymcp.oauth.discover", skip(client))]
pub async fn discover(
    client: &reqwest::Client,
    server_url: &str,
    resource_metadata: Option<&str>,
) -> Result<AuthorizationEndpoints, McpError> {
    let server = parse_url(server_url)?;
    let origin = origin_of(&server);

    let resource_url = resource_metadata.map_or_else(
        || format!("{origin}{PROTECTED_RESOURCE_PATH}"),
        str::to_owned,
    );
    let issuer = fetch_json::<ProtectedResourceMetadata>(client, &resource_url)
        .await
        .and_then(|m| m.authorization_servers.into_iter().next())
        .and_then(|issuer| Url::parse(&issuer).ok());
    let (issuer, metadata_url) = issuer.map_or_else(
        || (origin.clone(), format!("{origin}{AUTHORIZATION_SERVER_PATH}")),
        |issuer| issuer_locations(&issuer),
    );
    let endpoints = match fetch_json::<AuthorizationServerMetadata>(client, &metadata_url).await {
        Some(metadata) => AuthorizationEndpoints {
            authorization_endpoint: metadata.authorization_endpoint,
            token_endpoint: metadata.token_endpoint,
            registration_endpoint: metadata.registration_endpoint,
        },
        None => AuthorizationEndpoints {
            authorization_endpoint: format!("{issuer}/authorize"),
            token_endpoint: format!("{issuer}/token"),
            registration_endpoint: Some(format!("{issuer}/register")),
        },
    };
    debug!(?endpoints, "authorization endpoints");
    Ok(endpoints)
}

async fn endpoints_for(
    client: &reqwest::Client,
    provider: &OAuthProvider,
    resource_metadata: Option<&str>,
) -> Result<AuthorizationEndpoints, McpError> {
    if let Some(endpoints) = provider.endpoints() {
        return Ok(endpoints);
    }
    let endpoints = discover(client, provider.server_url(), resource_metadata).await?;
    provider.save_endpoints(endpoints.clone());
    Ok(endpoints)
}

/// Registers this client dynamically and stores the issued credentials.
///
/// # Errors
///
/// Returns an authorization error if the server refuses the registration.
pub async fn register(
    client: &reqwest::Client,
    provider: &OAuthProvider,
    registration_endpoint: &str,
) -> Result<OAuthClientInformation, McpError> {
    let response = client
        .post(registration_endpoint)
        .json(provider.client_metadata())
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(
            McpError::authorization(format!("client registration returned {status}"))
                .with_code(i64::from(status.as_u16())),
        );
    }
    let info: OAuthClientInformation = response.json().await?;
    info!(client_id = %info.client_id, "registered OAuth client");
    provider.save_client_information(info.clone());
    Ok(info)
}

/// Runs discovery, registration and the popup round trip; returns the code.
///
/// # Errors
///
/// Returns an authorization error if no client id can be obtained or the
/// popup round trip fails, and a timeout error if it is abandoned.
#[instrument(name = "paymcp.oauth.authorize", skip_all, fields(server = %provider.server_url()), err)]
pub async fn authorize(
    client: &reqwest::Client,
    provider: &OAuthProvider,
    resource_metadata: Option<String>,
) -> Result<String, McpError> {
    let endpoints = endpoints_for(client, provider, resource_metadata.as_deref()).await?;
    let info = match provider.client_information() {
        Some(info) => info,
        None => {
            let registration = endpoints.registration_endpoint.as_deref().ok_or_else(|| {
                McpError::authorization("server supports no dynamic client registration")
            })?;
            register(client, provider, registration).await?
        }
    };

    let pkce = Pkce::generate();
    provider.save_code_verifier(pkce.verifier);
    let state = PopupBroker::new_request_id();

    let mut url = parse_url(&endpoints.authorization_endpoint)?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &info.client_id)
        .append_pair("redirect_uri", provider.redirect_url())
        .append_pair("code_challenge", &pkce.challenge)
        .append_pair("code_challenge_method", "S256")
        .append_pair("state", &state)
        .append_pair("resource", provider.server_url());

    provider
        .redirect_to_authorization(&state, url.as_str(), resource_metadata)
        .await
}

/// Exchanges an authorization code for tokens and saves them.
///
/// # Errors
///
/// Returns an authorization error if the verifier or client id is missing
/// or the token endpoint refuses the code.
#[instrument(name = "paymcp.oauth.exchange", skip_all, fields(server = %provider.server_url()), err)]
pub async fn exchange_code(
    client: &reqwest::Client,
    provider: &OAuthProvider,
    code: &str,
) -> Result<(), McpError> {
    let endpoints = endpoints_for(client, provider, None).await?;
    let info = provider
        .client_information()
        .ok_or_else(|| McpError::authorization("no registered client to exchange the code"))?;
    let verifier = provider.code_verifier()?;

    let mut form = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", provider.redirect_url()),
        ("client_id", info.client_id.as_str()),
        ("code_verifier", verifier.as_str()),
        ("resource", provider.server_url()),
    ];
    if let Some(secret) = info.client_secret.as_deref() {
        form.push(("client_secret", secret));
    }

    let response = client.post(&endpoints.token_endpoint).form(&form).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(McpError::authorization(format!("token endpoint returned {status}"))
            .with_code(i64::from(status.as_u16()))
            .with_detail(serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body))));
    }
    let tokens: OAuthTokens = response.json().await?;
    provider.save_tokens(tokens).await?;
    info!("OAuth tokens saved");
    Ok(())
}
