//! Stateless client for the Google and Microsoft OAuth2 endpoints:
//! authorization URLs, code exchange, token refresh and the userinfo
//! lookup used to discover the account's email address.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use maildesk_domain::{OAuthConfig, Provider};
use maildesk_error::ChannelError;
use reqwest::Url;
use serde::Deserialize;
use tracing::debug;

/// Tokens within this margin of expiry are treated as expired, so a send
/// never races the provider's clock. The token lifecycle uses the same
/// constant; the refresh decision must match the expiry check exactly.
pub const TOKEN_EXPIRY_MARGIN_SECS: i64 = 300;

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);
// Refresh sits on the send path; keep the bound short so pending sends
// are not stalled behind a wedged token endpoint.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(15);
const USERINFO_TIMEOUT: Duration = Duration::from_secs(10);

const MICROSOFT_GRAPH_ME: &str = "https://graph.microsoft.com/v1.0/me";
const GOOGLE_USERINFO: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

/// Response from a provider token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub scope: String,
}

/// Resolved endpoints and scopes for one provider. Microsoft endpoints
/// are tenant-scoped when a tenant id is supplied.
#[derive(Debug, Clone)]
pub struct ProviderEndpoints {
    pub auth_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: &'static str,
    pub scopes: &'static [&'static str],
}

pub fn provider_endpoints(provider: Provider, tenant_id: &str) -> ProviderEndpoints {
    match provider {
        Provider::Microsoft => {
            let tenant = if tenant_id.is_empty() {
                "common"
            } else {
                tenant_id
            };
            ProviderEndpoints {
                auth_endpoint: format!(
                    "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/authorize"
                ),
                token_endpoint: format!(
                    "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token"
                ),
                userinfo_endpoint: MICROSOFT_GRAPH_ME,
                scopes: &[
                    "https://outlook.office.com/IMAP.AccessAsUser.All",
                    "https://outlook.office.com/SMTP.Send",
                    "offline_access",
                ],
            }
        }
        Provider::Google => ProviderEndpoints {
            auth_endpoint: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_endpoint: "https://oauth2.googleapis.com/token".to_string(),
            userinfo_endpoint: GOOGLE_USERINFO,
            scopes: &[
                "https://mail.google.com/",
                "https://www.googleapis.com/auth/userinfo.email",
            ],
        },
    }
}

/// Builds the provider authorization URL for the admin-facing connect
/// flow. `prompt=consent` forces the consent screen so a refresh token is
/// issued on the first authorization.
pub fn build_authorization_url(
    provider: Provider,
    client_id: &str,
    redirect_uri: &str,
    state: &str,
    tenant_id: &str,
) -> Result<String, ChannelError> {
    let endpoints = provider_endpoints(provider, tenant_id);
    let mut url = Url::parse(&endpoints.auth_endpoint)
        .map_err(|e| ChannelError::config(format!("auth endpoint: {e}")))?;
    url.query_pairs_mut()
        .append_pair("client_id", client_id)
        .append_pair("response_type", "code")
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("state", state)
        .append_pair("scope", &endpoints.scopes.join(" "))
        .append_pair("access_type", "offline")
        .append_pair("prompt", "consent");
    Ok(url.into())
}

/// Exchanges an authorization code for access and refresh tokens.
pub async fn exchange_code(
    provider: Provider,
    client_id: &str,
    client_secret: &str,
    code: &str,
    redirect_uri: &str,
    tenant_id: &str,
) -> Result<TokenResponse, ChannelError> {
    let endpoints = provider_endpoints(provider, tenant_id);
    let mut params = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", client_id),
    ];
    // Confidential clients only; public clients send no secret.
    if !client_secret.is_empty() {
        params.push(("client_secret", client_secret));
    }
    post_token(
        &endpoints.token_endpoint,
        &params,
        EXCHANGE_TIMEOUT,
        "token exchange",
    )
    .await
}

/// Exchanges a refresh token for a fresh access token.
pub async fn refresh_token(
    provider: Provider,
    client_id: &str,
    client_secret: &str,
    refresh_token: &str,
    tenant_id: &str,
) -> Result<TokenResponse, ChannelError> {
    let endpoints = provider_endpoints(provider, tenant_id);
    let mut params = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client_id),
    ];
    if !client_secret.is_empty() {
        params.push(("client_secret", client_secret));
    }
    post_token(
        &endpoints.token_endpoint,
        &params,
        REFRESH_TIMEOUT,
        "token refresh",
    )
    .await
}

/// Refreshes the tokens of an inbox OAuth config, returning a new config
/// with the credentials preserved. The caller owns storing and
/// persisting the result.
pub async fn refresh_oauth_config(current: &OAuthConfig) -> Result<OAuthConfig, ChannelError> {
    if current.refresh_token.is_empty() {
        return Err(ChannelError::config("no refresh token available"));
    }
    if current.client_id.is_empty() || current.client_secret.is_empty() {
        return Err(ChannelError::config(format!(
            "oauth credentials missing for provider '{}'",
            current.provider
        )));
    }
    let response = refresh_token(
        current.provider,
        &current.client_id,
        &current.client_secret,
        &current.refresh_token,
        &current.tenant_id,
    )
    .await?;
    debug!(provider = %current.provider, expires_in = response.expires_in, "token refreshed");
    Ok(refreshed_config(current, &response))
}

/// Merges a token response into the current config: credentials are
/// preserved, and when the provider omits a new refresh token the
/// previous one stays (providers are not required to rotate it).
pub fn refreshed_config(current: &OAuthConfig, response: &TokenResponse) -> OAuthConfig {
    let refresh_token = if response.refresh_token.is_empty() {
        current.refresh_token.clone()
    } else {
        response.refresh_token.clone()
    };
    OAuthConfig {
        provider: current.provider,
        access_token: response.access_token.clone(),
        refresh_token,
        expires_at: expires_at_from(response.expires_in),
        client_id: current.client_id.clone(),
        client_secret: current.client_secret.clone(),
        tenant_id: current.tenant_id.clone(),
    }
}

/// Fetches the authenticated account's email address. Google reports it
/// as `email`; Microsoft Graph uses `mail`, falling back to
/// `userPrincipalName` for accounts that do not populate it.
pub async fn fetch_user_email(
    provider: Provider,
    access_token: &str,
) -> Result<String, ChannelError> {
    let endpoints = provider_endpoints(provider, "");
    let client = http_client(USERINFO_TIMEOUT)?;
    let resp = client
        .get(endpoints.userinfo_endpoint)
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|e| ChannelError::network(format!("userinfo request: {e}")))?;
    let status = resp.status();
    let body: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| ChannelError::parse(format!("userinfo response: {e}")))?;
    if !status.is_success() {
        return Err(ChannelError::auth(format!(
            "userinfo failed with status {status}: {body}"
        )));
    }
    let email = match provider {
        Provider::Google => body["email"].as_str(),
        Provider::Microsoft => body["mail"]
            .as_str()
            .filter(|m| !m.is_empty())
            .or_else(|| body["userPrincipalName"].as_str()),
    };
    email
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ChannelError::parse("user email not found in provider response"))
}

/// True when the token expires within the safety margin (or already has).
pub fn is_token_expired(expires_at: DateTime<Utc>) -> bool {
    Utc::now() + chrono::Duration::seconds(TOKEN_EXPIRY_MARGIN_SECS) > expires_at
}

/// Absolute expiry from a token endpoint's relative `expires_in`.
pub fn expires_at_from(expires_in: i64) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::seconds(expires_in)
}

/// The XOAUTH2 single authentication response:
/// `user=<username>\x01auth=Bearer <token>\x01\x01`.
pub fn xoauth2_string(username: &str, access_token: &str) -> String {
    format!("user={username}\x01auth=Bearer {access_token}\x01\x01")
}

/// XOAUTH2 string in its base64 wire framing, for protocol layers that
/// do not encode for us.
pub fn xoauth2_b64(username: &str, access_token: &str) -> String {
    BASE64.encode(xoauth2_string(username, access_token))
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, ChannelError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ChannelError::internal(format!("http client: {e}")))
}

async fn post_token(
    endpoint: &str,
    params: &[(&str, &str)],
    timeout: Duration,
    what: &str,
) -> Result<TokenResponse, ChannelError> {
    let client = http_client(timeout)?;
    let resp = client
        .post(endpoint)
        .form(params)
        .send()
        .await
        .map_err(|e| ChannelError::network(format!("{what}: {e}")))?;
    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|e| ChannelError::network(format!("{what} response read: {e}")))?;
    if !status.is_success() {
        // Body carried for diagnostics; providers put the grant error there.
        return Err(ChannelError::auth(format!(
            "{what} failed with status {status}: {body}"
        )));
    }
    serde_json::from_str(&body).map_err(|e| ChannelError::parse(format!("{what} response: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn google_config(expires_at: DateTime<Utc>) -> OAuthConfig {
        OAuthConfig {
            provider: Provider::Google,
            access_token: "old-access".into(),
            refresh_token: "old-refresh".into(),
            expires_at,
            client_id: "cid".into(),
            client_secret: "sec".into(),
            tenant_id: String::new(),
        }
    }

    #[test]
    fn microsoft_endpoints_are_tenant_scoped() {
        let scoped = provider_endpoints(Provider::Microsoft, "tenant-123");
        assert_eq!(
            scoped.token_endpoint,
            "https://login.microsoftonline.com/tenant-123/oauth2/v2.0/token"
        );
        let common = provider_endpoints(Provider::Microsoft, "");
        assert_eq!(
            common.token_endpoint,
            "https://login.microsoftonline.com/common/oauth2/v2.0/token"
        );
    }

    #[test]
    fn google_endpoints_ignore_tenants() {
        let eps = provider_endpoints(Provider::Google, "tenant-123");
        assert_eq!(eps.token_endpoint, "https://oauth2.googleapis.com/token");
    }

    #[test]
    fn authorization_url_carries_offline_consent() {
        let url = build_authorization_url(
            Provider::Google,
            "cid",
            "https://desk.example.com/callback",
            "state-1",
            "",
        )
        .unwrap();
        let parsed = Url::parse(&url).unwrap();
        let params: HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(params["client_id"], "cid");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["redirect_uri"], "https://desk.example.com/callback");
        assert_eq!(params["state"], "state-1");
        assert_eq!(params["access_type"], "offline");
        assert_eq!(params["prompt"], "consent");
        assert!(params["scope"].contains("https://mail.google.com/"));
        assert!(params["scope"].contains("userinfo.email"));
    }

    #[test]
    fn microsoft_scopes_cover_mail_and_offline_access() {
        let url =
            build_authorization_url(Provider::Microsoft, "cid", "https://r", "s", "t-1").unwrap();
        assert!(url.starts_with("https://login.microsoftonline.com/t-1/oauth2/v2.0/authorize"));
        let parsed = Url::parse(&url).unwrap();
        let params: HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert!(params["scope"].contains("IMAP.AccessAsUser.All"));
        assert!(params["scope"].contains("SMTP.Send"));
        assert!(params["scope"].contains("offline_access"));
    }

    #[test]
    fn expiry_margin_is_five_minutes() {
        assert!(!is_token_expired(
            Utc::now() + chrono::Duration::minutes(10)
        ));
        assert!(is_token_expired(Utc::now() + chrono::Duration::minutes(2)));
        assert!(is_token_expired(Utc::now() - chrono::Duration::minutes(1)));
    }

    #[test]
    fn refresh_keeps_old_refresh_token_when_omitted() {
        let current = google_config(Utc::now());
        let response = TokenResponse {
            access_token: "new-access".into(),
            refresh_token: String::new(),
            expires_in: 3600,
            token_type: "Bearer".into(),
            scope: String::new(),
        };
        let merged = refreshed_config(&current, &response);
        assert_eq!(merged.access_token, "new-access");
        assert_eq!(merged.refresh_token, "old-refresh");
        assert_eq!(merged.client_id, "cid");
        assert_eq!(merged.client_secret, "sec");
        assert!(merged.expires_at > Utc::now() + chrono::Duration::minutes(50));
    }

    #[test]
    fn refresh_adopts_rotated_refresh_token() {
        let current = google_config(Utc::now());
        let response = TokenResponse {
            access_token: "new-access".into(),
            refresh_token: "rotated".into(),
            expires_in: 3600,
            token_type: "Bearer".into(),
            scope: String::new(),
        };
        assert_eq!(refreshed_config(&current, &response).refresh_token, "rotated");
    }

    #[tokio::test]
    async fn refresh_requires_credentials() {
        let mut config = google_config(Utc::now());
        config.refresh_token.clear();
        assert!(matches!(
            refresh_oauth_config(&config).await,
            Err(ChannelError::Config(_))
        ));

        let mut config = google_config(Utc::now());
        config.client_secret.clear();
        assert!(matches!(
            refresh_oauth_config(&config).await,
            Err(ChannelError::Config(_))
        ));
    }

    #[test]
    fn xoauth2_wire_framing_decodes_to_the_sasl_string() {
        let encoded = xoauth2_b64("alice@example.com", "tok123");
        let decoded = BASE64.decode(encoded).unwrap();
        assert_eq!(
            decoded,
            b"user=alice@example.com\x01auth=Bearer tok123\x01\x01"
        );
    }
}
