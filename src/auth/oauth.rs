use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngExt;
use reqwest::Url;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::consts::TOKEN_REQUEST_TIMEOUT;
use crate::error::{AuthError, Result};

/// Fitbit permission categories this tool knows how to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    Activity,
    Heartrate,
    Sleep,
    Profile,
    RespiratoryRate,
    OxygenSaturation,
    Weight,
    Settings,
}

impl Scope {
    /// The full set requested on every login.
    pub const ALL: [Scope; 8] = [
        Scope::Activity,
        Scope::Heartrate,
        Scope::Sleep,
        Scope::Profile,
        Scope::RespiratoryRate,
        Scope::OxygenSaturation,
        Scope::Weight,
        Scope::Settings,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Activity => "activity",
            Scope::Heartrate => "heartrate",
            Scope::Sleep => "sleep",
            Scope::Profile => "profile",
            Scope::RespiratoryRate => "respiratory_rate",
            Scope::OxygenSaturation => "oxygen_saturation",
            Scope::Weight => "weight",
            Scope::Settings => "settings",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self> {
        Scope::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| AuthError::Configuration(format!("unknown scope: {s}")))
    }
}

/// Tokens issued for one client, as persisted in the token store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub client_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub scope: BTreeSet<String>,
    /// Lifetime in seconds as reported by the provider.
    pub expires_in: u64,
    /// Expiration as unix timestamp in seconds, computed at exchange time.
    pub expires_at: u64,
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl TokenSet {
    pub fn is_expired(&self) -> bool {
        now_secs() >= self.expires_at
    }

    /// Seconds until expiry, zero once expired.
    pub fn remaining_secs(&self) -> u64 {
        self.expires_at.saturating_sub(now_secs())
    }
}

/// Per-flow CSRF state and PKCE verifier/challenge pair.
///
/// The state is echoed back on the redirect; the verifier is sent with the
/// token request and must never leave this process otherwise.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub state: String,
    pub code_verifier: String,
    pub code_challenge: String,
}

impl AuthorizationRequest {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let state_bytes: [u8; 16] = rng.random();
        let verifier_bytes: [u8; 32] = rng.random();

        let code_verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);
        Self {
            state: URL_SAFE_NO_PAD.encode(state_bytes),
            code_challenge: pkce_challenge(&code_verifier),
            code_verifier,
        }
    }
}

/// S256 challenge for a PKCE verifier.
pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Client for the two provider endpoints.
#[derive(Debug, Clone)]
pub struct FitbitOAuth {
    http: reqwest::Client,
    authorize_endpoint: String,
    token_endpoint: String,
}

impl FitbitOAuth {
    pub fn new(authorize_endpoint: impl Into<String>, token_endpoint: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AuthError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            authorize_endpoint: authorize_endpoint.into(),
            token_endpoint: token_endpoint.into(),
        })
    }

    /// Build the URL the user visits to grant consent. No network call.
    ///
    /// Scopes are space-joined in the order given, duplicates dropped.
    pub fn build_authorization_url(
        &self,
        client_id: &str,
        redirect_uri: &str,
        scopes: &[Scope],
        request: &AuthorizationRequest,
    ) -> Result<Url> {
        let client_id = client_id.trim();
        if client_id.is_empty() {
            return Err(AuthError::Configuration("client_id is empty".into()));
        }

        let mut seen = BTreeSet::new();
        let scope = scopes
            .iter()
            .filter(|scope| seen.insert(**scope))
            .map(|scope| scope.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        let mut url = Url::parse(&self.authorize_endpoint).map_err(|e| {
            AuthError::Configuration(format!(
                "invalid authorize endpoint {}: {e}",
                self.authorize_endpoint
            ))
        })?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", &scope)
            .append_pair("state", &request.state)
            .append_pair("code_challenge", &request.code_challenge)
            .append_pair("code_challenge_method", "S256");
        Ok(url)
    }

    /// Exchange an authorization code for tokens. One request, no retries.
    ///
    /// Client credentials go in an HTTP Basic header, which Fitbit requires
    /// for server-type apps; the client id is repeated in the form for PKCE.
    pub async fn exchange_code(
        &self,
        client_id: &str,
        client_secret: &str,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenSet> {
        debug!(client_id, endpoint = %self.token_endpoint, "exchanging authorization code");

        let response = self
            .http
            .post(&self.token_endpoint)
            .basic_auth(client_id, Some(client_secret))
            .form(&[
                ("client_id", client_id),
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("code_verifier", code_verifier),
            ])
            .send()
            .await
            .map_err(|e| AuthError::exchange(format!("token request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Exchange {
                status: Some(status.as_u16()),
                body: None,
                message: format!("failed to read token response: {e}"),
            })?;

        if !status.is_success() {
            return Err(AuthError::Exchange {
                status: Some(status.as_u16()),
                message: format!("token endpoint returned {status}: {body}"),
                body: Some(body),
            });
        }

        let data: TokenResponse = serde_json::from_str(&body).map_err(|e| AuthError::Exchange {
            status: Some(status.as_u16()),
            body: Some(body.clone()),
            message: format!("invalid token response: {e}"),
        })?;

        info!(client_id, expires_in = data.expires_in, "token exchange succeeded");
        Ok(data.into_token_set(client_id, now_secs()))
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: u64,
    #[serde(default, deserialize_with = "space_separated")]
    scope: BTreeSet<String>,
    token_type: String,
    #[serde(default)]
    user_id: Option<String>,
}

impl TokenResponse {
    fn into_token_set(self, client_id: &str, now: u64) -> TokenSet {
        TokenSet {
            client_id: client_id.to_string(),
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            scope: self.scope,
            expires_in: self.expires_in,
            expires_at: now.saturating_add(self.expires_in),
            token_type: self.token_type,
            user_id: self.user_id,
        }
    }
}

fn space_separated<'de, D>(deserializer: D) -> std::result::Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(raw.split_whitespace().map(str::to_string).collect())
}

pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
