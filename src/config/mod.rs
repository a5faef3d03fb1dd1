//! Flow configuration: provider endpoints, the registered redirect URI,
//! where the two store files live, and how long to wait for the browser.
//!
//! Defaults come from [`consts`](crate::consts); the CLI overrides the data
//! directory, timeout and redirect URI.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;

use crate::auth::oauth::Scope;
use crate::consts::{
    AUTHORIZE_URL, CREDENTIALS_FILE, DEFAULT_AUTH_TIMEOUT, REDIRECT_URI, TOKEN_URL, TOKENS_FILE,
};
use crate::error::{AuthError, Result};

/// Everything a login flow needs besides the client id and secret.
#[derive(Debug, Clone)]
pub struct Config {
    pub authorize_endpoint: String,
    pub token_endpoint: String,
    /// Must match the redirect URI registered with the Fitbit app.
    pub redirect_uri: String,
    pub scopes: Vec<Scope>,
    pub credentials_path: PathBuf,
    pub tokens_path: PathBuf,
    pub timeout: Duration,
}

impl Config {
    /// Default endpoints and scopes, with both store files under `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            authorize_endpoint: AUTHORIZE_URL.to_string(),
            token_endpoint: TOKEN_URL.to_string(),
            redirect_uri: REDIRECT_URI.to_string(),
            scopes: Scope::ALL.to_vec(),
            credentials_path: data_dir.join(CREDENTIALS_FILE),
            tokens_path: data_dir.join(TOKENS_FILE),
            timeout: DEFAULT_AUTH_TIMEOUT,
        }
    }

    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = redirect_uri.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = endpoint.into();
        self
    }

    /// Parse the redirect URI and check it is something we can listen on:
    /// plain `http`, a loopback host, an explicit port, and a literal path.
    pub fn redirect_url(&self) -> Result<Url> {
        let url = Url::parse(&self.redirect_uri).map_err(|e| {
            AuthError::Configuration(format!("invalid redirect URI {}: {e}", self.redirect_uri))
        })?;
        if url.scheme() != "http" {
            return Err(AuthError::Configuration(format!(
                "redirect URI must use http, got {}",
                url.scheme()
            )));
        }
        if url.port().is_none() {
            return Err(AuthError::Configuration(format!(
                "redirect URI {} has no explicit port",
                self.redirect_uri
            )));
        }
        loopback_ip(url.host_str().unwrap_or_default())?;
        // the router reads `:name` and `*name` segments as captures
        if url
            .path()
            .split('/')
            .any(|segment| segment.starts_with(':') || segment.starts_with('*'))
        {
            return Err(AuthError::Configuration(format!(
                "redirect URI path {} may not have segments starting with ':' or '*'",
                url.path()
            )));
        }
        Ok(url)
    }

    /// Address the callback listener binds, derived from the redirect URI.
    pub fn callback_addr(&self) -> Result<SocketAddr> {
        let url = self.redirect_url()?;
        let ip = loopback_ip(url.host_str().unwrap_or_default())?;
        let port = url.port().unwrap_or_default();
        Ok(SocketAddr::new(ip, port))
    }

    /// Path the callback listener serves, e.g. `/callback`.
    pub fn callback_path(&self) -> Result<String> {
        Ok(self.redirect_url()?.path().to_string())
    }
}

/// `localhost` maps to IPv4 loopback; anything else must be a loopback IP.
fn loopback_ip(host: &str) -> Result<IpAddr> {
    if host.eq_ignore_ascii_case("localhost") {
        return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    match trimmed.parse::<IpAddr>() {
        Ok(ip) if ip.is_loopback() => Ok(ip),
        _ => Err(AuthError::Configuration(format!(
            "redirect URI host must be loopback, got {host:?}"
        ))),
    }
}
