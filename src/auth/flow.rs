//! The login flow: browser consent, one redirect, one token exchange, two
//! store writes.

use tokio::time::Instant;
use tracing::{info, warn};

use super::browser::Launcher;
use super::callback::{CallbackOutcome, CallbackReceiver};
use super::oauth::{AuthorizationRequest, FitbitOAuth, TokenSet};
use super::storage::{ClientCredential, CredentialStore, TokenStore, commit_all};
use crate::config::Config;
use crate::error::{AuthError, Result};
use crate::events::{Event, EventBus};

/// Runs one authorization-code flow at a time.
pub struct LoginFlow {
    config: Config,
    oauth: FitbitOAuth,
    credentials: CredentialStore,
    tokens: TokenStore,
    launcher: Box<dyn Launcher>,
    events: EventBus,
}

impl LoginFlow {
    pub fn new(config: Config, launcher: Box<dyn Launcher>) -> Result<Self> {
        let oauth = FitbitOAuth::new(&config.authorize_endpoint, &config.token_endpoint)?;
        Ok(Self {
            credentials: CredentialStore::new(&config.credentials_path),
            tokens: TokenStore::new(&config.tokens_path),
            config,
            oauth,
            launcher,
            events: EventBus::default(),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Authorize `client_id` in the browser and persist the result.
    ///
    /// Nothing is written unless the exchange succeeds; the callback port is
    /// released on every path out of this function. The timeout covers the
    /// browser launch as well as the wait for the redirect.
    pub async fn run(&self, client_id: &str, client_secret: &str) -> Result<TokenSet> {
        let client_id = client_id.trim();
        let client_secret = client_secret.trim();
        if client_id.is_empty() {
            return Err(AuthError::Configuration("client_id is required".into()));
        }
        if client_secret.is_empty() {
            return Err(AuthError::Configuration("client_secret is required".into()));
        }

        // validated, then sent verbatim so it matches the app registration
        self.config.redirect_url()?;
        let redirect_uri = self.config.redirect_uri.as_str();
        let request = AuthorizationRequest::generate();
        let url = self.oauth.build_authorization_url(
            client_id,
            redirect_uri,
            &self.config.scopes,
            &request,
        )?;

        // an unreadable store must fail before the code is spent
        self.check_stores().await?;

        let receiver = CallbackReceiver::bind(
            self.config.callback_addr()?,
            &self.config.callback_path()?,
            &request.state,
        )
        .await?;
        self.events.emit(Event::ListenerStarted {
            addr: receiver.local_addr(),
        });

        let deadline = Instant::now() + self.config.timeout;
        let opened = match tokio::time::timeout_at(deadline, self.launcher.launch(&url)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                info!(error = %e, "browser not opened, URL must be visited manually");
                false
            }
            Err(_) => {
                warn!("browser launcher still running at the deadline");
                false
            }
        };
        self.events.emit(Event::AuthorizeUrl {
            url: url.to_string(),
            opened,
        });

        let remaining = deadline.saturating_duration_since(Instant::now());
        self.events.emit(Event::WaitingForRedirect { timeout: remaining });
        let outcome = receiver.wait(remaining).await.map_err(|e| match e {
            AuthError::Timeout(_) => AuthError::Timeout(self.config.timeout),
            other => other,
        })?;
        let code = match outcome {
            CallbackOutcome::Code(code) => code,
            CallbackOutcome::Denied(detail) => return Err(AuthError::Denied { detail }),
        };
        self.events.emit(Event::RedirectReceived);

        self.events.emit(Event::ExchangingCode);
        let tokens = self
            .oauth
            .exchange_code(
                client_id,
                client_secret,
                &code,
                redirect_uri,
                &request.code_verifier,
            )
            .await
            .inspect_err(|e| warn!(client_id, error = %e, "token exchange failed"))?;

        self.persist(
            ClientCredential {
                client_id: client_id.to_string(),
                client_secret: client_secret.to_string(),
            },
            tokens.clone(),
        )
        .await?;
        info!(client_id, "stored credentials and tokens");
        self.events.emit(Event::Saved {
            client_id: client_id.to_string(),
        });

        Ok(tokens)
    }

    async fn check_stores(&self) -> Result<()> {
        let credentials = self.credentials.clone();
        let tokens = self.tokens.clone();
        blocking(move || {
            credentials.load()?;
            tokens.load()?;
            Ok(())
        })
        .await
    }

    /// Both stores or neither.
    async fn persist(&self, credential: ClientCredential, tokens: TokenSet) -> Result<()> {
        let credentials = self.credentials.clone();
        let token_store = self.tokens.clone();
        blocking(move || {
            let staged_credentials = credentials.stage_upsert(credential)?;
            let staged_tokens = token_store.stage_upsert(tokens)?;
            commit_all(vec![staged_credentials, staged_tokens])
        })
        .await
    }
}

/// Run store file I/O off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AuthError::Persistence(format!("store task failed: {e}")))?
}
