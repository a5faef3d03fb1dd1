use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fitbit_auth::auth::LoginFlow;
use fitbit_auth::auth::browser::Launcher;
use fitbit_auth::auth::callback::{CallbackOutcome, CallbackReceiver};
use fitbit_auth::auth::oauth::TokenSet;
use fitbit_auth::auth::storage::{ClientCredential, CredentialStore, TokenStore};
use fitbit_auth::events::Event;
use fitbit_auth::{AuthError, Config};

/// What the scripted browser does once it "sees" the consent page.
enum Reply {
    /// Redirect back with this code and the real state.
    Code(&'static str),
    /// Redirect back with `error` and `error_description`.
    Error(&'static str, &'static str),
    /// Never come back.
    Nothing,
}

/// A browser stand-in that follows the redirect itself.
struct ScriptedBrowser {
    reply: Reply,
}

#[async_trait]
impl Launcher for ScriptedBrowser {
    async fn launch(&self, url: &Url) -> anyhow::Result<()> {
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let mut redirect = Url::parse(&params["redirect_uri"])?;
        let state = params["state"].clone();

        match &self.reply {
            Reply::Code(code) => {
                redirect
                    .query_pairs_mut()
                    .append_pair("code", code)
                    .append_pair("state", &state);
            }
            Reply::Error(error, description) => {
                redirect
                    .query_pairs_mut()
                    .append_pair("error", error)
                    .append_pair("error_description", description)
                    .append_pair("state", &state);
            }
            Reply::Nothing => return Ok(()),
        }

        // the callback page itself is checked in the receiver tests
        reqwest::get(redirect).await?;
        Ok(())
    }
}

/// An opener that never finishes within the test (a terminal browser).
struct StuckBrowser {
    launched: Arc<AtomicBool>,
}

#[async_trait]
impl Launcher for StuckBrowser {
    async fn launch(&self, _url: &Url) -> anyhow::Result<()> {
        self.launched.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

struct Harness {
    config: Config,
    port: u16,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new(token_server: &MockServer) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let port = free_port();
        let config = Config::new(dir.path())
            .with_redirect_uri(format!("http://127.0.0.1:{port}/callback"))
            .with_token_endpoint(format!("{}/oauth2/token", token_server.uri()))
            .with_timeout(Duration::from_secs(10));
        Self {
            config,
            port,
            _dir: dir,
        }
    }

    fn flow(&self, reply: Reply) -> LoginFlow {
        LoginFlow::new(self.config.clone(), Box::new(ScriptedBrowser { reply })).unwrap()
    }

    fn credentials(&self) -> CredentialStore {
        CredentialStore::new(&self.config.credentials_path)
    }

    fn tokens(&self) -> TokenStore {
        TokenStore::new(&self.config.tokens_path)
    }

    fn no_files_written(&self) -> bool {
        !self.config.credentials_path.exists() && !self.config.tokens_path.exists()
    }
}

async fn token_server(access_token: &str) -> MockServer {
    let server = MockServer::start().await;
    mount_tokens(&server, access_token).await;
    server
}

async fn mount_tokens(server: &MockServer, access_token: &str) {
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": access_token,
            "refresh_token": format!("refresh-for-{access_token}"),
            "expires_in": 28800,
            "scope": "activity heartrate sleep profile respiratory_rate oxygen_saturation weight settings",
            "token_type": "Bearer",
            "user_id": "7XYZ"
        })))
        .mount(server)
        .await;
}

fn seed(harness: &Harness, client_id: &str) {
    harness
        .credentials()
        .upsert(ClientCredential {
            client_id: client_id.to_string(),
            client_secret: "other-secret".to_string(),
        })
        .unwrap();
    harness
        .tokens()
        .upsert(TokenSet {
            client_id: client_id.to_string(),
            access_token: "other-access".to_string(),
            refresh_token: "other-refresh".to_string(),
            scope: Default::default(),
            expires_in: 1,
            expires_at: 1,
            token_type: "Bearer".to_string(),
            user_id: None,
        })
        .unwrap();
}

// ── Successful flows ──────────────────────────────────────────────

#[tokio::test]
async fn successful_flow_stores_one_entry_per_store() {
    let server = token_server("at-1").await;
    let harness = Harness::new(&server);
    seed(&harness, "OTHER");

    let tokens = harness
        .flow(Reply::Code("code-1"))
        .run("23ABCD", "secret-1")
        .await
        .unwrap();
    assert_eq!(tokens.access_token, "at-1");
    assert_eq!(tokens.scope.len(), 8);

    let credentials = harness.credentials().load().unwrap();
    assert_eq!(credentials.len(), 2);
    assert_eq!(credentials["23ABCD"].client_secret, "secret-1");
    assert_eq!(credentials["OTHER"].client_secret, "other-secret");

    let stored = harness.tokens().load().unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored["23ABCD"], tokens);
    assert_eq!(stored["OTHER"].access_token, "other-access");
}

#[tokio::test]
async fn rerun_upserts_credential_and_replaces_tokens() {
    let server = token_server("at-1").await;
    let harness = Harness::new(&server);
    seed(&harness, "OTHER");

    harness
        .flow(Reply::Code("code-1"))
        .run("23ABCD", "secret-1")
        .await
        .unwrap();

    server.reset().await;
    mount_tokens(&server, "at-2").await;

    harness
        .flow(Reply::Code("code-2"))
        .run("23ABCD", "secret-2")
        .await
        .unwrap();

    let credentials = harness.credentials().load().unwrap();
    assert_eq!(credentials.len(), 2);
    assert_eq!(credentials["23ABCD"].client_secret, "secret-2");
    assert_eq!(credentials["OTHER"].client_secret, "other-secret");

    let tokens = harness.tokens().load().unwrap();
    assert_eq!(tokens.len(), 2);
    assert_eq!(tokens["23ABCD"].access_token, "at-2");
    assert_eq!(tokens["23ABCD"].refresh_token, "refresh-for-at-2");

    let raw = std::fs::read_to_string(&harness.config.tokens_path).unwrap();
    assert!(!raw.contains("at-1\""), "old token must not survive: {raw}");
}

#[tokio::test]
async fn flow_emits_progress_in_order() {
    let server = token_server("at-1").await;
    let harness = Harness::new(&server);
    let flow = harness.flow(Reply::Code("code-1"));
    let mut rx = flow.events().subscribe();

    flow.run("23ABCD", "secret-1").await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(events[0], Event::ListenerStarted { .. }));
    assert!(matches!(events[1], Event::AuthorizeUrl { opened: true, .. }));
    assert!(matches!(events[2], Event::WaitingForRedirect { .. }));
    assert_eq!(events[3], Event::RedirectReceived);
    assert_eq!(events[4], Event::ExchangingCode);
    assert_eq!(
        events[5],
        Event::Saved {
            client_id: "23ABCD".into()
        }
    );
}

// ── Failure paths write nothing ───────────────────────────────────

#[tokio::test]
async fn empty_input_is_configuration_error() {
    let server = MockServer::start().await;
    let harness = Harness::new(&server);
    let flow = harness.flow(Reply::Code("code-1"));

    assert!(matches!(
        flow.run("", "secret").await,
        Err(AuthError::Configuration(_))
    ));
    assert!(matches!(
        flow.run("23ABCD", "   ").await,
        Err(AuthError::Configuration(_))
    ));
    assert!(harness.no_files_written());
}

#[tokio::test]
async fn error_redirect_is_denied_and_writes_nothing() {
    let server = token_server("at-1").await;
    let harness = Harness::new(&server);

    let err = harness
        .flow(Reply::Error("access_denied", "The user denied the request."))
        .run("23ABCD", "secret-1")
        .await
        .unwrap_err();

    match err {
        AuthError::Denied { detail } => assert_eq!(detail, "The user denied the request."),
        other => panic!("expected Denied, got {other:?}"),
    }
    assert!(harness.no_files_written());
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn timeout_writes_nothing_and_frees_port() {
    let server = token_server("at-1").await;
    let mut harness = Harness::new(&server);
    harness.config.timeout = Duration::from_millis(300);

    let err = harness
        .flow(Reply::Nothing)
        .run("23ABCD", "secret-1")
        .await
        .unwrap_err();

    assert!(matches!(err, AuthError::Timeout(_)));
    assert!(harness.no_files_written());

    tokio::net::TcpListener::bind(("127.0.0.1", harness.port))
        .await
        .expect("callback port should be free after timeout");
}

#[tokio::test]
async fn stuck_browser_launch_still_times_out() {
    let server = token_server("at-1").await;
    let mut harness = Harness::new(&server);
    harness.config.timeout = Duration::from_millis(300);
    let launched = Arc::new(AtomicBool::new(false));
    let flow = LoginFlow::new(
        harness.config.clone(),
        Box::new(StuckBrowser {
            launched: launched.clone(),
        }),
    )
    .unwrap();
    let mut rx = flow.events().subscribe();

    let started = Instant::now();
    let err = flow.run("23ABCD", "secret-1").await.unwrap_err();

    assert!(launched.load(Ordering::SeqCst));
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "took {:?}",
        started.elapsed()
    );
    match err {
        AuthError::Timeout(limit) => assert_eq!(limit, Duration::from_millis(300)),
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert!(harness.no_files_written());

    let mut opened = None;
    while let Ok(event) = rx.try_recv() {
        if let Event::AuthorizeUrl { opened: o, .. } = event {
            opened = Some(o);
        }
    }
    assert_eq!(opened, Some(false));
}

#[tokio::test]
async fn port_is_reusable_by_next_flow_after_timeout() {
    let server = token_server("at-1").await;
    let mut harness = Harness::new(&server);
    harness.config.timeout = Duration::from_millis(200);

    let first = harness.flow(Reply::Nothing).run("23ABCD", "secret-1").await;
    assert!(matches!(first, Err(AuthError::Timeout(_))));

    harness.config.timeout = Duration::from_secs(10);
    harness
        .flow(Reply::Code("code-1"))
        .run("23ABCD", "secret-1")
        .await
        .expect("second flow should rebind the same port");
}

#[tokio::test]
async fn token_error_status_is_exchange_error_and_writes_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
        .mount(&server)
        .await;
    let harness = Harness::new(&server);

    let err = harness
        .flow(Reply::Code("code-1"))
        .run("23ABCD", "wrong-secret")
        .await
        .unwrap_err();

    match err {
        AuthError::Exchange { status, body, .. } => {
            assert_eq!(status, Some(401));
            assert_eq!(body.as_deref(), Some("invalid_client"));
        }
        other => panic!("expected Exchange, got {other:?}"),
    }
    assert!(harness.no_files_written());
}

#[tokio::test]
async fn failed_exchange_leaves_existing_stores_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let harness = Harness::new(&server);
    seed(&harness, "23ABCD");
    let before_credentials = std::fs::read(&harness.config.credentials_path).unwrap();
    let before_tokens = std::fs::read(&harness.config.tokens_path).unwrap();

    let result = harness
        .flow(Reply::Code("code-1"))
        .run("23ABCD", "new-secret")
        .await;
    assert!(matches!(result, Err(AuthError::Exchange { .. })));

    assert_eq!(
        std::fs::read(&harness.config.credentials_path).unwrap(),
        before_credentials
    );
    assert_eq!(
        std::fs::read(&harness.config.tokens_path).unwrap(),
        before_tokens
    );
}

#[tokio::test]
async fn unreadable_store_fails_before_browser_and_exchange() {
    let server = token_server("at-1").await;
    let harness = Harness::new(&server);
    std::fs::write(&harness.config.tokens_path, "{ not json").unwrap();
    let launched = Arc::new(AtomicBool::new(false));
    let flow = LoginFlow::new(
        harness.config.clone(),
        Box::new(StuckBrowser {
            launched: launched.clone(),
        }),
    )
    .unwrap();

    let err = flow.run("23ABCD", "secret-1").await.unwrap_err();

    assert!(matches!(err, AuthError::Persistence(_)));
    assert!(!launched.load(Ordering::SeqCst));
    assert!(server.received_requests().await.unwrap().is_empty());
    assert_eq!(
        std::fs::read_to_string(&harness.config.tokens_path).unwrap(),
        "{ not json"
    );
    assert!(!harness.config.credentials_path.exists());
}

#[tokio::test]
async fn legacy_token_file_keeps_old_entries_after_login() {
    let server = token_server("at-1").await;
    let harness = Harness::new(&server);
    std::fs::write(
        &harness.config.tokens_path,
        r#"{"OLD": {"access_token": "old-at", "expires_in": 28800, "refresh_token": "old-rt",
            "scope": ["sleep"], "token_type": "Bearer", "user_id": "7XYZ",
            "expires_at": 1700000000.123}}"#,
    )
    .unwrap();

    harness
        .flow(Reply::Code("code-1"))
        .run("23ABCD", "secret-1")
        .await
        .unwrap();

    let tokens = harness.tokens().load().unwrap();
    assert_eq!(tokens.len(), 2);
    assert_eq!(tokens["23ABCD"].access_token, "at-1");
    assert_eq!(tokens["OLD"].client_id, "OLD");
    assert_eq!(tokens["OLD"].expires_at, 1_700_000_000);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn busy_port_is_listener_error() {
    let server = MockServer::start().await;
    let harness = Harness::new(&server);
    let _squatter = tokio::net::TcpListener::bind(("127.0.0.1", harness.port))
        .await
        .unwrap();

    let err = harness
        .flow(Reply::Code("code-1"))
        .run("23ABCD", "secret-1")
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Listener(_)));
}

// ── Callback receiver ─────────────────────────────────────────────

async fn receiver() -> (CallbackReceiver, SocketAddr) {
    let receiver = CallbackReceiver::bind("127.0.0.1:0".parse().unwrap(), "/callback", "st-1")
        .await
        .unwrap();
    let addr = receiver.local_addr();
    (receiver, addr)
}

#[tokio::test]
async fn second_redirect_does_not_replace_first() {
    let (receiver, addr) = receiver().await;

    let first = reqwest::get(format!("http://{addr}/callback?code=first&state=st-1"))
        .await
        .unwrap();
    assert_eq!(first.status(), 200);

    let second = reqwest::get(format!("http://{addr}/callback?code=second&state=st-1"))
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    assert!(second.text().await.unwrap().contains("Already completed"));

    let outcome = receiver.wait(Duration::from_secs(5)).await.unwrap();
    assert_eq!(outcome, CallbackOutcome::Code("first".into()));
}

#[tokio::test]
async fn forged_state_keeps_waiting() {
    let (receiver, addr) = receiver().await;

    let forged = reqwest::get(format!("http://{addr}/callback?code=evil&state=nope"))
        .await
        .unwrap();
    assert_eq!(forged.status(), 400);

    let real = reqwest::get(format!("http://{addr}/callback?code=good&state=st-1"))
        .await
        .unwrap();
    assert_eq!(real.status(), 200);

    let outcome = receiver.wait(Duration::from_secs(5)).await.unwrap();
    assert_eq!(outcome, CallbackOutcome::Code("good".into()));
}

#[tokio::test]
async fn error_redirect_gets_failure_page() {
    let (receiver, addr) = receiver().await;

    let response = reqwest::get(format!(
        "http://{addr}/callback?error=access_denied&state=st-1"
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 400);
    assert!(response.text().await.unwrap().contains("access_denied"));

    let outcome = receiver.wait(Duration::from_secs(5)).await.unwrap();
    assert_eq!(outcome, CallbackOutcome::Denied("access_denied".into()));
}

#[tokio::test]
async fn wait_releases_port_on_success() {
    let (receiver, addr) = receiver().await;
    reqwest::get(format!("http://{addr}/callback?code=c&state=st-1"))
        .await
        .unwrap();

    receiver.wait(Duration::from_secs(5)).await.unwrap();
    tokio::net::TcpListener::bind(addr)
        .await
        .expect("port should be free after wait");
}
