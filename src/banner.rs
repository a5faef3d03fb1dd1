//! Startup banner, login summary and stored-client listing.

use std::collections::BTreeMap;

use crate::auth::oauth::TokenSet;
use crate::auth::storage::ClientCredential;
use crate::config::Config;
use crate::consts::{AUTHOR, REPO, format_duration};

/// Print the startup banner with where things will be read and written.
pub fn print_banner(config: &Config) {
    println!(
        r#"
   fitbit-auth {}
   by          {}
   repo        {}
   redirect    {}
   credentials {}
   tokens      {}
"#,
        env!("CARGO_PKG_VERSION"),
        AUTHOR,
        REPO,
        config.redirect_uri,
        config.credentials_path.display(),
        config.tokens_path.display(),
    );
}

/// Print what a successful login stored.
pub fn print_login_summary(tokens: &TokenSet) {
    println!("✓ Authorized {}", tokens.client_id);
    if let Some(user_id) = &tokens.user_id {
        println!("  user      {user_id}");
    }
    println!("  expires   in {}", format_duration(tokens.expires_in));
    println!("  scopes    {}", scope_list(tokens));
}

/// Print every stored client and the state of its tokens.
pub fn print_status(
    credentials: &BTreeMap<String, ClientCredential>,
    tokens: &BTreeMap<String, TokenSet>,
) {
    if credentials.is_empty() && tokens.is_empty() {
        println!("no stored clients. run `fitbit-auth login` first.");
        return;
    }

    let mut ids: Vec<&String> = credentials.keys().chain(tokens.keys()).collect();
    ids.sort();
    ids.dedup();

    for id in ids {
        println!("{}", status_line(id, credentials.contains_key(id), tokens.get(id)));
    }
}

fn status_line(client_id: &str, has_secret: bool, tokens: Option<&TokenSet>) -> String {
    let secret = if has_secret { "secret ✓" } else { "secret ✗" };
    let token = match tokens {
        None => "no tokens".to_string(),
        Some(t) if t.is_expired() => format!("token expired ({})", scope_list(t)),
        Some(t) => format!(
            "token valid for {} ({})",
            format_duration(t.remaining_secs()),
            scope_list(t)
        ),
    };
    format!("  {client_id:<10} {secret}  {token}")
}

fn scope_list(tokens: &TokenSet) -> String {
    tokens
        .scope
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
