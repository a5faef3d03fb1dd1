pub mod browser;
pub mod callback;
pub mod flow;
pub mod oauth;
pub mod storage;

pub use flow::LoginFlow;
pub use storage::{CredentialStore, TokenStore};

use tracing::info;

use crate::config::Config;
use crate::error::Result;

/// Forget a client: drop its secret and tokens from both stores.
///
/// Returns `false` when neither store knew the client id. Both files are
/// committed together, same as a login.
pub fn logout(config: &Config, client_id: &str) -> Result<bool> {
    let credentials = CredentialStore::new(&config.credentials_path);
    let tokens = TokenStore::new(&config.tokens_path);

    let staged: Vec<_> = [
        credentials.stage_remove(client_id)?,
        tokens.stage_remove(client_id)?,
    ]
    .into_iter()
    .flatten()
    .collect();

    if staged.is_empty() {
        return Ok(false);
    }
    storage::commit_all(staged)?;
    info!(client_id, "removed stored client");
    Ok(true)
}
