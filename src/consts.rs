//! Project-wide constants.

use std::path::PathBuf;
use std::time::Duration;

pub const AUTHOR: &str = env!("CARGO_PKG_AUTHORS");
pub const HOMEPAGE: &str = env!("CARGO_PKG_HOMEPAGE");
pub const REPO: &str = env!("CARGO_PKG_REPOSITORY");

/// Fitbit authorization endpoint (opened in the user's browser).
pub const AUTHORIZE_URL: &str = "https://www.fitbit.com/oauth2/authorize";

/// Fitbit token endpoint for the authorization-code grant.
pub const TOKEN_URL: &str = "https://api.fitbit.com/oauth2/token";

/// Redirect URI registered with the Fitbit application.
pub const REDIRECT_URI: &str = "http://localhost:5000/callback";

/// How long to wait for the browser to come back with a code.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Request timeout for the token endpoint call.
pub const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub const CREDENTIALS_FILE: &str = "credentials.json";
pub const TOKENS_FILE: &str = "fitbit_tokens.json";

/// Default data directory: `~/.fitbit-auth`.
/// Holds both the credentials and the tokens file.
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".fitbit-auth"))
}

/// Format a second count as a short human duration (e.g. `7h 59m`).
pub fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    match (hours, minutes) {
        (0, 0) => format!("{seconds}s"),
        (0, m) => format!("{m}m {seconds:02}s"),
        (h, m) => format!("{h}h {m:02}m"),
    }
}
