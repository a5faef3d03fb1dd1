//! JSON file stores for client credentials and issued tokens.
//!
//! Each store is a single pretty-printed JSON object keyed by client id.
//! Writes never touch the target directly: the new document is written to a
//! temp file next to it ([`StagedWrite`]) and renamed over the target on
//! [`StagedWrite::commit`]. [`commit_all`] commits several staged writes and
//! rolls the earlier ones back if a later one fails, so the two stores move
//! together.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::oauth::TokenSet;
use crate::error::{AuthError, Result};

/// Application credentials entered by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCredential {
    pub client_id: String,
    pub client_secret: String,
}

/// Credentials file contents. Older files are a plain list of entries.
#[derive(Deserialize)]
#[serde(untagged)]
enum CredentialsDocument {
    Keyed(BTreeMap<String, ClientCredential>),
    Legacy(Vec<ClientCredential>),
}

impl Default for CredentialsDocument {
    fn default() -> Self {
        Self::Keyed(BTreeMap::new())
    }
}

impl CredentialsDocument {
    fn into_map(self) -> BTreeMap<String, ClientCredential> {
        match self {
            Self::Keyed(map) => map,
            // later entries win, matching a sequence of upserts
            Self::Legacy(list) => list
                .into_iter()
                .map(|cred| (cred.client_id.clone(), cred))
                .collect(),
        }
    }
}

/// One token store entry. Older files hold the provider's raw token
/// response: no `client_id`, scopes as a list, fractional `expires_at`.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredTokens {
    Current(TokenSet),
    Legacy(LegacyTokens),
}

#[derive(Deserialize)]
struct LegacyTokens {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    scope: LegacyScope,
    #[serde(default)]
    expires_in: f64,
    expires_at: f64,
    #[serde(default = "bearer")]
    token_type: String,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LegacyScope {
    List(Vec<String>),
    Spaced(String),
}

impl Default for LegacyScope {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

fn bearer() -> String {
    "Bearer".to_string()
}

impl StoredTokens {
    /// Legacy entries take their client id from the map key.
    fn into_token_set(self, client_id: &str) -> TokenSet {
        match self {
            Self::Current(tokens) => tokens,
            Self::Legacy(old) => TokenSet {
                client_id: client_id.to_string(),
                access_token: old.access_token,
                refresh_token: old.refresh_token,
                scope: match old.scope {
                    LegacyScope::List(list) => list.into_iter().collect(),
                    LegacyScope::Spaced(s) => s.split_whitespace().map(str::to_string).collect(),
                },
                // float to int casts saturate; negatives become 0
                expires_in: old.expires_in as u64,
                expires_at: old.expires_at as u64,
                token_type: old.token_type,
                user_id: old.user_id,
            },
        }
    }
}

/// Client id → client secret store.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    file: JsonFile,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonFile::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file.path
    }

    /// All stored credentials. A missing file is an empty store.
    pub fn load(&self) -> Result<BTreeMap<String, ClientCredential>> {
        Ok(self.file.read::<CredentialsDocument>()?.into_map())
    }

    pub fn get(&self, client_id: &str) -> Result<Option<ClientCredential>> {
        Ok(self.load()?.remove(client_id))
    }

    /// Insert or replace one entry, keeping every other entry.
    pub fn upsert(&self, credential: ClientCredential) -> Result<()> {
        self.stage_upsert(credential)?.commit().map(drop)
    }

    /// Prepare an upsert without touching the store file yet.
    pub fn stage_upsert(&self, credential: ClientCredential) -> Result<StagedWrite> {
        let mut all = self.load()?;
        all.insert(credential.client_id.clone(), credential);
        self.file.stage(&all)
    }

    /// Prepare removing one entry. `None` if the client id is not stored.
    pub fn stage_remove(&self, client_id: &str) -> Result<Option<StagedWrite>> {
        let mut all = self.load()?;
        if all.remove(client_id).is_none() {
            return Ok(None);
        }
        self.file.stage(&all).map(Some)
    }
}

/// Client id → issued tokens store.
#[derive(Debug, Clone)]
pub struct TokenStore {
    file: JsonFile,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonFile::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file.path
    }

    /// All stored tokens. Legacy entries are read as-is and rewritten in the
    /// current layout on the next write.
    pub fn load(&self) -> Result<BTreeMap<String, TokenSet>> {
        let stored: BTreeMap<String, StoredTokens> = self.file.read()?;
        Ok(stored
            .into_iter()
            .map(|(client_id, entry)| {
                let tokens = entry.into_token_set(&client_id);
                (client_id, tokens)
            })
            .collect())
    }

    pub fn get(&self, client_id: &str) -> Result<Option<TokenSet>> {
        Ok(self.load()?.remove(client_id))
    }

    /// Replace the entry for this client id wholesale.
    pub fn upsert(&self, tokens: TokenSet) -> Result<()> {
        self.stage_upsert(tokens)?.commit().map(drop)
    }

    pub fn stage_upsert(&self, tokens: TokenSet) -> Result<StagedWrite> {
        let mut all = self.load()?;
        all.insert(tokens.client_id.clone(), tokens);
        self.file.stage(&all)
    }

    pub fn stage_remove(&self, client_id: &str) -> Result<Option<StagedWrite>> {
        let mut all = self.load()?;
        if all.remove(client_id).is_none() {
            return Ok(None);
        }
        self.file.stage(&all).map(Some)
    }
}

#[derive(Debug, Clone)]
struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read and parse the file. Missing or blank files yield the default;
    /// invalid JSON is an error so a damaged store is never overwritten.
    fn read<T: DeserializeOwned + Default>(&self) -> Result<T> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => {
                return Err(AuthError::Persistence(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                )));
            }
        };
        if content.trim().is_empty() {
            return Ok(T::default());
        }
        serde_json::from_str(&content).map_err(|e| {
            AuthError::Persistence(format!("{} is not valid: {e}", self.path.display()))
        })
    }

    fn stage<T: Serialize>(&self, value: &T) -> Result<StagedWrite> {
        let json = serde_json::to_string_pretty(value).map_err(|e| {
            AuthError::Persistence(format!("failed to serialize {}: {e}", self.path.display()))
        })?;
        StagedWrite::prepare(&self.path, json.as_bytes())
    }
}

/// New file contents sitting in a temp file beside the target.
///
/// Dropping without committing deletes the temp file and leaves the target
/// untouched.
#[derive(Debug)]
pub struct StagedWrite {
    target: PathBuf,
    tmp: PathBuf,
    previous: Option<Vec<u8>>,
    committed: bool,
}

impl StagedWrite {
    fn prepare(target: &Path, contents: &[u8]) -> Result<Self> {
        let dir = target
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|e| {
            AuthError::Persistence(format!("failed to create {}: {e}", dir.display()))
        })?;

        let previous = match fs::read(target) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(AuthError::Persistence(format!(
                    "failed to read {}: {e}",
                    target.display()
                )));
            }
        };

        let tmp = tmp_path(target);
        let staged = Self {
            target: target.to_path_buf(),
            tmp,
            previous,
            committed: false,
        };
        write_private(&staged.tmp, contents)?;
        Ok(staged)
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Rename the temp file over the target.
    pub fn commit(mut self) -> Result<Committed> {
        fs::rename(&self.tmp, &self.target).map_err(|e| {
            AuthError::Persistence(format!("failed to replace {}: {e}", self.target.display()))
        })?;
        self.committed = true;
        debug!(path = %self.target.display(), "persisted store");
        Ok(Committed {
            target: std::mem::take(&mut self.target),
            previous: self.previous.take(),
        })
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        if !self.committed && let Err(e) = fs::remove_file(&self.tmp) {
            warn!(path = %self.tmp.display(), error = %e, "failed to remove staged file");
        }
    }
}

/// A replaced file plus what it held before, for rollback.
#[derive(Debug)]
pub struct Committed {
    target: PathBuf,
    previous: Option<Vec<u8>>,
}

impl Committed {
    /// Put the target back the way it was before the commit.
    pub fn rollback(self) -> Result<()> {
        match self.previous {
            Some(bytes) => StagedWrite::prepare(&self.target, &bytes)?.commit().map(drop),
            None => fs::remove_file(&self.target).map_err(|e| {
                AuthError::Persistence(format!(
                    "failed to remove {}: {e}",
                    self.target.display()
                ))
            }),
        }
    }
}

/// Commit every staged write in order. If one fails, the ones already
/// committed are rolled back and the rest are discarded.
pub fn commit_all(staged: Vec<StagedWrite>) -> Result<()> {
    let mut done: Vec<Committed> = Vec::with_capacity(staged.len());
    for write in staged {
        match write.commit() {
            Ok(committed) => done.push(committed),
            Err(e) => {
                for committed in done.into_iter().rev() {
                    let target = committed.target.clone();
                    if let Err(rollback) = committed.rollback() {
                        error!(path = %target.display(), error = %rollback, "rollback failed");
                    }
                }
                return Err(e);
            }
        }
    }
    Ok(())
}

fn tmp_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    target.with_file_name(format!(".{name}.tmp.{}", std::process::id()))
}

/// Write and fsync a file readable only by the owner.
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let io_err =
        |e: std::io::Error| AuthError::Persistence(format!("failed to write {}: {e}", path.display()));

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(io_err)?;

    // mode() only applies on creation; a leftover temp file keeps its bits
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(io_err)?;
    }

    file.write_all(contents).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    Ok(())
}
