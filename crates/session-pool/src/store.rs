//! Desired-credential storage
//!
//! The desired set lives in a small JSON key-value document on disk, under the
//! fixed key `"tokens"`. Other keys in the document are preserved untouched.
//! Every read-modify-write runs under one tokio Mutex so concurrent façade
//! requests and pool self-pruning cannot lose each other's updates. Writes use
//! atomic temp-file + rename.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use common::Credential;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Document key holding the credential array.
pub const TOKENS_KEY: &str = "tokens";

type Document = Map<String, Value>;

/// Deduplicate (first occurrence wins) and drop blank entries.
///
/// Returns the normalized list and whether anything changed.
pub fn normalize(raw: &[String]) -> (Vec<Credential>, bool) {
    let mut seen = HashSet::new();
    let mut normalized = Vec::with_capacity(raw.len());
    for value in raw {
        let Some(credential) = Credential::parse(value) else {
            continue;
        };
        if seen.insert(credential.expose().to_owned()) {
            normalized.push(credential);
        }
    }
    let changed = normalized.len() != raw.len()
        || normalized
            .iter()
            .zip(raw)
            .any(|(credential, original)| credential.expose() != original);
    (normalized, changed)
}

/// Persistent desired set of credentials.
pub struct CredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CredentialStore {
    /// Open the store at `path`, creating an empty document if none exists.
    ///
    /// Fails when the document exists but cannot be read or parsed, or when a
    /// fresh document cannot be written. Callers treat this as fatal at startup.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let store = Self {
            path,
            lock: Mutex::new(()),
        };

        if tokio::fs::try_exists(&store.path).await.unwrap_or(false) {
            let document = store.read_document().await?;
            let count = document
                .get(TOKENS_KEY)
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            info!(path = %store.path.display(), tokens = count, "opened credential store");
        } else {
            info!(
                path = %store.path.display(),
                "credential store not found, starting with empty set"
            );
            let mut document = Document::new();
            document.insert(TOKENS_KEY.into(), Value::Array(Vec::new()));
            write_atomic(&store.path, &document).await?;
        }

        Ok(store)
    }

    /// Location of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All desired credentials, normalized. An absent key is initialized to an
    /// empty list and persisted.
    pub async fn get_all(&self) -> Result<Vec<Credential>> {
        let _guard = self.lock.lock().await;
        let raw = self.read_tokens().await?;
        Ok(normalize(&raw).0)
    }

    /// Like `get_all`, but also persists the normalized list when the stored
    /// one contained duplicates or blank entries.
    pub async fn load_desired(&self) -> Result<Vec<Credential>> {
        let _guard = self.lock.lock().await;
        let raw = self.read_tokens().await?;
        let (normalized, changed) = normalize(&raw);
        if changed {
            debug!(
                stored = raw.len(),
                normalized = normalized.len(),
                "persisting normalized credential list"
            );
            self.write_tokens(&normalized).await?;
        }
        Ok(normalized)
    }

    /// Replace the whole desired set.
    ///
    /// The previous list is discarded, so an unreadable document is replaced
    /// by a fresh one instead of failing the write.
    pub async fn set_all(&self, credentials: &[Credential]) -> Result<()> {
        let _guard = self.lock.lock().await;
        let document = self.read_document().await.unwrap_or_else(|e| {
            warn!(error = %e, "credential store unreadable, rewriting it");
            Document::new()
        });
        self.write_tokens_into(document, credentials).await
    }

    /// Whether `credential` is in the desired set.
    pub async fn contains(&self, credential: &str) -> Result<bool> {
        Ok(self
            .get_all()
            .await?
            .iter()
            .any(|c| c.expose() == credential))
    }

    /// Add a credential. Returns `false` without writing if it was already present.
    pub async fn insert(&self, credential: Credential) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let (mut credentials, _) = normalize(&self.read_tokens().await?);
        if credentials.contains(&credential) {
            return Ok(false);
        }
        credentials.push(credential);
        self.write_tokens(&credentials).await?;
        Ok(true)
    }

    /// Remove a credential. Returns `false` without writing if it was absent.
    pub async fn remove(&self, credential: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let (mut credentials, _) = normalize(&self.read_tokens().await?);
        let before = credentials.len();
        credentials.retain(|c| c.expose() != credential);
        if credentials.len() == before {
            return Ok(false);
        }
        self.write_tokens(&credentials).await?;
        Ok(true)
    }

    async fn read_tokens(&self) -> Result<Vec<String>> {
        let mut document = self.read_document().await?;
        match document.get(TOKENS_KEY) {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                Error::StoreUnavailable(format!("\"{TOKENS_KEY}\" is not a list of strings: {e}"))
            }),
            None => {
                document.insert(TOKENS_KEY.into(), Value::Array(Vec::new()));
                write_atomic(&self.path, &document).await?;
                Ok(Vec::new())
            }
        }
    }

    async fn write_tokens(&self, credentials: &[Credential]) -> Result<()> {
        let document = self.read_document().await?;
        self.write_tokens_into(document, credentials).await
    }

    async fn write_tokens_into(
        &self,
        mut document: Document,
        credentials: &[Credential],
    ) -> Result<()> {
        let value = serde_json::to_value(credentials)
            .map_err(|e| Error::StoreUnavailable(format!("serializing credentials: {e}")))?;
        document.insert(TOKENS_KEY.into(), value);
        write_atomic(&self.path, &document).await?;
        debug!(tokens = credentials.len(), "persisted desired set");
        Ok(())
    }

    async fn read_document(&self) -> Result<Document> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Document::new()),
            Err(e) => {
                return Err(Error::StoreUnavailable(format!(
                    "reading {}: {e}",
                    self.path.display()
                )));
            }
        };
        serde_json::from_str(&contents).map_err(|e| {
            Error::StoreUnavailable(format!("parsing {}: {e}", self.path.display()))
        })
    }
}

/// Write the document atomically.
///
/// Writes to a temporary file in the same directory, then renames it over the
/// target. The file holds account secrets, so permissions are 0600 on unix.
async fn write_atomic(path: &Path, document: &Document) -> Result<()> {
    let json = serde_json::to_string_pretty(document)
        .map_err(|e| Error::StoreUnavailable(format!("serializing store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::StoreUnavailable("store path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("tokens.json");
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::StoreUnavailable(format!("writing temp store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::StoreUnavailable(format!("setting store permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::StoreUnavailable(format!("renaming temp store file: {e}")))?;

    Ok(())
}
