//! Session storage for the crawler's MTProto identity.
//!
//! The engine only ever reads an existing authorization: a fresh file here
//! fails the startup auth check instead of triggering an interactive login,
//! which lives outside this binary.

use crate::domain::DomainError;
use grammers_session::storages::SqliteSession;
use std::path::Path;
use tracing::debug;

/// Open the SQLite-backed session store at `path`.
///
/// A missing parent directory is created first; failures on either step
/// map to `DomainError::Config` since a broken session path is an operator
/// configuration problem, not a runtime fault.
pub async fn open_session_store(path: &Path) -> Result<SqliteSession, DomainError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            DomainError::Config(format!("session directory {}: {e}", parent.display()))
        })?;
    }
    debug!(path = %path.display(), "opening session store");
    SqliteSession::open(path)
        .await
        .map_err(|e| DomainError::Config(format!("session store {}: {e}", path.display())))
}
