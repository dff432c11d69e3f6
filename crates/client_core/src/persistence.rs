//! Explicit save/load of a session snapshot, called by the host at its own
//! lifecycle points.

use std::{fs, io::ErrorKind, path::Path};

use anyhow::{Context, Result};
use shared::domain::Session;
use tracing::info;

pub fn save_snapshot(path: &Path, session: &Session) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create snapshot directory '{}'", parent.display())
        })?;
    }

    let encoded = serde_json::to_vec_pretty(session).context("failed to encode session")?;
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, encoded)
        .with_context(|| format!("failed to write '{}'", staging.display()))?;
    fs::rename(&staging, path)
        .with_context(|| format!("failed to move snapshot into '{}'", path.display()))?;

    info!(
        path = %path.display(),
        entities = session.entities.len(),
        "persistence: snapshot saved"
    );
    Ok(())
}

/// `Ok(None)` when nothing has been saved yet.
pub fn load_snapshot(path: &Path) -> Result<Option<Session>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read '{}'", path.display()))
        }
    };
    let session: Session = serde_json::from_slice(&raw)
        .with_context(|| format!("snapshot '{}' is not a valid session", path.display()))?;
    Ok(Some(session))
}
