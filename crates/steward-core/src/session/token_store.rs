use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::warn;

use crate::backend::ResumeToken;

/// One `<id>.session` file per recipient holding the raw resume token.
#[derive(Debug, Clone)]
pub struct TokenStore {
    dir: PathBuf,
}

impl TokenStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn path(&self, id: i64) -> PathBuf {
        self.dir.join(format!("{id}.session"))
    }

    /// A missing, empty or unreadable file means "start fresh".
    pub fn load(&self, id: i64) -> Option<ResumeToken> {
        let path = self.path(id);
        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let token = raw.trim();
                (!token.is_empty()).then(|| ResumeToken::new(token))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Failed to read {}: {e}", path.display());
                None
            }
        }
    }

    /// Overwrite the stored token via a temp file and rename.
    pub fn save(&self, id: i64, token: &ResumeToken) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create '{}'", self.dir.display()))?;
        let path = self.path(id);
        let tmp = self.dir.join(format!(".{id}.session.tmp"));
        std::fs::write(&tmp, token.as_str())
            .with_context(|| format!("failed to write '{}'", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace '{}'", path.display()))?;
        Ok(())
    }

    /// Idempotent.
    pub fn clear(&self, id: i64) -> Result<()> {
        let path = self.path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove '{}'", path.display())),
        }
    }

    /// Ids with a token file on disk, sorted.
    pub fn stored_ids(&self) -> Vec<i64> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut ids: Vec<i64> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name();
                name.to_str()?.strip_suffix(".session")?.parse().ok()
            })
            .collect();
        ids.sort_unstable();
        ids
    }
}
