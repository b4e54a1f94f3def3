//! On-disk archive of matched events ("save matches").
//!
//! Each dispatched match is written verbatim to `<dir>/<signature>.json`.

use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("failed to write match archive: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode match: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct MatchArchive {
    dir: PathBuf,
}

impl MatchArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the raw event. Returns the path written.
    pub async fn save(&self, signature: &str, raw: &Value) -> Result<PathBuf, ArchiveError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!("{}.json", file_stem(signature)));
        let body = serde_json::to_vec_pretty(raw)?;
        tokio::fs::write(&path, body).await?;
        Ok(path)
    }
}

/// Signatures are base58 in practice; anything else is replaced so the name stays inside `dir`.
fn file_stem(signature: &str) -> String {
    let stem: String = signature
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(128)
        .collect();
    if stem.is_empty() {
        "unnamed".to_string()
    } else {
        stem
    }
}
