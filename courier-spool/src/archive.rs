use std::path::{Path, PathBuf};

use courier_common::{Message, MessageId, internal};
use serde::Deserialize;
use tokio::fs;

use crate::backends::file::validate_path;

/// Plain-text copies of dead-lettered messages.
///
/// Each message is written as `{ulid}.eml` so operators can inspect it with
/// ordinary mail tooling. Without a directory every operation is a no-op.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmlArchive {
    #[serde(default)]
    path: Option<PathBuf>,
}

impl EmlArchive {
    /// An archive rooted at `path`, created on first use.
    ///
    /// # Errors
    /// Fails if the path is relative, contains `..`, or is a system directory.
    pub fn new(path: impl Into<PathBuf>) -> crate::Result<Self> {
        let path = path.into();
        validate_path(&path)?;
        Ok(Self { path: Some(path) })
    }

    #[must_use]
    pub const fn disabled() -> Self {
        Self { path: None }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write `message` as `{id}.eml`, returning where it landed.
    ///
    /// # Errors
    /// Any I/O failure creating the directory or writing the file.
    pub async fn store(&self, message: &Message) -> crate::Result<Option<PathBuf>> {
        let Some(dir) = &self.path else {
            return Ok(None);
        };

        validate_path(dir)?;
        fs::create_dir_all(dir).await?;

        let target = dir.join(format!("{}.eml", message.id()));
        let temp = dir.join(format!(".tmp_{}.eml", message.id()));
        fs::write(&temp, message.render()).await?;
        fs::rename(&temp, &target).await?;

        internal!(level = DEBUG, "Archived {} to {}", message.id(), target.display());
        Ok(Some(target))
    }

    /// Remove the archived copy of `id`, if there is one.
    ///
    /// # Errors
    /// Any I/O failure other than the file already being absent.
    pub async fn remove(&self, id: &MessageId) -> crate::Result<()> {
        let Some(dir) = &self.path else {
            return Ok(());
        };

        match fs::remove_file(dir.join(format!("{id}.eml"))).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
