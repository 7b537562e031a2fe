use std::{
    fmt,
    marker::PhantomData,
    path::{Component, Path, PathBuf},
};

use async_trait::async_trait;
use courier_common::{MessageId, internal};
use serde::{Serialize, de::DeserializeOwned};
use tokio::fs;

use crate::{SpoolError, r#trait::BackingStore};

const TEMP_PREFIX: &str = ".tmp_";
const DELETED_SUFFIX: &str = ".deleted";

/// File-based backing store
///
/// Each record is a bincode file named `{ulid}.bin` inside the store's
/// directory.
///
/// # Atomicity
/// Writes go to `.tmp_{ulid}.bin` and are then renamed into place, so a crash
/// never leaves a partially written record behind. Deletes rename to
/// `{ulid}.bin.deleted` before removing. Leftover temporary and deleted files
/// are ignored by `list` and removed by [`FileBackingStore::init`].
pub struct FileBackingStore<T> {
    path: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for FileBackingStore<T> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            _record: PhantomData,
        }
    }
}

impl<T> fmt::Debug for FileBackingStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBackingStore")
            .field("path", &self.path)
            .finish()
    }
}

/// Reject paths that contain `..`, are relative, or point into system
/// directories.
pub fn validate_path(path: &Path) -> crate::Result<()> {
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(SpoolError::Validation(format!(
            "Spool path cannot contain '..' components: {}",
            path.display()
        )));
    }

    if !path.is_absolute() {
        return Err(SpoolError::Validation(format!(
            "Spool path must be absolute: {}",
            path.display()
        )));
    }

    let sensitive_prefixes = [
        "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
    ];

    if let Some(prefix) = sensitive_prefixes.iter().find(|p| path.starts_with(p)) {
        return Err(SpoolError::Validation(format!(
            "Spool path cannot be in system directory {prefix}: {}",
            path.display()
        )));
    }

    Ok(())
}

impl<T> FileBackingStore<T> {
    /// Validate `path` and create the directory, clearing leftovers from an
    /// earlier crash.
    ///
    /// # Errors
    /// Fails if the path is rejected, cannot be created, or is not a directory.
    pub fn open(path: impl Into<PathBuf>) -> crate::Result<Self> {
        let store = Self {
            path: path.into(),
            _record: PhantomData,
        };
        validate_path(&store.path)?;
        store.init()?;
        Ok(store)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init(&self) -> crate::Result<()> {
        if !self.path.try_exists()? {
            internal!("{} does not exist, creating...", self.path.display());
            std::fs::create_dir_all(&self.path)?;
        } else if !self.path.is_dir() {
            return Err(SpoolError::Validation(format!(
                "Expected {} to be a directory",
                self.path.display()
            )));
        }

        let mut cleaned = 0;
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if name.starts_with(TEMP_PREFIX) || name.ends_with(DELETED_SUFFIX) {
                std::fs::remove_file(entry.path())?;
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} orphaned files from {}",
                self.path.display()
            );
        }

        Ok(())
    }

    fn record_path(&self, id: &MessageId) -> PathBuf {
        self.path.join(format!("{id}.bin"))
    }

    async fn write_atomic(&self, id: &MessageId, bytes: &[u8]) -> crate::Result<()> {
        let temp = self.path.join(format!("{TEMP_PREFIX}{id}.bin"));
        fs::write(&temp, bytes).await?;
        fs::rename(&temp, self.record_path(id)).await?;
        Ok(())
    }
}

fn encode<T: Serialize>(record: &T) -> crate::Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(
        record,
        bincode::config::standard(),
    )?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> crate::Result<T> {
    let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(record)
}

#[async_trait]
impl<T> BackingStore<T> for FileBackingStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    #[tracing::instrument(level = "debug", skip(self, record))]
    async fn write(&self, id: &MessageId, record: &T) -> crate::Result<()> {
        if fs::try_exists(self.record_path(id)).await? {
            return Err(SpoolError::AlreadyExists(*id));
        }

        self.write_atomic(id, &encode(record)?).await?;
        internal!(level = DEBUG, "Spooled {id} to {}", self.path.display());
        Ok(())
    }

    /// IDs of every `{ulid}.bin` file, oldest first.
    ///
    /// Temporary files and names that are not valid ULIDs are skipped.
    async fn list(&self) -> crate::Result<Vec<MessageId>> {
        let mut entries = fs::read_dir(&self.path).await?;
        let mut ids = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if name.ends_with(".bin")
                && !name.starts_with(TEMP_PREFIX)
                && let Some(id) = MessageId::from_filename(&name)
            {
                ids.push(id);
            }
        }

        ids.sort();
        Ok(ids)
    }

    async fn read(&self, id: &MessageId) -> crate::Result<T> {
        match fs::read(self.record_path(id)).await {
            Ok(bytes) => decode(&bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(SpoolError::NotFound(*id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update(&self, id: &MessageId, record: &T) -> crate::Result<()> {
        if !fs::try_exists(self.record_path(id)).await? {
            return Err(SpoolError::NotFound(*id));
        }

        self.write_atomic(id, &encode(record)?).await
    }

    async fn delete(&self, id: &MessageId) -> crate::Result<()> {
        let path = self.record_path(id);
        let deleted = self.path.join(format!("{id}.bin{DELETED_SUFFIX}"));

        match fs::rename(&path, &deleted).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SpoolError::NotFound(*id));
            }
            Err(err) => return Err(err.into()),
        }

        fs::remove_file(&deleted).await?;
        internal!(level = DEBUG, "Deleted {id} from {}", self.path.display());
        Ok(())
    }
}
