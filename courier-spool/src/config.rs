use std::{path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{BackingStore, FileBackingStore, MemoryBackingStore};

fn default_path() -> PathBuf {
    PathBuf::from("/var/spool/courier")
}

/// Where queue state is persisted
///
/// # Examples
///
/// ```ron
/// spool: File(path: "/var/spool/courier"),
/// ```
///
/// ```ron
/// spool: Memory(capacity: Some(1000)),
/// ```
///
/// A `Memory` spool does not survive restarts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum SpoolConfig {
    File {
        #[serde(default = "default_path")]
        path: PathBuf,
    },
    Memory {
        #[serde(default)]
        capacity: Option<usize>,
    },
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self::File {
            path: default_path(),
        }
    }
}

impl SpoolConfig {
    /// Root directory for file spools
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::File { path } => Some(path),
            Self::Memory { .. } => None,
        }
    }

    /// Whether records written here survive a process restart
    #[must_use]
    pub const fn is_durable(&self) -> bool {
        matches!(self, Self::File { .. })
    }

    /// Open the named store, e.g. `queue` or `dead`.
    ///
    /// File stores live in a subdirectory of the configured path.
    ///
    /// # Errors
    /// Fails if the directory cannot be validated or created.
    pub fn open<T>(&self, name: &str) -> crate::Result<Arc<dyn BackingStore<T>>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        Ok(match self {
            Self::File { path } => Arc::new(FileBackingStore::<T>::open(path.join(name))?),
            Self::Memory { capacity } => Arc::new(
                capacity.map_or_else(MemoryBackingStore::new, MemoryBackingStore::with_capacity),
            ),
        })
    }
}
