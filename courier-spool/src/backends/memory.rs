use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use courier_common::MessageId;

use crate::{SpoolError, r#trait::BackingStore};

/// In-memory backing store
///
/// Records live in a `BTreeMap` behind an `RwLock`, so `list` is naturally
/// ordered by ULID. Nothing survives a restart; use it for tests or when
/// durability is not required.
///
/// An optional capacity rejects writes beyond the limit.
pub struct MemoryBackingStore<T> {
    records: Arc<RwLock<BTreeMap<MessageId, T>>>,
    capacity: Option<usize>,
}

impl<T> Clone for MemoryBackingStore<T> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
            capacity: self.capacity,
        }
    }
}

impl<T> fmt::Debug for MemoryBackingStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackingStore")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<T> Default for MemoryBackingStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MemoryBackingStore<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(BTreeMap::new())),
            capacity: None,
        }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(BTreeMap::new())),
            capacity: Some(capacity),
        }
    }

    /// Recovers the data if the lock is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

#[async_trait]
impl<T> BackingStore<T> for MemoryBackingStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn write(&self, id: &MessageId, record: &T) -> crate::Result<()> {
        let mut records = self.records.write()?;

        if records.contains_key(id) {
            return Err(SpoolError::AlreadyExists(*id));
        }

        if let Some(cap) = self.capacity
            && records.len() >= cap
        {
            return Err(SpoolError::Internal(format!(
                "Memory spool capacity exceeded: {}/{cap} records",
                records.len()
            )));
        }

        records.insert(*id, record.clone());
        Ok(())
    }

    async fn list(&self) -> crate::Result<Vec<MessageId>> {
        Ok(self.records.read()?.keys().copied().collect())
    }

    async fn read(&self, id: &MessageId) -> crate::Result<T> {
        self.records
            .read()?
            .get(id)
            .cloned()
            .ok_or(SpoolError::NotFound(*id))
    }

    async fn update(&self, id: &MessageId, record: &T) -> crate::Result<()> {
        let mut records = self.records.write()?;
        match records.get_mut(id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(SpoolError::NotFound(*id)),
        }
    }

    async fn delete(&self, id: &MessageId) -> crate::Result<()> {
        self.records
            .write()?
            .remove(id)
            .map(|_| ())
            .ok_or(SpoolError::NotFound(*id))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[tokio::test]
    async fn test_memory_store_basic_operations() {
        let store = MemoryBackingStore::new();
        let id = MessageId::generate();

        store.write(&id, &"first".to_string()).await.unwrap();
        assert!(matches!(
            store.write(&id, &"again".to_string()).await,
            Err(SpoolError::AlreadyExists(_))
        ));

        assert_eq!(store.list().await.unwrap(), vec![id]);
        assert_eq!(store.read(&id).await.unwrap(), "first");

        store.update(&id, &"second".to_string()).await.unwrap();
        assert_eq!(store.read(&id).await.unwrap(), "second");

        store.delete(&id).await.unwrap();
        assert!(store.is_empty());
        assert!(matches!(store.read(&id).await, Err(SpoolError::NotFound(_))));
        assert!(matches!(
            store.update(&id, &"x".to_string()).await,
            Err(SpoolError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_upsert() {
        let store = MemoryBackingStore::new();
        let id = MessageId::generate();

        store.upsert(&id, &1u32).await.unwrap();
        store.upsert(&id, &2u32).await.unwrap();
        assert_eq!(store.read(&id).await.unwrap(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_capacity_limit() {
        let store = MemoryBackingStore::with_capacity(2);
        store.write(&MessageId::generate(), &1u8).await.unwrap();
        store.write(&MessageId::generate(), &2u8).await.unwrap();

        let result = store.write(&MessageId::generate(), &3u8).await;
        assert!(result.unwrap_err().to_string().contains("capacity exceeded"));

        let ids = store.list().await.unwrap();
        store.delete(&ids[0]).await.unwrap();
        assert!(store.write(&MessageId::generate(), &3u8).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_writes() {
        let store = MemoryBackingStore::new();

        let handles: Vec<_> = (0..100u32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let id = MessageId::generate();
                    store.write(&id, &i).await.map(|()| id)
                })
            })
            .collect();

        let mut generated = HashSet::new();
        for handle in handles {
            generated.insert(handle.await.unwrap().unwrap());
        }

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 100);
        assert!(listed.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(listed.into_iter().collect::<HashSet<_>>(), generated);
    }
}
