use async_trait::async_trait;
use courier_common::MessageId;

/// Storage for records keyed by message ID.
///
/// Implementations must be safe to share between workers. A record is either
/// fully written or absent: readers never observe a partial write.
#[async_trait]
pub trait BackingStore<T>: Send + Sync + std::fmt::Debug
where
    T: Send + Sync,
{
    /// Store a new record
    ///
    /// # Errors
    /// [`SpoolError::AlreadyExists`](crate::SpoolError::AlreadyExists) if `id` is already present
    async fn write(&self, id: &MessageId, record: &T) -> crate::Result<()>;

    /// All stored IDs, oldest first
    async fn list(&self) -> crate::Result<Vec<MessageId>>;

    async fn read(&self, id: &MessageId) -> crate::Result<T>;

    /// Replace an existing record
    ///
    /// # Errors
    /// [`SpoolError::NotFound`](crate::SpoolError::NotFound) if `id` is not present
    async fn update(&self, id: &MessageId, record: &T) -> crate::Result<()>;

    async fn delete(&self, id: &MessageId) -> crate::Result<()>;

    /// Write `record`, creating or replacing as needed.
    async fn upsert(&self, id: &MessageId, record: &T) -> crate::Result<()> {
        match self.update(id, record).await {
            Err(crate::SpoolError::NotFound(_)) => self.write(id, record).await,
            other => other,
        }
    }
}
