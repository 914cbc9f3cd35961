use thiserror::Error;

/// Errors produced by the storage layer.
///
/// `Corruption` is special: it is the internal quarantine signal. A read
/// scope that detects invalid content returns it, the owning location
/// deletes the entry, and the facades (`HashKeyStorage`, `CacheStorage`)
/// turn it into a plain miss. It never escapes a facade read.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("collision: {0}")]
    Collision(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("storage corruption: {0}")]
    Corruption(String),

    #[error("potential deadlock: {0}")]
    PotentialDeadLock(String),

    #[error("wrong lock state: {0}")]
    LockState(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

impl StorageError {
    /// Whether this error is the quarantine signal.
    pub fn is_corruption(&self) -> bool {
        matches!(self, StorageError::Corruption(_))
    }
}

/// Errors produced by serializers.
#[derive(Error, Debug)]
pub enum SerializerError {
    /// This serializer does not handle the given value or file layout.
    /// `ChainSerializer` passes over it and tries the next child.
    #[error("unsupported by this serializer: {0}")]
    Unsupported(String),

    /// The payload was readable but its content is invalid.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
