//! Aggregate occupied-bytes counter per storage root.

use parking_lot::Mutex;

use crate::error::StorageError;

pub trait SizeTracker: Send + Sync {
    fn get(&self) -> Result<u64, StorageError>;
    fn set(&self, size: u64) -> Result<(), StorageError>;
    fn inc(&self, size: u64) -> Result<(), StorageError>;
    fn dec(&self, size: u64) -> Result<(), StorageError>;
}

/// No tracking; reads as zero.
pub struct DummySize;

impl SizeTracker for DummySize {
    fn get(&self) -> Result<u64, StorageError> {
        Ok(0)
    }

    fn set(&self, _size: u64) -> Result<(), StorageError> {
        Ok(())
    }

    fn inc(&self, _size: u64) -> Result<(), StorageError> {
        Ok(())
    }

    fn dec(&self, _size: u64) -> Result<(), StorageError> {
        Ok(())
    }
}

/// A single Redis scalar under `<prefix>.S`.
pub struct RedisSize {
    connection: Mutex<redis::Connection>,
    volume_key: String,
}

impl RedisSize {
    pub fn new(client: redis::Client, prefix: &str) -> Result<Self, StorageError> {
        Ok(RedisSize {
            connection: Mutex::new(client.get_connection()?),
            volume_key: format!("{}.S", prefix),
        })
    }

    pub fn from_url(url: &str, prefix: &str) -> Result<Self, StorageError> {
        Self::new(redis::Client::open(url)?, prefix)
    }
}

impl SizeTracker for RedisSize {
    fn get(&self) -> Result<u64, StorageError> {
        let mut connection = self.connection.lock();
        let size: Option<i64> = redis::cmd("GET").arg(&self.volume_key).query(&mut *connection)?;
        Ok(size.unwrap_or(0).max(0) as u64)
    }

    fn set(&self, size: u64) -> Result<(), StorageError> {
        let mut connection = self.connection.lock();
        redis::cmd("SET").arg(&self.volume_key).arg(size).query::<()>(&mut *connection)?;
        Ok(())
    }

    fn inc(&self, size: u64) -> Result<(), StorageError> {
        let mut connection = self.connection.lock();
        redis::cmd("INCRBY").arg(&self.volume_key).arg(size).query::<i64>(&mut *connection)?;
        Ok(())
    }

    fn dec(&self, size: u64) -> Result<(), StorageError> {
        let mut connection = self.connection.lock();
        redis::cmd("DECRBY").arg(&self.volume_key).arg(size).query::<i64>(&mut *connection)?;
        Ok(())
    }
}
