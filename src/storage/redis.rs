use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::StorageError;
use crate::tools::Labels;

use super::digest::Key;
use super::location::{Entry, Location, ReadBody, WriteBody};
use super::value::{Value, ValueHandle};

/// A hash-agnostic location backed by Redis: one value per key under
/// `<prefix><hex key>`, labels as a JSON array under
/// `labels<prefix><hex key>`.
///
/// Intended for small, hot payloads (e.g. cache indices); rewriting a key
/// with different content is a collision, like everywhere else.
pub struct RedisLocation {
    connection: Mutex<redis::Connection>,
    prefix: String,
}

impl RedisLocation {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Result<Self, StorageError> {
        Ok(RedisLocation {
            connection: Mutex::new(client.get_connection()?),
            prefix: prefix.into(),
        })
    }

    pub fn from_url(url: &str, prefix: impl Into<String>) -> Result<Self, StorageError> {
        Self::new(redis::Client::open(url)?, prefix)
    }

    fn content_key(&self, key: &Key) -> String {
        format!("{}{}", self.prefix, key.hex())
    }

    fn labels_key(&self, key: &Key) -> String {
        format!("labels{}{}", self.prefix, key.hex())
    }

    fn get_labels(
        &self,
        connection: &mut redis::Connection,
        key: &Key,
    ) -> Result<Option<Labels>, StorageError> {
        let raw: Option<Vec<u8>> = redis::cmd("GET").arg(self.labels_key(key)).query(connection)?;
        match raw {
            None => Ok(None),
            Some(raw) => {
                let labels: Vec<String> = serde_json::from_slice(&raw).map_err(|err| {
                    StorageError::Corruption(format!("invalid labels for {}: {}", key, err))
                })?;
                Ok(Some(labels.into_iter().collect()))
            }
        }
    }

    fn merge_labels(
        &self,
        connection: &mut redis::Connection,
        key: &Key,
        labels: Option<&Labels>,
    ) -> Result<(), StorageError> {
        let labels = match labels {
            Some(labels) if !labels.is_empty() => labels,
            _ => return Ok(()),
        };
        let mut merged = self.get_labels(connection, key)?.unwrap_or_default();
        merged.extend(labels.iter().cloned());
        let entries: Vec<&String> = merged.iter().collect();
        redis::cmd("SET")
            .arg(self.labels_key(key))
            .arg(serde_json::to_vec(&entries).expect("label sets are serializable"))
            .query::<()>(connection)?;
        Ok(())
    }
}

impl Location for RedisLocation {
    fn read(
        &self,
        key: &Key,
        want_labels: bool,
        body: ReadBody<'_>,
    ) -> Result<bool, StorageError> {
        let (content, labels) = {
            let mut connection = self.connection.lock();
            let content: Option<Vec<u8>> =
                match redis::cmd("GET").arg(self.content_key(key)).query(&mut *connection) {
                    Ok(content) => content,
                    Err(err) => {
                        // a transport failure is a miss at this boundary
                        log::warn!("redis read for {} failed: {}", key, err);
                        return Ok(false);
                    }
                };
            let content = match content {
                None => return Ok(false),
                Some(content) => content,
            };
            let labels = if want_labels { self.get_labels(&mut *connection, key)? } else { None };
            (content, labels)
        };

        let mut handle = ValueHandle::Blob(Bytes::from(content));
        let outcome = body(&mut handle, labels.as_ref());
        match outcome {
            Ok(()) => Ok(true),
            Err(err) if err.is_corruption() => {
                log::warn!("removing corrupted entry {}", key);
                self.delete(key)?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn write(
        &self,
        key: &Key,
        value: &mut Value,
        labels: Option<&Labels>,
        body: WriteBody<'_>,
    ) -> Result<bool, StorageError> {
        let mut incoming = Vec::new();
        std::io::Read::read_to_end(&mut value.reader()?, &mut incoming)?;

        {
            let mut connection = self.connection.lock();
            let stored: Option<Vec<u8>> =
                redis::cmd("GET").arg(self.content_key(key)).query(&mut *connection)?;
            match stored {
                None => {
                    redis::cmd("SET")
                        .arg(self.content_key(key))
                        .arg(&incoming)
                        .query::<()>(&mut *connection)?;
                }
                Some(stored) => {
                    if stored != incoming {
                        return Err(StorageError::Collision(format!(
                            "written value and the new one don't match: {}",
                            key
                        )));
                    }
                }
            }
            self.merge_labels(&mut *connection, key, labels)?;
        }

        let mut handle = ValueHandle::Blob(Bytes::from(incoming));
        body(&mut handle)?;
        Ok(true)
    }

    fn delete(&self, key: &Key) -> Result<bool, StorageError> {
        let mut connection = self.connection.lock();
        let removed: i64 = redis::cmd("DEL")
            .arg(self.content_key(key))
            .arg(self.labels_key(key))
            .query(&mut *connection)?;
        Ok(removed > 0)
    }

    fn contents(&self) -> Box<dyn Iterator<Item = Result<Entry, StorageError>> + '_> {
        let keys: Result<Vec<String>, StorageError> = (|| {
            let mut connection = self.connection.lock();
            let found: Vec<String> = redis::cmd("KEYS")
                .arg(format!("{}*", self.prefix))
                .query(&mut *connection)?;
            Ok(found)
        })();

        let keys = match keys {
            Ok(keys) => keys,
            Err(err) => return Box::new(std::iter::once(Err(err))),
        };

        let prefix_len = self.prefix.len();
        Box::new(
            keys.into_iter()
                // the label entries share the namespace
                .filter(|name| !name.starts_with("labels"))
                .filter_map(move |name| Key::from_hex(&name[prefix_len..]).ok())
                .map(move |key| {
                    let mut connection = self.connection.lock();
                    let labels = self.get_labels(&mut *connection, &key)?;
                    Ok(Entry { key, last_used: None, labels })
                }),
        )
    }
}
