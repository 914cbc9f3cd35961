//! Per-key read/write locking.
//!
//! Every disk-backed location serializes access per key through a `Locker`.
//! `GlobalThreadLocker` protects a single process, `RedisLocker` a whole
//! cluster, `DummyLocker` nothing (single-writer setups only).

use std::time::Duration;

use parking_lot::lock_api::{RawMutex as _, RawMutexTimed as _};
use parking_lot::Mutex;
use redis::Script;

use crate::error::StorageError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LockMode {
    Read,
    Write,
}

/// A per-key RW lock service.
///
/// Multiple readers may hold the same key concurrently; a writer excludes
/// all other guards on that key. Acquisition blocks and fails with
/// `PotentialDeadLock` when its deadline is exceeded.
pub trait Locker: Send + Sync {
    fn acquire(&self, key: &[u8], mode: LockMode) -> Result<(), StorageError>;
    fn release(&self, key: &[u8], mode: LockMode) -> Result<(), StorageError>;
}

impl dyn Locker {
    /// Acquires a scoped read lock.
    pub fn lock_read(&self, key: &[u8]) -> Result<LockGuard<'_>, StorageError> {
        self.lock(key, LockMode::Read)
    }

    /// Acquires a scoped write lock.
    pub fn lock_write(&self, key: &[u8]) -> Result<LockGuard<'_>, StorageError> {
        self.lock(key, LockMode::Write)
    }

    fn lock(&self, key: &[u8], mode: LockMode) -> Result<LockGuard<'_>, StorageError> {
        self.acquire(key, mode)?;
        Ok(LockGuard {
            locker: self,
            key: key.to_vec(),
            mode,
            armed: true,
        })
    }
}

/// Releases the lock on every exit path. The drop path cannot surface a
/// wrong-state error, so it logs instead; call `release` explicitly where
/// the error matters.
pub struct LockGuard<'a> {
    locker: &'a dyn Locker,
    key: Vec<u8>,
    mode: LockMode,
    armed: bool,
}

impl LockGuard<'_> {
    pub fn release(mut self) -> Result<(), StorageError> {
        self.armed = false;
        self.locker.release(&self.key, self.mode)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.locker.release(&self.key, self.mode) {
                log::error!("failed to release lock for {}: {}", hex::encode(&self.key), err);
            }
        }
    }
}

/// No locking at all.
pub struct DummyLocker;

impl Locker for DummyLocker {
    fn acquire(&self, _key: &[u8], _mode: LockMode) -> Result<(), StorageError> {
        Ok(())
    }

    fn release(&self, _key: &[u8], _mode: LockMode) -> Result<(), StorageError> {
        Ok(())
    }
}

/// A single process-wide mutex. Coarse on purpose: disk operations are
/// short, and one lock keeps the reader/writer interaction trivially
/// correct. Readers are serialized too.
pub struct GlobalThreadLocker {
    lock: parking_lot::RawMutex,
    timeout: Option<Duration>,
}

impl GlobalThreadLocker {
    pub fn new(timeout: Option<Duration>) -> Self {
        GlobalThreadLocker {
            lock: parking_lot::RawMutex::INIT,
            timeout,
        }
    }
}

impl Locker for GlobalThreadLocker {
    fn acquire(&self, key: &[u8], _mode: LockMode) -> Result<(), StorageError> {
        match self.timeout {
            None => self.lock.lock(),
            Some(timeout) => {
                if !self.lock.try_lock_for(timeout) {
                    log::error!("potential deadlock detected for {}", hex::encode(key));
                    return Err(StorageError::PotentialDeadLock(format!(
                        "it seems like you've hit a deadlock for key {}",
                        hex::encode(key)
                    )));
                }
            }
        }
        Ok(())
    }

    fn release(&self, _key: &[u8], _mode: LockMode) -> Result<(), StorageError> {
        // balanced by construction: only a LockGuard calls release
        unsafe { self.lock.unlock() };
        Ok(())
    }
}

/// Distributed locking over Redis.
///
/// One integer-valued key per lock, namespaced by `prefix:`. `-1` marks a
/// writer, a positive value counts readers. The reader transitions run as
/// server-side Lua scripts (re-loaded transparently on a script-cache
/// miss); writer acquisition is a plain `SET NX EX`. Every mutation
/// refreshes the TTL, which bounds how long a holder may keep the lock:
/// outliving it shows up as a wrong-state error on release.
pub struct RedisLocker {
    connection: Mutex<redis::Connection>,
    prefix: Vec<u8>,
    expire: u64,
    read_acquire: Script,
    read_release: Script,
    write_release: Script,
}

impl RedisLocker {
    pub fn new(client: redis::Client, prefix: &[u8], expire: u64) -> Result<Self, StorageError> {
        let connection = client.get_connection()?;
        let mut namespaced = prefix.to_vec();
        namespaced.push(b':');

        Ok(RedisLocker {
            connection: Mutex::new(connection),
            prefix: namespaced,
            expire,
            read_acquire: Script::new(&format!(
                r#"
                local lock = redis.call('get', KEYS[1])
                if lock == '-1' then
                    return 0
                elseif lock == false then
                    redis.call('set', KEYS[1], 1, 'EX', {expire})
                    return 1
                else
                    redis.call('set', KEYS[1], lock + 1, 'EX', {expire})
                    return 1
                end"#,
                expire = expire
            )),
            read_release: Script::new(&format!(
                r#"
                local lock = redis.call('get', KEYS[1])
                if lock == '1' then
                    redis.call('del', KEYS[1])
                elseif lock == false or tonumber(lock) < 1 then
                    return redis.error_reply('wrong lock state')
                else
                    redis.call('set', KEYS[1], lock - 1, 'EX', {expire})
                end"#,
                expire = expire
            )),
            write_release: Script::new(
                r#"
                if redis.call('get', KEYS[1]) == '-1' then
                    redis.call('del', KEYS[1])
                else
                    return redis.error_reply('wrong lock state')
                end"#,
            ),
        })
    }

    pub fn from_url(url: &str, prefix: &[u8], expire: u64) -> Result<Self, StorageError> {
        Self::new(redis::Client::open(url)?, prefix, expire)
    }

    fn lock_key(&self, key: &[u8]) -> Vec<u8> {
        let mut namespaced = self.prefix.clone();
        namespaced.extend_from_slice(key);
        namespaced
    }

    fn start_writing(&self, lock_key: &[u8]) -> Result<bool, StorageError> {
        let mut connection = self.connection.lock();
        let set: Option<String> = redis::cmd("SET")
            .arg(lock_key)
            .arg(-1)
            .arg("NX")
            .arg("EX")
            .arg(self.expire)
            .query(&mut *connection)?;
        Ok(set.is_some())
    }

    fn start_reading(&self, lock_key: &[u8]) -> Result<bool, StorageError> {
        let mut connection = self.connection.lock();
        let acquired: i64 = self.read_acquire.key(lock_key).invoke(&mut *connection)?;
        Ok(acquired != 0)
    }

    /// Polls until `attempt` succeeds, bounded by `expire / poll interval`
    /// iterations.
    fn wait_for_true(
        &self,
        key: &[u8],
        mut attempt: impl FnMut(&[u8]) -> Result<bool, StorageError>,
    ) -> Result<(), StorageError> {
        let lock_key = self.lock_key(key);
        let max_iterations =
            ((self.expire * 1000) / POLL_INTERVAL.as_millis() as u64).max(1);

        let mut iterations = 0;
        while !attempt(&lock_key)? {
            if iterations >= max_iterations {
                log::error!("potential deadlock detected for {}", hex::encode(key));
                return Err(StorageError::PotentialDeadLock(format!(
                    "it seems like you've hit a deadlock for key {}",
                    hex::encode(key)
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
            iterations += 1;
        }

        log::debug!("waited {} iterations for {}", iterations, hex::encode(key));
        Ok(())
    }

    fn run_release(&self, script: &Script, lock_key: &[u8]) -> Result<(), StorageError> {
        let mut connection = self.connection.lock();
        script
            .key(lock_key)
            .invoke::<()>(&mut *connection)
            .map_err(|err| {
                StorageError::LockState(format!(
                    "releasing {} failed (lock expired?): {}",
                    hex::encode(lock_key),
                    err
                ))
            })
    }
}

impl Locker for RedisLocker {
    fn acquire(&self, key: &[u8], mode: LockMode) -> Result<(), StorageError> {
        match mode {
            LockMode::Read => self.wait_for_true(key, |lock_key| self.start_reading(lock_key)),
            LockMode::Write => self.wait_for_true(key, |lock_key| self.start_writing(lock_key)),
        }
    }

    fn release(&self, key: &[u8], mode: LockMode) -> Result<(), StorageError> {
        let lock_key = self.lock_key(key);
        match mode {
            LockMode::Read => self.run_release(&self.read_release, &lock_key),
            LockMode::Write => self.run_release(&self.write_release, &lock_key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn guard_releases_on_drop() {
        let locker: Arc<dyn Locker> = Arc::new(GlobalThreadLocker::new(None));
        {
            let _guard = (&*locker).lock_write(b"key").unwrap();
        }
        // a second acquisition succeeds only if the first was released
        let guard = (&*locker).lock_read(b"key").unwrap();
        guard.release().unwrap();
    }

    #[test]
    fn thread_locker_times_out() {
        let locker = GlobalThreadLocker::new(Some(Duration::from_millis(50)));
        let locker: &dyn Locker = &locker;
        let _held = locker.lock_write(b"a").unwrap();
        match locker.lock_write(b"b") {
            Err(StorageError::PotentialDeadLock(_)) => {}
            other => panic!("expected PotentialDeadLock, got {:?}", other.map(|_| ())),
        };
    }

    #[test]
    fn thread_locker_excludes_across_threads() {
        let locker: Arc<dyn Locker> = Arc::new(GlobalThreadLocker::new(None));
        let counter = Arc::new(Mutex::new(0u32));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locker = Arc::clone(&locker);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let guard = (&*locker).lock_write(b"shared").unwrap();
                        *counter.lock() += 1;
                        guard.release().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*counter.lock(), 800);
    }
}
