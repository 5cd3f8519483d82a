//! 实例连接信息缓存
//!
//! 每个实例一条记录，过期时间取自客户端证书的 `notAfter`。证书到期前
//! `refresh_buffer` 内视为过期；拨号失败时记录被立即淘汰，下一次拨号重新
//! 向 Admin API 申请证书。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

struct Entry<T> {
    value: Arc<T>,
    expires_at: SystemTime,
}

pub struct InstanceCache<T> {
    entries: Mutex<HashMap<String, Entry<T>>>,
    refresh_buffer: Duration,
}

impl<T> InstanceCache<T> {
    pub fn new(refresh_buffer: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            refresh_buffer,
        }
    }

    /// Returns the entry for `key` unless it is missing or due for refresh.
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        let deadline = SystemTime::now() + self.refresh_buffer;
        self.entries()
            .get(key)
            .filter(|entry| deadline < entry.expires_at)
            .map(|entry| Arc::clone(&entry.value))
    }

    pub fn insert(&self, key: String, value: Arc<T>, expires_at: SystemTime) {
        self.entries().insert(key, Entry { value, expires_at });
    }

    /// Drops the entry for `key`. Returns whether one was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries().remove(key).is_some()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
