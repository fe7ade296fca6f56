//! Reusable curl handles, keyed by `zone/bucket`.
//!
//! Reuse keeps the TCP/TLS session alive inside the easy handle. A handle is
//! retired after `MAX_CLIENT_REUSE` borrows or when its last request errored
//! (taint), since libcurl connection state after a failure is suspect.

use curl::easy::Easy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const MAX_CLIENT_REUSE: u32 = 4;

struct PoolEntry {
    easy: Easy,
    uses: u32,
}

/// Per-context pool of idle clients. Acquisition pops LIFO so warm handles
/// are preferred; fresh handles are created on demand.
#[derive(Default)]
pub struct ConnectionPool {
    idle: Mutex<HashMap<String, Vec<PoolEntry>>>,
}

impl ConnectionPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Borrows a client for the given zone/bucket. The handle returns to the
    /// pool on drop unless tainted or worn out.
    pub fn acquire(self: &Arc<Self>, zone: &str, bucket: &str) -> PooledClient {
        let key = format!("{}/{}", zone, bucket);
        let mut idle = self.idle.lock().unwrap();
        while let Some(mut entry) = idle.get_mut(&key).and_then(Vec::pop) {
            entry.uses += 1;
            if entry.uses >= MAX_CLIENT_REUSE {
                // Worn out; destroy and keep looking.
                continue;
            }
            return PooledClient {
                pool: Arc::clone(self),
                key,
                easy: Some(entry.easy),
                uses: entry.uses,
                tainted: false,
            };
        }
        drop(idle);
        PooledClient {
            pool: Arc::clone(self),
            key,
            easy: Some(Easy::new()),
            uses: 1,
            tainted: false,
        }
    }

    fn release(&self, key: String, easy: Easy, uses: u32) {
        let mut idle = self.idle.lock().unwrap();
        idle.entry(key).or_default().push(PoolEntry { easy, uses });
    }

    #[cfg(test)]
    fn idle_count(&self, zone: &str, bucket: &str) -> usize {
        let idle = self.idle.lock().unwrap();
        idle.get(&format!("{}/{}", zone, bucket)).map_or(0, Vec::len)
    }
}

/// Scoped borrow of a pooled client.
pub struct PooledClient {
    pool: Arc<ConnectionPool>,
    key: String,
    easy: Option<Easy>,
    uses: u32,
    tainted: bool,
}

impl PooledClient {
    pub fn easy(&mut self) -> &mut Easy {
        self.easy.as_mut().expect("client already released")
    }

    /// Removes this client from reuse; call after any request error.
    pub fn taint(&mut self) {
        self.tainted = true;
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if let Some(easy) = self.easy.take() {
            if !self.tainted {
                self.pool.release(std::mem::take(&mut self.key), easy, self.uses);
            }
        }
    }
}
