//! Connection pool
//!
//! Process-wide registry of connections keyed by (host, port). At most one
//! live connection exists per key; closed or dead entries are replaced on
//! the next lookup, and a connection evicts itself when it closes. Direct
//! [`Connection::open`] construction bypasses the pool entirely.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::debug;

use crate::connection::{ConnectOptions, Connection};

type PoolKey = (String, u16);
type PoolMap = Mutex<HashMap<PoolKey, Connection>>;

/// Keyed registry of inverter connections
#[derive(Clone, Default)]
pub struct ConnectionPool {
    entries: Arc<PoolMap>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the connection for (host, port), creating it if the key is
    /// absent or its previous connection has closed.
    ///
    /// New connections take their link configuration from the environment
    /// and the given cache parameters. Must be called within a Tokio
    /// runtime.
    pub fn get(
        &self,
        host: &str,
        port: u16,
        cache_ttl: Duration,
        cache_max: usize,
    ) -> Connection {
        let key = (host.to_string(), port);
        let Ok(mut entries) = self.entries.lock() else {
            // Poisoned map: fall back to an unpooled connection.
            return Connection::open(host, port, ConnectOptions::from_env());
        };
        if let Some(existing) = entries.get(&key) {
            if existing.is_open() {
                return existing.clone();
            }
            debug!("pool entry dead, replacing: {}:{}", host, port);
        }

        let opts = ConnectOptions {
            cache_ttl,
            cache_max,
            ..ConnectOptions::from_env()
        };
        let conn = Connection::open(host, port, opts);
        conn.set_evict_hook(self.evict_hook(key.clone(), &conn));
        entries.insert(key, conn.clone());
        conn
    }

    /// Close every pooled connection and clear the registry.
    pub async fn shutdown(&self) {
        let drained: Vec<Connection> = match self.entries.lock() {
            Ok(mut entries) => entries.drain().map(|(_, c)| c).collect(),
            Err(_) => Vec::new(),
        };
        for conn in drained {
            conn.close().await;
        }
    }

    /// Number of registered entries (live or awaiting replacement)
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hook run by a connection when it closes: remove the entry, but only
    /// if it still refers to that same connection instance.
    fn evict_hook(&self, key: PoolKey, conn: &Connection) -> Box<dyn FnOnce() + Send> {
        let map: Weak<PoolMap> = Arc::downgrade(&self.entries);
        let conn = conn.clone();
        Box::new(move || {
            let Some(map) = map.upgrade() else {
                return;
            };
            let Ok(mut entries) = map.lock() else {
                return;
            };
            let matches_instance = entries
                .get(&key)
                .map(|current| current.same_instance(&conn))
                .unwrap_or(false);
            if matches_instance {
                debug!("pool evict: {}:{}", key.0, key.1);
                entries.remove(&key);
            }
        })
    }
}
