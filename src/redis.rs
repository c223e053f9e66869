use crate::error::{Error, Result};
use crate::throttling::store::CounterStore;
use redis::{Client, Connection, RedisResult};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_IDLE_CONNECTIONS: usize = 8;

/// Redis-backed counter store, shared between processes.
///
/// Histories are stored as JSON arrays under `throttle:<key>` with the policy window as TTL.
/// Connecting and every command are bounded by the store timeout, so an unreachable server
/// turns into a store error instead of a stalled request.
pub struct RedisStore {
    client: Client,
    idle: Mutex<Vec<Connection>>,
    timeout: Duration,
}

impl RedisStore {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| Error::Store(format!("Failed to create Redis client: {}", e)))?;

        Ok(Self {
            client,
            idle: Mutex::new(Vec::new()),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn ping(&self) -> Result<String> {
        self.with_connection(|conn| redis::cmd("PING").query(conn))
            .map_err(|e| Error::Store(format!("Ping failed: {}", e)))
    }

    fn redis_key(key: &str) -> String {
        format!("throttle:{}", key)
    }

    fn connect(&self) -> RedisResult<Connection> {
        let conn = self.client.get_connection_with_timeout(self.timeout)?;
        conn.set_read_timeout(Some(self.timeout))?;
        conn.set_write_timeout(Some(self.timeout))?;
        Ok(conn)
    }

    /// Run `f` on an idle connection, connecting when none is left. The pool lock is only
    /// held to take or return a connection. A failed command drops its connection.
    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> RedisResult<T>,
    ) -> RedisResult<T> {
        let idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        let mut conn = match idle {
            Some(conn) => conn,
            None => self.connect()?,
        };

        let result = f(&mut conn);
        if result.is_ok() {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            if idle.len() < MAX_IDLE_CONNECTIONS {
                idle.push(conn);
            }
        }
        result
    }
}

impl CounterStore for RedisStore {
    fn get_history(&self, key: &str) -> Result<Vec<f64>> {
        let raw: Option<String> = self
            .with_connection(|conn| redis::cmd("GET").arg(Self::redis_key(key)).query(conn))
            .map_err(|e| Error::Store(format!("GET failed: {}", e)))?;

        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::Store(format!("corrupt history for {}: {}", key, e))),
            None => Ok(Vec::new()),
        }
    }

    fn set_history(&self, key: &str, history: &[f64], ttl: Duration) -> Result<()> {
        let value = serde_json::to_string(history)
            .map_err(|e| Error::Store(format!("Failed to encode history: {}", e)))?;
        let expiry_seconds = ttl.as_secs().max(1);

        self.with_connection(|conn| {
            redis::cmd("SETEX")
                .arg(Self::redis_key(key))
                .arg(expiry_seconds)
                .arg(&value)
                .query::<()>(conn)
        })
        .map_err(|e| Error::Store(format!("SETEX failed: {}", e)))
    }

    fn clear(&self, key: &str) -> Result<()> {
        self.with_connection(|conn| redis::cmd("DEL").arg(Self::redis_key(key)).query::<i32>(conn))
            .map(|_| ())
            .map_err(|e| Error::Store(format!("DEL failed: {}", e)))
    }
}
