//! Implements a pool of connections to Mariadb/Mysql
//!
//! Connections are pooled per credential key (host, port, user, password);
//! the selected database is deliberately not part of the key, a reused
//! connection is switched with COM_INIT_DB instead of reconnecting.
//!
//! Example:
//! --------
//! ```no_run
//! use mylink::connection::{ConnectionError, ConnectionOptions};
//! use mylink::pool::{Pool, PoolOptions};
//!
//! async fn test() -> Result<(), ConnectionError> {
//!     let pool = Pool::new(PoolOptions::new().max_connections(10));
//!
//!     let mut conn = pool
//!         .acquire(
//!             &ConnectionOptions::new()
//!                 .host("127.0.0.1")
//!                 .port(3307)
//!                 .user("user")
//!                 .password("pw")
//!                 .database("test"),
//!         )
//!         .await?;
//!
//!     let result = conn.query("SELECT `number` FROM `table` WHERE `id`=42").await?;
//!     if let Some(row) = result.rows().first() {
//!         println!("Found {:?}", row.get("number"));
//!     }
//!
//!     Ok(())
//! }
//! ```
use std::{
    collections::{HashMap, VecDeque},
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::sync::oneshot;
use tracing::debug;

use crate::connection::{
    Connection, ConnectionErrorContent, ConnectionOptions, ConnectionResult,
};

/// Options used for connection pool
pub struct PoolOptions {
    /// The maximum number of concurrent connections allowed per credential
    /// key
    max_connections: usize,
    /// Fail a queued acquire that has waited this long for a connection
    acquire_timeout: Duration,
    /// Destroy an idle pooled connection that has been unused this long
    idle_timeout: Duration,
    /// How often the reaper scans for expired waiters and idle connections
    reap_interval: Duration,
}

impl PoolOptions {
    /// New default pool options
    pub fn new() -> Self {
        PoolOptions::default()
    }

    /// The maximum number of concurrent connections allowed per credential
    /// key
    pub fn max_connections(self, connections: usize) -> Self {
        PoolOptions {
            max_connections: connections,
            ..self
        }
    }

    /// Fail a queued acquire that has waited this long for a connection
    pub fn acquire_timeout(self, duration: Duration) -> Self {
        PoolOptions {
            acquire_timeout: duration,
            ..self
        }
    }

    /// Destroy an idle pooled connection that has been unused this long
    pub fn idle_timeout(self, duration: Duration) -> Self {
        PoolOptions {
            idle_timeout: duration,
            ..self
        }
    }

    /// How often the reaper scans for expired waiters and idle connections
    pub fn reap_interval(self, duration: Duration) -> Self {
        PoolOptions {
            reap_interval: duration,
            ..self
        }
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 20,
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            reap_interval: Duration::from_secs(1),
        }
    }
}

/// The credential key connections are pooled under
///
/// The password is part of the key so that differing credentials for the
/// same user never share a connection. The database is not part of the key,
/// it is switched lazily on reuse.
#[derive(Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    /// The host of the connection
    host: String,
    /// The port of the connection
    port: u16,
    /// The user of the connection
    user: String,
    /// The password of the connection
    password: String,
}

impl PoolKey {
    /// Derive the pool key from connection options
    fn new(options: &ConnectionOptions<'_>) -> Self {
        PoolKey {
            host: options.host.to_string(),
            port: options.port,
            user: options.user.to_string(),
            password: options.password.to_string(),
        }
    }
}

/// What a waiter receives when capacity frees up
enum Handoff {
    /// A released connection, ready for reuse
    Connection(Connection),
    /// A freed capacity slot, the waiter opens its own connection
    Slot,
}

/// A queued acquire waiting for a connection or a capacity slot
struct Waiter {
    /// Channel the handoff or timeout error is delivered on
    tx: oneshot::Sender<ConnectionResult<Handoff>>,
    /// The waiter fails with PoolTimeout once this deadline passes
    deadline: Instant,
}

/// Pool state for one credential key
#[derive(Default)]
struct PoolEntry {
    /// Number of connections currently handed out
    used: usize,
    /// Released connections with their idle expiry time
    idle: Vec<(Connection, Instant)>,
    /// Queued acquires in arrival order, oldest first
    waiters: VecDeque<Waiter>,
}

impl PoolEntry {
    /// Return true if the entry holds nothing worth keeping
    fn is_empty(&self) -> bool {
        self.used == 0 && self.idle.is_empty() && self.waiters.is_empty()
    }
}

/// Part of pool state protected by a mutex
struct PoolProtected {
    /// Per credential key pool state
    entries: HashMap<PoolKey, PoolEntry>,
    /// True while the reaper task is scheduled
    reaper_running: bool,
}

/// Inner state of a pool
struct PoolInner {
    /// Part of state protected by a mutex
    protected: Mutex<PoolProtected>,
    /// The pool options given at creation time
    options: PoolOptions,
}

/// A pool of shared connections that can be acquired
///
/// This is an explicit object owned by the application; cloning is cheap and
/// every clone refers to the same pool.
#[derive(Clone)]
pub struct Pool(Arc<PoolInner>);

impl Pool {
    /// Construct a new empty pool
    pub fn new(options: PoolOptions) -> Self {
        Pool(Arc::new(PoolInner {
            protected: Mutex::new(PoolProtected {
                entries: HashMap::new(),
                reaper_running: false,
            }),
            options,
        }))
    }

    /// Acquire a connection for the given options
    ///
    /// An idle connection for the same credentials is reused (switching the
    /// database if needed); below the connection limit a new connection is
    /// opened; otherwise the acquire queues behind earlier ones and is served
    /// oldest first when a connection frees up, or fails with
    /// [ConnectionErrorContent::PoolTimeout] when its deadline passes.
    pub async fn acquire(
        &self,
        options: &ConnectionOptions<'_>,
    ) -> ConnectionResult<PooledConnection> {
        /// How this acquire will be satisfied
        enum Plan {
            /// Reuse an idle connection
            Reuse(Connection),
            /// Open a new connection inside a reserved capacity slot
            New,
            /// Wait for a handoff from a release or the reaper
            Wait(oneshot::Receiver<ConnectionResult<Handoff>>),
        }

        let key = PoolKey::new(options);
        let plan = {
            let mut inner = self.0.protected.lock().unwrap();
            let max_connections = self.0.options.max_connections;
            let acquire_timeout = self.0.options.acquire_timeout;
            let entry = inner.entries.entry(key.clone()).or_default();
            if let Some((connection, _)) = entry.idle.pop() {
                entry.used += 1;
                Plan::Reuse(connection)
            } else if entry.used + entry.idle.len() < max_connections {
                entry.used += 1;
                Plan::New
            } else {
                let (tx, rx) = oneshot::channel();
                entry.waiters.push_back(Waiter {
                    tx,
                    deadline: Instant::now() + acquire_timeout,
                });
                self.ensure_reaper(&mut inner);
                Plan::Wait(rx)
            }
        };

        match plan {
            Plan::Reuse(connection) => self.prepare(connection, options, key).await,
            Plan::New => self.open(options, key).await,
            Plan::Wait(rx) => match rx.await {
                Ok(Ok(Handoff::Connection(connection))) => {
                    self.prepare(connection, options, key).await
                }
                Ok(Ok(Handoff::Slot)) => self.open(options, key).await,
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ConnectionErrorContent::ProtocolError(
                    "pool was dropped while waiting for a connection".to_string(),
                )
                .into()),
            },
        }
    }

    /// Open a new connection inside an already reserved capacity slot
    async fn open(
        &self,
        options: &ConnectionOptions<'_>,
        key: PoolKey,
    ) -> ConnectionResult<PooledConnection> {
        match Connection::connect(options).await {
            Ok(connection) => Ok(PooledConnection {
                pool: self.clone(),
                key,
                connection: ManuallyDrop::new(connection),
            }),
            Err(e) => {
                self.forfeit(&key);
                Err(e)
            }
        }
    }

    /// Make a reused connection match the requested options
    async fn prepare(
        &self,
        mut connection: Connection,
        options: &ConnectionOptions<'_>,
        key: PoolKey,
    ) -> ConnectionResult<PooledConnection> {
        if !options.database.is_empty() && connection.database() != options.database {
            if let Err(e) = connection.init_db(&options.database).await {
                // A refused database leaves the connection itself intact;
                // release decides whether it survives
                self.release(&key, connection);
                return Err(e);
            }
        }
        Ok(PooledConnection {
            pool: self.clone(),
            key,
            connection: ManuallyDrop::new(connection),
        })
    }

    /// Put a connection back into the pool
    ///
    /// A ready connection is handed to the oldest waiter, bypassing the idle
    /// list, or parked idle; anything else is destroyed and its capacity
    /// offered to the oldest waiter.
    fn release(&self, key: &PoolKey, connection: Connection) {
        if !connection.is_ready() {
            debug!(
                host = %key.host,
                user = %key.user,
                state = ?connection.state(),
                "destroying released connection"
            );
            drop(connection);
            self.forfeit(key);
            return;
        }
        let mut inner = self.0.protected.lock().unwrap();
        let idle_timeout = self.0.options.idle_timeout;
        let Some(entry) = inner.entries.get_mut(key) else {
            return;
        };
        let mut connection = connection;
        while let Some(waiter) = entry.waiters.pop_front() {
            match waiter.tx.send(Ok(Handoff::Connection(connection))) {
                // The connection stays counted as used by the waiter
                Ok(()) => return,
                Err(returned) => match returned {
                    Ok(Handoff::Connection(c)) => connection = c,
                    _ => unreachable!(),
                },
            }
        }
        entry.used -= 1;
        entry
            .idle
            .push((connection, Instant::now() + idle_timeout));
        self.ensure_reaper(&mut inner);
    }

    /// Give up a reserved capacity slot, offering it to the oldest waiter
    fn forfeit(&self, key: &PoolKey) {
        let mut inner = self.0.protected.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.used -= 1;
            while let Some(waiter) = entry.waiters.pop_front() {
                if waiter.tx.send(Ok(Handoff::Slot)).is_ok() {
                    entry.used += 1;
                    break;
                }
            }
            if entry.is_empty() {
                inner.entries.remove(key);
            }
        }
    }

    /// Start the reaper task if it is not already scheduled
    ///
    /// One task per pool, shared by all keys; it stops itself when no key has
    /// waiters or idle connections and is restarted lazily here.
    fn ensure_reaper(&self, inner: &mut PoolProtected) {
        if inner.reaper_running {
            return;
        }
        inner.reaper_running = true;
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.0.options.reap_interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !pool.reap() {
                    break;
                }
            }
        });
    }

    /// Run one reaper sweep, returns false once there is nothing left to
    /// watch and the reaper should stop
    fn reap(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.0.protected.lock().unwrap();
        inner.entries.retain(|key, entry| {
            loop {
                let Some(waiter) = entry.waiters.front() else {
                    break;
                };
                if waiter.deadline <= now {
                    if let Some(waiter) = entry.waiters.pop_front() {
                        debug!(host = %key.host, user = %key.user, "pool acquire timed out");
                        let _ = waiter.tx.send(Err(ConnectionErrorContent::PoolTimeout {
                            host: key.host.clone(),
                            port: key.port,
                            user: key.user.clone(),
                        }
                        .into()));
                    }
                } else if waiter.tx.is_closed() {
                    entry.waiters.pop_front();
                } else {
                    break;
                }
            }
            let before = entry.idle.len();
            entry.idle.retain(|(_, expires)| *expires > now);
            if entry.idle.len() != before {
                debug!(
                    host = %key.host,
                    user = %key.user,
                    expired = before - entry.idle.len(),
                    "destroyed expired idle connections"
                );
            }
            !entry.is_empty()
        });
        let keep = inner
            .entries
            .values()
            .any(|e| !e.waiters.is_empty() || !e.idle.is_empty());
        if !keep {
            inner.reaper_running = false;
        }
        keep
    }

    /// Number of idle pooled connections for the given options' credentials
    pub fn idle_connections(&self, options: &ConnectionOptions<'_>) -> usize {
        let key = PoolKey::new(options);
        let inner = self.0.protected.lock().unwrap();
        inner.entries.get(&key).map(|e| e.idle.len()).unwrap_or(0)
    }

    /// Number of queued acquires for the given options' credentials
    pub fn waiting_requests(&self, options: &ConnectionOptions<'_>) -> usize {
        let key = PoolKey::new(options);
        let inner = self.0.protected.lock().unwrap();
        inner
            .entries
            .get(&key)
            .map(|e| e.waiters.len())
            .unwrap_or(0)
    }

    /// Return true while the reaper task is scheduled
    pub fn reaper_running(&self) -> bool {
        self.0.protected.lock().unwrap().reaper_running
    }
}

/// A connection borrowed from the pool
///
/// Dropping the guard returns the connection to the pool; a connection that
/// is not ready (broken, or left busy by an abandoned statement future) is
/// destroyed instead of being reused.
pub struct PooledConnection {
    /// The pool the connection is borrowed from
    pool: Pool,
    /// The credential key the connection is pooled under
    key: PoolKey,
    /// The borrowed connection
    connection: ManuallyDrop<Connection>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.connection
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // Safety: I will not access self.connection after this
        let connection = unsafe { ManuallyDrop::take(&mut self.connection) };
        self.pool.release(&self.key, connection);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::missing_docs_in_private_items)]
    use super::*;

    #[test]
    fn default_options() {
        let options = PoolOptions::default();
        assert_eq!(options.max_connections, 20);
        assert_eq!(options.acquire_timeout, Duration::from_secs(10));
        assert_eq!(options.idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn pool_key_includes_the_password() {
        let base = ConnectionOptions::new().host("db").user("app");
        let a = PoolKey::new(&base);
        let b = PoolKey::new(&ConnectionOptions::new().host("db").user("app").password("x"));
        assert!(a != b);
        // The database is deliberately not part of the key
        let c = PoolKey::new(&base.database("other"));
        assert!(a == c);
    }
}
