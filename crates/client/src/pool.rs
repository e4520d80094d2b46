use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use protocol::{ClientConfig, PoolConfig, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info};

use crate::{Client, PoolError};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections that exist or are being opened (`idle + leased`).
    pub open: usize,
    /// Connections waiting in the pool.
    pub idle: usize,
    /// Connections currently held by a [`PooledClient`] or being opened.
    pub leased: usize,
    /// Connections opened over the pool's lifetime.
    pub created: u64,
    /// Configured `max_connections`.
    pub max: usize,
}

struct IdleClient {
    client: Client,
    since: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleClient>,
    open: usize,
    created: u64,
    closed: bool,
}

struct PoolInner {
    client_config: ClientConfig,
    max: usize,
    acquire_timeout: Duration,
    max_idle: Option<Duration>,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn is_expired(&self, idle: &IdleClient) -> bool {
        self.max_idle
            .is_some_and(|limit| idle.since.elapsed() > limit)
    }

    /// Pops the most recently returned usable connection, discarding dead or
    /// expired ones on the way.
    fn take_idle(&self) -> Option<Client> {
        let mut discarded = Vec::new();
        let found = {
            let mut state = self.state.lock();
            loop {
                let Some(candidate) = state.idle.pop_back() else {
                    break None;
                };
                if candidate.client.is_alive() && !self.is_expired(&candidate) {
                    break Some(candidate.client);
                }
                state.open -= 1;
                discarded.push(candidate);
            }
        };
        if !discarded.is_empty() {
            debug!(count = discarded.len(), "discarded stale pooled connections");
        }
        found
    }

    /// Opens a new connection. The slot is counted before connecting so
    /// concurrent acquirers never overshoot `max`.
    async fn open_new(&self) -> Result<Client, PoolError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            state.open += 1;
        }
        let mut slot = SlotGuard {
            state: &self.state,
            armed: true,
        };

        let client = Client::connect(&self.client_config).await?;

        slot.armed = false;
        let created = {
            let mut state = self.state.lock();
            state.created += 1;
            state.created
        };
        debug!(created, "opened pooled connection");
        Ok(client)
    }

    fn release(&self, client: Client) {
        let mut state = self.state.lock();
        if state.closed || !client.is_alive() {
            state.open -= 1;
            drop(state);
            debug!("dropping dead pooled connection");
            return;
        }
        state.idle.push_back(IdleClient {
            client,
            since: Instant::now(),
        });
    }

    fn discard(&self, client: Client) {
        self.state.lock().open -= 1;
        drop(client);
    }
}

/// Gives a counted slot back if a connect attempt fails or is cancelled.
struct SlotGuard<'a> {
    state: &'a Mutex<PoolState>,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().open -= 1;
        }
    }
}

/// A bounded set of connections to one endpoint.
///
/// Connections are opened lazily up to `max_connections` and reused. Each
/// [`Pool::acquire`] leases one connection exclusively until the returned
/// [`PooledClient`] is dropped. Cloning a pool shares it.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Validates both configurations and opens `initial_connections`.
    pub async fn connect(client_config: ClientConfig, pool_config: PoolConfig) -> Result<Self, PoolError> {
        client_config.validate()?;
        pool_config.validate()?;

        let inner = Arc::new(PoolInner {
            max: pool_config.max_connections,
            acquire_timeout: pool_config.acquire_timeout()?,
            max_idle: pool_config.max_idle()?,
            permits: Arc::new(Semaphore::new(pool_config.max_connections)),
            state: Mutex::new(PoolState::default()),
            client_config,
        });

        for _ in 0..pool_config.initial_connections {
            let client = inner.open_new().await?;
            inner.release(client);
        }

        let (host, port) = inner.client_config.address();
        info!(
            host,
            port,
            initial = pool_config.initial_connections,
            max = inner.max,
            "connection pool ready"
        );
        Ok(Self { inner })
    }

    /// Leases a connection, opening one if none is idle and capacity allows.
    ///
    /// With a zero acquire timeout this never waits and fails with
    /// [`PoolError::Exhausted`] when every slot is leased.
    pub async fn acquire(&self) -> Result<PooledClient, PoolError> {
        let inner = &self.inner;
        if inner.state.lock().closed {
            return Err(PoolError::Closed);
        }

        let permits = Arc::clone(&inner.permits);
        let permit = if inner.acquire_timeout.is_zero() {
            permits.try_acquire_owned().map_err(|e| match e {
                TryAcquireError::Closed => PoolError::Closed,
                TryAcquireError::NoPermits => PoolError::Exhausted { max: inner.max },
            })?
        } else {
            match tokio::time::timeout(inner.acquire_timeout, permits.acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(PoolError::Closed),
                Err(_) => {
                    return Err(PoolError::AcquireTimeout {
                        after: inner.acquire_timeout,
                    })
                }
            }
        };

        let client = match inner.take_idle() {
            Some(client) => client,
            None => inner.open_new().await?,
        };
        Ok(PooledClient {
            client: Some(client),
            pool: Arc::clone(inner),
            _permit: permit,
        })
    }

    /// Leases a connection for one call.
    ///
    /// A connection that fails during the call is discarded rather than
    /// returned to the pool.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, PoolError> {
        let lease = self.acquire().await?;
        Ok(lease.call(method, params).await?)
    }

    /// Typed variant of [`Pool::call`]; see [`Client::call_as`].
    pub async fn call_as<R>(&self, method: &str, args: impl Serialize) -> Result<R, PoolError>
    where
        R: DeserializeOwned,
    {
        let lease = self.acquire().await?;
        Ok(lease.call_as(method, args).await?)
    }

    /// Leases a connection for one notification.
    pub async fn notify(&self, method: &str, params: Vec<Value>) -> Result<(), PoolError> {
        let lease = self.acquire().await?;
        Ok(lease.notify(method, params).await?)
    }

    /// Discards idle connections that are dead or idle for longer than
    /// `max_idle_seconds`. Returns how many were removed.
    pub fn reap_idle(&self) -> usize {
        let inner = &self.inner;
        let expired: Vec<IdleClient> = {
            let mut state = inner.state.lock();
            let (keep, expired): (Vec<_>, Vec<_>) = state
                .idle
                .drain(..)
                .partition(|idle| idle.client.is_alive() && !inner.is_expired(idle));
            state.idle = VecDeque::from(keep);
            state.open -= expired.len();
            expired
        };
        if !expired.is_empty() {
            debug!(count = expired.len(), "reaped idle connections");
        }
        expired.len()
    }

    /// Current occupancy.
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            open: state.open,
            idle: state.idle.len(),
            leased: state.open - state.idle.len(),
            created: state.created,
            max: self.inner.max,
        }
    }

    /// Closes idle connections and rejects further acquires. Leased
    /// connections are closed as they are returned.
    pub fn close(&self) {
        let idle: Vec<IdleClient> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.open -= idle.len();
            idle
        };
        self.inner.permits.close();
        info!(closed_idle = idle.len(), "connection pool closed");
    }

    /// Returns `true` once [`Pool::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("status", &self.status()).finish()
    }
}

/// An exclusively leased connection.
///
/// Dereferences to [`Client`]. Dropping the lease returns the connection to
/// the pool, or discards it if the connection has died.
pub struct PooledClient {
    client: Option<Client>,
    pool: Arc<PoolInner>,
    // Dropped after the connection is back in the idle set.
    _permit: OwnedSemaphorePermit,
}

impl PooledClient {
    /// Closes this connection instead of returning it to the pool.
    pub fn discard(mut self) {
        if let Some(client) = self.client.take() {
            self.pool.discard(client);
        }
    }
}

impl Deref for PooledClient {
    type Target = Client;

    fn deref(&self) -> &Client {
        match &self.client {
            Some(client) => client,
            // Only `discard` and `drop` take the client, and both consume the lease.
            None => unreachable!("pooled client used after release"),
        }
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.release(client);
        }
    }
}

impl std::fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClient")
            .field("client", &self.client)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> ClientConfig {
        // Port 1 on loopback refuses connections.
        ClientConfig::new("127.0.0.1", 1)
    }

    #[tokio::test]
    async fn invalid_pool_config_is_rejected() {
        let pool_config = PoolConfig {
            max_connections: 0,
            ..PoolConfig::default()
        };
        let err = Pool::connect(unreachable_config(), pool_config)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));
    }

    #[tokio::test]
    async fn failed_connect_frees_its_slot() {
        let pool = Pool::connect(unreachable_config(), PoolConfig::default())
            .await
            .unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Connect(_)));
        assert_eq!(pool.status().open, 0);
        assert_eq!(pool.status().created, 0);
    }

    fn pool_with_idle(clients: Vec<(Client, Instant)>) -> Pool {
        let open = clients.len();
        let idle = clients
            .into_iter()
            .map(|(client, since)| IdleClient { client, since })
            .collect();
        Pool {
            inner: Arc::new(PoolInner {
                client_config: unreachable_config(),
                max: 4,
                acquire_timeout: Duration::from_secs(1),
                max_idle: Some(Duration::from_secs(60)),
                permits: Arc::new(Semaphore::new(4)),
                state: Mutex::new(PoolState {
                    idle,
                    open,
                    created: open as u64,
                    closed: false,
                }),
            }),
        }
    }

    fn stream_client() -> (Client, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(1024);
        (Client::from_stream(near, framer::FrameOptions::default()), far)
    }

    #[tokio::test]
    async fn reap_keeps_fresh_connections_in_order() {
        let (fresh_a, _far_a) = stream_client();
        let (stale, _far_b) = stream_client();
        let (dead, _far_c) = stream_client();
        let (fresh_b, _far_d) = stream_client();
        dead.close().await;

        let now = Instant::now();
        let long_ago = now - Duration::from_secs(120);
        let pool = pool_with_idle(vec![
            (fresh_a, now),
            (stale, long_ago),
            (dead, now),
            (fresh_b, now),
        ]);

        assert_eq!(pool.reap_idle(), 2);
        let status = pool.status();
        assert_eq!(status.open, 2);
        assert_eq!(status.idle, 2);
        assert_eq!(pool.reap_idle(), 0);

        // The most recently returned connection is still handed out first.
        let lease = pool.acquire().await.unwrap();
        assert!(lease.is_alive());
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn closed_pool_rejects_acquire() {
        let pool = Pool::connect(unreachable_config(), PoolConfig::default())
            .await
            .unwrap();
        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire().await.unwrap_err(), PoolError::Closed));
    }
}
