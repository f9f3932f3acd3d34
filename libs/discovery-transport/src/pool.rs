//! Bounded HTTP/1.1 connection pool.
//!
//! Connections are keyed by route (scheme, host, port). A route may hold at
//! most `max_per_route` connections and the pool at most `max_total`, idle
//! and leased together. When the total cap is reached, the oldest idle
//! connection of another route is evicted to make room; otherwise callers
//! wait for a connection to be returned, bounded by the connect timeout.
//!
//! The pool's mutex is the only lock in the transport. It is never held
//! across an `.await`.

use bytes::Bytes;
use http::{HeaderMap, Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::TransportConfig;
use crate::connector::{Connector, RouteKey, Sender};
use crate::error::{ConfigError, TransportError};

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub max_per_route: usize,
    pub max_total: usize,
    pub idle: usize,
    pub leased: usize,
    pub closed: bool,
}

/// Maintenance operations the reaper and the transport client drive.
pub trait PoolControl: Send + Sync {
    /// Close connections idle for at least `idle`; returns how many were closed
    fn close_idle(&self, idle: Duration) -> usize;

    /// Close connections past their keep-alive expiry or closed by the peer
    fn close_expired(&self) -> usize;

    /// Close every idle connection and refuse new checkouts. Idempotent.
    fn close(&self);
}

struct IdleConnection {
    sender: Sender,
    idle_since: Instant,
    expires_at: Option<Instant>,
}

impl IdleConnection {
    fn is_expired(&self, now: Instant) -> bool {
        self.sender.is_closed() || self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct PoolState {
    idle: HashMap<RouteKey, Vec<IdleConnection>>,
    per_route: HashMap<RouteKey, usize>,
    total: usize,
}

impl PoolState {
    fn reserve(&mut self, route: &RouteKey) {
        *self.per_route.entry(route.clone()).or_insert(0) += 1;
        self.total += 1;
    }

    fn release(&mut self, route: &RouteKey) {
        if let Some(count) = self.per_route.get_mut(route) {
            *count -= 1;
            if *count == 0 {
                self.per_route.remove(route);
            }
        }
        self.total = self.total.saturating_sub(1);
    }

    fn route_count(&self, route: &RouteKey) -> usize {
        self.per_route.get(route).copied().unwrap_or(0)
    }

    fn idle_count(&self) -> usize {
        self.idle.values().map(Vec::len).sum()
    }

    /// Remove idle connections matching `evict`, keeping counts in step.
    ///
    /// The removed senders are returned so they are dropped after the lock
    /// is released.
    fn drain_idle(&mut self, mut evict: impl FnMut(&IdleConnection) -> bool) -> Vec<Sender> {
        let mut removed = Vec::new();
        let mut released = Vec::new();
        for (route, conns) in &mut self.idle {
            let (evicted, kept): (Vec<_>, Vec<_>) =
                std::mem::take(conns).into_iter().partition(|conn| evict(conn));
            *conns = kept;
            released.extend(std::iter::repeat_n(route.clone(), evicted.len()));
            removed.extend(evicted.into_iter().map(|conn| conn.sender));
        }
        self.idle.retain(|_, conns| !conns.is_empty());
        for route in &released {
            self.release(route);
        }
        removed
    }

    /// Evict the longest-idle connection of a route other than `route`.
    fn evict_other_route(&mut self, route: &RouteKey) -> Option<Sender> {
        let victim = self
            .idle
            .iter()
            .filter(|(key, _)| *key != route)
            .flat_map(|(key, conns)| {
                conns
                    .iter()
                    .enumerate()
                    .map(move |(idx, conn)| (key, idx, conn.idle_since))
            })
            .min_by_key(|(_, _, since)| *since)
            .map(|(key, idx, _)| (key.clone(), idx))?;

        let (key, idx) = victim;
        let conns = self.idle.get_mut(&key)?;
        let conn = conns.remove(idx);
        if conns.is_empty() {
            self.idle.remove(&key);
        }
        self.release(&key);
        Some(conn.sender)
    }
}

enum Checkout {
    Idle(Sender),
    Connect,
    Wait,
}

struct PoolInner {
    state: Mutex<PoolState>,
    available: Notify,
    closed: AtomicBool,
    max_per_route: usize,
    max_total: usize,
    acquire_timeout: Duration,
    connector: Connector,
}

impl PoolInner {
    fn release_slot(&self, route: &RouteKey) {
        self.state.lock().release(route);
        self.available.notify_waiters();
    }

    fn try_checkout(&self, route: &RouteKey) -> (Checkout, Vec<Sender>) {
        let mut discarded = Vec::new();
        let mut state = self.state.lock();
        let now = Instant::now();

        let mut reusable = None;
        if let Some(conns) = state.idle.get_mut(route) {
            // most recently used first
            while let Some(conn) = conns.pop() {
                if !conn.is_expired(now) && conn.sender.is_ready() {
                    reusable = Some(conn.sender);
                    break;
                }
                discarded.push(conn.sender);
            }
            if conns.is_empty() {
                state.idle.remove(route);
            }
        }
        for _ in 0..discarded.len() {
            state.release(route);
        }
        if let Some(sender) = reusable {
            return (Checkout::Idle(sender), discarded);
        }

        if state.route_count(route) >= self.max_per_route {
            return (Checkout::Wait, discarded);
        }
        if state.total >= self.max_total {
            match state.evict_other_route(route) {
                Some(sender) => {
                    tracing::debug!(route = %route, "evicted idle connection of another route");
                    discarded.push(sender);
                }
                None => return (Checkout::Wait, discarded),
            }
        }
        state.reserve(route);
        (Checkout::Connect, discarded)
    }

    fn checkin(&self, mut slot: ConnectionSlot, sender: Sender, expires_at: Option<Instant>) {
        let now = Instant::now();
        if sender.is_closed() || expires_at.is_some_and(|at| at <= now) {
            return;
        }
        let accepted = {
            let mut state = self.state.lock();
            if self.closed.load(Ordering::Acquire) {
                false
            } else {
                slot.disarm();
                state
                    .idle
                    .entry(slot.route.clone())
                    .or_default()
                    .push(IdleConnection {
                        sender,
                        idle_since: now,
                        expires_at,
                    });
                true
            }
        };
        // a rejected slot is dropped here, after the lock is released
        drop(slot);
        if accepted {
            self.available.notify_waiters();
        }
    }
}

/// Counts one connection against the caps while it is leased.
struct ConnectionSlot {
    pool: Arc<PoolInner>,
    route: RouteKey,
    armed: bool,
}

impl ConnectionSlot {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_slot(&self.route);
        }
    }
}

struct PooledConnection {
    sender: Sender,
    slot: ConnectionSlot,
}

impl PooledConnection {
    /// Return the connection once the current response body has been read.
    fn release(self, expires_at: Option<Instant>) {
        let Self { mut sender, slot } = self;
        tokio::spawn(async move {
            // resolves once the previous exchange is complete, errors if the
            // connection was closed instead
            if sender.ready().await.is_ok() {
                let pool = Arc::clone(&slot.pool);
                pool.checkin(slot, sender, expires_at);
            }
        });
    }
}

/// Shared connection pool; cloning yields another handle to the same pool.
///
/// Also a `tower::Service` that sends a request over a pooled connection.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    /// # Errors
    /// Returns `ConfigError` if TLS setup fails.
    pub fn new(config: &TransportConfig) -> Result<Self, ConfigError> {
        let connector = Connector::new(config)?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::default()),
                available: Notify::new(),
                closed: AtomicBool::new(false),
                max_per_route: config.max_connections_per_host(),
                max_total: config.max_total_connections(),
                acquire_timeout: config.connect_timeout(),
                connector,
            }),
        })
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let idle = state.idle_count();
        PoolStats {
            max_per_route: self.inner.max_per_route,
            max_total: self.inner.max_total,
            idle,
            leased: state.total.saturating_sub(idle),
            closed: self.inner.closed.load(Ordering::Acquire),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    async fn checkout(&self, route: &RouteKey) -> Result<PooledConnection, TransportError> {
        let deadline = Instant::now() + self.inner.acquire_timeout;
        loop {
            // register interest before looking, so a release in between is not missed
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return Err(TransportError::PoolShutdown);
            }

            let (checkout, discarded) = self.inner.try_checkout(route);
            drop(discarded);
            match checkout {
                Checkout::Idle(sender) => {
                    tracing::trace!(route = %route, "reusing pooled connection");
                    return Ok(self.lease(route, sender));
                }
                Checkout::Connect => {
                    let slot = ConnectionSlot {
                        pool: Arc::clone(&self.inner),
                        route: route.clone(),
                        armed: true,
                    };
                    let sender = self.inner.connector.connect(route).await?;
                    return Ok(PooledConnection { sender, slot });
                }
                Checkout::Wait => {
                    tracing::trace!(route = %route, "waiting for a pooled connection");
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(TransportError::PoolTimeout(self.inner.acquire_timeout));
                    }
                }
            }
        }
    }

    fn lease(&self, route: &RouteKey, sender: Sender) -> PooledConnection {
        PooledConnection {
            sender,
            slot: ConnectionSlot {
                pool: Arc::clone(&self.inner),
                route: route.clone(),
                armed: true,
            },
        }
    }

    /// Send one request over a pooled connection.
    ///
    /// The request URI must be absolute; it selects the route.
    ///
    /// # Errors
    /// Any `TransportError` from checkout, connect or the exchange itself.
    pub async fn send(
        &self,
        request: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>, TransportError> {
        let route = RouteKey::from_uri(request.uri())?;
        let (mut parts, body) = request.into_parts();
        self.inner.connector.prepare_request(&route, &mut parts);

        let mut conn = self.checkout(&route).await?;
        match conn.sender.send_request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                let expires_at = keep_alive_timeout(response.headers()).map(|t| Instant::now() + t);
                conn.release(expires_at);
                Ok(response)
            }
            Err(err) => {
                tracing::debug!(route = %route, error = %err, "request failed on pooled connection");
                Err(TransportError::from(err))
            }
        }
    }
}

impl PoolControl for ConnectionPool {
    fn close_idle(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let removed = self
            .inner
            .state
            .lock()
            .drain_idle(|conn| now.saturating_duration_since(conn.idle_since) >= idle);
        let count = removed.len();
        drop(removed);
        if count > 0 {
            self.inner.available.notify_waiters();
            tracing::debug!(count, idle_ms = idle.as_millis(), "closed idle connections");
        }
        count
    }

    fn close_expired(&self) -> usize {
        let now = Instant::now();
        let removed = self
            .inner
            .state
            .lock()
            .drain_idle(|conn| conn.is_expired(now));
        let count = removed.len();
        drop(removed);
        if count > 0 {
            self.inner.available.notify_waiters();
            tracing::debug!(count, "closed expired connections");
        }
        count
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let removed = self.inner.state.lock().drain_idle(|_| true);
        let count = removed.len();
        drop(removed);
        // wake waiters so they observe the shutdown
        self.inner.available.notify_waiters();
        tracing::debug!(closed_idle = count, "connection pool shut down");
    }
}

impl tower::Service<Request<Full<Bytes>>> for ConnectionPool {
    type Response = Response<Incoming>;
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.is_closed() {
            return Poll::Ready(Err(TransportError::PoolShutdown));
        }
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Full<Bytes>>) -> Self::Future {
        let pool = self.clone();
        Box::pin(async move { pool.send(request).await })
    }
}

/// Parse `Keep-Alive: timeout=N` into the server's idle limit.
fn keep_alive_timeout(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("keep-alive")?.to_str().ok()?;
    value.split(',').find_map(|param| {
        let (key, val) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("timeout") {
            return None;
        }
        let secs: u64 = val.trim().trim_matches('"').parse().ok()?;
        (secs > 0).then(|| Duration::from_secs(secs))
    })
}
