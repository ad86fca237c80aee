use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use parking_lot::Mutex;

use crate::errors::ConnectionError;

/// How long a service keeps a connection after an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStrategy {
    /// Close after every call. Batch calls hold one connection for the whole
    /// batch.
    PerCall,
    /// Keep the connection until `close` is called explicitly.
    Persistent,
}

/// Opens physical connections for one broker kind.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;

    /// Human readable address used in logs and errors.
    fn endpoint(&self) -> String;

    async fn dial(&self) -> Result<Self::Connection, ConnectionError>;

    fn is_alive(&self, connection: &Self::Connection) -> bool;

    async fn hang_up(&self, connection: Arc<Self::Connection>);
}

/// Owns at most one live connection produced by its dialer.
pub struct ConnectionManager<D: Dialer> {
    dialer: D,
    connect_timeout: Duration,
    current: Mutex<Option<Arc<D::Connection>>>,
    // serializes dial and hang-up so two callers never dial at once
    lifecycle: tokio::sync::Mutex<()>,
}

impl<D: Dialer> ConnectionManager<D> {
    pub fn new(dialer: D, connect_timeout: Duration) -> Self {
        Self {
            dialer,
            connect_timeout,
            current: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Return the live connection, dialing only when none is held.
    pub async fn connect(&self) -> Result<Arc<D::Connection>, ConnectionError> {
        let _guard = self.lifecycle.lock().await;

        let stale = {
            let mut current = self.current.lock();
            if let Some(connection) = current.as_ref() {
                if self.dialer.is_alive(connection) {
                    return Ok(Arc::clone(connection));
                }
            }
            current.take()
        };
        if let Some(stale) = stale {
            warn!("Dropping dead connection to {}", self.dialer.endpoint());
            self.dialer.hang_up(stale).await;
        }

        let endpoint = self.dialer.endpoint();
        let connection = match tokio::time::timeout(self.connect_timeout, self.dialer.dial()).await
        {
            Ok(result) => Arc::new(result?),
            Err(_) => {
                return Err(ConnectionError::Timeout {
                    endpoint,
                    timeout: self.connect_timeout,
                })
            }
        };

        info!("Connected to {}", endpoint);
        *self.current.lock() = Some(Arc::clone(&connection));
        Ok(connection)
    }

    pub fn is_connected(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .map(|connection| self.dialer.is_alive(connection))
            .unwrap_or(false)
    }

    /// Currently held connection without dialing.
    pub fn current(&self) -> Option<Arc<D::Connection>> {
        self.current.lock().clone()
    }

    pub async fn close(&self) {
        let _guard = self.lifecycle.lock().await;
        let connection = self.current.lock().take();
        if let Some(connection) = connection {
            self.dialer.hang_up(connection).await;
            info!("Connection to {} closed", self.dialer.endpoint());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingDialer {
        dials: AtomicUsize,
        hang_ups: AtomicUsize,
        reachable: AtomicBool,
        delay: Duration,
    }

    impl CountingDialer {
        fn new(delay: Duration) -> Self {
            Self {
                dials: AtomicUsize::new(0),
                hang_ups: AtomicUsize::new(0),
                reachable: AtomicBool::new(true),
                delay,
            }
        }
    }

    #[derive(Debug)]
    struct Link {
        open: AtomicBool,
    }

    #[async_trait]
    impl Dialer for CountingDialer {
        type Connection = Link;

        fn endpoint(&self) -> String {
            "test:1".into()
        }

        async fn dial(&self) -> Result<Link, ConnectionError> {
            tokio::time::sleep(self.delay).await;
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(ConnectionError::unreachable("test:1", "connection refused"));
            }
            self.dials.fetch_add(1, Ordering::SeqCst);
            Ok(Link {
                open: AtomicBool::new(true),
            })
        }

        fn is_alive(&self, connection: &Link) -> bool {
            connection.open.load(Ordering::SeqCst)
        }

        async fn hang_up(&self, connection: Arc<Link>) {
            connection.open.store(false, Ordering::SeqCst);
            self.hang_ups.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn connect_reuses_live_connection() {
        let manager = ConnectionManager::new(CountingDialer::new(Duration::ZERO), Duration::from_secs(1));
        let first = manager.connect().await.unwrap();
        let second = manager.connect().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.dialer().dials.load(Ordering::SeqCst), 1);
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn close_releases_and_next_connect_redials() {
        let manager = ConnectionManager::new(CountingDialer::new(Duration::ZERO), Duration::from_secs(1));
        manager.connect().await.unwrap();
        manager.close().await;
        assert!(!manager.is_connected());
        manager.close().await;
        assert_eq!(manager.dialer().hang_ups.load(Ordering::SeqCst), 1);

        manager.connect().await.unwrap();
        assert_eq!(manager.dialer().dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dead_connection_is_replaced() {
        let manager = ConnectionManager::new(CountingDialer::new(Duration::ZERO), Duration::from_secs(1));
        let first = manager.connect().await.unwrap();
        first.open.store(false, Ordering::SeqCst);
        assert!(!manager.is_connected());

        let second = manager.connect().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(manager.dialer().dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unreachable_broker_surfaces_typed_error() {
        let dialer = CountingDialer::new(Duration::ZERO);
        dialer.reachable.store(false, Ordering::SeqCst);
        let manager = ConnectionManager::new(dialer, Duration::from_secs(1));
        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Unreachable { .. }));
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn slow_dial_times_out() {
        let manager = ConnectionManager::new(
            CountingDialer::new(Duration::from_secs(5)),
            Duration::from_millis(50),
        );
        let started = std::time::Instant::now();
        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
