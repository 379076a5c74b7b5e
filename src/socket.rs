//! Socket management for wssocks
//!
//! Listen sockets for reverse SOCKS5 ports are reference counted and kept
//! bound for a grace period after the last release, so rapid token or
//! client churn does not hit TIME_WAIT rebind races and pending TCP
//! clients stay queued across a transient loss of WebSocket peers.

use log::{debug, warn};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

/// SocketManager manages listen-socket lifecycle and reuse
pub struct SocketManager {
    sockets: Arc<Mutex<HashMap<u16, ManagedSocket>>>,
    host: String,
    grace: Duration,
}

/// ManagedSocket represents a listen socket with reference counting
struct ManagedSocket {
    listener: Arc<TcpListener>,
    refs: usize,
    grace_since: Option<Instant>,
    cleanup: Option<JoinHandle<()>>,
}

impl SocketManager {
    /// Create a new SocketManager binding on `host`
    pub fn new(host: &str, grace: Duration) -> Self {
        SocketManager {
            sockets: Arc::new(Mutex::new(HashMap::new())),
            host: host.to_string(),
            grace,
        }
    }

    /// Get the listener for the specified port, reusing an existing one if
    /// available
    ///
    /// Re-acquiring a socket that is in its grace period takes it back to
    /// the active state and cancels the pending cleanup.
    pub async fn acquire(&self, port: u16) -> io::Result<Arc<TcpListener>> {
        let mut sockets = self.sockets.lock().await;

        if let Some(sock) = sockets.get_mut(&port) {
            sock.refs += 1;
            sock.grace_since = None;
            if let Some(task) = sock.cleanup.take() {
                task.abort();
            }
            debug!("Reusing existing socket for port {} (refs: {})", port, sock.refs);
            return Ok(sock.listener.clone());
        }

        let listener = Arc::new(TcpListener::bind((self.host.as_str(), port)).await?);
        debug!("New socket allocated on {}:{}", self.host, port);
        sockets.insert(
            port,
            ManagedSocket {
                listener: listener.clone(),
                refs: 1,
                grace_since: None,
                cleanup: None,
            },
        );
        Ok(listener)
    }

    /// Release a listener, starting the grace period once the last
    /// reference is gone
    pub async fn release(&self, port: u16) {
        let mut sockets = self.sockets.lock().await;

        let Some(sock) = sockets.get_mut(&port) else {
            warn!("Attempted to release non-existent socket on port {}", port);
            return;
        };

        sock.refs = sock.refs.saturating_sub(1);
        if sock.refs > 0 {
            debug!("Released socket on port {}.", port);
            return;
        }

        debug!("Starting grace period for socket on port {}", port);
        sock.grace_since = Some(Instant::now());

        let sockets_ref = self.sockets.clone();
        let grace = self.grace;
        sock.cleanup = Some(tokio::spawn(async move {
            sleep(grace).await;
            let mut sockets = sockets_ref.lock().await;
            // Only close if still unreferenced and still in grace
            let expired = sockets
                .get(&port)
                .map(|s| s.refs == 0 && s.grace_since.is_some())
                .unwrap_or(false);
            if expired {
                debug!("Cleaning up unused socket on port {} after grace period", port);
                sockets.remove(&port);
            }
        }));
    }

    /// Close all managed sockets and cancel pending cleanups
    pub async fn close(&self) {
        debug!("Closing all managed sockets");
        let mut sockets = self.sockets.lock().await;
        for (_, mut sock) in sockets.drain() {
            if let Some(task) = sock.cleanup.take() {
                task.abort();
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn refs(&self, port: u16) -> Option<usize> {
        self.sockets.lock().await.get(&port).map(|s| s.refs)
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, port: u16) -> bool {
        self.sockets.lock().await.contains_key(&port)
    }
}
