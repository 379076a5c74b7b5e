//! Server implementation for wssocks

use crate::api::ApiHandler;
use crate::bus::ChannelBus;
use crate::error::{Error, Result};
use crate::message::Envelope;
use crate::portpool::PortPool;
use crate::relay::{self, Relay, RelayOption, SOCKS_REPLY_NETWORK_UNREACHABLE};
use crate::socket::SocketManager;
use crate::version::VERSION;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE};
use http::StatusCode;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use log::{debug, error, info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

/// Default buffer size for data transfer
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default grace period for released SOCKS listen sockets
pub const DEFAULT_SOCKS_GRACE: Duration = Duration::from_secs(30);

/// Default wait for a client to attach before refusing a SOCKS request
pub const DEFAULT_CLIENT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between heartbeat pings
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Per-frame receive timeout before probing the connection
const RECV_TIMEOUT: Duration = Duration::from_secs(60);

/// Poll interval while waiting for a client to attach
const CLIENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Server options for WsSocksServer
#[derive(Clone)]
pub struct ServerOption {
    /// WebSocket server listen address
    pub ws_host: String,

    /// WebSocket server listen port (0 binds an ephemeral port)
    pub ws_port: u16,

    /// SOCKS server listen address
    pub socks_host: String,

    /// Port pool for SOCKS servers
    pub port_pool: PortPool,

    /// Whether to wait for a client before starting a SOCKS server
    pub socks_wait_client: bool,

    /// Buffer size for data transfer
    pub buffer_size: usize,

    /// API key for the HTTP admin API; the API is disabled when None
    pub api_key: Option<String>,

    /// Timeout waiting for a peer's connect_response
    pub channel_timeout: Duration,

    /// Outbound connect timeout for forward connections
    pub connect_timeout: Duration,

    /// Grace period before a released SOCKS listen socket is closed
    pub socks_grace: Duration,

    /// How long a SOCKS request waits for a client to attach
    pub client_wait_timeout: Duration,
}

impl Default for ServerOption {
    fn default() -> Self {
        ServerOption {
            ws_host: "0.0.0.0".to_string(),
            ws_port: 8765,
            socks_host: "127.0.0.1".to_string(),
            port_pool: PortPool::new_default(),
            socks_wait_client: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
            api_key: None,
            channel_timeout: crate::relay::DEFAULT_CHANNEL_TIMEOUT,
            connect_timeout: crate::relay::DEFAULT_CONNECT_TIMEOUT,
            socks_grace: DEFAULT_SOCKS_GRACE,
            client_wait_timeout: DEFAULT_CLIENT_WAIT_TIMEOUT,
        }
    }
}

impl ServerOption {
    /// Set the WebSocket host
    pub fn with_ws_host(mut self, host: String) -> Self {
        self.ws_host = host;
        self
    }

    /// Set the WebSocket port
    pub fn with_ws_port(mut self, port: u16) -> Self {
        self.ws_port = port;
        self
    }

    /// Set the SOCKS host
    pub fn with_socks_host(mut self, host: String) -> Self {
        self.socks_host = host;
        self
    }

    /// Set the port pool
    pub fn with_port_pool(mut self, pool: PortPool) -> Self {
        self.port_pool = pool;
        self
    }

    /// Set whether to wait for a client before starting a SOCKS server
    pub fn with_socks_wait_client(mut self, wait: bool) -> Self {
        self.socks_wait_client = wait;
        self
    }

    /// Set the buffer size
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Enable the HTTP admin API with the given key
    pub fn with_api(mut self, key: String) -> Self {
        self.api_key = Some(key);
        self
    }

    /// Set the channel timeout
    pub fn with_channel_timeout(mut self, timeout: Duration) -> Self {
        self.channel_timeout = timeout;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the listen-socket grace period
    pub fn with_socks_grace(mut self, grace: Duration) -> Self {
        self.socks_grace = grace;
        self
    }

    /// Set how long a SOCKS request waits for a client to attach
    pub fn with_client_wait_timeout(mut self, timeout: Duration) -> Self {
        self.client_wait_timeout = timeout;
        self
    }
}

/// Options for a reverse token
#[derive(Default)]
pub struct ReverseTokenOptions {
    /// Token to use (auto-generated if None)
    pub token: Option<String>,

    /// Port to use (allocated from the pool if None)
    pub port: Option<u16>,

    /// SOCKS5 username; authentication applies only when the password is
    /// also set
    pub username: Option<String>,

    /// SOCKS5 password; authentication applies only when the username is
    /// also set
    pub password: Option<String>,
}

/// Result of adding a reverse token
#[derive(Debug)]
pub struct ReverseTokenResult {
    /// Token that was created or reused
    pub token: String,

    /// SOCKS5 port assigned to the token
    pub port: u16,
}

/// Which side of the proxy a session serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionKind {
    Reverse,
    Forward,
}

/// Clients attached to a reverse token and the round-robin cursor over them
///
/// The owning mutex is the per-token lock: selection, membership changes and
/// the supervisor-start check all happen while it is held.
#[derive(Default)]
struct TokenState {
    clients: Vec<(Uuid, mpsc::Sender<WsMessage>)>,
    cursor: usize,
}

impl TokenState {
    /// Advance the cursor and return the selected client
    fn next_client(&mut self) -> Option<(Uuid, mpsc::Sender<WsMessage>)> {
        if self.clients.is_empty() {
            return None;
        }
        self.cursor = (self.cursor + 1) % self.clients.len();
        self.clients.get(self.cursor).cloned()
    }
}

/// A configured reverse token
struct ReverseToken {
    port: u16,
    auth: Option<(String, String)>,
    state: AsyncMutex<TokenState>,
}

/// A running SOCKS supervisor and its cancellation signal
struct SocksServerTask {
    cancel: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// WsSocksServer is a SOCKS5 over WebSocket protocol server
///
/// In forward proxy mode it receives WebSocket requests from clients,
/// accesses the network on their behalf and returns the results. In reverse
/// proxy mode it accepts SOCKS5 requests locally and forwards them to a
/// connected client over WebSocket.
#[derive(Clone)]
pub struct WsSocksServer {
    /// Server options
    options: ServerOption,

    /// Ready notification, fired when the WebSocket listener is bound
    ready: Arc<Notify>,
    ready_flag: Arc<AtomicBool>,

    /// Set once serve() has started
    started: Arc<AtomicBool>,

    /// Address the WebSocket listener actually bound
    bound_addr: Arc<StdMutex<Option<SocketAddr>>>,

    /// Port pool
    port_pool: PortPool,

    /// Reverse tokens
    tokens: Arc<RwLock<HashMap<String, Arc<ReverseToken>>>>,

    /// Forward tokens
    forward_tokens: Arc<RwLock<HashSet<String>>>,

    /// Connected reverse clients
    clients: Arc<RwLock<HashMap<Uuid, mpsc::Sender<WsMessage>>>>,

    /// Connected forward clients
    forward_clients: Arc<RwLock<HashMap<Uuid, mpsc::Sender<WsMessage>>>>,

    /// Reverse tokens added before serve() that still need a supervisor
    pending_tokens: Arc<StdMutex<Vec<String>>>,

    /// Running SOCKS supervisors by port
    socks_tasks: Arc<AsyncMutex<HashMap<u16, SocksServerTask>>>,

    /// Listen socket manager
    socket_manager: Arc<SocketManager>,

    /// Channel message bus
    bus: Arc<ChannelBus>,

    /// Relay core
    relay: Arc<Relay>,

    /// Shutdown notification
    shutdown: Arc<Notify>,
}

impl WsSocksServer {
    /// Create a new WsSocksServer
    pub fn new(options: ServerOption) -> Self {
        let bus = Arc::new(ChannelBus::new());
        let relay_options = RelayOption::default()
            .with_buffer_size(options.buffer_size)
            .with_channel_timeout(options.channel_timeout)
            .with_connect_timeout(options.connect_timeout);
        let socket_manager = Arc::new(SocketManager::new(&options.socks_host, options.socks_grace));

        WsSocksServer {
            port_pool: options.port_pool.clone(),
            ready: Arc::new(Notify::new()),
            ready_flag: Arc::new(AtomicBool::new(false)),
            started: Arc::new(AtomicBool::new(false)),
            bound_addr: Arc::new(StdMutex::new(None)),
            tokens: Arc::new(RwLock::new(HashMap::new())),
            forward_tokens: Arc::new(RwLock::new(HashSet::new())),
            clients: Arc::new(RwLock::new(HashMap::new())),
            forward_clients: Arc::new(RwLock::new(HashMap::new())),
            pending_tokens: Arc::new(StdMutex::new(Vec::new())),
            socks_tasks: Arc::new(AsyncMutex::new(HashMap::new())),
            socket_manager,
            relay: Arc::new(Relay::new(relay_options, bus.clone())),
            bus,
            shutdown: Arc::new(Notify::new()),
            options,
        }
    }

    /// Add a new token for reverse SOCKS and assign it a port
    ///
    /// Idempotent by token: adding an existing reverse token returns its
    /// assigned port without a second allocation.
    pub async fn add_reverse_token(&self, opts: ReverseTokenOptions) -> Result<ReverseTokenResult> {
        let token = opts.token.unwrap_or_else(generate_token);

        if self.forward_tokens.read().await.contains(&token) {
            return Err(Error::TokenConflict);
        }

        let mut tokens = self.tokens.write().await;
        if let Some(existing) = tokens.get(&token) {
            return Ok(ReverseTokenResult {
                token,
                port: existing.port,
            });
        }

        let port = self.port_pool.get(opts.port).ok_or(match opts.port {
            Some(p) => Error::PortUnavailable(p),
            None => Error::NoPortAvailable,
        })?;

        // Both credentials or none; a single one means no authentication
        let auth = match (opts.username, opts.password) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        };

        tokens.insert(
            token.clone(),
            Arc::new(ReverseToken {
                port,
                auth,
                state: AsyncMutex::new(TokenState::default()),
            }),
        );
        drop(tokens);

        if !self.options.socks_wait_client {
            if self.started.load(Ordering::SeqCst) {
                let server = self.clone();
                let pending = token.clone();
                tokio::spawn(async move {
                    server.handle_pending_token(&pending, None).await;
                });
            } else {
                self.pending_tokens.lock().unwrap().push(token.clone());
            }
        }

        info!("New reverse proxy token added for port {}.", port);
        debug!("SHA256 for the token: {}", token_digest(&token));
        Ok(ReverseTokenResult { token, port })
    }

    /// Add a new token for forward SOCKS proxying
    pub async fn add_forward_token(&self, token: Option<String>) -> Result<String> {
        let token = token.unwrap_or_else(generate_token);

        if self.tokens.read().await.contains_key(&token) {
            return Err(Error::TokenConflict);
        }

        self.forward_tokens.write().await.insert(token.clone());
        info!("New forward proxy token added.");
        debug!("SHA256 for the token: {}", token_digest(&token));
        Ok(token)
    }

    /// Remove a token and disconnect all of its clients
    ///
    /// Returns false when the token is unknown.
    pub async fn remove_token(&self, token: &str) -> bool {
        let record = self.tokens.write().await.remove(token);
        if let Some(record) = record {
            let evicted: Vec<(Uuid, mpsc::Sender<WsMessage>)> = {
                let mut state = record.state.lock().await;
                state.cursor = 0;
                state.clients.drain(..).collect()
            };
            {
                let mut clients = self.clients.write().await;
                for (client_id, _) in &evicted {
                    clients.remove(client_id);
                }
            }
            for (_, sender) in evicted {
                let _ = sender
                    .send(close_frame(CloseCode::Normal, "Token removed"))
                    .await;
            }
            self.pending_tokens.lock().unwrap().retain(|t| t != token);

            let task = self.socks_tasks.lock().await.remove(&record.port);
            if let Some(task) = task {
                task.cancel.notify_one();
                let _ = task.handle.await;
            }
            self.port_pool.put(record.port);

            info!("Reverse token removed, port {} returned.", record.port);
            return true;
        }

        if self.forward_tokens.write().await.remove(token) {
            let evicted: Vec<_> = self.forward_clients.write().await.drain().collect();
            for (_, sender) in evicted {
                let _ = sender
                    .send(close_frame(CloseCode::Normal, "Token removed"))
                    .await;
            }
            info!("Forward token removed.");
            return true;
        }

        false
    }

    /// Start serving and wait for the WebSocket listener to be bound,
    /// returning the serve task
    pub async fn wait_ready(&self, wait: Option<Duration>) -> Result<JoinHandle<Result<()>>> {
        let server = self.clone();
        let handle = tokio::spawn(async move { server.serve().await });

        let notified = self.ready.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.ready_flag.load(Ordering::SeqCst) {
            match wait {
                Some(duration) => timeout(duration, notified)
                    .await
                    .map_err(|_| Error::Timeout("server ready"))?,
                None => notified.await,
            }
        }
        Ok(handle)
    }

    /// Start the server and run until close() is called
    pub async fn serve(&self) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);

        let pending: Vec<String> = std::mem::take(&mut *self.pending_tokens.lock().unwrap());
        for token in pending {
            self.handle_pending_token(&token, None).await;
        }

        let addr: SocketAddr =
            format!("{}:{}", self.options.ws_host, self.options.ws_port).parse()?;
        let server = self.clone();
        let make_svc = make_service_fn(move |conn: &AddrStream| {
            let server = server.clone();
            let remote = conn.remote_addr();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let server = server.clone();
                    async move { server.process_request(req, remote).await }
                }))
            }
        });

        let http = hyper::Server::try_bind(&addr)?.serve(make_svc);
        let bound = http.local_addr();
        *self.bound_addr.lock().unwrap() = Some(bound);

        info!("wssocks server {} started on: ws://{}", VERSION, bound);
        info!("Waiting for clients to connect.");
        self.ready_flag.store(true, Ordering::SeqCst);
        self.ready.notify_waiters();

        let shutdown = self.shutdown.clone();
        let result = http
            .with_graceful_shutdown(async move { shutdown.notified().await })
            .await;
        self.socket_manager.close().await;
        result.map_err(Error::from)
    }

    /// Stop the server: cancel supervisors, disconnect clients, close
    /// sockets
    pub async fn close(&self) {
        self.shutdown.notify_one();

        let tasks: Vec<SocksServerTask> = {
            let mut map = self.socks_tasks.lock().await;
            map.drain().map(|(_, task)| task).collect()
        };
        for task in tasks {
            task.cancel.notify_one();
            let _ = task.handle.await;
        }

        let clients: Vec<_> = self.clients.write().await.drain().collect();
        let forward: Vec<_> = self.forward_clients.write().await.drain().collect();
        for (_, sender) in clients.into_iter().chain(forward) {
            let _ = sender.send(WsMessage::Close(None)).await;
        }

        self.socket_manager.close().await;
    }

    /// Address the WebSocket listener bound, once serving
    pub fn ws_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock().unwrap()
    }

    /// Number of connected clients
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len() + self.forward_clients.read().await.len()
    }

    /// Number of clients connected for a given token
    pub async fn token_client_count(&self, token: &str) -> usize {
        if let Some(record) = self.tokens.read().await.get(token) {
            return record.state.lock().await.clients.len();
        }
        if self.forward_tokens.read().await.contains(token) {
            return self.forward_clients.read().await.len();
        }
        0
    }

    pub(crate) async fn reverse_token_count(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub(crate) async fn forward_token_count(&self) -> usize {
        self.forward_tokens.read().await.len()
    }

    /// Start the supervisor for an eagerly-started token
    async fn handle_pending_token(&self, token: &str, ready_event: Option<Arc<Notify>>) {
        if self.options.socks_wait_client {
            return;
        }
        let record = self.tokens.read().await.get(token).cloned();
        if let Some(record) = record {
            let _state = record.state.lock().await;
            self.ensure_socks_server(token, record.port, ready_event).await;
        }
    }

    /// Start the SOCKS supervisor for a port unless it is already running
    ///
    /// Callers hold the token state lock, which makes the check-and-start
    /// atomic per token.
    async fn ensure_socks_server(&self, token: &str, port: u16, ready_event: Option<Arc<Notify>>) {
        let mut tasks = self.socks_tasks.lock().await;
        if tasks.contains_key(&port) {
            if let Some(event) = ready_event {
                event.notify_one();
            }
            return;
        }

        let cancel = Arc::new(Notify::new());
        let server = self.clone();
        let token = token.to_string();
        let cancel_signal = cancel.clone();
        let handle = tokio::spawn(async move {
            server
                .run_socks_server(token, port, cancel_signal, ready_event)
                .await;
        });
        tasks.insert(port, SocksServerTask { cancel, handle });
    }

    /// SOCKS supervisor: accept TCP clients for one reverse port
    async fn run_socks_server(
        &self,
        token: String,
        port: u16,
        cancel: Arc<Notify>,
        ready_event: Option<Arc<Notify>>,
    ) {
        let listener = match self.socket_manager.acquire(port).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("SOCKS server error on port {}: {}", port, e);
                return;
            }
        };
        info!(
            "SOCKS5 server socket allocated on {}:{}",
            self.options.socks_host, port
        );
        if let Some(event) = &ready_event {
            event.notify_one();
        }

        let mut handlers: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                _ = cancel.notified() => break,
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("Accepted SOCKS5 connection from {}.", addr);
                        let server = self.clone();
                        let token = token.clone();
                        handlers.spawn(async move {
                            if let Err(e) = server.handle_socks_request(stream, addr, &token).await {
                                debug!("SOCKS request handler error: {}", e);
                            }
                        });
                    }
                    // Single accept failures do not tear down the supervisor
                    Err(e) => error!("Error accepting SOCKS connection: {}", e),
                },
            }
        }

        handlers.shutdown().await;
        self.socket_manager.release(port).await;
        info!(
            "SOCKS5 server released on {}:{}.",
            self.options.socks_host, port
        );
    }

    /// Serve one accepted SOCKS5 connection
    async fn handle_socks_request(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        token: &str,
    ) -> Result<()> {
        let record = self.tokens.read().await.get(token).cloned();
        let Some(record) = record else {
            // Token evicted while the connection was queued
            return self
                .relay
                .refuse_socks_request(stream, SOCKS_REPLY_NETWORK_UNREACHABLE)
                .await;
        };

        // Give a client a chance to attach before refusing
        let deadline = Instant::now() + self.options.client_wait_timeout;
        loop {
            if !record.state.lock().await.clients.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                debug!(
                    "No valid clients for token after waiting, refusing connection from {}",
                    addr
                );
                return self
                    .relay
                    .refuse_socks_request(stream, SOCKS_REPLY_NETWORK_UNREACHABLE)
                    .await;
            }
            sleep(CLIENT_POLL_INTERVAL).await;
        }

        let selected = record.state.lock().await.next_client();
        let Some((peer_id, sender)) = selected else {
            warn!("No available client for SOCKS5 port {}.", record.port);
            return self
                .relay
                .refuse_socks_request(stream, SOCKS_REPLY_NETWORK_UNREACHABLE)
                .await;
        };
        debug!("Handling request using client {}", peer_id);

        let (username, password) = match &record.auth {
            Some((user, pass)) => (Some(user.clone()), Some(pass.clone())),
            None => (None, None),
        };
        self.relay
            .handle_socks_request(sender, stream, username, password)
            .await
    }

    /// Handle one WebSocket connection from auth to cleanup
    pub(crate) async fn handle_websocket<S>(&self, ws: WebSocketStream<S>, remote: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        debug!("WebSocket connection from {}", remote);
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::channel::<WsMessage>(100);

        // Writer task owns the sink; a queued close frame ends it
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let is_close = matches!(msg, WsMessage::Close(_));
                if sink.send(msg).await.is_err() {
                    break;
                }
                if is_close {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let auth = self.authenticate(&mut stream, &tx).await;
        let Some((client_id, token, kind)) = auth else {
            drop(tx);
            let _ = writer.await;
            info!("Client (unauthenticated) disconnected.");
            return;
        };

        let mut dispatcher = tokio::spawn({
            let server = self.clone();
            let tx = tx.clone();
            async move { server.message_dispatcher(client_id, kind, stream, tx).await }
        });
        let mut heartbeat = tokio::spawn({
            let server = self.clone();
            let tx = tx.clone();
            async move { server.ws_heartbeat(client_id, tx).await }
        });

        tokio::select! {
            _ = &mut dispatcher => {
                heartbeat.abort();
                let _ = heartbeat.await;
            }
            _ = &mut heartbeat => {
                dispatcher.abort();
                let _ = dispatcher.await;
            }
        }

        // Make sure the WebSocket is closed on the way out
        let _ = tx.send(WsMessage::Close(None)).await;
        drop(tx);
        let _ = writer.await;

        info!("Client {} disconnected.", client_id);
        self.cleanup_connection(client_id, &token, kind).await;
    }

    /// Run the authentication exchange on a fresh connection
    ///
    /// Returns the registered client on success; on failure the rejection
    /// frames have already been queued and no state was touched.
    async fn authenticate<S>(
        &self,
        stream: &mut SplitStream<WebSocketStream<S>>,
        tx: &mpsc::Sender<WsMessage>,
    ) -> Option<(Uuid, String, SessionKind)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let first = loop {
            match stream.next().await? {
                Ok(WsMessage::Text(text)) => break text,
                Ok(WsMessage::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => break text,
                    Err(_) => {
                        let _ = tx
                            .send(close_frame(CloseCode::Policy, "Invalid auth message"))
                            .await;
                        return None;
                    }
                },
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => continue,
                Ok(_) => {
                    let _ = tx
                        .send(close_frame(CloseCode::Policy, "Invalid auth message"))
                        .await;
                    return None;
                }
                Err(e) => {
                    debug!("WebSocket error before authentication: {}", e);
                    return None;
                }
            }
        };

        let Ok(Envelope::Auth { token, reverse }) = Envelope::parse(&first) else {
            let _ = tx
                .send(close_frame(CloseCode::Policy, "Invalid auth message"))
                .await;
            return None;
        };

        if reverse {
            let record = self.tokens.read().await.get(&token).cloned();
            if let Some(record) = record {
                let client_id = Uuid::new_v4();
                {
                    let mut state = record.state.lock().await;
                    state.clients.push((client_id, tx.clone()));
                    // First client brings up the SOCKS listener for its port
                    self.ensure_socks_server(&token, record.port, None).await;
                }
                self.clients.write().await.insert(client_id, tx.clone());
                let _ = relay::send_frame(tx, &Envelope::AuthResponse { success: true }).await;
                info!("Reverse client {} authenticated", client_id);
                return Some((client_id, token, SessionKind::Reverse));
            }
        } else if self.forward_tokens.read().await.contains(&token) {
            let client_id = Uuid::new_v4();
            self.forward_clients.write().await.insert(client_id, tx.clone());
            let _ = relay::send_frame(tx, &Envelope::AuthResponse { success: true }).await;
            info!("Forward client {} authenticated", client_id);
            return Some((client_id, token, SessionKind::Forward));
        }

        let _ = relay::send_frame(tx, &Envelope::AuthResponse { success: false }).await;
        let _ = tx.send(close_frame(CloseCode::Policy, "Invalid token")).await;
        None
    }

    /// Receive loop distributing frames to channel queues and handlers
    async fn message_dispatcher<S>(
        &self,
        client_id: Uuid,
        kind: SessionKind,
        mut stream: SplitStream<WebSocketStream<S>>,
        tx: mpsc::Sender<WsMessage>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut handlers: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                received = timeout(RECV_TIMEOUT, stream.next()) => match received {
                    Err(_) => {
                        // Silence; probe the connection before giving up
                        if tx.send(WsMessage::Ping(Vec::new())).await.is_err() {
                            warn!("Connection timeout for client {}", client_id);
                            break;
                        }
                    }
                    Ok(None) => {
                        info!("Client {} connection closed.", client_id);
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        error!("WebSocket receive error for client {}: {}", client_id, e);
                        break;
                    }
                    Ok(Some(Ok(msg))) => match msg {
                        WsMessage::Text(text) => {
                            self.dispatch_frame(&text, client_id, kind, &tx, &mut handlers).await
                        }
                        WsMessage::Binary(data) => match String::from_utf8(data) {
                            Ok(text) => {
                                self.dispatch_frame(&text, client_id, kind, &tx, &mut handlers).await
                            }
                            Err(_) => {
                                debug!("Dropping non-UTF-8 binary frame from client {}", client_id)
                            }
                        },
                        WsMessage::Close(_) => {
                            info!("Client {} connection closed.", client_id);
                            break;
                        }
                        _ => {}
                    },
                },
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }
        handlers.shutdown().await;
    }

    /// Route one parsed frame
    async fn dispatch_frame(
        &self,
        text: &str,
        client_id: Uuid,
        kind: SessionKind,
        tx: &mpsc::Sender<WsMessage>,
        handlers: &mut JoinSet<()>,
    ) {
        let frame = match Envelope::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Unparseable frame from client {}: {}", client_id, e);
                return;
            }
        };

        match frame {
            Envelope::Data { channel_id, data } => {
                debug!("Received data for channel: {}", channel_id);
                let frame = Envelope::Data {
                    channel_id: channel_id.clone(),
                    data,
                };
                self.bus.deliver(&channel_id, frame);
            }
            Envelope::ConnectResponse {
                connect_id,
                success,
                error,
            } => {
                debug!("Received connection response for channel: {}", connect_id);
                let frame = Envelope::ConnectResponse {
                    connect_id: connect_id.clone(),
                    success,
                    error,
                };
                self.bus.deliver(&connect_id, frame);
            }
            Envelope::Connect {
                connect_id,
                address,
                port,
            } => {
                if kind != SessionKind::Forward {
                    debug!("Ignoring connect from reverse client {}", client_id);
                    return;
                }
                debug!("Received connection request for {}:{}", address, port);
                let relay = self.relay.clone();
                let tx = tx.clone();
                handlers.spawn(async move {
                    if let Err(e) = relay
                        .handle_network_connection(tx, connect_id, address, port)
                        .await
                    {
                        debug!("Network connection handler error: {}", e);
                    }
                });
            }
            other => debug!("Ignoring frame from client {}: {:?}", client_id, other),
        }
    }

    /// Periodic liveness probe for one session
    async fn ws_heartbeat(&self, client_id: Uuid, tx: mpsc::Sender<WsMessage>) {
        loop {
            if tx.send(WsMessage::Ping(Vec::new())).await.is_err() {
                info!("Heartbeat detected disconnection for client {}.", client_id);
                break;
            }
            sleep(HEARTBEAT_INTERVAL).await;
        }
    }

    /// Evict a disconnected client without stopping its SOCKS server
    ///
    /// The listen socket rides out the grace window so pending TCP clients
    /// stay queued for a reconnecting peer.
    async fn cleanup_connection(&self, client_id: Uuid, token: &str, kind: SessionKind) {
        match kind {
            SessionKind::Reverse => {
                let record = self.tokens.read().await.get(token).cloned();
                if let Some(record) = record {
                    let mut state = record.state.lock().await;
                    state.clients.retain(|(id, _)| *id != client_id);
                    if state.clients.is_empty() {
                        state.cursor = 0;
                    }
                }
                self.clients.write().await.remove(&client_id);
            }
            SessionKind::Forward => {
                self.forward_clients.write().await.remove(&client_id);
            }
        }
        debug!("Cleaned up resources for client {}.", client_id);
    }

    /// HTTP entry point: WebSocket upgrade, banner, admin API, 404
    async fn process_request(
        &self,
        req: Request<Body>,
        remote: SocketAddr,
    ) -> std::result::Result<Response<Body>, Infallible> {
        let path = req.uri().path();

        if path == "/socket" {
            return Ok(self.upgrade_websocket(req, remote));
        }

        if path.starts_with("/api/") {
            if let Some(key) = &self.options.api_key {
                let handler = ApiHandler::new(self.clone(), key.clone());
                return Ok(handler.handle_request(req).await);
            }
        }

        if path == "/" {
            let banner = if self.options.api_key.is_some() {
                format!("wssocks {} is running.\n", VERSION)
            } else {
                format!(
                    "wssocks {} is running but API is not enabled. Please check the documentation.\n",
                    VERSION
                )
            };
            return Ok(Response::new(Body::from(banner)));
        }

        Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("404 Not Found\n"))
            .unwrap())
    }

    /// Answer a WebSocket handshake on /socket and hand the upgraded
    /// stream to a session task
    fn upgrade_websocket(&self, req: Request<Body>, remote: SocketAddr) -> Response<Body> {
        let headers = req.headers();
        let is_upgrade = headers
            .get(UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        let version_ok = headers
            .get(SEC_WEBSOCKET_VERSION)
            .map(|v| v == "13")
            .unwrap_or(false);
        let key = headers.get(SEC_WEBSOCKET_KEY);

        let accept = match (is_upgrade && version_ok, key) {
            (true, Some(key)) => derive_accept_key(key.as_bytes()),
            _ => {
                return Response::builder()
                    .status(StatusCode::BAD_REQUEST)
                    .body(Body::from("Expected a WebSocket upgrade\n"))
                    .unwrap()
            }
        };

        let server = self.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let ws =
                        WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
                    server.handle_websocket(ws, remote).await;
                }
                Err(e) => debug!("WebSocket upgrade failed for {}: {}", remote, e),
            }
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(CONNECTION, "upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_ACCEPT, accept)
            .body(Body::empty())
            .unwrap()
    }
}

fn close_frame(code: CloseCode, reason: &'static str) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// Generate a random 16-character alphanumeric token
fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// Digest used when referring to a token in logs
fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_clients(n: usize) -> (TokenState, Vec<Uuid>) {
        let mut state = TokenState::default();
        let mut ids = Vec::new();
        for _ in 0..n {
            let (tx, _rx) = mpsc::channel(1);
            let id = Uuid::new_v4();
            // Receivers are dropped; only selection order matters here
            state.clients.push((id, tx));
            ids.push(id);
        }
        (state, ids)
    }

    #[test]
    fn round_robin_starts_at_the_second_client() {
        let (mut state, ids) = state_with_clients(3);
        let picks: Vec<Uuid> = (0..5)
            .map(|_| state.next_client().unwrap().0)
            .collect();
        assert_eq!(picks, vec![ids[1], ids[2], ids[0], ids[1], ids[2]]);
    }

    #[test]
    fn round_robin_single_client() {
        let (mut state, ids) = state_with_clients(1);
        assert_eq!(state.next_client().unwrap().0, ids[0]);
        assert_eq!(state.next_client().unwrap().0, ids[0]);
    }

    #[test]
    fn round_robin_empty() {
        let mut state = TokenState::default();
        assert!(state.next_client().is_none());
    }

    #[test]
    fn round_robin_is_fair() {
        let (mut state, ids) = state_with_clients(4);
        let mut counts = HashMap::new();
        for _ in 0..12 {
            let (id, _) = state.next_client().unwrap();
            *counts.entry(id).or_insert(0usize) += 1;
        }
        for id in ids {
            assert_eq!(counts[&id], 3);
        }
    }

    #[test]
    fn cursor_stays_in_bounds_after_shrink() {
        let (mut state, _) = state_with_clients(3);
        state.next_client();
        state.next_client();
        state.clients.truncate(1);
        assert!(state.next_client().is_some());
    }

    #[test]
    fn generated_tokens_are_alphanumeric() {
        let token = generate_token();
        assert_eq!(token.len(), 16);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
