//! Error types for wssocks

use thiserror::Error;

/// Errors produced by the server and relay
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP server error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid listen address: {0}")]
    Addr(#[from] std::net::AddrParseError),

    #[error("no port available in the pool")]
    NoPortAvailable,

    #[error("port {0} is not available")]
    PortUnavailable(u16),

    #[error("token already exists with a different kind")]
    TokenConflict,

    #[error("SOCKS protocol error: {0}")]
    Socks(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
