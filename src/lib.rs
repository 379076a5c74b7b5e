//! SOCKS5 over WebSocket relay server

pub mod api;
pub mod bus;
pub mod cli;
pub mod error;
pub mod message;
pub mod portpool;
pub mod relay;
pub mod server;
pub mod socket;
pub mod version;

// Re-export commonly used items
pub use crate::cli::Cli;
pub use crate::error::{Error, Result};
pub use crate::portpool::PortPool;
pub use crate::server::{ReverseTokenOptions, ServerOption, WsSocksServer};
pub use crate::version::VERSION;

#[cfg(test)]
mod tests {
    pub mod support;

    pub mod admin_test;
    pub mod forward_test;
    pub mod http_test;
    pub mod reverse_test;
    pub mod session_test;
}
