//! Command-line interface for wssocks

use crate::server::{ReverseTokenOptions, ServerOption, WsSocksServer};
use crate::version::{platform, VERSION};
use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};
use std::error::Error;
use std::time::Duration;
use tokio::signal;
use tokio::time::sleep;

/// Cli represents the command-line interface for wssocks
pub struct Cli {
    app: App,
}

/// SOCKS5 over WebSocket relay server
#[derive(Parser)]
#[clap(version = VERSION, about = "SOCKS5 over WebSocket relay server")]
struct App {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the version number
    Version,

    /// Start the SOCKS5 over WebSocket relay server
    Server {
        /// WebSocket server listen address
        #[clap(short = 'H', long, default_value = "0.0.0.0")]
        ws_host: String,

        /// WebSocket server listen port
        #[clap(short = 'P', long = "port", alias = "ws-port", default_value = "8765")]
        ws_port: u16,

        /// Specify auth token, auto-generate if not provided
        #[clap(short = 't', long)]
        token: Option<String>,

        /// Set buffer size for data transfer
        #[clap(short = 'b', long, default_value = "8192")]
        buffer_size: usize,

        /// Use reverse socks5 proxy
        #[clap(short = 'r', long)]
        reverse: bool,

        /// SOCKS5 server listen address for reverse proxy
        #[clap(short = 's', long, default_value = "127.0.0.1")]
        socks_host: String,

        /// SOCKS5 server listen port for reverse proxy
        #[clap(short = 'p', long = "socks-port", default_value = "9870")]
        socks_port: u16,

        /// SOCKS5 username for authentication
        #[clap(short = 'n', long)]
        socks_username: Option<String>,

        /// SOCKS5 password for authentication
        #[clap(short = 'w', long)]
        socks_password: Option<String>,

        /// Start the SOCKS server immediately
        #[clap(short = 'i', long)]
        socks_nowait: bool,

        /// Seconds a released SOCKS listen socket is kept for reuse
        #[clap(short = 'g', long, default_value = "30")]
        socks_grace: u64,

        /// Show debug logs (use -dd for trace logs)
        #[clap(short = 'd', long, action = clap::ArgAction::Count)]
        debug: u8,

        /// Enable HTTP API with the specified key
        #[clap(short = 'k', long)]
        api_key: Option<String>,
    },
}

/// Collected server command arguments
struct ServerRunConfig {
    ws_host: String,
    ws_port: u16,
    token: Option<String>,
    buffer_size: usize,
    reverse: bool,
    socks_host: String,
    socks_port: u16,
    socks_username: Option<String>,
    socks_password: Option<String>,
    socks_nowait: bool,
    socks_grace: u64,
    api_key: Option<String>,
}

impl Cli {
    /// Create a new Cli from the process arguments
    pub fn new() -> Self {
        Cli { app: App::parse() }
    }

    /// Execute the selected command
    pub fn execute(&self) -> Result<(), Box<dyn Error>> {
        match &self.app.command {
            Commands::Version => {
                println!("wssocks {} {}", VERSION, platform());
                Ok(())
            }
            Commands::Server {
                ws_host,
                ws_port,
                token,
                buffer_size,
                reverse,
                socks_host,
                socks_port,
                socks_username,
                socks_password,
                socks_nowait,
                socks_grace,
                debug,
                api_key,
            } => {
                self.init_logging(*debug);
                let config = ServerRunConfig {
                    ws_host: ws_host.clone(),
                    ws_port: *ws_port,
                    token: token.clone(),
                    buffer_size: *buffer_size,
                    reverse: *reverse,
                    socks_host: socks_host.clone(),
                    socks_port: *socks_port,
                    socks_username: socks_username.clone(),
                    socks_password: socks_password.clone(),
                    socks_nowait: *socks_nowait,
                    socks_grace: *socks_grace,
                    api_key: api_key.clone(),
                };
                self.run_server(config)
            }
        }
    }

    /// Initialize logging with the appropriate level
    fn init_logging(&self, debug_level: u8) {
        let level = match debug_level {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        env_logger::Builder::new()
            .format_timestamp_millis()
            .filter_level(level)
            .init();
    }

    /// Run the server with the given options
    #[tokio::main]
    async fn run_server(&self, config: ServerRunConfig) -> Result<(), Box<dyn Error>> {
        let mut server_opt = ServerOption::default()
            .with_ws_host(config.ws_host.clone())
            .with_ws_port(config.ws_port)
            .with_socks_host(config.socks_host.clone())
            .with_buffer_size(config.buffer_size)
            .with_socks_wait_client(!config.socks_nowait)
            .with_socks_grace(Duration::from_secs(config.socks_grace));

        if let Some(ref key) = config.api_key {
            server_opt = server_opt.with_api(key.clone());
        }

        let server = WsSocksServer::new(server_opt);

        // With the API enabled, tokens are managed over HTTP instead
        if config.api_key.is_none() {
            if config.reverse {
                let opts = ReverseTokenOptions {
                    token: config.token.clone(),
                    port: Some(config.socks_port),
                    username: config.socks_username.clone(),
                    password: config.socks_password.clone(),
                };
                let result = server.add_reverse_token(opts).await?;

                info!("Configuration:");
                info!("  Mode: reverse proxy (SOCKS5 on server -> client -> network)");
                info!("  Token: {}", result.token);
                info!("  SOCKS5 port: {}", result.port);
                if let (Some(username), Some(_)) =
                    (config.socks_username.as_ref(), config.socks_password.as_ref())
                {
                    info!("  SOCKS5 username: {}", username);
                }
            } else {
                let token = server.add_forward_token(config.token.clone()).await?;
                info!("Configuration:");
                info!("  Mode: forward proxy (SOCKS5 on client -> server -> network)");
                info!("  Token: {}", token);
            }
        }

        let _serve_task = server.wait_ready(None).await?;

        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutting down server...");
                server.close().await;
                sleep(Duration::from_millis(100)).await;
                Ok(())
            }
            Err(err) => {
                error!("Error waiting for Ctrl+C: {}", err);
                Err(err.into())
            }
        }
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self::new()
    }
}
