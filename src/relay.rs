//! Relay core for wssocks
//!
//! Performs the SOCKS5 handshake on accepted TCP connections, runs the
//! `connect`/`connect_response` exchange with a WebSocket peer, and pumps
//! `data` frames between TCP sockets and WebSocket channels.

use crate::bus::{ChannelBus, ChannelSubscription};
use crate::error::{Error, Result};
use crate::message::{self, Envelope};
use bytes::BytesMut;
use log::{debug, error, trace};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Default buffer size for data transfer
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default timeout waiting for a connect_response
pub const DEFAULT_CHANNEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default outbound connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// SOCKS5 reply: succeeded
pub const SOCKS_REPLY_SUCCESS: u8 = 0x00;

/// SOCKS5 reply: network unreachable, used when no backend is available
pub const SOCKS_REPLY_NETWORK_UNREACHABLE: u8 = 0x03;

const SOCKS_REPLY_HOST_UNREACHABLE: u8 = 0x04;
const SOCKS_REPLY_REFUSED: u8 = 0x05;
const SOCKS_REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

const SOCKS_VERSION: u8 = 0x05;
const SOCKS_METHOD_NO_AUTH: u8 = 0x00;
const SOCKS_METHOD_USER_PASS: u8 = 0x02;
const SOCKS_METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const SOCKS_CMD_CONNECT: u8 = 0x01;

/// Relay options
#[derive(Clone)]
pub struct RelayOption {
    /// Buffer size for data transfer
    pub buffer_size: usize,

    /// Timeout waiting for the peer's connect_response
    pub channel_timeout: Duration,

    /// Outbound connect timeout
    pub connect_timeout: Duration,
}

impl Default for RelayOption {
    fn default() -> Self {
        RelayOption {
            buffer_size: DEFAULT_BUFFER_SIZE,
            channel_timeout: DEFAULT_CHANNEL_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl RelayOption {
    /// Set the buffer size
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
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
}

/// Serialize a frame and queue it on a session's writer channel
pub(crate) async fn send_frame(ws: &mpsc::Sender<WsMessage>, frame: &Envelope) -> Result<()> {
    let text = frame.to_text()?;
    ws.send(WsMessage::Text(text))
        .await
        .map_err(|_| Error::ConnectionClosed)
}

/// Relay pumps data between TCP sockets and WebSocket channels
pub struct Relay {
    options: RelayOption,
    bus: Arc<ChannelBus>,
}

impl Relay {
    /// Create a new Relay routing frames through `bus`
    pub fn new(options: RelayOption, bus: Arc<ChannelBus>) -> Self {
        Relay { options, bus }
    }

    /// Serve one SOCKS5 client socket through a WebSocket peer
    ///
    /// Runs the SOCKS5 handshake locally, asks the peer to open the target
    /// connection, relays its verdict as the SOCKS5 reply, then pumps data
    /// until either side closes.
    pub async fn handle_socks_request(
        &self,
        ws: mpsc::Sender<WsMessage>,
        mut stream: TcpStream,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<()> {
        let target = self
            .socks_handshake(&mut stream, username.as_deref(), password.as_deref())
            .await?;
        let Some((address, port)) = target else {
            return Ok(());
        };

        let channel_id = message::new_channel_id();
        let mut sub = self.bus.register(&channel_id);
        send_frame(
            &ws,
            &Envelope::Connect {
                connect_id: channel_id.clone(),
                address: address.clone(),
                port,
            },
        )
        .await?;
        debug!(
            "Requested connection to {}:{} on channel {}",
            address, port, channel_id
        );

        match timeout(self.options.channel_timeout, sub.recv()).await {
            Ok(Some(Envelope::ConnectResponse { success: true, .. })) => {
                socks_reply(&mut stream, SOCKS_REPLY_SUCCESS).await?;
            }
            Ok(Some(Envelope::ConnectResponse { error, .. })) => {
                debug!(
                    "Peer could not reach {}:{}: {}",
                    address,
                    port,
                    error.unwrap_or_else(|| "unknown error".to_string())
                );
                socks_reply(&mut stream, SOCKS_REPLY_REFUSED).await?;
                return Ok(());
            }
            Ok(Some(other)) => {
                debug!(
                    "Unexpected frame while connecting channel {}: {:?}",
                    channel_id, other
                );
                socks_reply(&mut stream, SOCKS_REPLY_REFUSED).await?;
                return Ok(());
            }
            Ok(None) => {
                socks_reply(&mut stream, SOCKS_REPLY_REFUSED).await?;
                return Ok(());
            }
            Err(_) => {
                debug!(
                    "Timed out waiting for connect_response on channel {}",
                    channel_id
                );
                socks_reply(&mut stream, SOCKS_REPLY_HOST_UNREACHABLE).await?;
                return Ok(());
            }
        }

        self.pump(stream, ws, channel_id, sub).await
    }

    /// Complete a minimal SOCKS5 exchange and refuse with the given reply
    /// code
    pub async fn refuse_socks_request(&self, mut stream: TcpStream, reply: u8) -> Result<()> {
        let methods = read_greeting(&mut stream).await?;
        if !methods.contains(&SOCKS_METHOD_NO_AUTH) {
            stream
                .write_all(&[SOCKS_VERSION, SOCKS_METHOD_NONE_ACCEPTABLE])
                .await?;
            return Ok(());
        }
        stream
            .write_all(&[SOCKS_VERSION, SOCKS_METHOD_NO_AUTH])
            .await?;
        let _ = read_request(&mut stream).await?;
        socks_reply(&mut stream, reply).await?;
        let _ = stream.shutdown().await;
        Ok(())
    }

    /// Open an outbound TCP connection on behalf of a forward peer and pump
    /// data for it
    pub async fn handle_network_connection(
        &self,
        ws: mpsc::Sender<WsMessage>,
        connect_id: String,
        address: String,
        port: u16,
    ) -> Result<()> {
        debug!("Connecting to {}:{} for channel {}", address, port, connect_id);
        let dial = timeout(
            self.options.connect_timeout,
            TcpStream::connect((address.as_str(), port)),
        )
        .await;

        let stream = match dial {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("Connection to {}:{} failed: {}", address, port, e);
                send_frame(
                    &ws,
                    &Envelope::ConnectResponse {
                        connect_id,
                        success: false,
                        error: Some(e.to_string()),
                    },
                )
                .await?;
                return Ok(());
            }
            Err(_) => {
                debug!("Connection to {}:{} timed out", address, port);
                send_frame(
                    &ws,
                    &Envelope::ConnectResponse {
                        connect_id,
                        success: false,
                        error: Some("connection timed out".to_string()),
                    },
                )
                .await?;
                return Ok(());
            }
        };

        // Register before confirming so the first data frame cannot race us
        let sub = self.bus.register(&connect_id);
        send_frame(
            &ws,
            &Envelope::ConnectResponse {
                connect_id: connect_id.clone(),
                success: true,
                error: None,
            },
        )
        .await?;

        self.pump(stream, ws, connect_id, sub).await
    }

    /// Pump bytes both ways between a TCP stream and a WebSocket channel
    async fn pump(
        &self,
        stream: TcpStream,
        ws: mpsc::Sender<WsMessage>,
        channel_id: String,
        mut sub: ChannelSubscription,
    ) -> Result<()> {
        let (mut rd, mut wr) = stream.into_split();
        let buffer_size = self.options.buffer_size;

        let tcp_to_ws = async {
            let mut buf = BytesMut::with_capacity(buffer_size);
            loop {
                buf.clear();
                let n = match rd.read_buf(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => {
                        debug!("TCP read error on channel {}: {}", channel_id, e);
                        break;
                    }
                };
                if n == 0 {
                    break;
                }
                let frame = Envelope::data(&channel_id, &buf);
                let text = match frame.to_text() {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to serialize data frame: {}", e);
                        break;
                    }
                };
                if ws.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
        };

        let ws_to_tcp = async {
            while let Some(frame) = sub.recv().await {
                let Envelope::Data { data, .. } = frame else {
                    continue;
                };
                match message::decode_payload(&data) {
                    Ok(bytes) => {
                        if wr.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Undecodable data frame on channel {}: {}", channel_id, e)
                    }
                }
            }
            let _ = wr.shutdown().await;
        };

        tokio::select! {
            _ = tcp_to_ws => {}
            _ = ws_to_tcp => {}
        }
        trace!("Channel {} finished", channel_id);
        Ok(())
    }

    /// Negotiate the SOCKS5 greeting and read the CONNECT request
    ///
    /// Returns the requested target, or `None` when the request was already
    /// answered with a refusal.
    async fn socks_handshake(
        &self,
        stream: &mut TcpStream,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Option<(String, u16)>> {
        let methods = read_greeting(stream).await?;

        if let (Some(user), Some(pass)) = (username, password) {
            if !methods.contains(&SOCKS_METHOD_USER_PASS) {
                stream
                    .write_all(&[SOCKS_VERSION, SOCKS_METHOD_NONE_ACCEPTABLE])
                    .await?;
                return Ok(None);
            }
            stream
                .write_all(&[SOCKS_VERSION, SOCKS_METHOD_USER_PASS])
                .await?;
            if !check_user_pass(stream, user, pass).await? {
                debug!("SOCKS5 authentication failed");
                return Ok(None);
            }
        } else {
            if !methods.contains(&SOCKS_METHOD_NO_AUTH) {
                stream
                    .write_all(&[SOCKS_VERSION, SOCKS_METHOD_NONE_ACCEPTABLE])
                    .await?;
                return Ok(None);
            }
            stream
                .write_all(&[SOCKS_VERSION, SOCKS_METHOD_NO_AUTH])
                .await?;
        }

        let (cmd, address, port) = read_request(stream).await?;
        if cmd != SOCKS_CMD_CONNECT {
            socks_reply(stream, SOCKS_REPLY_COMMAND_NOT_SUPPORTED).await?;
            return Ok(None);
        }
        Ok(Some((address, port)))
    }
}

async fn read_greeting(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(Error::Socks(format!("unsupported version {}", head[0])));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    Ok(methods)
}

/// RFC 1929 username/password subnegotiation
async fn check_user_pass(stream: &mut TcpStream, user: &str, pass: &str) -> Result<bool> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != 0x01 {
        return Err(Error::Socks(format!(
            "unsupported auth subnegotiation version {}",
            head[0]
        )));
    }
    let mut uname = vec![0u8; head[1] as usize];
    stream.read_exact(&mut uname).await?;
    let mut plen = [0u8; 1];
    stream.read_exact(&mut plen).await?;
    let mut passwd = vec![0u8; plen[0] as usize];
    stream.read_exact(&mut passwd).await?;

    let ok = uname == user.as_bytes() && passwd == pass.as_bytes();
    stream.write_all(&[0x01, if ok { 0x00 } else { 0x01 }]).await?;
    Ok(ok)
}

async fn read_request(stream: &mut TcpStream) -> Result<(u8, String, u16)> {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(Error::Socks(format!("unsupported version {}", head[0])));
    }
    let address = match head[3] {
        0x01 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            std::net::Ipv4Addr::from(addr).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain)
                .map_err(|_| Error::Socks("invalid domain name".to_string()))?
        }
        0x04 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            std::net::Ipv6Addr::from(addr).to_string()
        }
        other => {
            return Err(Error::Socks(format!("unsupported address type {}", other)));
        }
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok((head[1], address, u16::from_be_bytes(port)))
}

async fn socks_reply(stream: &mut TcpStream, code: u8) -> Result<()> {
    stream
        .write_all(&[SOCKS_VERSION, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn relay() -> Relay {
        Relay::new(RelayOption::default(), Arc::new(ChannelBus::new()))
    }

    #[tokio::test]
    async fn refusal_sends_the_given_reply_code() {
        let (mut client, server) = tcp_pair().await;
        let relay = relay();
        let task = tokio::spawn(async move {
            relay
                .refuse_socks_request(server, SOCKS_REPLY_NETWORK_UNREACHABLE)
                .await
        });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x00]);

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x05);
        assert_eq!(reply[1], SOCKS_REPLY_NETWORK_UNREACHABLE);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wrong_password_fails_subnegotiation() {
        let (mut client, mut server) = tcp_pair().await;
        let relay = relay();
        let task = tokio::spawn(async move {
            relay
                .socks_handshake(&mut server, Some("user"), Some("secret"))
                .await
        });

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x02]);

        client
            .write_all(&[0x01, 0x04, b'u', b's', b'e', b'r', 0x05, b'w', b'r', b'o', b'n', b'g'])
            .await
            .unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, 0x01]);

        assert!(task.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn auth_required_but_not_offered() {
        let (mut client, mut server) = tcp_pair().await;
        let relay = relay();
        let task = tokio::spawn(async move {
            relay
                .socks_handshake(&mut server, Some("user"), Some("secret"))
                .await
        });

        // Client only offers no-auth
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, SOCKS_METHOD_NONE_ACCEPTABLE]);
        assert!(task.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn non_connect_command_is_rejected() {
        let (mut client, mut server) = tcp_pair().await;
        let relay = relay();
        let task =
            tokio::spawn(async move { relay.socks_handshake(&mut server, None, None).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x00]);

        // BIND request
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], SOCKS_REPLY_COMMAND_NOT_SUPPORTED);
        assert!(task.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn domain_request_is_parsed() {
        let (mut client, mut server) = tcp_pair().await;
        let relay = relay();
        let task =
            tokio::spawn(async move { relay.socks_handshake(&mut server, None, None).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();

        let mut req = vec![0x05, 0x01, 0x00, 0x03, 0x0B];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let target = task.await.unwrap().unwrap();
        assert_eq!(target, Some(("example.com".to_string(), 80)));
    }
}
