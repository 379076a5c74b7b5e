//! Shared helpers for server tests

use crate::message::Envelope;
use crate::server::{ServerOption, WsSocksServer};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on an ephemeral WebSocket port and wait until it is ready
pub async fn start_server(options: ServerOption) -> (WsSocksServer, SocketAddr) {
    let server = WsSocksServer::new(
        options
            .with_ws_host("127.0.0.1".to_string())
            .with_ws_port(0),
    );
    let _serve_task = server
        .wait_ready(Some(Duration::from_secs(5)))
        .await
        .expect("server did not become ready");
    let addr = server.ws_addr().expect("server address not recorded");
    (server, addr)
}

/// Open a WebSocket connection to the server's /socket endpoint
pub async fn connect_ws(addr: SocketAddr) -> WsClient {
    let url = format!("ws://{}/socket", addr);
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("WebSocket connect failed");
    ws
}

/// Send one protocol frame
pub async fn send_frame(ws: &mut WsClient, frame: &Envelope) {
    ws.send(WsMessage::Text(frame.to_text().unwrap()))
        .await
        .expect("WebSocket send failed");
}

/// Receive the next protocol frame, skipping control frames
pub async fn recv_frame(ws: &mut WsClient) -> Envelope {
    loop {
        match ws.next().await.expect("connection ended").expect("WebSocket error") {
            WsMessage::Text(text) => return Envelope::parse(&text).expect("unparseable frame"),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected message: {:?}", other),
        }
    }
}

/// Read until the server closes the connection, returning the close frame
pub async fn recv_close(ws: &mut WsClient) -> Option<CloseFrame<'static>> {
    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Close(frame))) => return frame,
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

/// Authenticate a connection and expect success
pub async fn authenticate(ws: &mut WsClient, token: &str, reverse: bool) {
    send_frame(
        ws,
        &Envelope::Auth {
            token: token.to_string(),
            reverse,
        },
    )
    .await;
    match recv_frame(ws).await {
        Envelope::AuthResponse { success: true } => {}
        other => panic!("authentication failed: {:?}", other),
    }
}
