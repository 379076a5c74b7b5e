//! End-to-end tests for the reverse proxy path

use crate::message::Envelope;
use crate::portpool::PortPool;
use crate::server::{ReverseTokenOptions, ServerOption};
use crate::tests::support::{connect_ws, start_server};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Run a scripted reverse peer: accepts every connect and echoes data back
///
/// This plays the remote side of the relay, standing in for a network that
/// reflects whatever is sent to it.
async fn run_echo_peer(addr: SocketAddr, token: String) {
    let mut ws = connect_ws(addr).await;
    ws.send(WsMessage::Text(
        Envelope::Auth {
            token,
            reverse: true,
        }
        .to_text()
        .unwrap(),
    ))
    .await
    .unwrap();

    while let Some(Ok(msg)) = ws.next().await {
        let text = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let reply = match Envelope::parse(&text) {
            Ok(Envelope::Connect { connect_id, .. }) => Envelope::ConnectResponse {
                connect_id,
                success: true,
                error: None,
            },
            Ok(Envelope::Data { channel_id, data }) => Envelope::Data { channel_id, data },
            _ => continue,
        };
        if ws
            .send(WsMessage::Text(reply.to_text().unwrap()))
            .await
            .is_err()
        {
            break;
        }
    }
}

/// Connect to a freshly started SOCKS listener, retrying while it comes up
async fn connect_socks(port: u16) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
            return stream;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("SOCKS listener on port {} never came up", port);
}

/// Drive the no-auth SOCKS5 handshake for a CONNECT to 9.9.9.9:99 and
/// return the reply code
async fn socks_connect_request(stream: &mut TcpStream) -> u8 {
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x00]);

    stream
        .write_all(&[0x05, 0x01, 0x00, 0x01, 9, 9, 9, 9, 0x00, 0x63])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    reply[1]
}

#[tokio::test]
async fn reverse_socks5_end_to_end() {
    let pool = PortPool::new_from_ports([38471]);
    let (server, addr) = start_server(ServerOption::default().with_port_pool(pool)).await;
    let result = server
        .add_reverse_token(ReverseTokenOptions::default())
        .await
        .unwrap();

    tokio::spawn(run_echo_peer(addr, result.token.clone()));

    // The supervisor starts when the peer authenticates
    let mut stream = connect_socks(result.port).await;
    let reply = socks_connect_request(&mut stream).await;
    assert_eq!(reply, 0x00);

    // Bytes flow out through the peer and come back mirrored
    stream.write_all(b"hello").await.unwrap();
    let mut echoed = [0u8; 5];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello");

    stream.write_all(b"again").await.unwrap();
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"again");

    server.close().await;
}

#[tokio::test]
async fn cold_accept_with_no_clients_is_refused_with_reply_3() {
    let pool = PortPool::new_from_ports([38473]);
    let options = ServerOption::default()
        .with_port_pool(pool)
        .with_socks_wait_client(false)
        .with_client_wait_timeout(Duration::from_millis(300));

    let server = crate::server::WsSocksServer::new(
        options
            .with_ws_host("127.0.0.1".to_string())
            .with_ws_port(0),
    );
    // Token added before serving lands in the pending set
    let result = server
        .add_reverse_token(ReverseTokenOptions::default())
        .await
        .unwrap();
    let _serve_task = server
        .wait_ready(Some(Duration::from_secs(5)))
        .await
        .unwrap();

    let mut stream = connect_socks(result.port).await;
    let reply = socks_connect_request(&mut stream).await;
    assert_eq!(reply, 0x03);

    // The refused connection is closed
    let mut rest = [0u8; 1];
    let n = stream.read(&mut rest).await.unwrap_or(0);
    assert_eq!(n, 0);

    server.close().await;
}

#[tokio::test]
async fn requests_rotate_across_peers() {
    let pool = PortPool::new_from_ports([38475]);
    let (server, addr) = start_server(ServerOption::default().with_port_pool(pool)).await;
    let result = server
        .add_reverse_token(ReverseTokenOptions::default())
        .await
        .unwrap();

    // Three echo peers; each request should land on a different one
    for _ in 0..3 {
        tokio::spawn(run_echo_peer(addr, result.token.clone()));
    }
    for _ in 0..50 {
        if server.token_client_count(&result.token).await == 3 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(server.token_client_count(&result.token).await, 3);

    // Every request succeeds regardless of which peer serves it
    for _ in 0..5 {
        let mut stream = connect_socks(result.port).await;
        let reply = socks_connect_request(&mut stream).await;
        assert_eq!(reply, 0x00);
        stream.write_all(b"ab").await.unwrap();
        let mut echoed = [0u8; 2];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ab");
    }

    server.close().await;
}
