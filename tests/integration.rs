//! End-to-end tests over localhost sockets

#![allow(clippy::unwrap_used, clippy::expect_used)]

use gamewire::config::NetworkConfig;
use gamewire::core::uint24::UInt24;
use gamewire::error::ProtocolError;
use gamewire::protocol::dispatcher::Dispatcher;
use gamewire::protocol::handshake::{respond, CHALLENGE_LEN};
use gamewire::protocol::message::{Message, TYPE_BROADCAST};
use gamewire::protocol::pipeline::CodecPipeline;
use gamewire::transport::client::Client;
use gamewire::transport::connection::ConnectionEvent;
use gamewire::transport::server::{Server, ServerHandle};
use gamewire::utils::compression::CompressionKind;
use gamewire::utils::crypto::EncryptionKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> NetworkConfig {
    NetworkConfig::default_with_overrides(|config| {
        config.server.address = "127.0.0.1:0".to_string();
        config.server.shutdown_timeout = Duration::from_secs(1);
        config.queue.workers = 2;
        config.client.connection_timeout = Duration::from_secs(2);
        config.client.response_timeout = Duration::from_secs(2);
    })
}

async fn start(
    config: &NetworkConfig,
    pipeline: &Arc<CodecPipeline>,
    dispatcher: Dispatcher,
) -> (ServerHandle, mpsc::Sender<()>) {
    let (stop_tx, stop_rx) = mpsc::channel(1);
    let handle = Server::new(config.clone(), pipeline.clone(), Arc::new(dispatcher))
        .start(stop_rx)
        .await
        .expect("server starts");
    (handle, stop_tx)
}

async fn connect(
    config: &NetworkConfig,
    server: &ServerHandle,
    pipeline: &Arc<CodecPipeline>,
    dispatcher: Dispatcher,
) -> Client {
    let mut config = config.clone();
    config.client.address = server.local_addr().to_string();
    let client = Client::connect(config, pipeline.clone(), Arc::new(dispatcher))
        .await
        .expect("client connects");

    // The registry insert may trail the client seeing its id
    let registered = tokio::time::timeout(WAIT, async {
        while server.connection(client.id()).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(registered.is_ok(), "server never registered the client");
    client
}

#[tokio::test]
async fn test_hello_scenario_over_tcp() {
    let pipeline = Arc::new(
        CodecPipeline::new(EncryptionKind::Aes256Cbc, Some(b"integration"), CompressionKind::Lz4).unwrap(),
    );
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::new()
        .with_head_action(5, "hello", move |msg, conn| {
            let text = msg.get::<String>()?;
            let number = msg.get::<i32>()?;
            let _ = seen_tx.send((text, number, msg.client_id(), conn.id()));
            Ok(None)
        })
        .unwrap();

    let config = test_config();
    let (server, _stop) = start(&config, &pipeline, dispatcher).await;
    let client = connect(&config, &server, &pipeline, Dispatcher::new()).await;

    let mut hello = Message::new(5);
    hello.set("hello").unwrap().set(42i32).unwrap();
    client.send(&mut hello).unwrap();

    let (text, number, client_id, conn_id) = tokio::time::timeout(WAIT, seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(text, "hello");
    assert_eq!(number, 42);
    assert_eq!(client_id, client.id());
    assert_eq!(conn_id, client.id());

    client.disconnect().await;
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_request_reply_round_trip() {
    let pipeline = Arc::new(CodecPipeline::passthrough());
    let dispatcher = Dispatcher::new()
        .with_head_action(20, "double", |req, _| {
            let n = req.get::<i64>()?;
            Ok(Some(Message::reply_to(req).with(n * 2)?))
        })
        .unwrap();

    let config = test_config();
    let (server, _stop) = start(&config, &pipeline, dispatcher).await;
    let client = connect(&config, &server, &pipeline, Dispatcher::new()).await;

    for n in [1i64, 21, -7] {
        let mut reply = client.request(&mut Message::new(20).with(n).unwrap()).await.unwrap();
        assert_eq!(reply.get::<i64>().unwrap(), n * 2);
        assert_eq!(reply.head_id(), 20);
    }
    assert!(client.connection().replies().is_empty());

    client.disconnect().await;
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unhandled_request_answered_false() {
    let pipeline = Arc::new(CodecPipeline::passthrough());
    let config = test_config();
    let (server, _stop) = start(&config, &pipeline, Dispatcher::new()).await;
    let client = connect(&config, &server, &pipeline, Dispatcher::new()).await;

    let mut answer = client.request(&mut Message::new(99)).await.unwrap();
    assert_eq!(answer.head_id(), 99);
    assert!(!answer.get::<bool>().unwrap());
    assert_eq!(server.metrics().snapshot().unhandled, 1);

    client.disconnect().await;
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_server_initiated_request_resolves_on_server() {
    let pipeline = Arc::new(CodecPipeline::passthrough());
    let config = test_config();
    let (server, _stop) = start(&config, &pipeline, Dispatcher::new()).await;

    let client_dispatcher = Dispatcher::new()
        .with_head_action(33, "increment", |req, _| {
            let n = req.get::<u32>()?;
            Ok(Some(Message::reply_to(req).with(n + 1)?))
        })
        .unwrap();
    let client = connect(&config, &server, &pipeline, client_dispatcher).await;

    let conn = server.connection(client.id()).unwrap();
    let mut reply = conn
        .request(&mut Message::new(33).with(9u32).unwrap(), WAIT)
        .await
        .unwrap();
    assert_eq!(reply.get::<u32>().unwrap(), 10);

    client.disconnect().await;
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_group_broadcast_excludes_sender() {
    let pipeline = Arc::new(CodecPipeline::passthrough());
    let config = test_config();
    let (server, _stop) = start(&config, &pipeline, Dispatcher::new()).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<(u8, u16)>();
    let mut clients = Vec::new();
    for tag in 0u8..3 {
        let tx = tx.clone();
        let dispatcher = Dispatcher::new()
            .with_head_action(60, "position", move |msg, _| {
                let _ = tx.send((tag, msg.get::<u16>()?));
                Ok(None)
            })
            .unwrap();
        clients.push(connect(&config, &server, &pipeline, dispatcher).await);
    }

    assert!(server.join_group(clients[0].id(), 9));
    assert!(server.join_group(clients[1].id(), 9));
    assert!(server.join_group(clients[2].id(), 10));

    let mut update = Message::new(60).with(512u16).unwrap();
    update.set_type_id(UInt24::new(TYPE_BROADCAST).unwrap());
    clients[0].send(&mut update).unwrap();

    let got = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(got, (1, 512));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "only the other group member receives it");

    for client in clients {
        client.disconnect().await;
    }
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wrong_handshake_key_rejected() {
    let pipeline = Arc::new(CodecPipeline::passthrough());
    let config = test_config();
    let (server, _stop) = start(&config, &pipeline, Dispatcher::new()).await;

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut challenge = [0u8; CHALLENGE_LEN];
    stream.read_exact(&mut challenge).await.unwrap();
    let mut key = respond(challenge);
    key[0] ^= 0xFF;
    stream.write_all(&key).await.unwrap();

    // The server closes without sending an id
    let mut rest = Vec::new();
    let read = tokio::time::timeout(WAIT, stream.read_to_end(&mut rest)).await.unwrap();
    assert!(read.is_err() || rest.is_empty());

    let failed = tokio::time::timeout(WAIT, async {
        while server.metrics().snapshot().handshakes_failed == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(failed.is_ok());
    assert!(server.connections().is_empty());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connect_to_closed_port_fails() {
    let mut config = test_config();
    config.client.address = "127.0.0.1:1".to_string();
    let result = Client::connect(
        config,
        Arc::new(CodecPipeline::passthrough()),
        Arc::new(Dispatcher::new()),
    )
    .await;
    assert!(matches!(
        result,
        Err(ProtocolError::Io(_)) | Err(ProtocolError::Timeout)
    ));
}

#[tokio::test]
async fn test_disconnect_events() {
    let pipeline = Arc::new(CodecPipeline::passthrough());
    let config = test_config();
    let (server, _stop) = start(&config, &pipeline, Dispatcher::new()).await;
    let mut events = server.events();

    let client = connect(&config, &server, &pipeline, Dispatcher::new()).await;
    let id = client.id();
    assert_eq!(
        tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap(),
        ConnectionEvent::Connected(id)
    );

    client.disconnect().await;
    assert_eq!(
        tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap(),
        ConnectionEvent::Disconnected(id)
    );
    assert!(server.connection(id).is_none());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_datagram_reaches_server_handler() {
    let pipeline = Arc::new(CodecPipeline::passthrough());
    let mut config = test_config();
    config.server.udp_enabled = true;
    config.client.udp_enabled = true;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::new()
        .with_head_action(40, "state", move |msg, conn| {
            let _ = seen_tx.send((msg.get::<f32>()?, conn.id()));
            Ok(None)
        })
        .unwrap();
    let (server, _stop) = start(&config, &pipeline, dispatcher).await;
    assert!(server.udp_addr().is_some());
    let client = connect(&config, &server, &pipeline, Dispatcher::new()).await;

    // Datagrams are unreliable; resend until one lands
    let received = tokio::time::timeout(WAIT, async {
        loop {
            client
                .send_datagram(&mut Message::new(40).with(0.5f32).unwrap())
                .unwrap();
            if let Ok(Some(seen)) = tokio::time::timeout(Duration::from_millis(100), seen_rx.recv()).await {
                return seen;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(received, (0.5, client.id()));
    assert!(server.metrics().snapshot().datagrams_received >= 1);

    client.disconnect().await;
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_signal_stops_accepting() {
    let pipeline = Arc::new(CodecPipeline::passthrough());
    let config = test_config();
    let (server, stop) = start(&config, &pipeline, Dispatcher::new()).await;
    let client = connect(&config, &server, &pipeline, Dispatcher::new()).await;
    let mut events = client.events();

    stop.send(()).await.unwrap();
    assert_eq!(
        tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap(),
        ConnectionEvent::Disconnected(client.id())
    );
    assert!(!client.is_connected());
    server.shutdown().await.unwrap();
}
