//! Integration tests for the broker socket server

use hwbroker::client::{BrokerClient, RemoteError};
use hwbroker::config::Config;
use hwbroker::error::ErrorKind;
use hwbroker::platform::{BatchRequest, MemoryIo};
use hwbroker::process::ProcFs;
use hwbroker::protocol::{
    deserialize, frame_message, serialize, ClientMessage, ServerMessage, PROTOCOL_VERSION,
};
use hwbroker::secure::{SecureFs, SecureStore, FILE_MODE};
use hwbroker::server::{BrokerServer, BrokerState};
use hwbroker::{BrokerContext, BrokerPaths};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const CONFIG: &str = r#"
[general]
liveness_interval_ms = 50

[platform]
batch_command = ["sh", "-c", "read -r config; echo key-$0; exec sleep 30"]
topology = "board 1\npackage 1\n"

[[platform.signals]]
name = "ENERGY"
description = "Energy counter"
domain = 0
value = 12.5

[[platform.signals]]
name = "POWER"
domain = 0
value = 80.0

[[platform.controls]]
name = "FREQUENCY"
description = "Core frequency"
domain = 0
value = 1.0e9
"#;

struct TestBroker {
    _temp: TempDir,
    socket_path: PathBuf,
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestBroker {
    async fn start() -> Self {
        let temp = tempdir().unwrap();
        let mut config = Config::parse(CONFIG).unwrap();
        config.general.runtime_dir = Some(temp.path().join("run"));
        config.general.access_dir = temp.path().join("access");

        // Everyone may read ENERGY and write FREQUENCY
        let store = SecureFs::new();
        let default_dir = config.access_dir().join("0.DEFAULT_ACCESS");
        store.make_dirs(config.access_dir()).unwrap();
        store.make_dirs(&default_dir).unwrap();
        store
            .make_file(&default_dir.join("allowed_signals"), "ENERGY\n", FILE_MODE)
            .unwrap();
        store
            .make_file(&default_dir.join("allowed_controls"), "FREQUENCY\n", FILE_MODE)
            .unwrap();

        let context = BrokerContext::new(
            Arc::new(MemoryIo::new(&config.platform)),
            Arc::new(store),
            Arc::new(ProcFs::new()),
            BrokerPaths::new(config.state_dir(), config.access_dir()),
        );
        let state = BrokerState::new(&context).unwrap();
        let socket_path = config.socket_path();
        let server = BrokerServer::new(
            socket_path.clone(),
            Duration::from_millis(config.general.liveness_interval_ms),
        );
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let handle = tokio::spawn(async move { server.run(state, shutdown_rx).await });

        // Wait for server to start
        for _ in 0..50 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        Self {
            _temp: temp,
            socket_path,
            shutdown_tx,
            handle,
        }
    }

    async fn client(&self) -> BrokerClient {
        timeout(Duration::from_secs(2), BrokerClient::connect(&self.socket_path))
            .await
            .expect("connect timed out")
            .expect("connect failed")
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        let result = timeout(Duration::from_secs(2), self.handle).await;
        assert!(result.is_ok(), "Server should stop");
        assert!(!self.socket_path.exists());
    }
}

fn remote_kind(err: &anyhow::Error) -> ErrorKind {
    err.downcast_ref::<RemoteError>()
        .map(|e| e.kind)
        .unwrap_or_else(|| panic!("Expected RemoteError, got {:?}", err))
}

/// Helper to read a length-prefixed message
async fn read_message(stream: &mut UnixStream) -> Option<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await.ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let mut buffer = vec![0u8; len];
    stream.read_exact(&mut buffer).await.ok()?;
    Some(buffer)
}

/// Helper to write a length-prefixed message
async fn write_message(stream: &mut UnixStream, payload: &[u8]) {
    stream.write_all(&frame_message(payload)).await.unwrap();
    stream.flush().await.unwrap();
}

#[tokio::test]
async fn test_server_sends_welcome() {
    let broker = TestBroker::start().await;

    let mut stream = UnixStream::connect(&broker.socket_path).await.unwrap();
    let welcome_bytes = timeout(Duration::from_secs(2), read_message(&mut stream))
        .await
        .expect("Should receive message")
        .expect("Message should not be empty");

    match deserialize::<ServerMessage>(&welcome_bytes).unwrap() {
        ServerMessage::Welcome {
            protocol_version, ..
        } => assert_eq!(protocol_version, PROTOCOL_VERSION),
        other => panic!("Expected Welcome message, got {:?}", other),
    }

    drop(stream);
    broker.stop().await;
}

#[tokio::test]
async fn test_server_rejects_wrong_protocol_version() {
    let broker = TestBroker::start().await;
    let mut stream = UnixStream::connect(&broker.socket_path).await.unwrap();
    read_message(&mut stream).await.unwrap();

    let hello = ClientMessage::Hello {
        protocol_version: PROTOCOL_VERSION + 1,
    };
    write_message(&mut stream, &serialize(&hello).unwrap()).await;
    let response: ServerMessage = deserialize(&read_message(&mut stream).await.unwrap()).unwrap();

    match response {
        ServerMessage::Error { kind, message } => {
            assert_eq!(kind, ErrorKind::InvalidArgument);
            assert!(message.contains("version"));
        }
        other => panic!("Expected Error, got {:?}", other),
    }

    drop(stream);
    broker.stop().await;
}

#[tokio::test]
async fn test_server_reports_malformed_message() {
    let broker = TestBroker::start().await;
    let mut stream = UnixStream::connect(&broker.socket_path).await.unwrap();
    read_message(&mut stream).await.unwrap();

    write_message(&mut stream, &[0xc1, 0xc1]).await;
    let response: ServerMessage = deserialize(&read_message(&mut stream).await.unwrap()).unwrap();

    assert!(matches!(
        response,
        ServerMessage::Error {
            kind: ErrorKind::InvalidArgument,
            ..
        }
    ));

    drop(stream);
    broker.stop().await;
}

#[tokio::test]
async fn test_session_read_and_write() {
    let broker = TestBroker::start().await;
    let mut client = broker.client().await;

    let err = client.read_signal("ENERGY", 0, 0).await.unwrap_err();
    assert_eq!(remote_kind(&err), ErrorKind::NotActiveSession);

    client.open_session().await.unwrap();
    assert_eq!(client.read_signal("ENERGY", 0, 0).await.unwrap(), 12.5);
    client.write_control("FREQUENCY", 0, 0, 2.0e9).await.unwrap();

    let err = client.read_signal("ENERGY", 1, 0).await.unwrap_err();
    assert_eq!(remote_kind(&err), ErrorKind::Platform);

    client.close_session().await.unwrap();
    let err = client.close_session().await.unwrap_err();
    assert_eq!(remote_kind(&err), ErrorKind::NotActiveSession);

    drop(client);
    broker.stop().await;
}

#[tokio::test]
async fn test_info_and_access_queries() {
    let broker = TestBroker::start().await;
    let mut client = broker.client().await;

    let signals = client
        .get_signal_info(vec!["ENERGY".to_string()])
        .await
        .unwrap();
    assert_eq!(signals[0].description, "Energy counter");
    let controls = client
        .get_control_info(vec!["FREQUENCY".to_string()])
        .await
        .unwrap();
    assert_eq!(controls[0].description, "Core frequency");

    let (all_signals, all_controls) = client.get_all_access().await.unwrap();
    assert_eq!(all_signals, vec!["ENERGY".to_string(), "POWER".to_string()]);
    assert_eq!(all_controls, vec!["FREQUENCY".to_string()]);

    let (signals, _) = client.get_group_access("").await.unwrap();
    assert_eq!(signals, vec!["ENERGY".to_string()]);
    let (signals, controls) = client.get_user_access().await.unwrap();
    assert!(signals.contains(&"ENERGY".to_string()));
    assert!(controls.contains(&"FREQUENCY".to_string()));

    let err = client.lock_control().await.unwrap_err();
    assert_eq!(remote_kind(&err), ErrorKind::NotImplemented);

    drop(client);
    broker.stop().await;
}

#[tokio::test]
async fn test_set_group_access_requires_root() {
    let broker = TestBroker::start().await;
    let mut client = broker.client().await;

    let result = client
        .set_group_access("", vec!["POWER".to_string()], vec![])
        .await;

    if nix::unistd::getuid().is_root() {
        result.unwrap();
        let (signals, _) = client.get_group_access("").await.unwrap();
        assert_eq!(signals, vec!["POWER".to_string()]);
    } else {
        assert_eq!(remote_kind(&result.unwrap_err()), ErrorKind::Unauthorized);
    }

    drop(client);
    broker.stop().await;
}

#[tokio::test]
async fn test_topology_cache() {
    let broker = TestBroker::start().await;
    let mut client = broker.client().await;

    assert_eq!(client.get_cache().await.unwrap(), "board 1\npackage 1\n");

    drop(client);
    broker.stop().await;
}

#[tokio::test]
async fn test_batch_server_lifecycle() {
    let broker = TestBroker::start().await;
    let mut client = broker.client().await;
    client.open_session().await.unwrap();

    let handle = timeout(
        Duration::from_secs(5),
        client.start_batch(
            vec![BatchRequest::new(0, 0, "ENERGY")],
            vec![BatchRequest::new(0, 0, "FREQUENCY")],
        ),
    )
    .await
    .expect("batch start timed out")
    .unwrap();
    assert_eq!(handle.key, format!("key-{}", std::process::id()));

    let err = client
        .start_batch(vec![BatchRequest::new(0, 0, "ENERGY")], vec![])
        .await
        .unwrap_err();
    assert_eq!(remote_kind(&err), ErrorKind::InvalidArgument);

    // root is granted every signal, so only the second-server check applies
    let err = client
        .start_batch(vec![BatchRequest::new(0, 0, "POWER")], vec![])
        .await
        .unwrap_err();
    let expected = if nix::unistd::getuid().is_root() {
        ErrorKind::InvalidArgument
    } else {
        ErrorKind::AccessDenied
    };
    assert_eq!(remote_kind(&err), expected);

    client.stop_batch(handle.server_pid).await.unwrap();
    client.close_session().await.unwrap();

    drop(client);
    broker.stop().await;
}

#[tokio::test]
async fn test_disconnect_reclaims_session() {
    let broker = TestBroker::start().await;
    let mut first = broker.client().await;
    first.open_session().await.unwrap();
    first.write_control("FREQUENCY", 0, 0, 3.0e9).await.unwrap();
    drop(first);

    // Same process, so the new connection sees the same client pid
    let mut session_gone = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut second = broker.client().await;
        match second.read_signal("ENERGY", 0, 0).await {
            Err(e) if remote_kind(&e) == ErrorKind::NotActiveSession => {
                session_gone = true;
                break;
            }
            _ => {}
        }
    }
    assert!(session_gone, "Session should be reclaimed after disconnect");

    broker.stop().await;
}
