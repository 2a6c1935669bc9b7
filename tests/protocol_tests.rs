//! Integration tests for protocol serialization and framing

use hwbroker::error::ErrorKind;
use hwbroker::platform::BatchRequest;
use hwbroker::protocol::{
    check_version_compatibility, deserialize, frame_message, read_typed, serialize,
    unframe_message, write_frame, ClientMessage, ProtocolError, ServerMessage, MAX_MESSAGE_SIZE,
    PROTOCOL_VERSION,
};

#[test]
fn test_client_message_roundtrip() {
    let messages = vec![
        ClientMessage::Hello {
            protocol_version: 1,
        },
        ClientMessage::OpenSession,
        ClientMessage::WriteControl {
            name: "FREQUENCY".to_string(),
            domain: 2,
            domain_idx: 3,
            value: 2.4e9,
        },
        ClientMessage::StartBatch {
            signals: vec![BatchRequest::new(0, 0, "ENERGY")],
            controls: vec![],
        },
        ClientMessage::SetGroupAccess {
            group: String::new(),
            signals: vec!["ENERGY".to_string()],
            controls: vec![],
        },
    ];

    for msg in messages {
        let encoded = serialize(&msg).expect("serialize failed");
        let decoded: ClientMessage = deserialize(&encoded).expect("deserialize failed");
        assert_eq!(msg, decoded);
    }
}

#[test]
fn test_error_kind_survives_encoding() {
    let msg = ServerMessage::Error {
        kind: ErrorKind::WriteConflict,
        message: "held by 100".to_string(),
    };

    let decoded: ServerMessage = deserialize(&serialize(&msg).unwrap()).unwrap();

    assert_eq!(decoded, msg);
}

#[test]
fn test_garbage_is_malformed() {
    let result: Result<ClientMessage, _> = deserialize(&[0xc1, 0x00, 0xff]);
    assert!(matches!(result, Err(ProtocolError::MalformedMessage(_))));
}

#[test]
fn test_unframe_partial_and_multiple_frames() {
    let first = frame_message(b"abc");
    let second = frame_message(b"de");
    let mut buffer = first.clone();
    buffer.extend_from_slice(&second);

    assert!(unframe_message(&first[..5]).unwrap().is_none());
    assert!(unframe_message(&[0, 0]).unwrap().is_none());

    let (payload, rest) = unframe_message(&buffer).unwrap().unwrap();
    assert_eq!(payload, b"abc");
    let (payload, rest) = unframe_message(rest).unwrap().unwrap();
    assert_eq!(payload, b"de");
    assert!(rest.is_empty());
}

#[test]
fn test_unframe_rejects_oversized_frame() {
    let header = (MAX_MESSAGE_SIZE + 1).to_be_bytes();
    assert!(matches!(
        unframe_message(&header),
        Err(ProtocolError::MessageTooLarge { .. })
    ));
}

#[test]
fn test_version_check() {
    assert!(check_version_compatibility(PROTOCOL_VERSION, PROTOCOL_VERSION).is_ok());
    assert!(matches!(
        check_version_compatibility(PROTOCOL_VERSION + 1, PROTOCOL_VERSION),
        Err(ProtocolError::VersionMismatch { .. })
    ));
}

#[tokio::test]
async fn test_frames_over_stream() {
    let (mut client, mut server) = tokio::io::duplex(1024);

    write_frame(&mut client, &ClientMessage::GetCache).await.unwrap();
    drop(client);

    let first: Option<ClientMessage> = read_typed(&mut server).await.unwrap();
    assert_eq!(first, Some(ClientMessage::GetCache));
    let end: Option<ClientMessage> = read_typed(&mut server).await.unwrap();
    assert_eq!(end, None);
}
