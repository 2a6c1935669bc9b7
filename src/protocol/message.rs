//! Message types for the broker protocol

use crate::error::ErrorKind;
use crate::platform::{BatchRequest, ControlInfo, SignalInfo};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages sent from client to server.
///
/// The calling pid is never part of a request; the server takes it from the
/// peer credentials of the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Handshake with protocol version
    Hello { protocol_version: u32 },

    OpenSession,

    CloseSession,

    ReadSignal {
        name: String,
        domain: i32,
        domain_idx: i32,
    },

    WriteControl {
        name: String,
        domain: i32,
        domain_idx: i32,
        value: f64,
    },

    StartBatch {
        signals: Vec<BatchRequest>,
        controls: Vec<BatchRequest>,
    },

    StopBatch { server_pid: i32 },

    GetSignalInfo { names: Vec<String> },

    GetControlInfo { names: Vec<String> },

    /// Every name the platform exposes
    GetAllAccess,

    /// Access the caller would be granted
    GetUserAccess,

    /// Access list of a group; an empty name addresses the default list
    GetGroupAccess { group: String },

    /// Replace a group's access list (root only)
    SetGroupAccess {
        group: String,
        signals: Vec<String>,
        controls: Vec<String>,
    },

    LockControl,

    UnlockControl,

    /// Topology cache contents
    GetCache,
}

impl ClientMessage {
    /// Variant name, echoed back in acknowledgments
    pub fn command(&self) -> &'static str {
        match self {
            ClientMessage::Hello { .. } => "Hello",
            ClientMessage::OpenSession => "OpenSession",
            ClientMessage::CloseSession => "CloseSession",
            ClientMessage::ReadSignal { .. } => "ReadSignal",
            ClientMessage::WriteControl { .. } => "WriteControl",
            ClientMessage::StartBatch { .. } => "StartBatch",
            ClientMessage::StopBatch { .. } => "StopBatch",
            ClientMessage::GetSignalInfo { .. } => "GetSignalInfo",
            ClientMessage::GetControlInfo { .. } => "GetControlInfo",
            ClientMessage::GetAllAccess => "GetAllAccess",
            ClientMessage::GetUserAccess => "GetUserAccess",
            ClientMessage::GetGroupAccess { .. } => "GetGroupAccess",
            ClientMessage::SetGroupAccess { .. } => "SetGroupAccess",
            ClientMessage::LockControl => "LockControl",
            ClientMessage::UnlockControl => "UnlockControl",
            ClientMessage::GetCache => "GetCache",
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Handshake response
    Welcome {
        connection_id: Uuid,
        protocol_version: u32,
    },

    /// Acknowledgment of a command with no result
    Ack { for_command: String },

    /// Signal value
    Value { value: f64 },

    BatchStarted { server_pid: i32, key: String },

    SignalInfo { signals: Vec<SignalInfo> },

    ControlInfo { controls: Vec<ControlInfo> },

    Access {
        signals: Vec<String>,
        controls: Vec<String>,
    },

    Cache { contents: String },

    /// Error response
    Error { kind: ErrorKind, message: String },
}
