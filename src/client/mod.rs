//! Client library for talking to the broker over its Unix socket

use crate::access::Access;
use crate::error::ErrorKind;
use crate::platform::{BatchHandle, BatchRequest, ControlInfo, SignalInfo};
use crate::protocol::{read_typed, write_frame, ClientMessage, ServerMessage, PROTOCOL_VERSION};
use crate::registry::ConnectionId;
use anyhow::{anyhow, bail, Context, Result};
use std::fmt;
use std::path::Path;
use tokio::net::UnixStream;

/// Error reported by the broker, with its kind preserved
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Connection to a running broker.
///
/// Requests are answered in order, one at a time.
pub struct BrokerClient {
    stream: UnixStream,
    connection_id: ConnectionId,
}

impl BrokerClient {
    /// Connect and complete the protocol handshake
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref();
        let mut stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("connecting to {}", socket_path.display()))?;

        let connection_id = match read_typed::<_, ServerMessage>(&mut stream).await? {
            Some(ServerMessage::Welcome {
                connection_id,
                protocol_version,
            }) => {
                if protocol_version != PROTOCOL_VERSION {
                    bail!(
                        "Protocol version mismatch: expected {}, got {}",
                        PROTOCOL_VERSION,
                        protocol_version
                    );
                }
                connection_id
            }
            Some(other) => bail!("Expected Welcome message, got {:?}", other),
            None => bail!("Broker closed the connection during handshake"),
        };

        let mut client = Self {
            stream,
            connection_id,
        };
        client
            .expect_ack(ClientMessage::Hello {
                protocol_version: PROTOCOL_VERSION,
            })
            .await?;
        tracing::debug!("Connected to broker as {}", connection_id);
        Ok(client)
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Send one request and wait for its response
    pub async fn request(&mut self, msg: ClientMessage) -> Result<ServerMessage> {
        write_frame(&mut self.stream, &msg).await?;
        match read_typed::<_, ServerMessage>(&mut self.stream).await? {
            Some(ServerMessage::Error { kind, message }) => Err(RemoteError { kind, message }.into()),
            Some(response) => Ok(response),
            None => Err(anyhow!("Broker closed the connection")),
        }
    }

    async fn expect_ack(&mut self, msg: ClientMessage) -> Result<()> {
        let command = msg.command();
        match self.request(msg).await? {
            ServerMessage::Ack { for_command } if for_command == command => Ok(()),
            other => Err(unexpected(command, other)),
        }
    }

    async fn expect_access(&mut self, msg: ClientMessage) -> Result<Access> {
        let command = msg.command();
        match self.request(msg).await? {
            ServerMessage::Access { signals, controls } => Ok((signals, controls)),
            other => Err(unexpected(command, other)),
        }
    }

    pub async fn open_session(&mut self) -> Result<()> {
        self.expect_ack(ClientMessage::OpenSession).await
    }

    pub async fn close_session(&mut self) -> Result<()> {
        self.expect_ack(ClientMessage::CloseSession).await
    }

    pub async fn read_signal(&mut self, name: &str, domain: i32, domain_idx: i32) -> Result<f64> {
        let msg = ClientMessage::ReadSignal {
            name: name.to_string(),
            domain,
            domain_idx,
        };
        match self.request(msg).await? {
            ServerMessage::Value { value } => Ok(value),
            other => Err(unexpected("ReadSignal", other)),
        }
    }

    pub async fn write_control(
        &mut self,
        name: &str,
        domain: i32,
        domain_idx: i32,
        value: f64,
    ) -> Result<()> {
        self.expect_ack(ClientMessage::WriteControl {
            name: name.to_string(),
            domain,
            domain_idx,
            value,
        })
        .await
    }

    pub async fn start_batch(
        &mut self,
        signals: Vec<BatchRequest>,
        controls: Vec<BatchRequest>,
    ) -> Result<BatchHandle> {
        match self
            .request(ClientMessage::StartBatch { signals, controls })
            .await?
        {
            ServerMessage::BatchStarted { server_pid, key } => Ok(BatchHandle { server_pid, key }),
            other => Err(unexpected("StartBatch", other)),
        }
    }

    pub async fn stop_batch(&mut self, server_pid: i32) -> Result<()> {
        self.expect_ack(ClientMessage::StopBatch { server_pid }).await
    }

    pub async fn get_signal_info(&mut self, names: Vec<String>) -> Result<Vec<SignalInfo>> {
        match self.request(ClientMessage::GetSignalInfo { names }).await? {
            ServerMessage::SignalInfo { signals } => Ok(signals),
            other => Err(unexpected("GetSignalInfo", other)),
        }
    }

    pub async fn get_control_info(&mut self, names: Vec<String>) -> Result<Vec<ControlInfo>> {
        match self.request(ClientMessage::GetControlInfo { names }).await? {
            ServerMessage::ControlInfo { controls } => Ok(controls),
            other => Err(unexpected("GetControlInfo", other)),
        }
    }

    pub async fn get_all_access(&mut self) -> Result<Access> {
        self.expect_access(ClientMessage::GetAllAccess).await
    }

    /// Access the broker would grant this client's user
    pub async fn get_user_access(&mut self) -> Result<Access> {
        self.expect_access(ClientMessage::GetUserAccess).await
    }

    pub async fn get_group_access(&mut self, group: &str) -> Result<Access> {
        self.expect_access(ClientMessage::GetGroupAccess {
            group: group.to_string(),
        })
        .await
    }

    pub async fn set_group_access(
        &mut self,
        group: &str,
        signals: Vec<String>,
        controls: Vec<String>,
    ) -> Result<()> {
        self.expect_ack(ClientMessage::SetGroupAccess {
            group: group.to_string(),
            signals,
            controls,
        })
        .await
    }

    pub async fn lock_control(&mut self) -> Result<()> {
        self.expect_ack(ClientMessage::LockControl).await
    }

    pub async fn unlock_control(&mut self) -> Result<()> {
        self.expect_ack(ClientMessage::UnlockControl).await
    }

    /// Topology cache contents
    pub async fn get_cache(&mut self) -> Result<String> {
        match self.request(ClientMessage::GetCache).await? {
            ServerMessage::Cache { contents } => Ok(contents),
            other => Err(unexpected("GetCache", other)),
        }
    }
}

fn unexpected(command: &str, response: ServerMessage) -> anyhow::Error {
    anyhow!("Unexpected response to {}: {:?}", command, response)
}
