//! Client connection handling

use super::state::BrokerState;
use crate::error::{BrokerError, ErrorKind};
use crate::protocol::{
    check_version_compatibility, read_typed, write_frame, ClientMessage, ProtocolError,
    ServerMessage, PROTOCOL_VERSION,
};
use crate::registry::{ConnectionId, Identity};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use uuid::Uuid;

/// A connected client and the identity its peer credentials resolved to
pub struct ClientConnection {
    id: ConnectionId,
    identity: Identity,
}

impl ClientConnection {
    pub fn new(identity: Identity) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Carry out one request on behalf of this client
    pub fn process_message(&self, msg: ClientMessage, state: &mut BrokerState) -> ServerMessage {
        let command = msg.command();
        let pid = self.identity.pid;
        let platform = &mut state.platform;

        let result: Result<ServerMessage, BrokerError> = match msg {
            ClientMessage::Hello { protocol_version } => {
                match check_version_compatibility(protocol_version, PROTOCOL_VERSION) {
                    Ok(()) => Ok(ack(command)),
                    Err(e) => Err(BrokerError::InvalidArgument(e.to_string())),
                }
            }
            ClientMessage::OpenSession => platform
                .open_session(&self.identity.user, pid)
                .map(|()| ack(command)),
            ClientMessage::CloseSession => platform.close_session(pid).map(|()| ack(command)),
            ClientMessage::ReadSignal {
                name,
                domain,
                domain_idx,
            } => platform
                .read_signal(pid, &name, domain, domain_idx)
                .map(|value| ServerMessage::Value { value }),
            ClientMessage::WriteControl {
                name,
                domain,
                domain_idx,
                value,
            } => platform
                .write_control(pid, &name, domain, domain_idx, value)
                .map(|()| ack(command)),
            ClientMessage::StartBatch { signals, controls } => platform
                .start_batch(pid, &signals, &controls)
                .map(|handle| ServerMessage::BatchStarted {
                    server_pid: handle.server_pid,
                    key: handle.key,
                }),
            ClientMessage::StopBatch { server_pid } => {
                platform.stop_batch(pid, server_pid).map(|()| ack(command))
            }
            ClientMessage::GetSignalInfo { names } => platform
                .get_signal_info(&names)
                .map(|signals| ServerMessage::SignalInfo { signals }),
            ClientMessage::GetControlInfo { names } => platform
                .get_control_info(&names)
                .map(|controls| ServerMessage::ControlInfo { controls }),
            ClientMessage::GetAllAccess => {
                let (signals, controls) = platform.get_all_access();
                Ok(ServerMessage::Access { signals, controls })
            }
            ClientMessage::GetUserAccess => platform
                .get_user_access(&self.identity.user)
                .map(|(signals, controls)| ServerMessage::Access { signals, controls }),
            ClientMessage::GetGroupAccess { group } => platform
                .get_group_access(&group)
                .map(|(signals, controls)| ServerMessage::Access { signals, controls }),
            ClientMessage::SetGroupAccess {
                group,
                signals,
                controls,
            } => {
                if self.identity.is_root() {
                    platform
                        .set_group_access(&group, &signals, &controls)
                        .map(|()| ack(command))
                } else {
                    Err(BrokerError::Unauthorized(format!(
                        "user {} may not change access lists",
                        self.identity.user
                    )))
                }
            }
            ClientMessage::LockControl => platform.lock_control().map(|()| ack(command)),
            ClientMessage::UnlockControl => platform.unlock_control().map(|()| ack(command)),
            ClientMessage::GetCache => state
                .topo
                .get_cache()
                .map(|contents| ServerMessage::Cache { contents }),
        };

        result.unwrap_or_else(|e| {
            tracing::debug!("{} from pid {} failed: {}", command, pid, e);
            create_error_message(e.kind(), e.to_string())
        })
    }
}

fn ack(command: &str) -> ServerMessage {
    ServerMessage::Ack {
        for_command: command.to_string(),
    }
}

/// Create a welcome message for a new client
pub fn create_welcome_message(connection_id: ConnectionId) -> ServerMessage {
    ServerMessage::Welcome {
        connection_id,
        protocol_version: PROTOCOL_VERSION,
    }
}

/// Create an error message
pub fn create_error_message(kind: ErrorKind, message: String) -> ServerMessage {
    ServerMessage::Error { kind, message }
}

/// Serve one client until it disconnects
pub async fn handle_client(mut stream: UnixStream, state: Arc<Mutex<BrokerState>>) -> Result<()> {
    let cred = stream.peer_cred()?;
    let pid = cred
        .pid()
        .ok_or_else(|| anyhow!("peer credentials carry no pid"))?;
    let identity = Identity::resolve(cred.uid(), cred.gid(), pid);
    let client = ClientConnection::new(identity.clone());
    let client_id = client.id();

    tracing::info!(
        "Client connected: {} ({} uid {} pid {})",
        client_id,
        identity.user,
        identity.uid,
        identity.pid
    );
    state.lock().await.platform.registry_mut().register(client_id, identity);

    let result = serve(&mut stream, &client, &state).await;

    let closed = state.lock().await.platform.connection_closed(&client_id);
    if !closed.is_empty() {
        tracing::info!("Reclaimed sessions of {:?} after {} closed", closed, client_id);
    }
    tracing::info!("Client handler finished: {}", client_id);
    result
}

async fn serve(
    stream: &mut UnixStream,
    client: &ClientConnection,
    state: &Arc<Mutex<BrokerState>>,
) -> Result<()> {
    write_frame(stream, &create_welcome_message(client.id())).await?;

    loop {
        let response = match read_typed::<_, ClientMessage>(stream).await {
            Ok(Some(msg)) => {
                let mut state = state.lock().await;
                client.process_message(msg, &mut state)
            }
            Ok(None) => {
                tracing::info!("Client disconnected: {}", client.id());
                return Ok(());
            }
            Err(ProtocolError::MalformedMessage(e)) => {
                tracing::error!("Failed to parse message: {}", e);
                create_error_message(ErrorKind::InvalidArgument, format!("Invalid message: {}", e))
            }
            Err(e) => return Err(e.into()),
        };
        write_frame(stream, &response).await?;
    }
}
