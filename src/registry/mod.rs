//! Connected clients, their identities, and liveness watches

use crate::error::{BrokerError, BrokerResult};
use crate::process::{is_pid_valid, ProcessTable};
use nix::unistd::{getgrouplist, Gid, Group, Uid, User};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ffi::CString;
use std::sync::Arc;
use std::time::SystemTime;
use uuid::Uuid;

/// Transport-level connection handle
pub type ConnectionId = Uuid;

/// Handle returned by [`ClientRegistry::watch`]
pub type WatchId = u32;

/// Resolved identity of a calling process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user: String,
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
    pub groups: Vec<String>,
}

impl Identity {
    /// Resolve user and group names for peer credentials.
    ///
    /// Unknown uids are named by their number and belong to no groups.
    pub fn resolve(uid: u32, gid: u32, pid: i32) -> Self {
        match User::from_uid(Uid::from_raw(uid)) {
            Ok(Some(user)) => {
                let groups = os_groups(&user.name, user.gid);
                Self {
                    user: user.name,
                    uid,
                    gid,
                    pid,
                    groups,
                }
            }
            _ => Self {
                user: uid.to_string(),
                uid,
                gid,
                pid,
                groups: Vec::new(),
            },
        }
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

fn os_groups(user: &str, gid: Gid) -> Vec<String> {
    let Ok(name) = CString::new(user) else {
        return Vec::new();
    };
    match getgrouplist(&name, gid) {
        Ok(gids) => gids
            .into_iter()
            .filter_map(|gid| Group::from_gid(gid).ok().flatten())
            .map(|group| group.name)
            .collect(),
        Err(e) => {
            tracing::warn!("Unable to list groups of {}: {}", user, e);
            Vec::new()
        }
    }
}

/// A watched client pid and when watching began
#[derive(Debug, Clone, Copy)]
struct Watch {
    client_pid: i32,
    since: SystemTime,
}

/// Tracks live connections and which client pids are being watched
pub struct ClientRegistry {
    processes: Arc<dyn ProcessTable>,
    connections: HashMap<ConnectionId, Identity>,
    watches: BTreeMap<WatchId, Watch>,
    next_watch_id: WatchId,
}

impl ClientRegistry {
    pub fn new(processes: Arc<dyn ProcessTable>) -> Self {
        Self {
            processes,
            connections: HashMap::new(),
            watches: BTreeMap::new(),
            next_watch_id: 1,
        }
    }

    /// Record the identity behind a new connection
    pub fn register(&mut self, connection: ConnectionId, identity: Identity) {
        tracing::debug!(
            "Connection {} registered for {} (pid {})",
            connection,
            identity.user,
            identity.pid
        );
        self.connections.insert(connection, identity);
    }

    /// Forget a connection.
    ///
    /// Returns the watched client pids left with no connection at all; their
    /// sessions should be reclaimed.
    pub fn unregister(&mut self, connection: &ConnectionId) -> Vec<i32> {
        let Some(identity) = self.connections.remove(connection) else {
            return Vec::new();
        };
        let still_connected = self.connections.values().any(|i| i.pid == identity.pid);
        if still_connected {
            return Vec::new();
        }

        let mut orphaned: Vec<i32> = self
            .watches
            .values()
            .map(|watch| watch.client_pid)
            .filter(|pid| *pid == identity.pid)
            .collect();
        orphaned.dedup();
        orphaned
    }

    pub fn identity(&self, connection: &ConnectionId) -> BrokerResult<&Identity> {
        self.connections.get(connection).ok_or_else(|| {
            BrokerError::InvalidArgument(format!("unknown connection {}", connection))
        })
    }

    pub fn get_user(&self, connection: &ConnectionId) -> BrokerResult<&str> {
        self.identity(connection).map(|i| i.user.as_str())
    }

    pub fn get_groups(&self, connection: &ConnectionId) -> BrokerResult<&[String]> {
        self.identity(connection).map(|i| i.groups.as_slice())
    }

    /// Group memberships of a user by name.
    ///
    /// Prefers what a registered connection resolved; falls back to the
    /// system user database.
    pub fn get_user_groups(&self, user: &str) -> Vec<String> {
        if let Some(identity) = self.connections.values().find(|i| i.user == user) {
            return identity.groups.clone();
        }
        match User::from_name(user) {
            Ok(Some(entry)) => os_groups(&entry.name, entry.gid),
            _ => Vec::new(),
        }
    }

    /// Start watching a client pid for disconnection or exit
    pub fn watch(&mut self, client_pid: i32) -> WatchId {
        let watch_id = self.next_watch_id;
        self.next_watch_id = self.next_watch_id.wrapping_add(1).max(1);
        self.watches.insert(
            watch_id,
            Watch {
                client_pid,
                since: SystemTime::now(),
            },
        );
        tracing::debug!("Watching client {} as {}", client_pid, watch_id);
        watch_id
    }

    pub fn unwatch(&mut self, watch_id: WatchId) {
        if let Some(watch) = self.watches.remove(&watch_id) {
            tracing::debug!("Stopped watching client {} ({})", watch.client_pid, watch_id);
        }
    }

    pub fn watched_clients(&self) -> Vec<i32> {
        self.watches.values().map(|watch| watch.client_pid).collect()
    }

    /// Watched clients whose process exited.
    ///
    /// A pid now held by a process created after watching began counts as
    /// exited; the new process must not inherit the session.
    pub fn dead_clients(&self) -> Vec<i32> {
        let mut dead: Vec<i32> = self
            .watches
            .values()
            .filter(|watch| {
                !is_pid_valid(watch.since, self.processes.create_time(watch.client_pid))
            })
            .map(|watch| watch.client_pid)
            .collect();
        dead.sort_unstable();
        dead.dedup();
        dead
    }

    /// Identifier compared against write lock holders.
    ///
    /// Processes in the same session share one id; if the session id cannot
    /// be read the pid itself is used.
    pub fn get_write_client(&self, client_pid: i32) -> i32 {
        self.processes
            .session_id(client_pid)
            .unwrap_or(client_pid)
    }
}
