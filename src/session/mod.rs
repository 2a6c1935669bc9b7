//! Durable registry of active client sessions
//!
//! Each session is mirrored to `session-<pid>.json` in a broker-private
//! directory. Every mutation rewrites the file before returning so a
//! restarted broker can pick up where it left off.

mod record;

pub use record::{SessionMode, SessionRecord};

use crate::error::{BrokerError, BrokerResult};
use crate::process::{is_pid_valid, ProcessTable};
use crate::secure::{Defect, SecureStore, FILE_MODE};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SESSION_PREFIX: &str = "session-";
const SESSION_SUFFIX: &str = ".json";
const TEMP_SUFFIX: &str = ".tmp";

/// In-memory state of one session
#[derive(Debug, Clone)]
struct ActiveSession {
    record: SessionRecord,

    /// Nested opens by the same client; not persisted
    reference_count: u32,
}

/// Registry of active sessions keyed by client pid
pub struct ActiveSessions {
    dir: PathBuf,
    store: Arc<dyn SecureStore>,
    sessions: BTreeMap<i32, ActiveSession>,
}

impl ActiveSessions {
    /// Open the registry at `dir`, recovering any sessions left on disk.
    ///
    /// Files that fail verification or parsing are quarantined. Sessions
    /// whose client pid was reused since the file was written are dropped.
    pub fn new(
        dir: impl Into<PathBuf>,
        store: Arc<dyn SecureStore>,
        processes: &dyn ProcessTable,
    ) -> BrokerResult<Self> {
        let dir = dir.into();
        store.make_dirs(&dir)?;

        let mut active = Self {
            dir,
            store,
            sessions: BTreeMap::new(),
        };
        active.remove_leftover_temp_files();
        for path in active.session_files() {
            active.load_session_file(&path, processes);
        }

        tracing::info!(
            "Recovered {} session(s) from {}",
            active.sessions.len(),
            active.dir.display()
        );
        Ok(active)
    }

    fn session_path(&self, client_pid: i32) -> PathBuf {
        self.dir
            .join(format!("{}{}{}", SESSION_PREFIX, client_pid, SESSION_SUFFIX))
    }

    fn session_files(&self) -> Vec<PathBuf> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Unable to list {}: {}", self.dir.display(), e);
                return Vec::new();
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.starts_with(SESSION_PREFIX) && name.ends_with(SESSION_SUFFIX)
            })
            .map(|entry| entry.path())
            .collect();
        paths.sort();
        paths
    }

    /// Delete `.session-<pid>.json.<id>.tmp` files from interrupted writes
    fn remove_leftover_temp_files(&self) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.filter_map(|entry| entry.ok()) {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let leftover = name
                .strip_prefix('.')
                .is_some_and(|rest| rest.starts_with(SESSION_PREFIX))
                && name.ends_with(TEMP_SUFFIX);
            if !leftover {
                continue;
            }
            tracing::info!("Removing leftover temporary file {}", entry.path().display());
            if let Err(e) = self.store.remove_file(&entry.path()) {
                tracing::warn!("Unable to remove leftover temporary file: {}", e);
            }
        }
    }

    fn load_session_file(&mut self, path: &Path, processes: &dyn ProcessTable) {
        let file = match self.store.read_file(path, FILE_MODE) {
            Ok(file) => file,
            // Already renamed aside and reported
            Err(e) if e.is_quarantined() => return,
            Err(e) => {
                tracing::warn!("Unable to read session file: {}", e);
                return;
            }
        };

        let mut record = match parse_record(path, &file.contents) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("{}", e);
                let reason = match e {
                    BrokerError::InvalidState { reason, .. } => reason,
                    other => other.to_string(),
                };
                if let Err(e) = self.store.quarantine(path, &Defect::Malformed(reason)) {
                    tracing::error!("Unable to quarantine session file: {}", e);
                }
                return;
            }
        };

        let client_pid = record.client_pid;
        if path != self.session_path(client_pid) {
            let defect = Defect::Malformed(format!(
                "file name does not match client_pid {}",
                client_pid
            ));
            if let Err(e) = self.store.quarantine(path, &defect) {
                tracing::error!("Unable to quarantine session file: {}", e);
            }
            return;
        }

        if !is_pid_valid(file.changed, processes.create_time(client_pid)) {
            tracing::info!(
                "Client pid {} from {} is no longer running, dropping the session",
                client_pid,
                path.display()
            );
            if let Err(e) = self.store.remove_file(path) {
                tracing::warn!("Unable to remove stale session file: {}", e);
            }
            return;
        }

        if let Some(batch_pid) = record.batch_server {
            if !is_pid_valid(file.changed, processes.create_time(batch_pid)) {
                tracing::info!(
                    "Batch server pid {} for client {} is no longer running",
                    batch_pid,
                    client_pid
                );
                record.batch_server = None;
            }
        }

        self.sessions.insert(
            client_pid,
            ActiveSession {
                record,
                reference_count: 1,
            },
        );

        // Rewrite in normalized form
        if let Err(e) = self.update_session_file(client_pid) {
            tracing::warn!("Unable to rewrite session for client {}: {}", client_pid, e);
        }
    }

    fn update_session_file(&self, client_pid: i32) -> BrokerResult<()> {
        let path = self.session_path(client_pid);
        let session = self.session(client_pid, "update_session_file")?;
        let contents = session
            .record
            .to_json()
            .map_err(|e| BrokerError::InvalidState {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        self.store.make_file(&path, &contents, FILE_MODE)?;
        Ok(())
    }

    fn session(&self, client_pid: i32, operation: &'static str) -> BrokerResult<&ActiveSession> {
        self.sessions
            .get(&client_pid)
            .ok_or(BrokerError::NotActiveSession {
                operation,
                client_pid,
            })
    }

    fn session_mut(
        &mut self,
        client_pid: i32,
        operation: &'static str,
    ) -> BrokerResult<&mut ActiveSession> {
        self.sessions
            .get_mut(&client_pid)
            .ok_or(BrokerError::NotActiveSession {
                operation,
                client_pid,
            })
    }

    /// Register a new session and persist it
    pub fn add_client(
        &mut self,
        client_pid: i32,
        signals: Vec<String>,
        controls: Vec<String>,
        watch_id: u32,
    ) -> BrokerResult<()> {
        if self.is_client_active(client_pid) {
            return Err(BrokerError::InvalidArgument(format!(
                "client {} already has an active session",
                client_pid
            )));
        }

        self.sessions.insert(
            client_pid,
            ActiveSession {
                record: SessionRecord::new(client_pid, signals, controls, watch_id),
                reference_count: 1,
            },
        );
        if let Err(e) = self.update_session_file(client_pid) {
            self.sessions.remove(&client_pid);
            return Err(e);
        }
        Ok(())
    }

    /// Remove a session and delete its file, returning the removed record
    pub fn remove_client(&mut self, client_pid: i32) -> BrokerResult<SessionRecord> {
        let session = self
            .sessions
            .remove(&client_pid)
            .ok_or(BrokerError::NotActiveSession {
                operation: "remove_client",
                client_pid,
            })?;
        self.store.remove_file(&self.session_path(client_pid))?;
        Ok(session.record)
    }

    pub fn get_clients(&self) -> Vec<i32> {
        self.sessions.keys().copied().collect()
    }

    pub fn is_client_active(&self, client_pid: i32) -> bool {
        self.sessions.contains_key(&client_pid)
    }

    /// Fail with [`BrokerError::NotActiveSession`] unless `client_pid` has a session
    pub fn check_client_active(&self, client_pid: i32, operation: &'static str) -> BrokerResult<()> {
        self.session(client_pid, operation).map(|_| ())
    }

    pub fn get_signals(&self, client_pid: i32) -> Option<&[String]> {
        self.sessions
            .get(&client_pid)
            .map(|s| s.record.signals.as_slice())
    }

    pub fn get_controls(&self, client_pid: i32) -> Option<&[String]> {
        self.sessions
            .get(&client_pid)
            .map(|s| s.record.controls.as_slice())
    }

    pub fn get_watch_id(&self, client_pid: i32) -> Option<u32> {
        self.sessions.get(&client_pid).map(|s| s.record.watch_id)
    }

    pub fn get_batch_server(&self, client_pid: i32) -> Option<i32> {
        self.sessions
            .get(&client_pid)
            .and_then(|s| s.record.batch_server)
    }

    pub fn get_reference_count(&self, client_pid: i32) -> Option<u32> {
        self.sessions.get(&client_pid).map(|s| s.reference_count)
    }

    pub fn set_watch_id(&mut self, client_pid: i32, watch_id: u32) -> BrokerResult<()> {
        self.session_mut(client_pid, "set_watch_id")?.record.watch_id = watch_id;
        self.update_session_file(client_pid)
    }

    /// Record or clear the batch server bound to a session
    pub fn set_batch_server(&mut self, client_pid: i32, batch_pid: Option<i32>) -> BrokerResult<()> {
        self.session_mut(client_pid, "set_batch_server")?
            .record
            .batch_server = batch_pid;
        self.update_session_file(client_pid)
    }

    pub fn is_write_client(&self, client_pid: i32) -> bool {
        self.sessions
            .get(&client_pid)
            .is_some_and(|s| s.record.mode == SessionMode::ReadWrite)
    }

    /// Mark a session as holding write access
    pub fn set_write_client(&mut self, client_pid: i32) -> BrokerResult<()> {
        self.session_mut(client_pid, "set_write_client")?.record.mode = SessionMode::ReadWrite;
        self.update_session_file(client_pid)
    }

    /// Clients currently recorded with write access
    pub fn write_clients(&self) -> Vec<i32> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.record.mode == SessionMode::ReadWrite)
            .map(|(pid, _)| *pid)
            .collect()
    }

    pub fn increment_reference_count(&mut self, client_pid: i32) -> BrokerResult<u32> {
        let session = self.session_mut(client_pid, "increment_reference_count")?;
        session.reference_count += 1;
        Ok(session.reference_count)
    }

    /// Decrement and return the remaining count; the caller tears down at zero
    pub fn decrement_reference_count(&mut self, client_pid: i32) -> BrokerResult<u32> {
        let session = self.session_mut(client_pid, "decrement_reference_count")?;
        session.reference_count = session.reference_count.saturating_sub(1);
        Ok(session.reference_count)
    }
}

fn parse_record(path: &Path, contents: &str) -> BrokerResult<SessionRecord> {
    SessionRecord::parse(contents).map_err(|reason| BrokerError::InvalidState {
        path: path.display().to_string(),
        reason,
    })
}
