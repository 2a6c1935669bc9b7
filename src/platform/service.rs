//! Session-aware front end to the hardware I/O layer
//!
//! Per client the states are `CLOSED -> OPEN -> (BATCH_ACTIVE) -> OPEN ->
//! CLOSED`. Calls must be serialized by the caller; the write lock and the
//! session registry rely on it.

use super::io::{BatchHandle, BatchRequest, ControlInfo, PlatformIo, SignalInfo};
use crate::access::{Access, AccessLists};
use crate::context::BrokerContext;
use crate::error::{BrokerError, BrokerResult, NameKind};
use crate::process::ProcessTable;
use crate::registry::{ClientRegistry, ConnectionId};
use crate::secure::SecureStore;
use crate::session::ActiveSessions;
use crate::write_lock::WriteLock;
use std::path::PathBuf;
use std::sync::Arc;

/// Authorization, session bookkeeping and write arbitration
pub struct PlatformService {
    io: Arc<dyn PlatformIo>,
    store: Arc<dyn SecureStore>,
    processes: Arc<dyn ProcessTable>,
    active_sessions: ActiveSessions,
    access_lists: AccessLists,
    write_lock: WriteLock,
    registry: ClientRegistry,
    save_dir: PathBuf,
}

impl PlatformService {
    /// Build the service, recovering sessions persisted by a previous run
    pub fn new(context: &BrokerContext) -> BrokerResult<Self> {
        let active_sessions = ActiveSessions::new(
            context.paths.state_dir.clone(),
            Arc::clone(&context.store),
            context.processes.as_ref(),
        )?;
        let access_lists = AccessLists::new(
            context.paths.access_dir.clone(),
            Arc::clone(&context.store),
            context.io.signal_names(),
            context.io.control_names(),
        );

        let mut service = Self {
            io: Arc::clone(&context.io),
            store: Arc::clone(&context.store),
            processes: Arc::clone(&context.processes),
            active_sessions,
            access_lists,
            write_lock: WriteLock::new(),
            registry: ClientRegistry::new(Arc::clone(&context.processes)),
            save_dir: context.paths.save_dir(),
        };
        service.restore_sessions();
        Ok(service)
    }

    /// Re-register liveness watches and the write lock for recovered sessions
    fn restore_sessions(&mut self) {
        for client_pid in self.active_sessions.get_clients() {
            let watch_id = self.registry.watch(client_pid);
            if let Err(e) = self.active_sessions.set_watch_id(client_pid, watch_id) {
                tracing::warn!("Unable to update watch for client {}: {}", client_pid, e);
            }
        }

        for client_pid in self.active_sessions.write_clients() {
            let holder_id = self.registry.get_write_client(client_pid);
            let holder = self.write_lock.try_lock(holder_id);
            if holder != holder_id {
                tracing::warn!(
                    "Recovered write client {} conflicts with write lock holder {}",
                    client_pid,
                    holder
                );
            }
        }
    }

    pub fn active_sessions(&self) -> &ActiveSessions {
        &self.active_sessions
    }

    pub fn write_lock(&self) -> &WriteLock {
        &self.write_lock
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ClientRegistry {
        &mut self.registry
    }

    /// Every signal and control name the platform exposes
    pub fn get_all_access(&self) -> Access {
        self.access_lists.get_all_access()
    }

    /// Access a user would be granted by a new session
    pub fn get_user_access(&self, user: &str) -> BrokerResult<Access> {
        let groups = self.registry.get_user_groups(user);
        self.access_lists.get_user_access(user, &groups)
    }

    pub fn get_group_access(&self, group: &str) -> BrokerResult<Access> {
        self.access_lists.get_group_access(group)
    }

    pub fn set_group_access(
        &self,
        group: &str,
        signals: &[String],
        controls: &[String],
    ) -> BrokerResult<()> {
        self.access_lists.set_group_access(group, signals, controls)
    }

    /// Describe signals, in the order requested
    pub fn get_signal_info(&self, names: &[String]) -> BrokerResult<Vec<SignalInfo>> {
        names
            .iter()
            .map(|name| {
                let description = self.io.signal_description(name)?;
                let domain = self.io.signal_domain_type(name)?;
                let behavior = self.io.signal_info(name)?;
                Ok(SignalInfo {
                    name: name.clone(),
                    description,
                    domain,
                    aggregation: behavior.aggregation,
                    format: behavior.format,
                    behavior: behavior.behavior,
                })
            })
            .collect()
    }

    /// Describe controls, in the order requested
    pub fn get_control_info(&self, names: &[String]) -> BrokerResult<Vec<ControlInfo>> {
        names
            .iter()
            .map(|name| {
                Ok(ControlInfo {
                    name: name.clone(),
                    description: self.io.control_description(name)?,
                    domain: self.io.control_domain_type(name)?,
                })
            })
            .collect()
    }

    pub fn lock_control(&self) -> BrokerResult<()> {
        Err(BrokerError::NotImplemented)
    }

    pub fn unlock_control(&self) -> BrokerResult<()> {
        Err(BrokerError::NotImplemented)
    }

    /// Open a session for `client_pid`, or add a reference to an open one
    pub fn open_session(&mut self, user: &str, client_pid: i32) -> BrokerResult<()> {
        if self.active_sessions.is_client_active(client_pid) {
            let count = self.active_sessions.increment_reference_count(client_pid)?;
            tracing::debug!("Client {} reopened its session ({} references)", client_pid, count);
            return Ok(());
        }

        let groups = self.registry.get_user_groups(user);
        let (signals, controls) = self.access_lists.get_user_access(user, &groups)?;
        let watch_id = self.registry.watch(client_pid);
        let (signal_count, control_count) = (signals.len(), controls.len());
        if let Err(e) = self
            .active_sessions
            .add_client(client_pid, signals, controls, watch_id)
        {
            self.registry.unwatch(watch_id);
            return Err(e);
        }

        tracing::info!(
            "Opened session for {} (pid {}) with {} signal(s) and {} control(s)",
            user,
            client_pid,
            signal_count,
            control_count
        );
        Ok(())
    }

    /// Drop one reference; the session is torn down when none remain
    pub fn close_session(&mut self, client_pid: i32) -> BrokerResult<()> {
        self.active_sessions
            .check_client_active(client_pid, "PlatformService::close_session")?;
        let remaining = self.active_sessions.decrement_reference_count(client_pid)?;
        if remaining > 0 {
            tracing::debug!("Client {} still holds {} reference(s)", client_pid, remaining);
            return Ok(());
        }
        self.teardown(client_pid)
    }

    /// Tear a session down regardless of its reference count
    pub fn close_session_admin(&mut self, client_pid: i32) -> BrokerResult<()> {
        self.active_sessions
            .check_client_active(client_pid, "PlatformService::close_session_admin")?;
        self.teardown(client_pid)
    }

    fn teardown(&mut self, client_pid: i32) -> BrokerResult<()> {
        if let Some(watch_id) = self.active_sessions.get_watch_id(client_pid) {
            self.registry.unwatch(watch_id);
        }

        if let Some(server_pid) = self.active_sessions.get_batch_server(client_pid) {
            if let Err(e) = self.stop_batch_server(server_pid) {
                tracing::error!(
                    "Unable to stop batch server {} of client {}: {}",
                    server_pid,
                    client_pid,
                    e
                );
            }
        }

        if self.active_sessions.is_write_client(client_pid) {
            let others_writing = self
                .active_sessions
                .write_clients()
                .into_iter()
                .any(|pid| pid != client_pid);
            if !others_writing {
                self.release_write_access(client_pid);
            }
        }

        self.active_sessions.remove_client(client_pid)?;
        tracing::info!("Closed session for pid {}", client_pid);
        Ok(())
    }

    /// Restore saved controls and free the write lock
    fn release_write_access(&mut self, client_pid: i32) {
        if let Err(e) = self.io.restore_control_dir(&self.save_dir) {
            tracing::error!(
                "Unable to restore controls saved for client {}: {}",
                client_pid,
                e
            );
        }
        if let Err(e) = self.store.remove_tree(&self.save_dir) {
            tracing::warn!("Unable to remove {}: {}", self.save_dir.display(), e);
        }
        self.write_lock.unlock();
    }

    /// Mark `client_pid` as a write client, saving controls if it is the first.
    ///
    /// Called with the write lock already taken for the client. On failure
    /// the lock is released again unless some session is still recorded as
    /// writing, since teardown only unlocks for write clients.
    fn become_write_client(&mut self, client_pid: i32) -> BrokerResult<()> {
        let first = self.active_sessions.write_clients().is_empty();
        let mut result = if first { self.take_save_point() } else { Ok(()) };
        if result.is_ok() {
            result = self.active_sessions.set_write_client(client_pid);
        }

        if let Err(e) = &result {
            if self.active_sessions.write_clients().is_empty() {
                tracing::warn!(
                    "Client {} did not get write access, releasing the write lock: {}",
                    client_pid,
                    e
                );
                if let Err(e) = self.store.remove_tree(&self.save_dir) {
                    tracing::warn!("Unable to remove {}: {}", self.save_dir.display(), e);
                }
                self.write_lock.unlock();
            }
        }
        result
    }

    fn take_save_point(&self) -> BrokerResult<()> {
        self.store.make_dirs(&self.save_dir)?;
        self.io.save_control_dir(&self.save_dir)?;
        Ok(())
    }

    fn stop_batch_server(&self, server_pid: i32) -> BrokerResult<()> {
        if self.processes.pid_exists(server_pid) {
            self.io.stop_batch_server(server_pid)?;
        } else {
            tracing::debug!("Batch server {} already exited", server_pid);
        }
        Ok(())
    }

    pub fn read_signal(
        &self,
        client_pid: i32,
        name: &str,
        domain: i32,
        domain_idx: i32,
    ) -> BrokerResult<f64> {
        self.active_sessions
            .check_client_active(client_pid, "PlatformService::read_signal")?;
        let allowed = self.active_sessions.get_signals(client_pid).unwrap_or_default();
        if !allowed.iter().any(|s| s == name) {
            return Err(BrokerError::access_denied(NameKind::Signals, [name]));
        }
        Ok(self.io.read_signal(name, domain, domain_idx)?)
    }

    /// Write a control.
    ///
    /// The first write by a session takes the write lock if it is free, which
    /// saves control state for restoration at close. A write while another
    /// client holds the lock is still carried out.
    pub fn write_control(
        &mut self,
        client_pid: i32,
        name: &str,
        domain: i32,
        domain_idx: i32,
        value: f64,
    ) -> BrokerResult<()> {
        self.active_sessions
            .check_client_active(client_pid, "PlatformService::write_control")?;
        let allowed = self.active_sessions.get_controls(client_pid).unwrap_or_default();
        if !allowed.iter().any(|c| c == name) {
            return Err(BrokerError::access_denied(NameKind::Controls, [name]));
        }

        if !self.active_sessions.is_write_client(client_pid) {
            let holder_id = self.registry.get_write_client(client_pid);
            let holder = self.write_lock.try_lock(holder_id);
            if holder == holder_id {
                self.become_write_client(client_pid)?;
            } else {
                tracing::debug!(
                    "Client {} writes {} while {} holds the write lock",
                    client_pid,
                    name,
                    holder
                );
            }
        }

        Ok(self.io.write_control(name, domain, domain_idx, value)?)
    }

    /// Start a batch server for a session.
    ///
    /// Every requested name must be granted; any control makes this a
    /// write-mode server which needs the write lock.
    pub fn start_batch(
        &mut self,
        client_pid: i32,
        signal_config: &[BatchRequest],
        control_config: &[BatchRequest],
    ) -> BrokerResult<BatchHandle> {
        self.active_sessions
            .check_client_active(client_pid, "PlatformService::start_batch")?;

        let denied = not_granted(
            signal_config,
            self.active_sessions.get_signals(client_pid).unwrap_or_default(),
        );
        if !denied.is_empty() {
            return Err(BrokerError::access_denied(NameKind::Signals, denied));
        }
        let denied = not_granted(
            control_config,
            self.active_sessions.get_controls(client_pid).unwrap_or_default(),
        );
        if !denied.is_empty() {
            return Err(BrokerError::access_denied(NameKind::Controls, denied));
        }

        if let Some(existing) = self.active_sessions.get_batch_server(client_pid) {
            return Err(BrokerError::InvalidArgument(format!(
                "client {} already has batch server {}",
                client_pid, existing
            )));
        }

        if !control_config.is_empty() && !self.active_sessions.is_write_client(client_pid) {
            let holder_id = self.registry.get_write_client(client_pid);
            let holder = self.write_lock.try_lock(holder_id);
            if holder != holder_id {
                return Err(BrokerError::WriteConflict { client_pid, holder });
            }
            self.become_write_client(client_pid)?;
        }

        let (server_pid, key) =
            self.io
                .start_batch_server(client_pid, signal_config, control_config)?;
        self.active_sessions
            .set_batch_server(client_pid, Some(server_pid))?;
        tracing::info!(
            "Started batch server {} for client {} ({} signal(s), {} control(s))",
            server_pid,
            client_pid,
            signal_config.len(),
            control_config.len()
        );
        Ok(BatchHandle { server_pid, key })
    }

    /// Stop the batch server bound to a session
    pub fn stop_batch(&mut self, client_pid: i32, server_pid: i32) -> BrokerResult<()> {
        self.active_sessions
            .check_client_active(client_pid, "PlatformService::stop_batch")?;
        if self.active_sessions.get_batch_server(client_pid) != Some(server_pid) {
            return Err(BrokerError::InvalidArgument(format!(
                "batch server {} is not associated with client {}",
                server_pid, client_pid
            )));
        }
        self.stop_batch_server(server_pid)?;
        self.active_sessions.set_batch_server(client_pid, None)
    }

    /// Reclaim sessions of watched clients whose process has exited.
    ///
    /// Returns the pids whose sessions were closed.
    pub fn check_clients(&mut self) -> Vec<i32> {
        let dead = self.registry.dead_clients();
        self.reclaim(dead, "exited")
    }

    /// Reclaim sessions orphaned by a closed connection
    pub fn connection_closed(&mut self, connection: &ConnectionId) -> Vec<i32> {
        let orphaned = self.registry.unregister(connection);
        self.reclaim(orphaned, "disconnected")
    }

    fn reclaim(&mut self, client_pids: Vec<i32>, reason: &str) -> Vec<i32> {
        let mut closed = Vec::new();
        for client_pid in client_pids {
            if !self.active_sessions.is_client_active(client_pid) {
                continue;
            }
            tracing::info!("Client {} {}, closing its session", client_pid, reason);
            match self.close_session_admin(client_pid) {
                Ok(()) => closed.push(client_pid),
                Err(e) => tracing::error!("Unable to close session of {}: {}", client_pid, e),
            }
        }
        closed
    }
}

/// Names in `requests` missing from `granted`
fn not_granted(requests: &[BatchRequest], granted: &[String]) -> Vec<String> {
    requests
        .iter()
        .filter(|request| !granted.contains(&request.name))
        .map(|request| request.name.clone())
        .collect()
}
