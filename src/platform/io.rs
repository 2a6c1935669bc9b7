//! Boundary to the hardware I/O layer

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Failure reported by the hardware I/O layer, surfaced to clients unchanged
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PlatformError {
    message: String,
}

impl PlatformError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// One signal or control requested for a batch server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub domain: i32,
    pub domain_idx: i32,
    pub name: String,
}

impl BatchRequest {
    pub fn new(domain: i32, domain_idx: i32, name: impl Into<String>) -> Self {
        Self {
            domain,
            domain_idx,
            name: name.into(),
        }
    }
}

/// Handle of a running batch server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHandle {
    pub server_pid: i32,
    pub key: String,
}

/// How a signal is aggregated, formatted and behaves over time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalBehavior {
    pub aggregation: i32,
    pub format: i32,
    pub behavior: i32,
}

/// Description of a signal as reported to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalInfo {
    pub name: String,
    pub description: String,
    pub domain: i32,
    pub aggregation: i32,
    pub format: i32,
    pub behavior: i32,
}

/// Description of a control as reported to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlInfo {
    pub name: String,
    pub description: String,
    pub domain: i32,
}

/// Operations the broker delegates to the hardware I/O layer.
///
/// All calls are synchronous.
pub trait PlatformIo: Send + Sync {
    /// Every signal name the platform exposes
    fn signal_names(&self) -> Vec<String>;

    /// Every control name the platform exposes
    fn control_names(&self) -> Vec<String>;

    fn read_signal(&self, name: &str, domain: i32, domain_idx: i32) -> PlatformResult<f64>;

    fn write_control(&self, name: &str, domain: i32, domain_idx: i32, value: f64) -> PlatformResult<()>;

    /// Save the current value of every control into `dir`
    fn save_control_dir(&self, dir: &Path) -> PlatformResult<()>;

    /// Restore control values saved by [`PlatformIo::save_control_dir`]
    fn restore_control_dir(&self, dir: &Path) -> PlatformResult<()>;

    fn signal_description(&self, name: &str) -> PlatformResult<String>;

    fn control_description(&self, name: &str) -> PlatformResult<String>;

    fn signal_domain_type(&self, name: &str) -> PlatformResult<i32>;

    fn control_domain_type(&self, name: &str) -> PlatformResult<i32>;

    fn signal_info(&self, name: &str) -> PlatformResult<SignalBehavior>;

    /// Spawn a batch server for `client_pid`, blocking until it reports its key.
    ///
    /// Returns the server pid and key.
    fn start_batch_server(
        &self,
        client_pid: i32,
        signals: &[BatchRequest],
        controls: &[BatchRequest],
    ) -> PlatformResult<(i32, String)>;

    fn stop_batch_server(&self, server_pid: i32) -> PlatformResult<()>;

    /// Write the topology cache to `path`
    fn create_topo_cache(&self, path: &Path) -> PlatformResult<()>;
}
