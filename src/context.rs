//! Collaborators and paths shared by the broker's services
//!
//! Built once at startup and handed to each service; there is no global
//! state.

use crate::platform::PlatformIo;
use crate::process::ProcessTable;
use crate::secure::SecureStore;
use std::path::PathBuf;
use std::sync::Arc;

/// Filesystem locations used by the broker
#[derive(Debug, Clone)]
pub struct BrokerPaths {
    /// Broker-private directory holding session files (mode 0700)
    pub state_dir: PathBuf,

    /// Root of the access list store
    pub access_dir: PathBuf,
}

impl BrokerPaths {
    pub fn new(state_dir: impl Into<PathBuf>, access_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            access_dir: access_dir.into(),
        }
    }

    /// Where control values are saved while a client holds write access
    pub fn save_dir(&self) -> PathBuf {
        self.state_dir.join("SAVE_FILES")
    }

    pub fn topo_cache(&self) -> PathBuf {
        self.state_dir.join("topo-cache")
    }
}

/// Everything a service needs from the outside world
#[derive(Clone)]
pub struct BrokerContext {
    pub io: Arc<dyn PlatformIo>,
    pub store: Arc<dyn SecureStore>,
    pub processes: Arc<dyn ProcessTable>,
    pub paths: BrokerPaths,
}

impl BrokerContext {
    pub fn new(
        io: Arc<dyn PlatformIo>,
        store: Arc<dyn SecureStore>,
        processes: Arc<dyn ProcessTable>,
        paths: BrokerPaths,
    ) -> Self {
        Self {
            io,
            store,
            processes,
            paths,
        }
    }
}
