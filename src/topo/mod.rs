//! Platform topology cache

use crate::context::BrokerContext;
use crate::error::BrokerResult;
use crate::platform::PlatformIo;
use crate::secure::SecureStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// World-readable topology cache
pub const CACHE_MODE: u32 = 0o644;

/// Serves the topology cache, creating it on demand
pub struct TopoService {
    io: Arc<dyn PlatformIo>,
    store: Arc<dyn SecureStore>,
    path: PathBuf,
}

impl TopoService {
    pub fn new(context: &BrokerContext) -> Self {
        Self {
            io: Arc::clone(&context.io),
            store: Arc::clone(&context.store),
            path: context.paths.topo_cache(),
        }
    }

    pub fn cache_path(&self) -> &Path {
        &self.path
    }

    /// Contents of the topology cache.
    ///
    /// A missing or quarantined cache is regenerated first.
    pub fn get_cache(&self) -> BrokerResult<String> {
        match self.store.read_file(&self.path, CACHE_MODE) {
            Ok(file) => return Ok(file.contents),
            Err(e) if e.is_not_found() || e.is_quarantined() => {
                tracing::info!("Regenerating topology cache: {}", e);
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(parent) = self.path.parent() {
            self.store.make_dirs(parent)?;
        }
        self.io.create_topo_cache(&self.path)?;
        Ok(self.store.read_file(&self.path, CACHE_MODE)?.contents)
    }
}
