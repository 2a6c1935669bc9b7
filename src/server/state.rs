//! Broker state shared across connections

use crate::context::BrokerContext;
use crate::error::BrokerResult;
use crate::platform::PlatformService;
use crate::topo::TopoService;

/// Services driven by the transport.
///
/// Held behind one mutex so every operation runs to completion before the
/// next starts.
pub struct BrokerState {
    pub platform: PlatformService,
    pub topo: TopoService,
}

impl BrokerState {
    pub fn new(context: &BrokerContext) -> BrokerResult<Self> {
        Ok(Self {
            platform: PlatformService::new(context)?,
            topo: TopoService::new(context),
        })
    }
}
