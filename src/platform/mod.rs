//! Hardware I/O boundary and the session-aware service in front of it

mod batch;
mod io;
mod memory;
mod service;

pub use batch::{BatchProcess, BatchState};
pub use io::{
    BatchHandle, BatchRequest, ControlInfo, PlatformError, PlatformIo, PlatformResult,
    SignalBehavior, SignalInfo,
};
pub use memory::MemoryIo;
pub use service::PlatformService;
