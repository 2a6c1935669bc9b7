//! Server module - Unix socket listener and client connection handling

mod connection;
mod listener;
mod state;

pub use connection::ClientConnection;
pub use listener::BrokerServer;
pub use state::BrokerState;
