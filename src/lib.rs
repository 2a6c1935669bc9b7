//! hwbroker - A privileged broker mediating access to hardware signals and controls
//!
//! This crate provides the session and access-control core of the broker:
//! - Secure on-disk state (session records, access lists, save points)
//! - Per-client sessions, authorization and the system-wide write lock
//! - Client-server protocol, the socket server and a client library
//!
//! # Architecture
//!
//! The broker daemon (`hwbroker`) runs with elevated privilege and owns all
//! hardware access. Unprivileged clients connect over a Unix domain socket;
//! each request is checked against the access lists of the calling user
//! before it reaches the [`platform::PlatformIo`] layer.

pub mod access;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod platform;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod secure;
pub mod server;
pub mod session;
pub mod topo;
pub mod write_lock;

pub use context::{BrokerContext, BrokerPaths};
pub use error::{BrokerError, BrokerResult, ErrorKind};
