//! # fastrpc-server
//!
//! TCP server for fastrpc.
//!
//! This crate provides:
//! - TCP connection handling with async I/O
//! - Protocol framing and call dispatch to registered handlers
//! - Per-connection call tracking with cancellation propagation
//! - YAML and environment based configuration

pub mod config;
pub mod error;
pub mod handler;
pub mod server;
pub mod session;

pub use config::{Config, ConfigError, NetworkConfig, RpcConfig};
pub use error::ServerError;
pub use handler::{Handler, Registry};
pub use server::{Server, ServerConfig, ServerEvent, ServerStats};
pub use session::Session;
