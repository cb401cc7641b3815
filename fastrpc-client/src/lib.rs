//! # fastrpc-client
//!
//! Client library for fastrpc.
//!
//! This crate provides:
//! - Async TCP client multiplexing concurrent calls over one connection
//! - Streaming responses and call cancellation
//! - Connection retries with exponential backoff and automatic reconnection

pub mod call;
pub mod client;
pub mod connection;
pub mod error;
pub mod event;

pub use call::{Call, CallEvent};
pub use client::{Client, ConnectionState};
pub use connection::{ClientConfig, Reconnect, RetryPolicy};
pub use error::ClientError;
pub use event::ClientEvent;
