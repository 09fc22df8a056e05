//! # msgswitch-server
//!
//! Server sessions for msgswitch.
//!
//! This crate provides:
//! - `Server`, which serves a broker queue sequentially (`listen`) or one
//!   batch at a time concurrently (`listen_p`), with a two-phase shutdown
//! - The `Handler` trait with closure, echo and external-program handlers
//! - YAML and environment configuration for the service host

pub mod config;
pub mod error;
pub mod handler;
pub mod server;

pub use config::{BrokerConfig, Config, ConfigError, ServiceConfig};
pub use error::ServerError;
pub use handler::{handler_fn, EchoHandler, Handler, HandlerFn, ProgramHandler};
pub use server::{Server, ServerConfig, ServerState, ServerStats};
