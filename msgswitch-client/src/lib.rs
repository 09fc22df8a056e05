//! # msgswitch-client
//!
//! Client library for msgswitch.
//!
//! This crate provides:
//! - The `Transport` trait and a TCP / Unix socket transport
//! - Write-once cells (`Ivar`) and cancellable delayed timers
//! - A request/response `Connection` speaking the broker protocol
//! - `Client`, an RPC session that correlates responses with their callers
//!   and reconnects on its own
//! - An in-process loopback broker (feature `loopback`)

pub mod client;
pub mod connection;
pub mod error;
pub mod ivar;
#[cfg(any(test, feature = "loopback"))]
pub mod loopback;
pub mod stream;
pub mod timer;
pub mod transport;

pub use client::{Client, ClientConfig, ClientState};
pub use connection::{Connection, ConnectionConfig};
pub use error::{ClientError, ExchangeError};
pub use ivar::{AlreadyFilled, Ivar};
#[cfg(any(test, feature = "loopback"))]
pub use loopback::LoopbackBroker;
pub use stream::BrokerStream;
pub use timer::{run_after, TimerHandle};
pub use transport::{BrokerTransport, Endpoint, Transport};
