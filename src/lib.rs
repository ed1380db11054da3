//! # Memcachesque
//! Sharded client for the memcached binary protocol.
//!
//! This crate multiplexes cache requests across a pool of backend nodes:
//! keys are distributed over a weighted consistent-hash ring, each address
//! gets a bounded connection pool, and two background loops keep ring
//! membership converged with a periodically resolved server list (such as
//! the DNS records of a Kubernetes headless service).
//!
//! # Goals
//! - Easy to understand code
//! - Leverage best in class libraries such as [Tokio](https://tokio.rs/)
//! - Speak the binary protocol exactly, including pipelined quiet-opcode
//!   batches and PLAIN SASL
//! - Stay up and converged while cache nodes come and go
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use memcachesque::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cfg = ClientConfig::with_servers(["127.0.0.1:11211"]);
//!     let client = Client::connect(cfg).await?;
//!
//!     client.store(StoreMode::Set, "greeting", 0, "hello").await?;
//!     let resp = client.get("greeting").await?;
//!     println!("{}", String::from_utf8_lossy(&resp.body));
//!     Ok(())
//! }
//! ```
//!
//! Or bootstrap from `MEMCACHED_SERVERS` /
//! `MEMCACHED_HEADLESS_SERVICE_ADDRESS` with [`Client::from_env`].
//!
//! ## Batches
//!
//! Multi-key operations partition keys by owning node and pipeline each
//! partition on a single connection as quiet opcodes terminated by a NOOP
//! sentinel:
//!
//! ```rust,no_run
//! # use memcachesque::prelude::*;
//! # async fn example(client: Client) -> Result<()> {
//! let values = client.multi_get(["foo", "bar", "baz"]).await?;
//! for (key, body) in &values {
//!     println!("{key} = {} bytes", body.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Error model
//!
//! A non-success response is both a structured value and an error: see
//! [`error::Error`] for the classification and for which kinds allow the
//! connection to be reused.

#![forbid(unsafe_code)]

pub mod addr;
pub mod client;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod protocol;
mod provider;
pub mod request;
pub mod response;
pub mod ring;
pub mod telemetry;

pub mod prelude {
    //! Main exports of the client surface.
    pub use crate::client::{Client, legal_key};
    pub use crate::config::{AuthCredentials, ClientConfig};
    pub use crate::error::{Error, Result};
    pub use crate::protocol::{OpCode, Status};
    pub use crate::request::{AppendMode, DeltaMode, Request, StoreMode};
    pub use crate::response::Response;

    pub use bytes;
}
