//! heliolink
//!
//! Async client for the framed register protocol spoken by solar inverter
//! / battery controllers over TCP. The device exposes named registers
//! addressed by 32-bit ids; this crate reads and writes them over a
//! persistent connection while handling the wire format, request
//! serialization and connection lifecycle.
//!
//! # Architecture
//!
//! ```text
//! heliolink
//!     ├── frame      (start/escape tokens, CRC-16, incremental decoder)
//!     ├── registry   (register catalog, wire-type value codec)
//!     ├── cache      (per-connection TTL response cache)
//!     ├── pipeline   (FIFO jobs, waiter slot, retry backoff)
//!     ├── connection (transport lifecycle, reader loop, idle close)
//!     └── pool       (process-wide keyed registry)
//! ```
//!
//! The protocol is half-duplex with positional correlation: the next
//! response on a connection belongs to the most recently sent request, so
//! each connection serializes callers onto the wire with at most one
//! request outstanding. Reads within the cache TTL are answered locally;
//! writes are verified with a byte-exact follow-up read.
//!
//! # Example
//!
//! ```ignore
//! use heliolink::{registry, ConnectionPool};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> heliolink::Result<()> {
//!     let pool = ConnectionPool::new();
//!     let inverter = pool.get("192.168.40.21", 8899, Duration::from_secs(10), 128);
//!
//!     let soc = registry::find_register_by_label("battery.soc").unwrap();
//!     println!("state of charge: {:?}", inverter.query(soc).await?);
//!
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod frame;
pub mod pool;
pub mod registry;

mod connection;
mod pipeline;

pub use cache::ResponseCache;
pub use config::LinkConfig;
pub use connection::{ConnectOptions, Connection};
pub use error::{LinkError, Result};
pub use frame::{decode, encode_frame, Command, Datagram, DecodeStep};
pub use pool::ConnectionPool;
pub use registry::{
    find_register, RegisterDesc, RegisterValue, WireType, BUILTIN_CATALOG, ID_BATTERY_SOC,
    ID_BATTERY_STATUS,
};
