//! # HandlerSocket Async Client
//!
//! Purpose: Perform indexed lookups, inserts, updates and deletes against a
//! HandlerSocket backend without going through a SQL parser.
//!
//! ## Design Principles
//! 1. **Two Sockets**: Lookups use the read port, mutations the write port.
//!    Each socket has its own reader and writer task.
//! 2. **Strict Correlation**: One outstanding request per socket; the next
//!    line read answers the last line written.
//! 3. **Client-Owned Bindings**: Column names for each opened index are kept
//!    per client and used to label `find` results.
//! 4. **Protocol Clarity**: Encoding and decoding live in `hs-common` as pure
//!    functions.
//!
//! ## Example
//!
//! ```no_run
//! use hs_client::{HandlerSocket, Operator};
//!
//! # async fn demo() -> hs_client::ClientResult<()> {
//! let client = HandlerSocket::new();
//! client.connect("127.0.0.1").await?;
//! client.open_index(1, "hstest", "hstest_table1", "PRIMARY", &["k", "v"]).await?;
//! client.insert(1, &["blue1", "hello"]).await?;
//! let rows = client.find(1, Operator::Eq, 1, 0, &["blue1"]).await?;
//! assert_eq!(rows[0].get("v"), Some("hello"));
//! client.close()?;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod connection;
mod correlator;
mod error;
mod registry;

pub use client::HandlerSocket;
pub use config::ClientConfig;
pub use connection::{Direction, Lifecycle};
pub use error::{ClientError, ClientResult};
pub use registry::{IndexBinding, Row};

pub use hs_common::{
    IndexId, ModifyOp, Operator, ProtocolError, DEFAULT_READ_PORT, DEFAULT_WRITE_PORT,
    PRIMARY_INDEX,
};
