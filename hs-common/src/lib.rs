// hs-common - Shared types and wire codec for the HandlerSocket client
//
// This crate defines the command/response model and the tab-delimited line
// format spoken on both the read and the write port. It performs no I/O.

pub mod error;
pub mod protocol;
pub mod types;

// Re-export for convenience
pub use error::*;
pub use protocol::*;
pub use types::*;
