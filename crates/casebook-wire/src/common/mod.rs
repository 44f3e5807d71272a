//! Types shared by the client adapter and the server session.
//!
//! - [`error`] - The protocol error type.
//! - [`protocol`] - Opcodes and the command codec.

pub mod error;
pub mod protocol;

pub use error::*;
pub use protocol::*;
