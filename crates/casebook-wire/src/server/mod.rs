//! Server side of the protocol.

mod session;

pub use session::*;
