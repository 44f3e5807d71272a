//! Client side of the protocol: connectors and the remote database adapter.

mod connector;
mod remote;

pub use connector::*;
pub use remote::*;
