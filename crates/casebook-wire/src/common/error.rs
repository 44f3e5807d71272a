//! Error types for the casebook wire protocol.
//!
//! ## Error Cases
//! - `Io`: The underlying stream failed or ended mid-message.
//! - `MalformedCommand`: The peer sent an unknown opcode.
//! - `InvalidRequest`: A well-formed command carried out-of-range values.
//! - `NameTooLong`: A solver name does not fit the u16 length prefix.
//! - `Tls`: Certificate material could not be loaded or a TLS config could
//!   not be built.
//! - `Ledger`: An error surfaced from the `casebook` core.

use std::io;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the wire protocol and its endpoints.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Socket I/O failed or the stream ended inside a message.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The command byte is not a known opcode.
    #[error("malformed command: opcode {opcode:#04x}")]
    MalformedCommand { opcode: u8 },

    /// The command was well formed but violated protocol limits.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// A solver name longer than 65535 bytes of UTF-8.
    #[error("solver name too long: {len} bytes")]
    NameTooLong { len: usize },

    /// Loading certificates or keys, or building a TLS config, failed.
    #[error("TLS error: {context}")]
    Tls { context: String },

    /// Error from the ledger core.
    #[error("ledger error: {0}")]
    Ledger(#[from] casebook::Error),
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Self::Tls {
            context: err.to_string(),
        }
    }
}
