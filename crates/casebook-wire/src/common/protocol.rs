//! The casebook wire protocol.
//!
//! Every client message is one opcode byte followed by fixed-width
//! big-endian fields:
//!
//! | Opcode | Command            | Fields                                   | Flushed |
//! |--------|--------------------|------------------------------------------|---------|
//! | `0x01` | `FETCH_CASES`      | `i32 count`                              | yes     |
//! | `0x02` | `ANNOUNCE_SOLVER`  | `i32 id`, `u16 len`, `len` bytes UTF-8   | no      |
//! | `0x03` | `REPORT_RESULT`    | `i32 id`, `i64 spec`, `i64 result`       | yes     |
//! | `0x04` | `DENOUNCE_SOLVER`  | `i32 id`                                 | no      |
//!
//! The server answers `FETCH_CASES(n)` with exactly `n` big-endian `i64`
//! payloads, `0` meaning "no work". No other command is answered.
//!
//! An unflushed command rides along with the next flushed one; clients
//! encode related commands into one buffer and write it in one go.

use crate::{Error, Result};
use bytes::{BufMut, BytesMut};
use core::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Command bytes understood by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    FetchCases = 0x01,
    AnnounceSolver = 0x02,
    ReportResult = 0x03,
    DenounceSolver = 0x04,
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(Self::FetchCases),
            0x02 => Ok(Self::AnnounceSolver),
            0x03 => Ok(Self::ReportResult),
            0x04 => Ok(Self::DenounceSolver),
            opcode => Err(Error::MalformedCommand { opcode }),
        }
    }
}

/// One client-to-server message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Request `count` case payloads.
    FetchCases { count: i32 },
    /// Bind a connection-local solver ID to a display name.
    AnnounceSolver { id: i32, name: String },
    /// Report `result` for the case `spec` on behalf of solver `id`.
    ReportResult { id: i32, spec: u64, result: u64 },
    /// Release a connection-local solver ID.
    DenounceSolver { id: i32 },
}

impl Command {
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::FetchCases { .. } => Opcode::FetchCases,
            Self::AnnounceSolver { .. } => Opcode::AnnounceSolver,
            Self::ReportResult { .. } => Opcode::ReportResult,
            Self::DenounceSolver { .. } => Opcode::DenounceSolver,
        }
    }

    /// Whether the sender flushes the stream after this command.
    pub const fn flushes(&self) -> bool {
        matches!(self, Self::FetchCases { .. } | Self::ReportResult { .. })
    }

    /// Appends the encoded command to `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NameTooLong`] if an announced name exceeds 65535
    /// bytes; `buf` is left untouched in that case.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Self::FetchCases { count } => {
                buf.reserve(5);
                buf.put_u8(Opcode::FetchCases as u8);
                buf.put_i32(*count);
            }
            Self::AnnounceSolver { id, name } => {
                let len = u16::try_from(name.len())
                    .map_err(|_| Error::NameTooLong { len: name.len() })?;
                buf.reserve(7 + name.len());
                buf.put_u8(Opcode::AnnounceSolver as u8);
                buf.put_i32(*id);
                buf.put_u16(len);
                buf.put_slice(name.as_bytes());
            }
            Self::ReportResult { id, spec, result } => {
                buf.reserve(21);
                buf.put_u8(Opcode::ReportResult as u8);
                buf.put_i32(*id);
                buf.put_u64(*spec);
                buf.put_u64(*result);
            }
            Self::DenounceSolver { id } => {
                buf.reserve(5);
                buf.put_u8(Opcode::DenounceSolver as u8);
                buf.put_i32(*id);
            }
        }
        Ok(())
    }

    /// Reads the next command.
    ///
    /// Returns `Ok(None)` if the stream ends cleanly before an opcode byte.
    ///
    /// # Errors
    ///
    /// * [`Error::MalformedCommand`] for an unknown opcode.
    /// * [`Error::Io`] if the stream fails or ends inside a command.
    /// * [`Error::InvalidRequest`] for a name that is not UTF-8.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Self>> {
        let mut opcode = [0u8; 1];
        if reader.read(&mut opcode).await? == 0 {
            return Ok(None);
        }
        let command = match Opcode::try_from(opcode[0])? {
            Opcode::FetchCases => Self::FetchCases {
                count: reader.read_i32().await?,
            },
            Opcode::AnnounceSolver => {
                let id = reader.read_i32().await?;
                let len = reader.read_u16().await? as usize;
                let mut bytes = vec![0; len];
                reader.read_exact(&mut bytes).await?;
                let name = String::from_utf8(bytes).map_err(|e| Error::InvalidRequest {
                    reason: format!("solver name is not UTF-8: {e}"),
                })?;
                Self::AnnounceSolver { id, name }
            }
            Opcode::ReportResult => Self::ReportResult {
                id: reader.read_i32().await?,
                spec: reader.read_u64().await?,
                result: reader.read_u64().await?,
            },
            Opcode::DenounceSolver => Self::DenounceSolver {
                id: reader.read_i32().await?,
            },
        };
        Ok(Some(command))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FetchCases { count } => write!(f, "FETCH_CASES({count})"),
            Self::AnnounceSolver { id, name } => write!(f, "ANNOUNCE_SOLVER({id}, {name:?})"),
            Self::ReportResult { id, spec, result } => {
                write!(f, "REPORT_RESULT({id}, {spec:#x}, {result:#x})")
            }
            Self::DenounceSolver { id } => write!(f, "DENOUNCE_SOLVER({id})"),
        }
    }
}

/// Appends a `FETCH_CASES` response.
pub fn encode_cases(cases: &[u64], buf: &mut BytesMut) {
    buf.reserve(cases.len() * 8);
    for &case in cases {
        buf.put_u64(case);
    }
}
