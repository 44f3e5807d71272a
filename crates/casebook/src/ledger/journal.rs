use chrono::DateTime;
use parking_lot::Mutex;
use std::io::{self, Write};

pub(crate) type Sink = Box<dyn Write + Send>;

/// Append-only side logs kept next to a ledger.
///
/// * The duplicate log receives the raw 16-byte `(spec word, result word)`
///   pair of every report for an already solved case.
/// * The solver log receives one line per newly assigned solver ID:
///   `YYYY-MM-DD HH:MM SOLVER #<id>: <name>`.
///
/// Both logs are optional. Write failures are returned to the caller, which
/// logs them; they never affect the ledger itself.
#[derive(Default)]
pub(crate) struct Journal {
    duplicates: Option<Mutex<Sink>>,
    solvers: Option<Mutex<Sink>>,
}

impl Journal {
    pub(crate) fn new(duplicates: Option<Sink>, solvers: Option<Sink>) -> Self {
        Self {
            duplicates: duplicates.map(Mutex::new),
            solvers: solvers.map(Mutex::new),
        }
    }

    pub(crate) fn duplicate(&self, spec_word: u64, result_word: u64) -> io::Result<()> {
        let Some(sink) = &self.duplicates else {
            return Ok(());
        };
        let mut bytes = [0; 16];
        bytes[..8].copy_from_slice(&spec_word.to_be_bytes());
        bytes[8..].copy_from_slice(&result_word.to_be_bytes());
        let mut sink = sink.lock();
        sink.write_all(&bytes)?;
        sink.flush()
    }

    pub(crate) fn solver(&self, id: u32, name: &str, now_millis: u64) -> io::Result<()> {
        let Some(sink) = &self.solvers else {
            return Ok(());
        };
        let at = DateTime::from_timestamp_millis(now_millis as i64).unwrap_or_default();
        let mut sink = sink.lock();
        writeln!(sink, "{} SOLVER #{id}: {name}", at.format("%Y-%m-%d %H:%M"))?;
        sink.flush()
    }
}
