//! Per-connection server session.
//!
//! A [`Session`] serves one client connection against a shared [`Database`]
//! whose entries are reference counted, normally a
//! [`Tracking`](casebook::Tracking) ledger. Commands are processed strictly in
//! order:
//!
//! - `FETCH_CASES(n)`: fetches `n` entries (`0` once the database runs
//!   dry), remembers each as an *outstanding offer* and answers with one
//!   flushed batch.
//! - `ANNOUNCE_SOLVER(id, name)`: binds `id` to a fresh attributor named
//!   `"<peer> <name>"`.
//! - `REPORT_RESULT(id, spec, result)`: solves the outstanding offer for
//!   `spec` on behalf of solver `id`.
//! - `DENOUNCE_SOLVER(id)`: forgets `id`.
//!
//! Offers are held as [`Weak`] references. The database keeps the entry
//! alive while its lease is current; once the lease expires and the case is
//! re-offered elsewhere, the offer here can no longer be upgraded and a late
//! report for it is logged as spurious.

use crate::{Command, Error, Result, encode_cases};
use bytes::BytesMut;
use casebook::{Attributor, Database, Entry};
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default upper bound on a single `FETCH_CASES` count.
pub const DEFAULT_MAX_FETCH: usize = 4096;

/// Limits applied to every session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Largest accepted `FETCH_CASES` count.
    pub max_fetch: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_fetch: DEFAULT_MAX_FETCH,
        }
    }
}

/// Observer for session activity, e.g. to feed metrics.
pub trait SessionEvents: Send + Sync {
    /// `count` cases (including "no work" zeros) were sent.
    fn offered(&self, _count: u64) {}
    /// A report was forwarded to the database.
    fn reported(&self) {}
    /// A report matched no live offer.
    fn spurious(&self) {}
}

impl SessionEvents for () {}

/// One client connection's protocol state.
pub struct Session<D, E, V = ()> {
    peer: String,
    db: Arc<D>,
    config: SessionConfig,
    events: V,
    solvers: HashMap<i32, Arc<Attributor>>,
    offers: HashMap<u64, Weak<E>>,
}

impl<D, E> Session<D, E>
where
    D: Database<Entry = Arc<E>>,
    E: Entry + 'static,
{
    /// `peer` is a display label only; it prefixes every announced solver
    /// name.
    pub fn new(peer: impl Into<String>, db: Arc<D>, config: SessionConfig) -> Self {
        Self {
            peer: peer.into(),
            db,
            config,
            events: (),
            solvers: HashMap::new(),
            offers: HashMap::new(),
        }
    }
}

impl<D, E, V> Session<D, E, V>
where
    D: Database<Entry = Arc<E>>,
    E: Entry + 'static,
    V: SessionEvents,
{
    pub fn with_events<V2: SessionEvents>(self, events: V2) -> Session<D, E, V2> {
        Session {
            peer: self.peer,
            db: self.db,
            config: self.config,
            events,
            solvers: self.solvers,
            offers: self.offers,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Offers whose entry is still alive.
    pub fn outstanding(&self) -> usize {
        self.offers.values().filter(|o| o.strong_count() > 0).count()
    }

    /// Serves `stream` until the client closes it, a protocol violation
    /// occurs, or `shutdown` fires.
    ///
    /// # Errors
    ///
    /// * [`Error::MalformedCommand`] for an unknown opcode.
    /// * [`Error::InvalidRequest`] for an out-of-range fetch count.
    /// * [`Error::Io`] if the stream fails or ends inside a command.
    pub async fn run<S>(mut self, stream: S, shutdown: CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        info!(peer = %self.peer, "serving client");
        let mut stream = BufStream::new(stream);
        let outcome = loop {
            let command = tokio::select! {
                c = Command::read(&mut stream) => c,
                () = shutdown.cancelled() => break Ok(()),
            };
            match command {
                Ok(Some(command)) => {
                    if let Err(e) = self.handle(command, &mut stream).await {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        info!(peer = %self.peer, outstanding = self.outstanding(), "client disconnected");
        outcome
    }

    async fn handle<W>(&mut self, command: Command, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match command {
            Command::FetchCases { count } => {
                let count = usize::try_from(count)
                    .ok()
                    .filter(|&n| n <= self.config.max_fetch)
                    .ok_or_else(|| Error::InvalidRequest {
                        reason: format!(
                            "fetch count {count} outside 0..={}",
                            self.config.max_fetch
                        ),
                    })?;
                self.offers.retain(|_, offer| offer.strong_count() > 0);

                let mut cases = Vec::with_capacity(count);
                for _ in 0..count {
                    let spec = match self.db.fetch_unsolved().await {
                        Some(entry) => {
                            let spec = entry.spec();
                            self.offers.insert(spec, Arc::downgrade(&entry));
                            spec
                        }
                        None => 0,
                    };
                    cases.push(spec);
                }

                let mut buf = BytesMut::new();
                encode_cases(&cases, &mut buf);
                writer.write_all(&buf).await?;
                writer.flush().await?;
                self.events.offered(count as u64);
                debug!(peer = %self.peer, count, "offered cases");
            }
            Command::AnnounceSolver { id, name } => {
                let solver = Attributor::shared(format!("{} {name}", self.peer));
                debug!(id, solver = %solver, "solver announced");
                self.solvers.insert(id, solver);
            }
            Command::ReportResult { id, spec, result } => {
                let Some(solver) = self.solvers.get(&id) else {
                    warn!(peer = %self.peer, id, spec, result, "report from unannounced solver");
                    return Ok(());
                };
                let entry = self.offers.remove(&spec).and_then(|offer| offer.upgrade());
                match entry {
                    Some(entry) => {
                        let served = entry.solve(solver, result);
                        debug!(peer = %self.peer, spec, served, "result reported");
                        self.events.reported();
                    }
                    None => {
                        warn!(
                            spec = format_args!("{spec:#013x}"),
                            result = format_args!("{result:#015x}"),
                            solver = %solver,
                            "spurious result"
                        );
                        self.events.spurious();
                    }
                }
            }
            Command::DenounceSolver { id } => {
                if self.solvers.remove(&id).is_none() {
                    debug!(peer = %self.peer, id, "denounced unknown solver");
                }
            }
        }
        Ok(())
    }
}
