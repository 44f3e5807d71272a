//! Client-side [`Database`] backed by a remote ledger server.
//!
//! [`RemoteDatabase`] keeps one connection open through a [`Connector`] and
//! runs two loops over it:
//!
//! - **Fetch loop**: whenever the input queue falls below
//!   `min_available`, requests `in_capacity - len` cases in one
//!   `FETCH_CASES` and appends the reply to the input queue.
//! - **Report loop**: drains the output queue in FIFO order. The first
//!   report of an attributor is preceded by `ANNOUNCE_SOLVER`; IDs of
//!   attributors that have since been dropped are released with
//!   `DENOUNCE_SOLVER`.
//!
//! A report whose solver finds the connection's ID pool full of live
//! solvers is dropped with a warning. The first I/O error on either loop
//! tears the connection down. A report
//! that was being sent goes back to the tail of the output queue, the input
//! queue is discarded, and the supervisor reconnects after a fixed backoff,
//! forever, until [`RemoteDatabase::shutdown`].

use super::Connector;
use crate::{Command, Result};
use bytes::BytesMut;
use casebook::{Attributor, Database, Entry, Error as LedgerError, IdPool};
use core::fmt;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{Mutex as AsyncMutex, Notify},
    task::JoinHandle,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Queue sizing and reconnect policy of a [`RemoteDatabase`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Cases held locally after a refill.
    pub in_capacity: usize,
    /// Refill once fewer than this many cases are queued.
    pub min_available: usize,
    /// Fixed delay between reconnect attempts.
    pub reconnect_backoff: Duration,
    /// Capacity of the per-connection solver ID pool.
    pub pool_capacity: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            in_capacity: 200,
            min_available: 100,
            reconnect_backoff: Duration::from_secs(30),
            pool_capacity: casebook::DEFAULT_POOL_CAPACITY,
        }
    }
}

impl RemoteConfig {
    /// # Errors
    ///
    /// Requires `0 < min_available <= in_capacity`, an `in_capacity` that
    /// fits a `FETCH_CASES` count and a non-empty solver pool.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| -> Result<()> {
            Err(LedgerError::InvalidConfig {
                reason: reason.into(),
            }
            .into())
        };
        if self.min_available == 0 || self.in_capacity < self.min_available {
            return invalid("must have 0 < min_available <= in_capacity");
        }
        if i32::try_from(self.in_capacity).is_err() {
            return invalid("in_capacity exceeds the FETCH_CASES range");
        }
        if self.pool_capacity == 0 {
            return invalid("pool_capacity must be positive");
        }
        Ok(())
    }
}

struct Report {
    solver: Arc<Attributor>,
    spec: u64,
    result: u64,
}

struct Shared {
    config: RemoteConfig,
    inbox: Mutex<VecDeque<u64>>,
    /// Signalled when cases arrive.
    inbox_filled: Notify,
    /// Signalled when a case is consumed.
    inbox_drained: Notify,
    outbox: Mutex<VecDeque<Report>>,
    outbox_filled: Notify,
    reported: AtomicU64,
    connected: AtomicBool,
    shutdown: CancellationToken,
}

impl Shared {
    fn new(config: RemoteConfig) -> Self {
        Self {
            config,
            inbox: Mutex::new(VecDeque::with_capacity(config.in_capacity)),
            inbox_filled: Notify::new(),
            inbox_drained: Notify::new(),
            outbox: Mutex::new(VecDeque::new()),
            outbox_filled: Notify::new(),
            reported: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    fn push_report(&self, report: Report) {
        self.outbox.lock().push_back(report);
        self.outbox_filled.notify_waiters();
    }
}

/// A [`Database`] whose cases come from, and whose results go to, a remote
/// ledger server.
///
/// [`Entry::solve`] on a fetched entry only queues the result and always
/// returns `true`; delivery happens in the background.
pub struct RemoteDatabase {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteDatabase {
    /// Validates `config` and starts connecting in the background.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<C: Connector>(connector: C, config: RemoteConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared::new(config));
        let supervisor = tokio::spawn(supervise(Arc::clone(&shared), connector));
        Ok(Self {
            shared,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    /// Cases fetched and not yet handed out.
    pub fn in_queue_len(&self) -> usize {
        self.shared.inbox.lock().len()
    }

    /// Results queued and not yet sent.
    pub fn out_queue_len(&self) -> usize {
        self.shared.outbox.lock().len()
    }

    /// Results written to the server so far.
    pub fn reported(&self) -> u64 {
        self.shared.reported.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    /// Stops the connection and wakes every blocked fetch. Unsent results
    /// are discarded.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "remote supervisor panicked");
            }
        }
    }
}

impl Drop for RemoteDatabase {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl fmt::Display for RemoteDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RemoteDatabase > {} > ... > {} > {}",
            self.in_queue_len(),
            self.out_queue_len(),
            self.reported()
        )
    }
}

impl Database for RemoteDatabase {
    type Entry = RemoteEntry;

    /// Waits for the next fetched case. Resolves to `None` for a server
    /// "no work" reply or once the database is shut down.
    async fn fetch_unsolved(&self) -> Option<RemoteEntry> {
        let shared = &self.shared;
        loop {
            let filled = shared.inbox_filled.notified();
            tokio::pin!(filled);
            filled.as_mut().enable();

            let next = shared.inbox.lock().pop_front();
            if let Some(spec) = next {
                shared.inbox_drained.notify_waiters();
                return (spec != 0).then(|| RemoteEntry {
                    spec,
                    shared: Arc::clone(shared),
                });
            }

            tokio::select! {
                () = &mut filled => {}
                () = shared.shutdown.cancelled() => return None,
            }
        }
    }
}

/// A case fetched from a [`RemoteDatabase`].
pub struct RemoteEntry {
    spec: u64,
    shared: Arc<Shared>,
}

impl fmt::Debug for RemoteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteEntry").field("spec", &self.spec).finish()
    }
}

impl Entry for RemoteEntry {
    fn spec(&self) -> u64 {
        self.spec
    }

    fn solve(&self, solver: &Arc<Attributor>, result: u64) -> bool {
        self.shared.push_report(Report {
            solver: Arc::clone(solver),
            spec: self.spec,
            result,
        });
        true
    }
}

async fn supervise<C: Connector>(shared: Arc<Shared>, connector: C) {
    let backoff = shared.config.reconnect_backoff;
    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }
        match connector.connect().await {
            Ok(stream) => {
                info!("connected to ledger server");
                shared.connected.store(true, Ordering::Relaxed);
                let outcome = run_connection(&shared, stream).await;
                shared.connected.store(false, Ordering::Relaxed);
                let abandoned = {
                    let mut inbox = shared.inbox.lock();
                    let n = inbox.len();
                    inbox.clear();
                    n
                };
                shared.inbox_drained.notify_waiters();
                match outcome {
                    Ok(()) => {
                        info!("connection closed");
                        break;
                    }
                    Err(e) => error!(error = %e, abandoned, "connection error"),
                }
            }
            Err(e) => error!(error = %e, "connect failed"),
        }

        info!(backoff_secs = backoff.as_secs(), "reconnecting after backoff");
        tokio::select! {
            () = sleep(backoff) => {}
            () = shared.shutdown.cancelled() => break,
        }
    }
    debug!("remote supervisor stopped");
}

/// Runs both loops until one fails or the database shuts down. Dropping the
/// losing loop's future is what stops it.
async fn run_connection<S>(shared: &Shared, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (reader, writer) = tokio::io::split(stream);
    let writer = AsyncMutex::new(writer);
    tokio::select! {
        r = fetch_loop(shared, reader, &writer) => r,
        r = report_loop(shared, &writer) => r,
        () = shared.shutdown.cancelled() => Ok(()),
    }
}

async fn send<S: AsyncWrite>(writer: &AsyncMutex<WriteHalf<S>>, buf: &[u8]) -> Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(buf).await?;
    writer.flush().await?;
    Ok(())
}

async fn fetch_loop<S>(
    shared: &Shared,
    mut reader: ReadHalf<S>,
    writer: &AsyncMutex<WriteHalf<S>>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let RemoteConfig {
        in_capacity,
        min_available,
        ..
    } = shared.config;
    let mut buf = BytesMut::with_capacity(5);
    loop {
        let wanted = loop {
            let drained = shared.inbox_drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            let len = shared.inbox.lock().len();
            if len < min_available {
                break in_capacity - len;
            }
            drained.await;
        };

        buf.clear();
        // in_capacity fits an i32, see RemoteConfig::validate
        Command::FetchCases {
            count: wanted as i32,
        }
        .encode(&mut buf)?;
        send(writer, &buf).await?;
        debug!(count = wanted, "requested cases");

        for _ in 0..wanted {
            let spec = reader.read_u64().await?;
            shared.inbox.lock().push_back(spec);
            shared.inbox_filled.notify_waiters();
        }
    }
}

/// Puts a report back at the tail of the output queue unless it was sent.
struct InFlight<'a> {
    shared: &'a Shared,
    report: Option<Report>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(report) = self.report.take() {
            self.shared.push_report(report);
        }
    }
}

async fn report_loop<S>(shared: &Shared, writer: &AsyncMutex<WriteHalf<S>>) -> Result<()>
where
    S: AsyncWrite,
{
    let mut solvers: IdPool<Attributor> = IdPool::new(shared.config.pool_capacity);
    let mut buf = BytesMut::new();
    loop {
        let report = loop {
            let filled = shared.outbox_filled.notified();
            tokio::pin!(filled);
            filled.as_mut().enable();

            let next = shared.outbox.lock().pop_front();
            if let Some(report) = next {
                break report;
            }
            filled.await;
        };
        let mut in_flight = InFlight {
            shared,
            report: None,
        };
        let report = in_flight.report.insert(report);

        buf.clear();
        let id = match solvers.try_get(&report.solver) {
            Some(id) => id,
            None => {
                let mut released = Vec::new();
                let id = match solvers.map_with(&report.solver, |id| released.push(id)) {
                    Ok(id) => id,
                    Err(e) => {
                        // every ID belongs to a live solver; the server
                        // re-offers the case once its lease expires
                        warn!(
                            solver = %report.solver,
                            spec = report.spec,
                            error = %e,
                            "report dropped"
                        );
                        in_flight.report = None;
                        continue;
                    }
                };
                for released in released {
                    Command::DenounceSolver {
                        id: released as i32,
                    }
                    .encode(&mut buf)?;
                }
                Command::AnnounceSolver {
                    id: id as i32,
                    name: report.solver.name().to_owned(),
                }
                .encode(&mut buf)?;
                debug!(solver = %report.solver, id, "announcing solver");
                id
            }
        };
        Command::ReportResult {
            id: id as i32,
            spec: report.spec,
            result: report.result,
        }
        .encode(&mut buf)?;

        if let Err(e) = send(writer, &buf).await {
            warn!(spec = report.spec, "report failed, requeued");
            return Err(e);
        }
        in_flight.report = None;
        shared.reported.fetch_add(1, Ordering::Relaxed);
    }
}
