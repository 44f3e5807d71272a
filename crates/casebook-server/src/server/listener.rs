//! Engine-facing accept loop.

use super::telemetry::{self, SessionMetrics};
use casebook_wire::{
    Error,
    casebook::{Ledger, Tracking},
    server::{Session, SessionConfig},
    tls::peer_label,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    task::JoinSet,
    time::timeout,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The database every session serves from.
pub type SharedDb = Arc<Tracking<Ledger>>;

/// Accepts engine connections until `shutdown` fires, then waits up to
/// `grace` for open sessions to end.
///
/// With `tls` set, every connection must complete a mutual-TLS handshake
/// before its session starts.
pub async fn serve_clients(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    db: SharedDb,
    config: SessionConfig,
    shutdown: CancellationToken,
    grace: Duration,
) {
    let mut sessions = JoinSet::new();
    loop {
        let accepted = tokio::select! {
            a = listener.accept() => a,
            () = shutdown.cancelled() => break,
            Some(done) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = done {
                    error!(error = %e, "session task panicked");
                }
                continue;
            }
        };
        let (tcp, addr) = match accepted {
            Ok(a) => a,
            Err(e) => {
                error!(error = %e, "client listener failing");
                continue;
            }
        };
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(%addr, error = %e, "cannot disable nagle");
        }
        sessions.spawn(handle(
            tcp,
            addr,
            tls.clone(),
            Arc::clone(&db),
            config,
            shutdown.clone(),
        ));
    }

    let open = sessions.len();
    if open > 0 {
        info!(open, grace_secs = grace.as_secs(), "waiting for sessions to close");
        let drained = timeout(grace, async { while sessions.join_next().await.is_some() {} }).await;
        if drained.is_err() {
            warn!(remaining = sessions.len(), "aborting sessions after grace period");
            sessions.shutdown().await;
        }
    }
    debug!("client listener stopped");
}

async fn handle(
    tcp: TcpStream,
    addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    db: SharedDb,
    config: SessionConfig,
    shutdown: CancellationToken,
) {
    match tls {
        Some(acceptor) => match acceptor.accept(tcp).await {
            Ok(stream) => {
                let peer = peer_label(addr, stream.get_ref().1.peer_certificates());
                run(peer, stream, db, config, shutdown).await;
            }
            Err(e) => warn!(%addr, error = %e, "TLS handshake failed"),
        },
        None => run(addr.to_string(), tcp, db, config, shutdown).await,
    }
}

async fn run<S>(
    peer: String,
    stream: S,
    db: SharedDb,
    config: SessionConfig,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    telemetry::increment_sessions_inflight();
    let session = Session::new(peer.clone(), db, config).with_events(SessionMetrics);
    match session.run(stream, shutdown).await {
        Ok(()) => {}
        Err(Error::MalformedCommand { opcode }) => {
            warn!(%peer, opcode, "malformed command stream");
        }
        Err(e) => warn!(%peer, error = %e, "client failing"),
    }
    telemetry::decrement_sessions_inflight();
}
