use tokio::{io::AsyncWriteExt, net::TcpListener};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub const STATUS_LINE: &str = "casebook ledger status\n";

/// Answers every connection on `listener` with [`STATUS_LINE`] and closes
/// it, until `shutdown` fires.
pub async fn serve_status(listener: TcpListener, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            a = listener.accept() => a,
            () = shutdown.cancelled() => break,
        };
        let (mut stream, peer) = match accepted {
            Ok(a) => a,
            Err(e) => {
                error!(error = %e, "status listener failing");
                continue;
            }
        };
        tokio::spawn(async move {
            let reply = async {
                stream.write_all(STATUS_LINE.as_bytes()).await?;
                stream.shutdown().await
            };
            match reply.await {
                Ok(()) => debug!(%peer, "served status request"),
                Err(e) => warn!(%peer, error = %e, "error serving status request"),
            }
        });
    }
    debug!("status listener stopped");
}
