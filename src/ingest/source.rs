//! Transport adapters feeding the ingestor: a TCP listener or stdin.

use std::net::SocketAddr;

use anyhow::Result;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::Ingestor;
use crate::config::{Config, IngestSource};
use crate::store::Store;

// ---

/// Start the configured input feed and run it until cancelled.
pub async fn run<S: Store>(cfg: &Config, ingestor: Ingestor<S>, cancel: CancellationToken) -> Result<()> {
    // ---
    match cfg.ingest_source {
        IngestSource::Tcp => {
            let listener = TcpListener::bind(cfg.ingest_addr).await?;
            info!("Ingest listening on {}", cfg.ingest_addr);
            serve_tcp(listener, ingestor, cancel).await
        }
        IngestSource::Stdin => {
            info!("Ingest reading from stdin");
            read_stdin(ingestor, cancel).await
        }
    }
}

/// Accept connections, one sequential task per connection.
pub async fn serve_tcp<S: Store>(
    listener: TcpListener,
    ingestor: Ingestor<S>,
    cancel: CancellationToken,
) -> Result<()> {
    // ---
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        info!(%peer, "probe feed connected");
        let ingestor = ingestor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            handle_connection(ingestor, BufReader::new(stream), peer, cancel).await;
        });
    }

    info!("ingest listener stopped");
    Ok(())
}

async fn handle_connection<S, R>(ingestor: Ingestor<S>, reader: R, peer: SocketAddr, cancel: CancellationToken)
where
    S: Store,
    R: tokio::io::AsyncBufRead + Unpin,
{
    // ---
    let peer = peer.to_string();
    if let Err(e) = ingestor.run_lines(reader, &peer, &cancel).await {
        error!(peer, error = %e, "probe feed aborted");
    }
}

pub async fn read_stdin<S: Store>(ingestor: Ingestor<S>, cancel: CancellationToken) -> Result<()> {
    // ---
    let reader = BufReader::new(tokio::io::stdin());
    ingestor.run_lines(reader, "stdin", &cancel).await?;
    Ok(())
}
