//! TCP listener: accepts connections and serves each on its own task.

use std::io;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::request::{serve_connection, RequestContext};

/// The agent's network listener.
pub struct Listener {
    listener: TcpListener,
    context: RequestContext,
}

impl Listener {
    /// Bind to `addr`.
    ///
    /// Port 0 picks an ephemeral port; see [`Listener::local_addr`].
    pub async fn bind(addr: SocketAddr, context: RequestContext) -> Result<Self, io::Error> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, context })
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` is cancelled, then wait for
    /// in-flight connections to finish.
    ///
    /// Each connection is handled independently; a failure on one never
    /// affects another or the listener.
    pub async fn run(self, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();
        match self.local_addr() {
            Ok(addr) => info!("Listening on {}", addr),
            Err(e) => debug!("Listening on unknown address: {}", e),
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Listener received shutdown signal");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("Accepted connection from {}", peer);
                            let context = self.context.clone();
                            tracker.spawn(serve_connection(stream, peer, context));
                        }
                        Err(e) => {
                            // Usually a transient resource limit; keep accepting
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        tracker.close();
        if !tracker.is_empty() {
            info!("Waiting for {} connection(s) to finish", tracker.len());
        }
        tracker.wait().await;
        info!("Listener stopped");
    }
}
