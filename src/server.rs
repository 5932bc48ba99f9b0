use crate::registry::StreamRegistry;
use crate::session::Session;
use anyhow::{Context, Result};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Binds the RTMP listener and runs the accept loop for the life of the
/// process. Spawns one [`Session`] per inbound connection; on cancellation,
/// stops accepting and waits for every in-flight session to finish before
/// returning.
pub struct MediaServer {
    listen_addr: String,
    registry: Arc<StreamRegistry>,
    cancel: CancellationToken,
}

impl MediaServer {
    pub fn new(listen_addr: String, registry: Arc<StreamRegistry>, cancel: CancellationToken) -> Self {
        Self {
            listen_addr,
            registry,
            cancel,
        }
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .with_context(|| format!("failed to bind RTMP listener on {}", self.listen_addr))?;
        info!("RTMP listener bound on {}", self.listen_addr);

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            if let Err(e) = socket.set_nodelay(true) {
                                warn!("failed to set TCP_NODELAY for {peer}: {e}");
                            }
                            let session = Session::new(self.registry.clone(), self.cancel.child_token());
                            sessions.spawn(session.run(socket));
                        }
                        Err(e) => error!("accept error: {e}"),
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("RTMP listener shutting down, draining {} active session(s)", sessions.len());
                    break;
                }
            }
        }
        while sessions.join_next().await.is_some() {}
        Ok(())
    }
}
