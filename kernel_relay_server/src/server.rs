// THEORY:
// The accept loop. It owns the listener and the dispatcher and does nothing
// else: every accepted socket goes straight to `Dispatcher::admit`.
//
// Graceful shutdown happens in two steps:
// 1.  The shutdown future resolves, either between accepts or while a `Block`
//     pool holds the loop waiting for a queue slot. The loop stops accepting
//     and drops the listener, so new connection attempts are refused from
//     here on.
// 2.  The dispatcher drains. Everything already admitted runs to completion.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kernel_relay::FilterPipeline;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::dispatch::{Connection, Dispatcher};
use crate::handler::ConnectionHandler;
use crate::sequence::RequestSequence;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    sequence: Arc<RequestSequence>,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.bind_addr))?;
        Ok(Self {
            listener,
            config,
            sequence: Arc::new(RequestSequence::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("listener has no local address")
    }

    /// The request id source shared by every connection of this server.
    pub fn sequence(&self) -> Arc<RequestSequence> {
        Arc::clone(&self.sequence)
    }

    /// Serves until `shutdown` resolves, then drains and returns.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        let Server {
            listener,
            config,
            sequence,
        } = self;

        let pipeline = Arc::new(FilterPipeline::new(config.pipeline.clone()));
        let handler = Arc::new(ConnectionHandler::new(
            config.protocol,
            pipeline,
            sequence,
            config.max_payload_bytes,
        ));
        let mut dispatcher = Dispatcher::new(&config.strategy, handler);

        info!(
            %addr,
            protocol = ?config.protocol,
            strategy = ?config.strategy,
            partitions = config.pipeline.partitions,
            "listening"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => {
                    info!("shutdown requested; no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        let admitted = dispatcher.admit(Connection { stream, peer }, shutdown.as_mut()).await;
                        if admitted.is_break() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        info!("draining in-flight connections");
        dispatcher.drain().await;
        info!("server stopped");
        Ok(())
    }
}
