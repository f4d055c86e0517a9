//! Listener and connection registry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, SessionId};
use crate::context::Context;
use crate::error::Result;
use crate::transport::BoxedStream;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

type Registry = Arc<Mutex<HashMap<SessionId, SocketAddr>>>;

pub struct Hub {
    ctx: Arc<Context>,
    listener: TcpListener,
    registry: Registry,
    next_id: AtomicU64,
}

impl Hub {
    /// Binds the configured `host:port`.
    pub async fn bind(ctx: Arc<Context>) -> Result<Self> {
        let listener = TcpListener::bind((ctx.config.host.as_str(), ctx.config.port)).await?;
        Ok(Self::with_listener(ctx, listener))
    }

    pub fn with_listener(ctx: Arc<Context>, listener: TcpListener) -> Self {
        Self {
            ctx,
            listener,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Number of live connections.
    pub fn connections(&self) -> usize {
        self.registry.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Accepts connections until the listener fails.
    pub async fn run(self) -> Result<()> {
        let role = if self.ctx.config.is_client() { "client" } else { "server" };
        info!("[hub] {} listening on {}", role, self.local_addr()?);

        let _prober = self
            .ctx
            .balancer
            .as_ref()
            .and_then(|balancer| Arc::clone(balancer).spawn(self.ctx.config.balancer_interval()))
            .map(|handle| scopeguard::guard(handle, |handle| handle.abort()));

        let stats = Arc::clone(&self.ctx.stats);
        let reporter = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                stats.print_stats();
            }
        });
        let _reporter = scopeguard::guard(reporter, |handle| handle.abort());

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("[hub] accept failed: {}", e);
                    return Err(e.into());
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("[hub] set_nodelay for {} failed: {}", peer, e);
            }
            self.spawn_connection(Box::new(stream), peer);
        }
    }

    fn spawn_connection(&self, stream: BoxedStream, peer: SocketAddr) {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, peer);

        let registry = Arc::clone(&self.registry);
        let on_close = Box::new(move |id: SessionId| {
            let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.remove(&id);
            debug!("[hub] [{}] removed, {} remaining", id, registry.len());
        });

        let connection = match Connection::new(id, Arc::clone(&self.ctx), stream, peer, on_close) {
            Ok(connection) => connection,
            Err(e) => {
                warn!("[hub] [{}] cannot set up connection from {}: {}", id, peer, e);
                self.registry
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                return;
            }
        };

        debug!("[hub] [{}] accepted {}", id, peer);
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            // Drop the entry even if the task is aborted or panics.
            let _entry = scopeguard::guard(id, move |id| {
                registry
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
            });
            connection.run().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn server_hub() -> (Arc<Context>, SocketAddr, tokio::task::JoinHandle<Result<()>>) {
        let ctx = Context::new(Config::new("127.0.0.1", 8388, "secret")).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hub = Hub::with_listener(Arc::clone(&ctx), listener);
        let addr = hub.local_addr().unwrap();
        (ctx, addr, tokio::spawn(hub.run()))
    }

    #[tokio::test]
    async fn test_accepted_connections_are_counted_and_released() {
        let (ctx, addr, handle) = server_hub().await;

        let stream = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ctx.stats.snapshot().total_connections, 1);
        assert_eq!(ctx.stats.snapshot().active_connections, 1);

        drop(stream);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ctx.stats.snapshot().active_connections, 0);
        handle.abort();
    }

    #[tokio::test]
    async fn test_server_without_redirect_keeps_foreign_client_open() {
        let (ctx, addr, handle) = server_hub().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ctx.stats.snapshot().fatals, 1);

        // Closed only after the randomized delay, so nothing is readable yet.
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(100), stream.read(&mut buf)).await;
        assert!(read.is_err());
        handle.abort();
    }
}
