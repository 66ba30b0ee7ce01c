//! Public HTTP listener.
//!
//! Every request goes through [`Runtime::handle`], so the listener keeps
//! accepting across worker restarts and answers 503 while no worker serves.

use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::Request as HttpRequest;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::engine::Runtime;
use crate::error::RuntimeError;

pub struct HttpServer {
    listener: TcpListener,
    drain_timeout: Duration,
    shutdown: CancellationToken,
}

impl HttpServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self, RuntimeError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RuntimeError::Http(format!("failed to bind {addr}: {e}")))?;
        Ok(Self {
            listener,
            drain_timeout: Duration::from_secs(30),
            shutdown: CancellationToken::new(),
        })
    }

    /// Upper bound on waiting for in-flight requests once shutdown begins.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RuntimeError> {
        self.listener
            .local_addr()
            .map_err(|e| RuntimeError::Http(e.to_string()))
    }

    /// Cancelling the returned token starts a graceful shutdown.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serves until the runtime exits or the shutdown handle fires.
    pub async fn serve(self, runtime: Runtime) -> Result<(), RuntimeError> {
        let token = self.shutdown.clone();
        let watched = runtime.clone();
        self.serve_until(runtime, async move {
            tokio::select! {
                _ = token.cancelled() => {}
                reason = watched.wait_done() => {
                    tracing::debug!(reason = %reason, "runtime exited, closing listener");
                }
            }
        })
        .await
    }

    pub async fn serve_until<F>(self, runtime: Runtime, shutdown: F) -> Result<(), RuntimeError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        let app = axum::Router::new().fallback(move |request: HttpRequest| {
            let runtime = runtime.clone();
            async move { runtime.handle(request).await }
        });

        let (draining_tx, draining_rx) = oneshot::channel::<()>();
        let signal = async move {
            shutdown.await;
            tracing::info!("http server draining");
            let _ = draining_tx.send(());
        };
        let drain_timeout = self.drain_timeout;
        let deadline = async move {
            match draining_rx.await {
                Ok(()) => tokio::time::sleep(drain_timeout).await,
                Err(_) => std::future::pending::<()>().await,
            }
        };

        tracing::info!(addr = %addr, "http server listening");
        let server = axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal);

        tokio::select! {
            result = server.into_future() => {
                result.map_err(|e| RuntimeError::Http(e.to_string()))?;
                tracing::info!("http server stopped");
            }
            _ = deadline => {
                tracing::warn!(timeout_ms = drain_timeout.as_millis() as u64, "drain timeout elapsed, dropping open connections");
            }
        }
        Ok(())
    }
}
