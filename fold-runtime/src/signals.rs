//! Host signal handling.
//!
//! SIGINT and SIGTERM received by the runtime are forwarded to the worker,
//! then the runtime is stopped. A listener task feeds a channel; a separate
//! forwarding task acts on it, so the engine is never driven from the
//! signal stream itself.

use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::engine::{Event, Runtime};

/// Installs the handlers and returns the forwarding task. The task ends
/// once the runtime exits.
pub fn forward_signals(runtime: Runtime) -> std::io::Result<JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let (tx, mut rx) = mpsc::channel::<Signal>(8);

    let listener = tokio::spawn(async move {
        loop {
            let sig = tokio::select! {
                Some(()) = sigint.recv() => Signal::SIGINT,
                Some(()) = sigterm.recv() => Signal::SIGTERM,
                else => break,
            };
            if tx.send(sig).await.is_err() {
                break;
            }
        }
    });

    Ok(tokio::spawn(async move {
        loop {
            let sig = tokio::select! {
                sig = rx.recv() => sig,
                _ = runtime.wait_done() => None,
            };
            let Some(sig) = sig else { break };
            tracing::info!(signal = sig.as_str(), "received signal, shutting down");
            runtime.signal(sig);
            runtime.post(Event::Stop);
        }
        listener.abort();
    }))
}
