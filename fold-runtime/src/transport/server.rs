//! Worker side of the ingress socket.
//!
//! A worker implements [`IngressService`] and hands it to [`serve`] together
//! with a listener bound via [`bind`]. Calls on one connection are answered
//! concurrently; replies carry the call id of the request they answer.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use fold_manifest::Manifest;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::frame::{read_frame, write_frame, Frame, FrameError, MessageType};
use super::wire::{ManifestRequest, WireError, WireRequest};
use super::{decode_request, encode_manifest, encode_response, Request, Response};
use crate::addr::remove_socket;
use crate::error::{io_err, RuntimeError};

/// What a worker exposes over the ingress socket.
#[async_trait]
pub trait IngressService: Send + Sync + 'static {
    fn manifest(&self) -> Manifest;

    async fn handle(&self, request: Request) -> Response;
}

/// Binds the worker socket, clearing a stale file left by a dead process.
pub fn bind(socket: &Path) -> Result<UnixListener, RuntimeError> {
    clear_stale_socket(socket)?;
    let listener = UnixListener::bind(socket).map_err(|e| io_err(socket, e))?;
    set_socket_permissions(socket)?;
    Ok(listener)
}

/// Accepts connections until `shutdown` fires, then removes the socket file.
pub async fn serve<S: IngressService>(
    listener: UnixListener,
    service: Arc<S>,
    shutdown: CancellationToken,
) -> Result<(), RuntimeError> {
    let socket = listener
        .local_addr()
        .ok()
        .and_then(|addr| addr.as_pathname().map(Path::to_path_buf));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(error = %err, "ingress accept failed");
                        continue;
                    }
                };
                let service = service.clone();
                let shutdown = shutdown.child_token();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(stream, service, shutdown).await {
                        tracing::error!(error = %err, "ingress connection error");
                    }
                });
            }
        }
    }

    if let Some(socket) = socket {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

/// Serves one runtime connection until it closes.
pub async fn serve_connection<S: IngressService>(
    stream: UnixStream,
    service: Arc<S>,
    shutdown: CancellationToken,
) -> Result<(), FrameError> {
    let (mut reader, mut writer) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<Frame>(64);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = reply_rx.recv().await {
            write_frame(&mut writer, &frame).await?;
        }
        Ok::<(), FrameError>(())
    });

    let result = loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            frame = read_frame(&mut reader) => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => break Ok(()),
            Err(err) => break Err(err),
        };

        let service = service.clone();
        let reply_tx = reply_tx.clone();
        tokio::spawn(async move {
            let reply = answer(service.as_ref(), &frame).await.unwrap_or_else(|err| {
                error_frame(frame.call_id, err.to_string())
            });
            let _ = reply_tx.send(reply).await;
        });
    };

    // The peer is gone or we are shutting down; replies still in flight are dropped.
    writer_task.abort();
    result
}

async fn answer<S: IngressService + ?Sized>(service: &S, frame: &Frame) -> Result<Frame, FrameError> {
    match frame.message_type {
        MessageType::GetManifest => {
            let _: ManifestRequest = frame.decode()?;
            Frame::new(MessageType::Manifest, frame.call_id, &encode_manifest(&service.manifest()))
        }
        MessageType::DoRequest => {
            let wire: WireRequest = frame.decode()?;
            let request = match decode_request(wire) {
                Ok(request) => request,
                Err(err) => return Ok(error_frame(frame.call_id, err.to_string())),
            };
            let response = service.handle(request).await;
            match encode_response(&response) {
                Ok(wire) => Frame::new(MessageType::Response, frame.call_id, &wire),
                Err(err) => Ok(error_frame(frame.call_id, err.to_string())),
            }
        }
        other => Err(FrameError::UnexpectedMessageType(other)),
    }
}

fn error_frame(call_id: u64, message: String) -> Frame {
    let payload = WireError { message };
    Frame::new(MessageType::Error, call_id, &payload).unwrap_or(Frame {
        message_type: MessageType::Error,
        call_id,
        payload: bytes::Bytes::new(),
    })
}

/// Clears a socket file nobody answers on. A live listener is left alone.
fn clear_stale_socket(socket: &Path) -> Result<(), RuntimeError> {
    match fs::symlink_metadata(socket) {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(io_err(socket, err)),
    }
    if StdUnixStream::connect(socket).is_ok() {
        return Err(RuntimeError::SocketInUse {
            path: socket.to_path_buf(),
        });
    }
    tracing::debug!(socket = %socket.display(), "clearing leftover worker socket");
    remove_socket(socket)
}

fn set_socket_permissions(path: &Path) -> Result<(), RuntimeError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}
