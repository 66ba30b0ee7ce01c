//! Worker socket addresses.
//!
//! Each start cycle gets a fresh path handed to the worker in `SOCK_ADDR`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{io_err, RuntimeError};

/// Environment variable carrying the socket path to the worker.
pub const SOCK_ADDR_ENV: &str = "SOCK_ADDR";

/// Produces the socket path for the next cycle.
pub type SocketFactory = Arc<dyn Fn() -> PathBuf + Send + Sync>;

pub fn new_socket_addr(dir: &Path) -> PathBuf {
    dir.join(format!("fold.{}.sock", Uuid::new_v4()))
}

/// Allocates addresses under `dir`.
pub fn socket_factory(dir: PathBuf) -> SocketFactory {
    Arc::new(move || new_socket_addr(&dir))
}

/// Removes a socket file; a missing file is not an error.
pub fn remove_socket(path: &Path) -> Result<(), RuntimeError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(path, err)),
    }
}
