//! Worker runtime: supervises one worker process, talks to it over a Unix
//! socket and fronts it with an HTTP listener that survives restarts.

pub mod addr;
pub mod backoff;
pub mod config;
pub mod engine;
mod error;
pub mod fsm;
pub mod ingress;
pub mod logging;
pub mod router;
pub mod server;
pub mod signals;
pub mod supervisor;
pub mod transport;
pub mod watcher;

pub use config::{CrashPolicy, RuntimeConfig, Stage};
pub use engine::{Event, ExitReason, ProcessEndHook, Runtime, RuntimeBuilder, State};
pub use error::{IngressError, RuntimeError, SupervisorError, TransportError};
pub use server::HttpServer;
pub use transport::frame::FrameError;
