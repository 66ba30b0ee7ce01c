//! Tracing subscriber setup.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Stage;

/// Installs the global subscriber. `RUST_LOG` overrides the stage default.
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing(stage: Stage) {
    let default_level = match stage {
        Stage::Dev | Stage::Test => "debug",
        Stage::Prod => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = match stage {
        Stage::Dev => fmt().with_env_filter(filter).with_target(false).try_init(),
        Stage::Test | Stage::Prod => fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .try_init(),
    };
}
