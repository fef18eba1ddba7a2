//! Structured logging.
//!
//! JSON output carries consistent fields so log shippers can index them:
//! - `timestamp`, `level`, `target`
//! - `service`: the configured service name (on the root span)
//! - `correlation_id`, `peer`, `topic`, `elapsed_ms` on RPC events

use crate::{TelemetryConfig, TelemetryError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Install the global subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_new(&config.log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .map_err(|e| TelemetryError::Config(e.to_string()))?;

    let output = if !config.console_output {
        None
    } else if config.json_logs {
        Some(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_current_span(true)
                .boxed(),
        )
    } else {
        Some(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .compact()
                .boxed(),
        )
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(output)
        .try_init()
        .map_err(|e| TelemetryError::LoggingInit(e.to_string()))
}

/// Log a peer lifecycle event with standard fields.
///
/// ```rust,ignore
/// log_peer_event!(info, "socket", "Agent connected", peer, generation = 3);
/// ```
#[macro_export]
macro_rules! log_peer_event {
    ($level:ident, $transport:expr, $msg:expr, $peer:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            transport = $transport,
            peer = %$peer,
            $($($field)*,)?
            $msg
        )
    };
}

/// Log a call-related event with standard fields.
#[macro_export]
macro_rules! log_call_event {
    ($level:ident, $msg:expr, $correlation_id:expr, $peer:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            correlation_id = %$correlation_id,
            peer = %$peer,
            $($($field)*,)?
            $msg
        )
    };
}
