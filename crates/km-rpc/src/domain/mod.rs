//! Domain types for the agent RPC layer.
//!
//! Identifiers, frames, outcomes, errors, configuration and the correlation
//! registry. Nothing in here performs I/O.

pub mod config;
pub mod correlation;
pub mod error;
pub mod frame;
pub mod pending;
pub mod state;
pub mod types;

// Re-exports for convenience
pub use config::{ConfigError, ReconnectPolicy, RpcConfig};
pub use correlation::{CorrelationId, PeerId};
pub use error::{ApiError, ApiResult, FrameError, RegistryError, RpcError, UpstreamError};
pub use frame::{Frame, FrameKind};
pub use pending::{CorrelationRegistry, PendingStats, ResolveStatus, Waiter};
pub use state::{ConnectionState, TransportEvent};
pub use types::{CancelReason, Outcome, RemoteError};
