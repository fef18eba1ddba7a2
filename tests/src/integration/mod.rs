//! Integration flows between the correlation layer, its transports and the
//! agent-side responders.

pub mod fixtures;
mod queue_rpc;
mod socket_rpc;
mod telemetry;
