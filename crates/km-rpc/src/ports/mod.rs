//! Ports (hexagonal architecture).
//!
//! - `inbound`: what peers drive (event and request handlers)
//! - `outbound`: what the RPC layer drives (transports, brokers, directory,
//!   authorization)

pub mod inbound;
pub mod outbound;

pub use inbound::{ChannelEventHandler, EventHandler, HandlerError, InboundEvent, RequestHandler};
pub use outbound::{
    AuthError, BrokerConnector, BrokerError, BrokerMessage, BrokerSession, CallAuthorizer,
    DeliveryStream, PeerDirectory, PeerEndpoint, StaticPeerDirectory, Transport, TransportError,
};
