//! Message-queue binding.
//!
//! Durable named request queues and one durable result queue. Messages are
//! persistent and publisher-confirmed; the broker itself sits behind the
//! `BrokerConnector` port.

mod responder;
mod transport;

pub use responder::{QueueResponder, ResponderHandle};
pub use transport::QueueTransport;
