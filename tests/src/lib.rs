//! # Kube-Manager Agent RPC Test Suite
//!
//! Cross-crate flows that need more than one crate at a time.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── queue_rpc.rs    # QueueTransport + QueueResponder over shared-bus
//!     └── socket_rpc.rs   # SocketTransport against loopback agents
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p km-tests
//! cargo test -p km-tests integration::socket_rpc::
//! ```

#![allow(unused_variables)]
#![allow(unused_imports)]
#![allow(dead_code)]

pub mod integration;
