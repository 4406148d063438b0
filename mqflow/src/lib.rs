#![deny(unsafe_code)]

//! # Overall Example
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use mqflow::connection::ConnectInfo;
//! use mqflow::context::{FlowConfig, ServerContext};
//! use mqflow::transport::ChannelTransport;
//! use mqflow::types::ProtocolVersion;
//!
//! #[tokio::main]
//! async fn main() {
//!     let scx = ServerContext::builder(FlowConfig::default()).build();
//!
//!     let (transport, mut outgoing) = ChannelTransport::pair();
//!     let info = ConnectInfo::new("client-1", ProtocolVersion::V5).receive_maximum(10);
//!     let conn = scx.start_session(info, Arc::new(transport)).unwrap();
//!
//!     while let Some(packet) = outgoing.recv().await {
//!         println!("{} <- {:?}", conn.id(), packet);
//!     }
//!     scx.registry.shutdown().await;
//! }
//! ```

pub mod ack; // Outbound PUBACK/PUBREC/PUBCOMP handling
pub mod completion; // Single-assignment completion handles
pub mod connection; // Live client connection
pub mod context; // Shared server context
pub mod delivery; // Terminal status side effects
pub mod dispatch; // Downstream hand-off of inbound publishes
pub mod error;
pub mod inbound; // Inbound QoS 1/2 duplicate detection
pub mod inflight; // Outbound in-flight window and overflow queue
pub mod logger;
pub mod packet_id; // Packet identifier pool
pub mod poll; // Queue polling
pub mod queue; // Client and shared subscription queues
pub mod registry; // Client id to connection map and shutdown
pub mod session; // Per-connection task
pub mod stats;
pub mod store; // Flow record and payload storage
pub mod transport;
pub mod types;

pub use mqflow_conf as conf;
pub use mqflow_utils as utils;

pub use error::{ChannelClosed, Error, MqttError, Result};
