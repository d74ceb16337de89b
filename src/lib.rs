//! `rudp`: reliable, ordered datagrams over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐ accept/connect ┌───────────────────┐
//!  │Connector │───────────────▶│ ConnectionHandler │──▶ Peer
//!  └────┬─────┘   (per peer)   │  unreliable       │
//!       │                      │  reliable         │
//!       │                      │  ordered          │
//!       │                      └───┬───────────▲───┘
//!       │  segments out            │           │ PacketEvents
//!  ┌────▼──────────────────────────▼──┐   ┌────┴───────────┐
//!  │             Channel              │──▶│ PacketConsumer │
//!  │  (UDP socket + send/recv threads)│   │ (dispatch)     │
//!  └──────────────────────────────────┘   └────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`checksum`] : 16-bit frame checksum
//! - [`packet`] : wire format (SYN, ACK, RST, NUL)
//! - [`parameters`] : connection parameters and their validation
//! - [`buffer`] : pooled datagram buffers
//! - [`ring`] : blocking bounded queues
//! - [`window`] : mod-256 sliding window
//! - [`channel`] : checksum-framed UDP I/O threads
//! - [`consumer`] : datagram classification and event dispatch
//! - [`timer`] : timer thread shared by one connector
//! - [`retransmitter`] : per-segment resend loop
//! - [`handler`] : shared plumbing for the delivery disciplines
//! - [`unreliable`], [`reliable`], [`ordered`] : the delivery disciplines
//! - [`connection_handler`] : handshake and per-connection lifecycle
//! - [`connector`], [`peer`] : the public surface
//! - [`state`], [`connection`] : state machine types and the error type
//! - [`stats`] : traffic counters
//! - [`simulator`] : optional lossy/reorder network layer for testing
//!
//! # Example
//!
//! ```no_run
//! use rudp::Connector;
//!
//! let server = Connector::bind("127.0.0.1:9000".parse().unwrap()).unwrap();
//! let peer = server.accept().unwrap();
//! while let Ok(msg) = peer.consume() {
//!     peer.send(&msg).unwrap();
//! }
//! ```

pub mod buffer;
pub mod channel;
pub mod checksum;
pub mod connection;
pub mod connection_handler;
pub mod connector;
pub mod consumer;
pub mod handler;
pub mod ordered;
pub mod packet;
pub mod parameters;
pub mod peer;
pub mod reliable;
pub mod retransmitter;
pub mod ring;
pub mod simulator;
pub mod state;
pub mod stats;
pub mod timer;
pub mod unreliable;
pub mod window;

pub use channel::ChannelOptions;
pub use connection::{ConnError, Connection};
pub use connector::Connector;
pub use handler::Delivery;
pub use parameters::ConnectionParameters;
pub use peer::Peer;
pub use simulator::SimulatorConfig;
pub use state::{CloseReason, ConnectionState};
pub use stats::StatsSnapshot;
