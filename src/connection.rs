//! Negotiated connection description and the crate-wide error type.
//!
//! A [`Connection`] pairs a remote endpoint with the SYN that endpoint sent
//! (after negotiation) and this side's own parameters.  Two connections are
//! the same connection when their endpoints match; parameters do not take
//! part in identity.

use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::channel::MAX_PAYLOAD;
use crate::packet::{Syn, HEADER_LEN};
use crate::parameters::{ConnectionParameters, InvalidParameters};
use crate::state::{CloseReason, ConnectionState};
use crate::window::MAX_WINDOW;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors reported to callers.  Network anomalies never surface here; they
/// are absorbed where they are detected.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("socket I/O error: {0}")]
    Socket(#[from] std::io::Error),
    #[error("channel is not bound")]
    NotBound,
    #[error("channel is already bound to {0}")]
    AlreadyBound(SocketAddr),
    #[error("channel is closed")]
    ChannelClosed,
    #[error("{0} has been disposed")]
    Disposed(&'static str),
    #[error("payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("payload is empty")]
    EmptyPayload,
    #[error("send window is full")]
    SendBufferFull,
    #[error("a connection to {0} is already active")]
    AlreadyConnected(SocketAddr),
    #[error("connection is not established (state: {0})")]
    BadState(ConnectionState),
    #[error(transparent)]
    InvalidParameters(#[from] InvalidParameters),
    #[error("handshake refused")]
    Refused,
    #[error("retransmission budget exhausted")]
    MaxRetriesExceeded,
    #[error("connection reset by peer")]
    Reset,
    #[error("connection closed")]
    Closed,
}

impl From<CloseReason> for ConnError {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::Local => ConnError::Closed,
            CloseReason::RemoteReset => ConnError::Reset,
            CloseReason::Expired => ConnError::MaxRetriesExceeded,
            CloseReason::Refused => ConnError::Refused,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Immutable description of an established connection.
#[derive(Debug, Clone)]
pub struct Connection {
    endpoint: SocketAddr,
    local: ConnectionParameters,
    peer: Syn,
}

impl Connection {
    pub fn new(endpoint: SocketAddr, local: ConnectionParameters, peer: Syn) -> Self {
        Self {
            endpoint,
            local,
            peer,
        }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// The SYN the remote side sent.
    pub fn peer_syn(&self) -> &Syn {
        &self.peer
    }

    /// Parameters advertised by the remote side.
    pub fn peer_params(&self) -> &ConnectionParameters {
        &self.peer.params
    }

    /// This side's own parameters.
    pub fn local_params(&self) -> &ConnectionParameters {
        &self.local
    }

    /// Largest payload the peer accepts in one segment.
    pub fn max_payload(&self) -> usize {
        usize::from(self.peer.params.max_packet_size)
            .saturating_sub(HEADER_LEN)
            .min(MAX_PAYLOAD)
    }

    /// Segments this side may have in flight.
    pub fn send_window(&self) -> u8 {
        self.peer.params.max_outstanding_packets.clamp(1, MAX_WINDOW)
    }

    /// Segments this side buffers ahead of in-order delivery.
    pub fn recv_window(&self) -> u8 {
        self.local.max_outstanding_packets.clamp(1, MAX_WINDOW)
    }

    pub fn retransmission_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.peer.params.retransmission_timeout))
    }

    pub fn cumulative_ack_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.peer.params.cumulative_ack_timeout))
    }

    /// Keep-alive interval, `None` when keep-alives are disabled.
    pub fn null_packet_timeout(&self) -> Option<Duration> {
        match self.peer.params.null_packet_timeout {
            0 => None,
            ms => Some(Duration::from_millis(u64::from(ms))),
        }
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.endpoint.hash(state);
    }
}
