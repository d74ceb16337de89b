//! Application handle for one connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{ConnError, Connection};
use crate::connection_handler::ConnectionHandler;
use crate::handler::Delivery;
use crate::state::ConnectionState;

/// An established connection, as returned by
/// [`Connector::accept`](crate::Connector::accept) and
/// [`Connector::connect`](crate::Connector::connect).
///
/// Dropping a `Peer` resets the connection.
pub struct Peer {
    handler: Arc<ConnectionHandler>,
}

impl Peer {
    pub(crate) fn new(handler: Arc<ConnectionHandler>) -> Self {
        Self { handler }
    }

    /// Reliable, in-order send.
    pub fn send(&self, data: &[u8]) -> Result<(), ConnError> {
        self.send_with(data, Delivery::Ordered)
    }

    pub fn send_with(&self, data: &[u8], delivery: Delivery) -> Result<(), ConnError> {
        if data.is_empty() {
            return Err(ConnError::EmptyPayload);
        }
        let max = self.handler.max_payload();
        if data.len() > max {
            return Err(ConnError::PayloadTooLarge {
                len: data.len(),
                max,
            });
        }
        self.handler.send(data, delivery)
    }

    /// Block for the next payload.  Once the connection is closed and
    /// every queued payload has been read, returns the reason it closed.
    pub fn consume(&self) -> Result<Vec<u8>, ConnError> {
        self.handler.consume()
    }

    /// `Ok(None)` when nothing arrives within `timeout`.
    pub fn try_consume(&self, timeout: Duration) -> Result<Option<Vec<u8>>, ConnError> {
        self.handler.try_consume(timeout)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.handler.remote()
    }

    pub fn is_connected(&self) -> bool {
        self.handler.state() == ConnectionState::Established
    }

    pub fn state(&self) -> ConnectionState {
        self.handler.state()
    }

    /// Negotiated parameters of both sides.
    pub fn connection(&self) -> Option<Connection> {
        self.handler.connection()
    }

    /// Largest payload `send` accepts.
    pub fn max_payload(&self) -> usize {
        self.handler.max_payload()
    }

    /// Send RST and release the connection.  Idempotent.
    pub fn close(&self) {
        self.handler.reset();
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.handler.reset();
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("remote", &self.remote_addr())
            .field("state", &self.state())
            .finish()
    }
}
