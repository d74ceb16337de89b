//! Connection finite-state machine (FSM) types.
//!
//! This module defines every state a [`crate::connection_handler::ConnectionHandler`]
//! can occupy.  Transitions are driven by the handler; keeping the types
//! here lets the handler, the peer handle and the connector share them.

/// All possible states of the connection FSM.
///
/// ```text
///  IDLE ──SYN sent──▶ CONNECTING ──valid SYN reply──▶ ESTABLISHED
///                         │                               │
///                         │ RST / budget exhausted        │ RST sent or received,
///                         ▼                               │ budget exhausted
///                       CLOSED ◀──────────────────────────┘
///                         ▲
///  LISTENING ──SYN validated, reply sent──▶ ESTABLISHED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Nothing sent or received yet.
    #[default]
    Idle,
    /// SYN sent; waiting for the remote SYN reply.
    Connecting,
    /// Accept side: a SYN arrived and is being validated.
    Listening,
    /// Handshake complete; data may flow.
    Established,
    /// Torn down.  Terminal.
    Closed(CloseReason),
}

impl ConnectionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed(_))
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Closed(reason) => write!(f, "Closed({reason})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Why a connection reached [`ConnectionState::Closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// This side reset or disposed the connection.
    Local,
    /// The peer sent RST.
    RemoteReset,
    /// A segment exhausted its retransmission budget.
    Expired,
    /// The handshake was rejected by either side.
    Refused,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            CloseReason::Local => "closed locally",
            CloseReason::RemoteReset => "reset by peer",
            CloseReason::Expired => "retransmissions exhausted",
            CloseReason::Refused => "handshake refused",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_idle() {
        assert_eq!(ConnectionState::default(), ConnectionState::Idle);
    }

    #[test]
    fn display_includes_close_reason() {
        let state = ConnectionState::Closed(CloseReason::RemoteReset);
        assert!(state.is_closed());
        assert_eq!(state.to_string(), "Closed(reset by peer)");
        assert_eq!(ConnectionState::Established.to_string(), "Established");
    }
}
