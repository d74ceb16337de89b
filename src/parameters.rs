//! Connection parameters exchanged in the SYN handshake.
//!
//! Parameters come in two groups:
//!
//! | Group           | Fields                                              |
//! |-----------------|-----------------------------------------------------|
//! | Negotiable      | timeouts, retransmission budget, cumulative-ack     |
//! |                 | threshold, out-of-sequence and auto-reset limits,   |
//! |                 | security block                                      |
//! | Non-negotiable  | max outstanding packets, max packet size            |
//!
//! Negotiable values follow the connecting side's request; the accepting
//! side echoes them back.  Non-negotiable values describe what each side is
//! willing to receive, so every peer sends within the limits its *peer*
//! advertised.

use thiserror::Error;

use crate::packet::HEADER_LEN;

/// Protocol version carried in every SYN.
pub const PROTOCOL_VERSION: u8 = 1;

/// Smallest accepted retransmission or cumulative-ack timeout, in ms.
pub const MIN_TIMEOUT_MS: u16 = 100;

/// Configuration set carried by a SYN segment.
///
/// All durations are milliseconds.  Use [`ConnectionParameters::validate`]
/// before handing a set to the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub version: u8,
    /// Window size: segments the sender may have unacknowledged at once.
    pub max_outstanding_packets: u8,
    /// Largest datagram (header included) this side accepts.
    pub max_packet_size: u16,
    pub retransmission_timeout: u16,
    /// Upper bound on how long a received segment may wait for its ack.
    pub cumulative_ack_timeout: u16,
    /// Idle time before a NUL keep-alive is sent; 0 disables keep-alives.
    pub null_packet_timeout: u16,
    /// Retransmissions per segment before the connection is declared broken;
    /// 0 retransmits forever.
    pub max_retransmissions: u8,
    /// Segments received before an ack is forced; 0 acks every segment.
    pub max_cumulative_acks: u8,
    pub max_out_of_sequence_packets: u8,
    pub max_auto_resets: u8,
    /// Opaque security block.  Carried and compared, never interpreted.
    pub security: Option<Vec<u8>>,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            max_outstanding_packets: 32,
            max_packet_size: 1400,
            retransmission_timeout: 600,
            cumulative_ack_timeout: 300,
            null_packet_timeout: 2000,
            max_retransmissions: 8,
            max_cumulative_acks: 3,
            max_out_of_sequence_packets: 3,
            max_auto_resets: 3,
            security: None,
        }
    }
}

/// A single rule a [`ConnectionParameters`] value breaks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParameterError {
    #[error("retransmission timeout {0} ms is below 100 ms")]
    RetransmissionTimeout(u16),
    #[error("cumulative-ack timeout {0} ms is below 100 ms")]
    CumulativeAckTimeout(u16),
    #[error("cumulative-ack timeout {cumulative} ms must be below retransmission timeout {retransmission} ms")]
    CumulativeAckNotBelowRetransmission { cumulative: u16, retransmission: u16 },
    #[error("max outstanding packets must be at least 1")]
    MaxOutstandingPackets,
    #[error("max packet size {0} leaves no room for a payload")]
    MaxPacketSize(u16),
}

/// Every violation found in one parameter set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid connection parameters: {}", join(.0))]
pub struct InvalidParameters(pub Vec<ParameterError>);

fn join(errors: &[ParameterError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ConnectionParameters {
    /// Check every rule and report all violations together.
    pub fn validate(&self) -> Result<(), InvalidParameters> {
        let mut errors = Vec::new();

        if self.retransmission_timeout < MIN_TIMEOUT_MS {
            errors.push(ParameterError::RetransmissionTimeout(
                self.retransmission_timeout,
            ));
        }
        if self.cumulative_ack_timeout < MIN_TIMEOUT_MS {
            errors.push(ParameterError::CumulativeAckTimeout(
                self.cumulative_ack_timeout,
            ));
        }
        if self.cumulative_ack_timeout >= self.retransmission_timeout {
            errors.push(ParameterError::CumulativeAckNotBelowRetransmission {
                cumulative: self.cumulative_ack_timeout,
                retransmission: self.retransmission_timeout,
            });
        }
        if self.max_outstanding_packets == 0 {
            errors.push(ParameterError::MaxOutstandingPackets);
        }
        if usize::from(self.max_packet_size) <= HEADER_LEN {
            errors.push(ParameterError::MaxPacketSize(self.max_packet_size));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(InvalidParameters(errors))
        }
    }

    /// The set an accepting side replies with: the requester's negotiable
    /// values combined with this side's own receive limits.
    pub fn negotiate(&self, requested: &ConnectionParameters) -> ConnectionParameters {
        ConnectionParameters {
            max_outstanding_packets: self.max_outstanding_packets,
            max_packet_size: self.max_packet_size,
            ..requested.clone()
        }
    }

    /// `true` when both sets agree on every negotiable field.
    pub fn negotiable_eq(&self, other: &ConnectionParameters) -> bool {
        self.version == other.version
            && self.retransmission_timeout == other.retransmission_timeout
            && self.cumulative_ack_timeout == other.cumulative_ack_timeout
            && self.null_packet_timeout == other.null_packet_timeout
            && self.max_retransmissions == other.max_retransmissions
            && self.max_cumulative_acks == other.max_cumulative_acks
            && self.max_out_of_sequence_packets == other.max_out_of_sequence_packets
            && self.max_auto_resets == other.max_auto_resets
            && self.security == other.security
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(ConnectionParameters::default().validate().is_ok());
    }

    #[test]
    fn all_violations_are_reported() {
        let params = ConnectionParameters {
            retransmission_timeout: 50,
            cumulative_ack_timeout: 60,
            max_outstanding_packets: 0,
            ..Default::default()
        };

        let err = params.validate().unwrap_err();
        assert_eq!(
            err.0,
            vec![
                ParameterError::RetransmissionTimeout(50),
                ParameterError::CumulativeAckTimeout(60),
                ParameterError::CumulativeAckNotBelowRetransmission {
                    cumulative: 60,
                    retransmission: 50,
                },
                ParameterError::MaxOutstandingPackets,
            ]
        );
    }

    #[test]
    fn cumulative_ack_must_be_strictly_below_rto() {
        let params = ConnectionParameters {
            retransmission_timeout: 200,
            cumulative_ack_timeout: 200,
            ..Default::default()
        };
        let err = params.validate().unwrap_err();
        assert_eq!(err.0.len(), 1);
    }

    #[test]
    fn tiny_packet_size_is_rejected() {
        let params = ConnectionParameters {
            max_packet_size: HEADER_LEN as u16,
            ..Default::default()
        };
        assert_eq!(
            params.validate().unwrap_err().0,
            vec![ParameterError::MaxPacketSize(HEADER_LEN as u16)]
        );
    }

    #[test]
    fn error_display_lists_every_violation() {
        let params = ConnectionParameters {
            retransmission_timeout: 10,
            max_outstanding_packets: 0,
            ..Default::default()
        };
        let text = params.validate().unwrap_err().to_string();
        assert!(text.contains("retransmission timeout 10 ms"));
        assert!(text.contains("max outstanding packets"));
    }

    #[test]
    fn negotiate_keeps_local_limits() {
        let server = ConnectionParameters {
            max_outstanding_packets: 4,
            max_packet_size: 512,
            ..Default::default()
        };
        let client = ConnectionParameters {
            retransmission_timeout: 900,
            max_retransmissions: 20,
            max_outstanding_packets: 64,
            ..Default::default()
        };

        let reply = server.negotiate(&client);
        assert_eq!(reply.max_outstanding_packets, 4);
        assert_eq!(reply.max_packet_size, 512);
        assert_eq!(reply.retransmission_timeout, 900);
        assert_eq!(reply.max_retransmissions, 20);
        assert!(reply.negotiable_eq(&client));
    }

    #[test]
    fn negotiable_eq_detects_changes() {
        let a = ConnectionParameters::default();
        let b = ConnectionParameters {
            null_packet_timeout: 0,
            ..Default::default()
        };
        assert!(!a.negotiable_eq(&b));
    }
}
