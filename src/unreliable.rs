//! Fire-and-forget delivery and connection resets.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::ConnError;
use crate::consumer::{PacketEvent, PacketKind};
use crate::handler::Link;
use crate::packet::{options, Ack, OptionsMask, Packet};

/// Sends each payload once.  Also carries RST, which is never
/// retransmitted.
pub struct UnreliableHandler {
    link: Arc<Link>,
    next_seq: Mutex<u8>,
}

impl UnreliableHandler {
    const MASK: OptionsMask = OptionsMask::UNRELIABLE;

    pub fn new(link: Arc<Link>) -> Self {
        Self {
            link,
            next_seq: Mutex::new(0),
        }
    }

    fn allocate(&self) -> u8 {
        let mut next = self.next_seq.lock();
        let seq = *next;
        *next = next.wrapping_add(1);
        seq
    }

    pub fn send(&self, payload: &[u8]) -> Result<(), ConnError> {
        let seq = self.allocate();
        let packet = Packet::Ack(Ack::new(seq, 0, options::NONE, payload.to_vec()));
        self.link.send_packet(&packet)?;
        log::trace!("[unreliable] → seq {seq} ({} bytes) to {}", payload.len(), self.link.remote());
        Ok(())
    }

    pub fn send_rst(&self) -> Result<(), ConnError> {
        let seq = self.allocate();
        self.link.send_packet(&Packet::rst(seq, 0))?;
        self.link.stats().record_reset_sent();
        log::debug!("[unreliable] → RST to {}", self.link.remote());
        Ok(())
    }

    pub fn handle(&self, event: &PacketEvent) {
        if !Self::MASK.supports(event.header.options) {
            return;
        }
        match &event.kind {
            PacketKind::Data(payload) => self.link.deliver(payload.clone()),
            PacketKind::Rst => {
                self.link.stats().record_reset_received();
                log::debug!("[unreliable] ← RST from {}", event.from);
                self.link.notify_reset();
            }
            PacketKind::Syn(_) | PacketKind::Ack | PacketKind::Nul => {}
        }
    }
}

impl std::fmt::Debug for UnreliableHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnreliableHandler")
            .field("remote", &self.link.remote())
            .finish()
    }
}
