//! Reliable, in-order delivery.
//!
//! Both directions run a [`SlidingWindow`] over their own sequence space,
//! starting at 0 when the connection is established:
//!
//! ```text
//!   send:  queued ──try_insert──▶ [ window: peer's max outstanding ] ──▶ wire
//!            Available  → transmit + start retransmitter
//!            Accepted   → peer acked it, dispose retransmitter
//!
//!   recv:  wire ──try_insert_and_accept──▶ [ window: our max outstanding ]
//!            Accepted   → hand to the application, strictly in order
//! ```
//!
//! Segments queued beyond the send window wait in their slot until acks
//! slide the window over them.  Every data segment piggybacks the current
//! cumulative ack, patched in each time it reaches the wire, resends
//! included.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::buffer::PooledBuffer;
use crate::connection::{ConnError, Connection};
use crate::consumer::{PacketEvent, PacketKind};
use crate::handler::{AckCounter, Link, RetransmitTable};
use crate::packet::{options, Ack, Header, OptionsMask, Packet};
use crate::retransmitter::{RefreshHook, RetransmitPolicy};
use crate::window::{SlidingWindow, WindowEvent, MAX_WINDOW};

const ORDERED: u8 = options::RELIABLE | options::ORDERED;

pub struct OrderedHandler {
    link: Arc<Link>,
    next_seq: Mutex<u8>,
    send: SlidingWindow<PooledBuffer>,
    table: RetransmitTable,
    recv: Arc<SlidingWindow<Vec<u8>>>,
    acks: AckCounter,
    policy: RetransmitPolicy,
    refresh: RefreshHook,
    ack_threshold: u8,
}

impl OrderedHandler {
    const MASK: OptionsMask = OptionsMask::ORDERED;

    pub fn new(link: Arc<Link>, conn: &Connection) -> Self {
        let recv = Arc::new(SlidingWindow::new(conn.recv_window()));
        let window = Arc::clone(&recv);
        let refresh: RefreshHook = Arc::new(move |segment: &mut [u8]| {
            Header::rewrite_ack(segment, cumulative_ack(&window));
        });
        Self {
            link,
            next_seq: Mutex::new(0),
            send: SlidingWindow::new(conn.send_window()),
            table: RetransmitTable::default(),
            recv,
            acks: AckCounter::default(),
            policy: RetransmitPolicy {
                max_retransmissions: conn.peer_params().max_retransmissions,
                interval: conn.retransmission_timeout(),
            },
            refresh,
            ack_threshold: conn.peer_params().max_cumulative_acks,
        }
    }

    /// Queue `payload`.  It goes out as soon as it is inside the send window.
    pub fn send(&self, payload: &[u8]) -> Result<u8, ConnError> {
        let mut next = self.next_seq.lock();
        let seq = *next;
        if seq.wrapping_sub(self.send.tail()) >= MAX_WINDOW {
            return Err(ConnError::SendBufferFull);
        }

        let segment = Packet::Ack(Ack::new(seq, self.ack_value(), ORDERED, payload.to_vec()))
            .encode_pooled(self.link.pool());
        if !self.send.try_insert(seq, segment, |event| self.on_send_event(event)) {
            return Err(ConnError::SendBufferFull);
        }
        *next = seq.wrapping_add(1);
        Ok(seq)
    }

    /// Runs under the send window's lock.
    fn on_send_event(&self, event: WindowEvent<'_, PooledBuffer>) {
        match event {
            WindowEvent::Available { seq, item } => {
                let mut wire = item.clone();
                Header::rewrite_ack(&mut wire, self.ack_value());
                let refresh = Some(Arc::clone(&self.refresh));
                let rtx = self.link.retransmit(item.clone(), self.policy, refresh);
                self.table.insert(seq, rtx);
                match self.link.send(wire) {
                    Ok(()) => {
                        self.acks.take();
                        log::trace!("[ordered] → seq {seq} to {}", self.link.remote());
                    }
                    Err(e) => log::debug!("[ordered] seq {seq} not sent: {e}"),
                }
            }
            WindowEvent::Accepted { seq, item } => {
                self.table.remove(seq);
                drop(item);
            }
        }
    }

    pub fn handle(&self, event: &PacketEvent) {
        if !Self::MASK.supports(event.header.options) {
            return;
        }
        match &event.kind {
            PacketKind::Ack => self.on_ack(event.header.ack),
            PacketKind::Data(payload) => self.receive(event.header.seq, payload.clone()),
            PacketKind::Syn(_) | PacketKind::Rst | PacketKind::Nul => {}
        }
    }

    fn on_ack(&self, ack: u8) {
        let next = *self.next_seq.lock();
        let tail = self.send.tail();
        if ack.wrapping_sub(tail) >= next.wrapping_sub(tail) {
            log::trace!("[ordered] ← stale ack {ack} (tail {tail})");
            return;
        }
        if self.send.try_accept_through(ack, |event| self.on_send_event(event)) {
            log::trace!("[ordered] ← ack {ack}, window now at {}", self.send.tail());
        }
    }

    fn receive(&self, seq: u8, payload: Vec<u8>) {
        if self.recv.is_stale(seq) {
            log::debug!("[ordered] ← stale seq {seq} from {}", self.link.remote());
        } else if !self.recv.try_insert_and_accept(seq, payload, |event| {
            if let WindowEvent::Accepted { item, .. } = event {
                self.link.deliver(item);
            }
        }) {
            log::debug!("[ordered] ← duplicate seq {seq} from {}", self.link.remote());
        }
        if self.acks.record(self.ack_threshold) {
            self.send_ack();
        }
    }

    fn ack_value(&self) -> u8 {
        cumulative_ack(&self.recv)
    }

    fn send_ack(&self) {
        let seq = *self.next_seq.lock();
        let ack = self.ack_value();
        let packet = Packet::Ack(Ack::new(seq, ack, ORDERED, Vec::new()));
        match self.link.send_packet(&packet) {
            Ok(()) => log::trace!("[ordered] → ack {ack}"),
            Err(e) => log::debug!("[ordered] ack to {} not sent: {e}", self.link.remote()),
        }
    }

    /// Send an ack if any received segment is still unacknowledged.
    pub fn flush_acks(&self) {
        if self.acks.take() {
            self.send_ack();
        }
    }

    /// Time since this side last acknowledged anything.
    pub fn ack_idle_for(&self) -> Duration {
        self.acks.idle_for()
    }

    /// Segments queued or in flight.
    pub fn unacknowledged(&self) -> usize {
        self.send.len()
    }

    pub fn dispose(&self) {
        self.table.dispose_all();
        self.send.drain();
        self.recv.drain();
    }
}

/// Last in-order sequence number received.
fn cumulative_ack<T>(recv: &SlidingWindow<T>) -> u8 {
    recv.tail().wrapping_sub(1)
}

impl std::fmt::Debug for OrderedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedHandler")
            .field("remote", &self.link.remote())
            .field("send", &self.send)
            .field("recv", &self.recv)
            .finish()
    }
}
