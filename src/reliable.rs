//! Reliable, unordered delivery.
//!
//! Every segment sent here (data, SYN, NUL) occupies one sequence number
//! and gets a [`Retransmitter`](crate::retransmitter::Retransmitter).  The
//! peer answers with cumulative acks: `ack = n` covers every segment up to
//! and including `n`.
//!
//! ```text
//!   send side:   base ──── outstanding ──── next_seq
//!                 ▲ cumulative ack moves base, disposing retransmitters
//!
//!   recv side:   SlidingWindow<()> starting at the peer's ISN + 1.
//!                New data is delivered on arrival; the window only
//!                remembers what was seen so duplicates are dropped and
//!                the ack value (tail - 1) is exact.
//! ```
//!
//! Acks go out once `max_cumulative_acks` segments are pending (0 = every
//! segment), when outbound data piggybacks them, or when the connection's
//! cumulative-ack timer calls [`ReliableHandler::flush_acks`].  Resends of
//! ACK-bearing segments carry the ack value current at resend time.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::buffer::PooledBuffer;
use crate::connection::{ConnError, Connection};
use crate::consumer::{PacketEvent, PacketKind};
use crate::handler::{AckCounter, Link, RetransmitTable};
use crate::packet::{controls, options, Ack, Header, OptionsMask, Packet, Syn};
use crate::parameters::ConnectionParameters;
use crate::retransmitter::{RefreshHook, RetransmitPolicy};
use crate::window::{SlidingWindow, MAX_WINDOW};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Settings {
    policy: RetransmitPolicy,
    ack_threshold: u8,
    /// Segments allowed in flight.
    window: u8,
}

impl Settings {
    fn from_local(params: &ConnectionParameters) -> Self {
        Self {
            policy: RetransmitPolicy {
                max_retransmissions: params.max_retransmissions,
                interval: Duration::from_millis(u64::from(params.retransmission_timeout)),
            },
            ack_threshold: params.max_cumulative_acks,
            window: params.max_outstanding_packets.clamp(1, MAX_WINDOW),
        }
    }

    fn from_connection(conn: &Connection) -> Self {
        Self {
            policy: RetransmitPolicy {
                max_retransmissions: conn.peer_params().max_retransmissions,
                interval: conn.retransmission_timeout(),
            },
            ack_threshold: conn.peer_params().max_cumulative_acks,
            window: conn.send_window(),
        }
    }
}

#[derive(Debug)]
struct SendState {
    isn: u8,
    next_seq: u8,
    /// Oldest unacknowledged sequence number.
    base: u8,
}

pub struct ReliableHandler {
    link: Arc<Link>,
    send: Mutex<SendState>,
    table: RetransmitTable,
    recv: Arc<SlidingWindow<()>>,
    acks: AckCounter,
    settings: Mutex<Settings>,
    refresh: RefreshHook,
}

impl ReliableHandler {
    const MASK: OptionsMask = OptionsMask::RELIABLE;

    /// Create a handler with a random initial sequence number.  Until
    /// [`ReliableHandler::merge`] runs, `params` governs retransmission.
    pub fn new(link: Arc<Link>, params: &ConnectionParameters) -> Self {
        let isn: u8 = rand::random();
        let settings = Settings::from_local(params);
        let recv = Arc::new(SlidingWindow::new(settings.window));
        let window = Arc::clone(&recv);
        let refresh: RefreshHook = Arc::new(move |segment: &mut [u8]| {
            Header::rewrite_ack(segment, window.tail().wrapping_sub(1));
        });
        Self {
            link,
            send: Mutex::new(SendState {
                isn,
                next_seq: isn,
                base: isn,
            }),
            table: RetransmitTable::default(),
            recv,
            acks: AckCounter::default(),
            settings: Mutex::new(settings),
            refresh,
        }
    }

    /// Initial sequence number; the SYN carries it.
    pub fn isn(&self) -> u8 {
        self.send.lock().isn
    }

    /// Adopt the negotiated settings and start expecting the peer's first
    /// segment after its SYN.
    pub fn merge(&self, conn: &Connection) {
        *self.settings.lock() = Settings::from_connection(conn);
        self.recv.reset(conn.peer_syn().header.seq.wrapping_add(1));
    }

    /// Send the connection request.  Returns its sequence number.
    pub fn send_syn(&self, params: &ConnectionParameters) -> Result<u8, ConnError> {
        self.send_tracked(|seq, _| Packet::Syn(Syn::request(seq, params.clone())))
    }

    /// Send the SYN reply once, untracked.  Returns the encoded reply so it
    /// can be repeated when the request is.
    pub fn send_syn_reply(
        &self,
        ack: u8,
        params: &ConnectionParameters,
    ) -> Result<PooledBuffer, ConnError> {
        let mut send = self.send.lock();
        let seq = send.next_seq;
        let reply = Packet::Syn(Syn::reply(seq, ack, params.clone())).encode_pooled(self.link.pool());
        self.link.send(reply.clone())?;
        send.next_seq = seq.wrapping_add(1);
        send.base = send.next_seq;
        Ok(reply)
    }

    pub fn send(&self, payload: &[u8]) -> Result<u8, ConnError> {
        self.send_tracked(|seq, ack| {
            Packet::Ack(Ack::new(seq, ack, options::RELIABLE, payload.to_vec()))
        })
    }

    /// Keep-alive.  Tracked like data, so a dead peer exhausts the budget.
    pub fn send_nul(&self) -> Result<u8, ConnError> {
        self.send_tracked(|seq, ack| Packet::nul(seq, ack, options::RELIABLE))
    }

    fn send_tracked(&self, build: impl FnOnce(u8, u8) -> Packet) -> Result<u8, ConnError> {
        let settings = *self.settings.lock();
        let mut send = self.send.lock();
        let seq = send.next_seq;
        if seq.wrapping_sub(send.base) >= settings.window || self.table.contains(seq) {
            return Err(ConnError::SendBufferFull);
        }

        let packet = build(seq, self.ack_value());
        let refresh = (packet.header().controls & controls::ACK != 0).then(|| Arc::clone(&self.refresh));
        let segment = packet.encode_pooled(self.link.pool());
        let rtx = self.link.retransmit(segment.clone(), settings.policy, refresh);
        self.link.send(segment)?;
        self.table.insert(seq, rtx);
        send.next_seq = seq.wrapping_add(1);
        self.acks.take();
        log::trace!("[reliable] → seq {seq} to {}", self.link.remote());
        Ok(seq)
    }

    pub fn handle(&self, event: &PacketEvent) {
        if !Self::MASK.supports(event.header.options) {
            return;
        }
        match &event.kind {
            PacketKind::Ack => self.on_ack(event.header.ack),
            PacketKind::Data(payload) => self.receive(event.header.seq, Some(payload.clone())),
            PacketKind::Nul => self.receive(event.header.seq, None),
            PacketKind::Syn(_) | PacketKind::Rst => {}
        }
    }

    fn on_ack(&self, ack: u8) {
        let mut send = self.send.lock();
        let acked = ack.wrapping_sub(send.base);
        if acked >= send.next_seq.wrapping_sub(send.base) {
            log::trace!("[reliable] ← stale ack {ack} (base {})", send.base);
            return;
        }
        let released = self.table.remove_through(send.base, ack);
        send.base = ack.wrapping_add(1);
        log::trace!("[reliable] ← ack {ack} released {released}");
    }

    fn receive(&self, seq: u8, payload: Option<Vec<u8>>) {
        let fresh = !self.recv.is_stale(seq) && self.recv.try_insert_and_accept(seq, (), |_| {});
        match (fresh, payload) {
            (true, Some(payload)) => self.link.deliver(payload),
            (true, None) => log::trace!("[reliable] ← NUL {seq}"),
            (false, _) => log::debug!("[reliable] ← duplicate seq {seq} from {}", self.link.remote()),
        }
        let threshold = self.settings.lock().ack_threshold;
        if self.acks.record(threshold) {
            self.send_ack();
        }
    }

    /// Cumulative ack value: everything before the receive tail.
    fn ack_value(&self) -> u8 {
        self.recv.tail().wrapping_sub(1)
    }

    fn send_ack(&self) {
        let seq = self.send.lock().next_seq;
        let ack = self.ack_value();
        let packet = Packet::Ack(Ack::new(seq, ack, options::RELIABLE, Vec::new()));
        match self.link.send_packet(&packet) {
            Ok(()) => log::trace!("[reliable] → ack {ack}"),
            Err(e) => log::debug!("[reliable] ack to {} not sent: {e}", self.link.remote()),
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

    /// Segments sent and not yet acknowledged.
    pub fn outstanding(&self) -> usize {
        self.table.len()
    }

    pub fn dispose(&self) {
        self.table.dispose_all();
        self.recv.drain();
    }
}

impl std::fmt::Debug for ReliableHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let send = self.send.lock();
        f.debug_struct("ReliableHandler")
            .field("remote", &self.link.remote())
            .field("next_seq", &send.next_seq)
            .field("base", &send.base)
            .field("recv_tail", &self.recv.tail())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::testing::{endpoint, link, pump, Endpoint};
    use crate::simulator::SimulatorConfig;
    use crate::timer::TimerQueue;
    use std::net::SocketAddr;
    use std::time::Instant;

    fn params() -> ConnectionParameters {
        ConnectionParameters {
            retransmission_timeout: 150,
            cumulative_ack_timeout: 100,
            max_cumulative_acks: 0,
            ..Default::default()
        }
    }

    /// A connection on `receiver`'s side that expects `sender`'s data.
    fn expecting(sender: &ReliableHandler, addr: SocketAddr, params: &ConnectionParameters) -> Connection {
        let syn = Syn::request(sender.isn().wrapping_sub(1), params.clone());
        Connection::new(addr, params.clone(), syn)
    }

    struct Pair {
        a: Endpoint,
        b: Endpoint,
        tx: ReliableHandler,
        rx: ReliableHandler,
        _queue: TimerQueue,
    }

    fn pair(p: ConnectionParameters, loss: Option<SimulatorConfig>) -> Pair {
        let a = endpoint(loss);
        let b = endpoint(None);
        let queue = TimerQueue::new().unwrap();
        let tx = ReliableHandler::new(link(&a, b.addr, &queue.handle()), &p);
        let rx = ReliableHandler::new(link(&b, a.addr, &queue.handle()), &p);
        rx.merge(&expecting(&tx, a.addr, &p));
        Pair {
            a,
            b,
            tx,
            rx,
            _queue: queue,
        }
    }

    #[test]
    fn data_is_delivered_and_acks_release_retransmitters() {
        let p = pair(params(), None);
        for word in [&b"alpha"[..], b"beta", b"gamma"] {
            p.tx.send(word).unwrap();
        }
        assert_eq!(p.tx.outstanding(), 3);

        pump(&p.b.channel, Duration::from_millis(200), |ev| p.rx.handle(ev));
        assert_eq!(p.b.recorder.received().len(), 3);

        pump(&p.a.channel, Duration::from_millis(200), |ev| p.tx.handle(ev));
        assert_eq!(p.tx.outstanding(), 0);
    }

    #[test]
    fn duplicates_are_delivered_once() {
        let p = pair(params(), None);
        let seq = p.tx.isn();
        let raw = link(&p.a, p.b.addr, p.tx.link.timers());
        let dup = Packet::Ack(Ack::new(seq, 0, options::RELIABLE, b"once".to_vec()));
        raw.send_packet(&dup).unwrap();
        raw.send_packet(&dup).unwrap();

        pump(&p.b.channel, Duration::from_millis(200), |ev| p.rx.handle(ev));
        assert_eq!(p.b.recorder.received(), vec![b"once".to_vec()]);
    }

    #[test]
    fn window_limits_outstanding_segments() {
        let p = pair(
            ConnectionParameters {
                max_outstanding_packets: 2,
                ..params()
            },
            None,
        );
        p.tx.send(b"1").unwrap();
        p.tx.send(b"2").unwrap();
        assert!(matches!(p.tx.send(b"3"), Err(ConnError::SendBufferFull)));
    }

    #[test]
    fn stale_ack_is_ignored() {
        let p = pair(params(), None);
        p.tx.send(b"x").unwrap();
        p.tx.on_ack(p.tx.isn().wrapping_sub(1));
        assert_eq!(p.tx.outstanding(), 1);
        p.tx.on_ack(p.tx.isn().wrapping_add(5));
        assert_eq!(p.tx.outstanding(), 1);
        p.tx.on_ack(p.tx.isn());
        assert_eq!(p.tx.outstanding(), 0);
    }

    #[test]
    fn threshold_batches_acks() {
        let p = pair(
            ConnectionParameters {
                max_cumulative_acks: 3,
                retransmission_timeout: 1000,
                ..params()
            },
            None,
        );
        p.tx.send(b"1").unwrap();
        p.tx.send(b"2").unwrap();
        pump(&p.b.channel, Duration::from_millis(150), |ev| p.rx.handle(ev));
        assert_eq!(p.rx.acks.pending(), 2);
        assert_eq!(pump(&p.a.channel, Duration::from_millis(100), |_| {}), 0);

        p.rx.flush_acks();
        pump(&p.a.channel, Duration::from_millis(150), |ev| p.tx.handle(ev));
        assert_eq!(p.tx.outstanding(), 0);
    }

    #[test]
    fn lossy_link_still_delivers_everything() {
        let unbounded = ConnectionParameters {
            max_retransmissions: 0,
            ..params()
        };
        let p = pair(unbounded, Some(SimulatorConfig::lossy(0.5, 11)));
        for i in 0..8u8 {
            p.tx.send(&[i]).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while p.tx.outstanding() > 0 && Instant::now() < deadline {
            pump(&p.b.channel, Duration::from_millis(20), |ev| p.rx.handle(ev));
            p.rx.flush_acks();
            pump(&p.a.channel, Duration::from_millis(20), |ev| p.tx.handle(ev));
        }

        let mut got = p.b.recorder.received();
        got.sort();
        assert_eq!(got, (0..8u8).map(|i| vec![i]).collect::<Vec<_>>());
        assert!(p.a.channel.stats().snapshot().retransmissions > 0);
    }

    #[test]
    fn nul_is_acknowledged_without_delivery() {
        let p = pair(params(), None);
        p.tx.send_nul().unwrap();
        pump(&p.b.channel, Duration::from_millis(150), |ev| p.rx.handle(ev));
        assert!(p.b.recorder.received().is_empty());
        pump(&p.a.channel, Duration::from_millis(150), |ev| p.tx.handle(ev));
        assert_eq!(p.tx.outstanding(), 0);
    }

    #[test]
    fn resent_data_carries_the_current_ack() {
        let quiet = ConnectionParameters {
            max_cumulative_acks: 10,
            ..params()
        };
        let p = pair(quiet.clone(), None);
        p.tx.merge(&expecting(&p.rx, p.b.addr, &quiet));

        p.tx.send(b"first").unwrap();
        pump(&p.b.channel, Duration::from_millis(50), |_| {});

        p.rx.send(b"reply").unwrap();
        pump(&p.a.channel, Duration::from_millis(100), |ev| p.tx.handle(ev));
        assert_eq!(p.a.recorder.received(), vec![b"reply".to_vec()]);
        assert_eq!(p.tx.acks.pending(), 1);

        pump(&p.b.channel, Duration::from_millis(300), |ev| p.rx.handle(ev));
        assert_eq!(p.b.recorder.received(), vec![b"first".to_vec()]);
        assert_eq!(p.rx.outstanding(), 0);
    }
}
