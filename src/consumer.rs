//! Datagram decoding and event fan-out.
//!
//! One dispatch thread pulls datagrams off the [`Channel`], classifies them
//! into [`PacketEvent`]s and hands each event to:
//!
//! 1. every subscribed [`PacketListener`] whose endpoint filter matches, and
//! 2. for SYNs nobody has claimed, a bounded backlog that `accept` takes
//!    from.  A SYN is claimed when a listener subscribed to its endpoint
//!    exists; that listener already owns the handshake.
//!
//! One datagram may produce several events.  A data-carrying ACK yields a
//! `Data` event followed by an `Ack` event; otherwise the ACK bit yields
//! `Ack`, then SYN, RST and NUL bits yield their own events in that order.
//!
//! Listeners run on the dispatch thread and must not block.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::channel::{Channel, Datagram};
use crate::connection::ConnError;
use crate::packet::{controls, Header, PacketError, Syn, HEADER_LEN};
use crate::ring::{Consumed, Overflow, RingBuffer};

/// Unclaimed SYNs kept for `accept`.
pub const BACKLOG_LEN: usize = 256;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What one event reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketKind {
    Syn(Syn),
    /// The header's ack field is meaningful.
    Ack,
    /// Application payload carried by a plain ACK.
    Data(Vec<u8>),
    Rst,
    Nul,
}

/// Discriminant of [`PacketKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Syn,
    Ack,
    Data,
    Rst,
    Nul,
}

impl PacketKind {
    pub fn kind(&self) -> EventKind {
        match self {
            PacketKind::Syn(_) => EventKind::Syn,
            PacketKind::Ack => EventKind::Ack,
            PacketKind::Data(_) => EventKind::Data,
            PacketKind::Rst => EventKind::Rst,
            PacketKind::Nul => EventKind::Nul,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketEvent {
    pub from: SocketAddr,
    pub header: Header,
    pub kind: PacketKind,
}

/// Receives events on the dispatch thread.
pub trait PacketListener: Send + Sync {
    fn on_packet(&self, event: &PacketEvent);
}

impl<F> PacketListener for F
where
    F: Fn(&PacketEvent) + Send + Sync,
{
    fn on_packet(&self, event: &PacketEvent) {
        self(event)
    }
}

/// Decode one datagram (checksum already stripped) into its events.
pub fn classify(from: SocketAddr, segment: &[u8]) -> Result<Vec<PacketEvent>, PacketError> {
    let header = Header::decode(segment)?;
    let event = |kind| PacketEvent { from, header, kind };
    let mut events = Vec::with_capacity(2);

    if header.has(controls::ACK) {
        if header.is_pure_ack() && segment.len() > HEADER_LEN {
            events.push(event(PacketKind::Data(segment[HEADER_LEN..].to_vec())));
        }
        events.push(event(PacketKind::Ack));
    }
    if header.has(controls::SYN) {
        events.push(event(PacketKind::Syn(Syn::decode(segment)?)));
    }
    if header.has(controls::RST) {
        events.push(event(PacketKind::Rst));
    }
    if header.has(controls::NUL) {
        events.push(event(PacketKind::Nul));
    }
    if events.is_empty() {
        return Err(PacketError::UnknownControls(header.controls));
    }
    Ok(events)
}

struct Subscription {
    id: u64,
    filter: Option<SocketAddr>,
    listener: Arc<dyn PacketListener>,
}

struct Shared {
    channel: Arc<Channel>,
    running: AtomicBool,
    subscriptions: Mutex<Vec<Subscription>>,
    backlog: RingBuffer<PacketEvent>,
}

impl Shared {
    fn dispatch(&self, datagram: Datagram) {
        let events = match classify(datagram.from, &datagram.payload) {
            Ok(events) => events,
            Err(e) => {
                log::debug!("[consumer] ← undecodable segment from {}: {e}", datagram.from);
                return;
            }
        };
        drop(datagram);

        for event in events {
            let (listeners, claimed) = self.listeners_for(event.from);
            for listener in listeners {
                listener.on_packet(&event);
            }
            if matches!(event.kind, PacketKind::Syn(_)) && !claimed {
                self.backlog.produce(event);
            }
        }
    }

    /// Listeners for `from`, and whether one of them is bound to it.
    fn listeners_for(&self, from: SocketAddr) -> (Vec<Arc<dyn PacketListener>>, bool) {
        let subs = self.subscriptions.lock();
        let claimed = subs.iter().any(|sub| sub.filter == Some(from));
        let listeners = subs
            .iter()
            .filter(|sub| sub.filter.map_or(true, |addr| addr == from))
            .map(|sub| Arc::clone(&sub.listener))
            .collect();
        (listeners, claimed)
    }
}

/// Owner of the dispatch thread.
pub struct PacketConsumer {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
    disposed: AtomicBool,
}

impl PacketConsumer {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self {
            shared: Arc::new(Shared {
                channel,
                running: AtomicBool::new(false),
                subscriptions: Mutex::new(Vec::new()),
                backlog: RingBuffer::new(BACKLOG_LEN, Overflow::DropOldest),
            }),
            thread: Mutex::new(None),
            next_id: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
        }
    }

    /// Start dispatching.  No-op when already running.
    pub fn start(&self) -> Result<(), ConnError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ConnError::Disposed("packet consumer"));
        }
        let mut slot = self.thread.lock();
        if slot.is_some() {
            return Ok(());
        }
        self.shared.backlog.clear();
        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        *slot = Some(
            thread::Builder::new()
                .name("rudp-consumer".into())
                .spawn(move || {
                    while shared.running.load(Ordering::Acquire) {
                        if let Some(datagram) = shared.channel.try_consume(POLL_INTERVAL) {
                            shared.dispatch(datagram);
                        }
                    }
                    log::debug!("[consumer] dispatch thread stopped");
                })?,
        );
        log::debug!("[consumer] dispatch thread started");
        Ok(())
    }

    /// Stop dispatching and wait for the thread.  No-op when stopped.
    pub fn stop(&self) -> Result<(), ConnError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ConnError::Disposed("packet consumer"));
        }
        self.halt();
        Ok(())
    }

    fn halt(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        self.shared.running.store(false, Ordering::Release);
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            log::warn!("[consumer] dispatch thread panicked");
        }
    }

    /// Stop for good.  Waiters on the backlog are woken with `Closed`.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.halt();
        self.shared.subscriptions.lock().clear();
        self.shared.backlog.close();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Register `listener` for events from `filter` (or from anyone).
    pub fn subscribe(&self, filter: Option<SocketAddr>, listener: Arc<dyn PacketListener>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.subscriptions.lock().push(Subscription {
            id,
            filter,
            listener,
        });
        id
    }

    /// Returns `false` if `id` was not subscribed.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut subs = self.shared.subscriptions.lock();
        let before = subs.len();
        subs.retain(|sub| sub.id != id);
        subs.len() != before
    }

    pub fn subscribers(&self) -> usize {
        self.shared.subscriptions.lock().len()
    }

    /// Take the oldest unclaimed SYN matching `predicate`, waiting at most
    /// `timeout`.
    pub fn wait_for_syn(
        &self,
        timeout: Duration,
        predicate: impl FnMut(&PacketEvent) -> bool,
    ) -> Consumed<PacketEvent> {
        self.shared.backlog.take_matching(timeout, predicate)
    }

    /// Drop every backlogged SYN from `from`.  Returns how many went.
    pub fn discard_syns_from(&self, from: SocketAddr) -> usize {
        let mut discarded = 0;
        while let Consumed::Item(_) = self
            .shared
            .backlog
            .take_matching(Duration::ZERO, |event| event.from == from)
        {
            discarded += 1;
        }
        discarded
    }

    pub fn backlog_len(&self) -> usize {
        self.shared.backlog.len()
    }
}

impl Drop for PacketConsumer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for PacketConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketConsumer")
            .field("running", &self.is_running())
            .field("subscribers", &self.subscribers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::channel::ChannelOptions;
    use crate::packet::{options, Ack, Packet};
    use crate::parameters::ConnectionParameters;
    use crate::stats::Stats;
    use std::net::Ipv4Addr;
    use std::sync::mpsc;

    fn from() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 4000))
    }

    fn kinds(events: &[PacketEvent]) -> Vec<EventKind> {
        events.iter().map(|ev| ev.kind.kind()).collect()
    }

    #[test]
    fn data_ack_yields_data_then_ack() {
        let seg = Packet::Ack(Ack::new(1, 2, options::RELIABLE, b"hi".to_vec())).encode();
        let events = classify(from(), &seg).unwrap();
        assert_eq!(kinds(&events), vec![EventKind::Data, EventKind::Ack]);
        assert_eq!(events[0].kind, PacketKind::Data(b"hi".to_vec()));
    }

    #[test]
    fn control_combinations() {
        let syn_ack = Packet::Syn(crate::packet::Syn::reply(3, 4, ConnectionParameters::default())).encode();
        assert_eq!(kinds(&classify(from(), &syn_ack).unwrap()), vec![EventKind::Ack, EventKind::Syn]);

        let rst = Packet::rst(0, 0).encode();
        assert_eq!(kinds(&classify(from(), &rst).unwrap()), vec![EventKind::Ack, EventKind::Rst]);

        let nul = Packet::nul(0, 0, options::RELIABLE).encode();
        assert_eq!(kinds(&classify(from(), &nul).unwrap()), vec![EventKind::Ack, EventKind::Nul]);

        let bare_ack = Packet::Ack(Ack::new(0, 9, options::NONE, Vec::new())).encode();
        assert_eq!(kinds(&classify(from(), &bare_ack).unwrap()), vec![EventKind::Ack]);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(classify(from(), &[0x40, 0]).is_err());
        assert!(classify(from(), &[0x07, 0, 0, 0]).is_err());
        assert!(classify(from(), &[0x80, 0, 0, 0, 1]).is_err());
    }

    fn running_pair() -> (Arc<Channel>, PacketConsumer, Arc<Channel>) {
        let open = || {
            let ch = Arc::new(Channel::new(
                ChannelOptions::default(),
                BufferPool::new(16),
                Arc::new(Stats::default()),
            ));
            ch.bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
            ch.open().unwrap();
            ch
        };
        let local = open();
        let consumer = PacketConsumer::new(Arc::clone(&local));
        consumer.start().unwrap();
        (local, consumer, open())
    }

    #[test]
    fn listeners_are_filtered_by_endpoint() {
        let (local, consumer, remote) = running_pair();
        let (tx_any, rx_any) = mpsc::channel();
        let (tx_other, rx_other) = mpsc::channel();
        let (tx_any, tx_other) = (Mutex::new(tx_any), Mutex::new(tx_other));
        consumer.subscribe(None, Arc::new(move |ev: &PacketEvent| {
            let _ = tx_any.lock().send(ev.kind.kind());
        }) as Arc<dyn PacketListener>);
        consumer.subscribe(Some(from()), Arc::new(move |ev: &PacketEvent| {
            let _ = tx_other.lock().send(ev.kind.kind());
        }) as Arc<dyn PacketListener>);
        assert_eq!(consumer.subscribers(), 2);

        let seg = Packet::rst(0, 0).encode_pooled(remote.pool());
        remote.send(seg, local.local_addr().unwrap()).unwrap();

        assert_eq!(rx_any.recv_timeout(Duration::from_secs(2)).unwrap(), EventKind::Ack);
        assert_eq!(rx_any.recv_timeout(Duration::from_secs(2)).unwrap(), EventKind::Rst);
        assert!(rx_other.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(consumer.backlog_len(), 0);
    }

    #[test]
    fn only_unclaimed_syns_are_backlogged() {
        let (local, consumer, remote) = running_pair();
        let remote_addr = remote.local_addr().unwrap();
        let to = local.local_addr().unwrap();
        let syn = Packet::Syn(Syn::request(9, ConnectionParameters::default()));
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);

        remote.send(syn.encode_pooled(remote.pool()), to).unwrap();
        remote.send(syn.encode_pooled(remote.pool()), to).unwrap();
        let first = consumer.wait_for_syn(Duration::from_secs(2), |ev| ev.from == remote_addr);
        assert!(matches!(first, Consumed::Item(_)));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(consumer.discard_syns_from(remote_addr), 1);
        assert_eq!(consumer.backlog_len(), 0);

        consumer.subscribe(Some(remote_addr), Arc::new(move |ev: &PacketEvent| {
            let _ = tx.lock().send(ev.kind.kind());
        }) as Arc<dyn PacketListener>);
        remote.send(syn.encode_pooled(remote.pool()), to).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), EventKind::Syn);
        assert_eq!(consumer.backlog_len(), 0);
    }

    #[test]
    fn unsubscribe_and_lifecycle() {
        let (_local, consumer, _remote) = running_pair();
        let id = consumer.subscribe(None, Arc::new(|_: &PacketEvent| {}));
        assert!(consumer.unsubscribe(id));
        assert!(!consumer.unsubscribe(id));

        consumer.start().unwrap();
        consumer.stop().unwrap();
        consumer.stop().unwrap();
        assert!(!consumer.is_running());
        consumer.start().unwrap();
        assert!(consumer.is_running());

        consumer.dispose();
        assert!(matches!(consumer.start(), Err(ConnError::Disposed(_))));
        assert!(matches!(
            consumer.wait_for_syn(Duration::from_secs(5), |_| true),
            Consumed::Closed
        ));
    }
}
