//! Plumbing shared by the three delivery disciplines.
//!
//! | Discipline   | Options on the wire    | Retransmitted | In order |
//! |--------------|------------------------|---------------|----------|
//! | Unreliable   | none                   | no            | no       |
//! | Reliable     | `RELIABLE`             | yes           | no       |
//! | Ordered      | `RELIABLE \| ORDERED`  | yes           | yes      |
//!
//! Each discipline owns its own sequence counter and retransmit table, and
//! reacts only to segments whose option bits match its [`OptionsMask`].
//! All three talk to the network and to their connection through a shared
//! [`Link`].
//!
//! [`OptionsMask`]: crate::packet::OptionsMask

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::buffer::{BufferPool, PooledBuffer};
use crate::channel::Channel;
use crate::connection::ConnError;
use crate::packet::Packet;
use crate::retransmitter::{ExpiryHook, RefreshHook, RetransmitPolicy, Retransmitter};
use crate::stats::Stats;
use crate::timer::Timers;
use crate::window::SEQUENCE_SPACE;

/// Delivery discipline for one send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Sent once, may be lost or reordered.
    Unreliable,
    /// Retransmitted until acknowledged, delivered as it arrives.
    Reliable,
    /// Retransmitted and delivered in send order.
    #[default]
    Ordered,
}

/// Upward notifications from the disciplines to their connection.
///
/// Called from the dispatch thread (data, reset) or the timer thread
/// (expiry).  Implementations must not block.
pub trait HandlerObserver: Send + Sync {
    fn on_data(&self, data: Vec<u8>);
    fn on_reset(&self, from: SocketAddr);
    fn on_expired(&self, to: SocketAddr);
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// One connection's view of the shared channel.
pub struct Link {
    channel: Arc<Channel>,
    timers: Timers,
    remote: SocketAddr,
    observer: Weak<dyn HandlerObserver>,
    last_send: Mutex<Instant>,
}

impl Link {
    pub fn new(
        channel: Arc<Channel>,
        timers: Timers,
        remote: SocketAddr,
        observer: Weak<dyn HandlerObserver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            timers,
            remote,
            observer,
            last_send: Mutex::new(Instant::now()),
        })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        self.channel.pool()
    }

    pub fn stats(&self) -> &Arc<Stats> {
        self.channel.stats()
    }

    /// Queue an encoded segment for the remote endpoint.
    pub fn send(&self, segment: PooledBuffer) -> Result<(), ConnError> {
        self.channel.send(segment, self.remote)?;
        *self.last_send.lock() = Instant::now();
        Ok(())
    }

    pub fn send_packet(&self, packet: &Packet) -> Result<(), ConnError> {
        self.send(packet.encode_pooled(self.pool()))
    }

    /// Time since the last segment was queued.
    pub fn idle_for(&self) -> Duration {
        self.last_send.lock().elapsed()
    }

    /// Start resending `segment` until acknowledged. `refresh` patches each
    /// resend before it is queued.
    pub fn retransmit(
        &self,
        segment: PooledBuffer,
        policy: RetransmitPolicy,
        refresh: Option<RefreshHook>,
    ) -> Retransmitter {
        Retransmitter::start(
            Arc::clone(&self.channel),
            &self.timers,
            segment,
            self.remote,
            policy,
            self.expiry_hook(),
            refresh,
        )
    }

    pub fn deliver(&self, data: Vec<u8>) {
        if let Some(observer) = self.observer.upgrade() {
            observer.on_data(data);
        }
    }

    pub fn notify_reset(&self) {
        if let Some(observer) = self.observer.upgrade() {
            observer.on_reset(self.remote);
        }
    }

    fn expiry_hook(&self) -> ExpiryHook {
        let observer = self.observer.clone();
        Arc::new(move |to| {
            if let Some(observer) = observer.upgrade() {
                observer.on_expired(to);
            }
        })
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("remote", &self.remote).finish()
    }
}

// ---------------------------------------------------------------------------
// Retransmit table
// ---------------------------------------------------------------------------

/// One retransmitter slot per sequence number.
///
/// Lookup, removal and disposal happen under a single lock, so a
/// retransmitter is always disposed before anyone else can see its slot
/// empty.
pub struct RetransmitTable {
    slots: Mutex<Vec<Option<Retransmitter>>>,
}

impl Default for RetransmitTable {
    fn default() -> Self {
        Self {
            slots: Mutex::new((0..SEQUENCE_SPACE).map(|_| None).collect()),
        }
    }
}

impl RetransmitTable {
    /// Store `rtx` at `seq`, disposing whatever was there.
    pub fn insert(&self, seq: u8, rtx: Retransmitter) {
        let mut slots = self.slots.lock();
        if let Some(old) = slots[usize::from(seq)].replace(rtx) {
            old.dispose();
        }
    }

    pub fn contains(&self, seq: u8) -> bool {
        self.slots.lock()[usize::from(seq)].is_some()
    }

    /// Dispose the retransmitter at `seq`.  Returns `false` if there was none.
    pub fn remove(&self, seq: u8) -> bool {
        let mut slots = self.slots.lock();
        match slots[usize::from(seq)].take() {
            Some(rtx) => {
                rtx.dispose();
                true
            }
            None => false,
        }
    }

    /// Dispose every retransmitter from `from` through `through`, wrapping.
    /// Returns how many were disposed.
    pub fn remove_through(&self, from: u8, through: u8) -> usize {
        let mut slots = self.slots.lock();
        let count = u16::from(through.wrapping_sub(from)) + 1;
        let mut removed = 0;
        for step in 0..count {
            let seq = from.wrapping_add(step as u8);
            if let Some(rtx) = slots[usize::from(seq)].take() {
                rtx.dispose();
                removed += 1;
            }
        }
        removed
    }

    pub fn dispose_all(&self) {
        let mut slots = self.slots.lock();
        for rtx in slots.iter_mut().filter_map(Option::take) {
            rtx.dispose();
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Ack counter
// ---------------------------------------------------------------------------

/// Counts segments received since the last acknowledgement went out, and
/// when that was.
#[derive(Debug)]
pub struct AckCounter {
    state: Mutex<AckState>,
}

#[derive(Debug)]
struct AckState {
    pending: u32,
    last_ack: Instant,
}

impl Default for AckCounter {
    fn default() -> Self {
        Self {
            state: Mutex::new(AckState {
                pending: 0,
                last_ack: Instant::now(),
            }),
        }
    }
}

impl AckCounter {
    /// Count one segment.  Returns `true` when an ack is due now, in which
    /// case the count is reset.  A threshold of 0 acks every segment.
    pub fn record(&self, threshold: u8) -> bool {
        let mut state = self.state.lock();
        state.pending += 1;
        if state.pending >= u32::from(threshold) {
            state.pending = 0;
            state.last_ack = Instant::now();
            true
        } else {
            false
        }
    }

    /// Reset the count.  Returns whether anything was pending.
    pub fn take(&self) -> bool {
        let mut state = self.state.lock();
        if state.pending == 0 {
            return false;
        }
        state.pending = 0;
        state.last_ack = Instant::now();
        true
    }

    pub fn pending(&self) -> u32 {
        self.state.lock().pending
    }

    /// Time since an ack last went out, standalone or piggybacked.
    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_ack.elapsed()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Loopback rig for exercising one discipline without a connection.

    use super::*;
    use crate::channel::ChannelOptions;
    use crate::consumer::{classify, PacketEvent};
    use crate::simulator::SimulatorConfig;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct Recorder {
        pub data: Mutex<Vec<Vec<u8>>>,
        pub resets: AtomicUsize,
        pub expiries: AtomicUsize,
    }

    impl HandlerObserver for Recorder {
        fn on_data(&self, data: Vec<u8>) {
            self.data.lock().push(data);
        }
        fn on_reset(&self, _from: SocketAddr) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
        fn on_expired(&self, _to: SocketAddr) {
            self.expiries.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Recorder {
        pub fn received(&self) -> Vec<Vec<u8>> {
            self.data.lock().clone()
        }
    }

    pub struct Endpoint {
        pub channel: Arc<Channel>,
        pub recorder: Arc<Recorder>,
        pub addr: SocketAddr,
    }

    pub fn endpoint(simulator: Option<SimulatorConfig>) -> Endpoint {
        let channel = Arc::new(Channel::new(
            ChannelOptions {
                simulator,
                ..Default::default()
            },
            BufferPool::new(64),
            Arc::new(Stats::default()),
        ));
        let addr = channel
            .bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .expect("bind loopback");
        channel.open().expect("open channel");
        Endpoint {
            channel,
            recorder: Arc::new(Recorder::default()),
            addr,
        }
    }

    pub fn link(from: &Endpoint, to: SocketAddr, timers: &Timers) -> Arc<Link> {
        let recorder = Arc::downgrade(&from.recorder);
        let observer: Weak<dyn HandlerObserver> = recorder;
        Link::new(Arc::clone(&from.channel), timers.clone(), to, observer)
    }

    /// Feed every datagram arriving within `window` to `handle`.
    pub fn pump(channel: &Channel, window: Duration, mut handle: impl FnMut(&PacketEvent)) -> usize {
        let deadline = Instant::now() + window;
        let mut events = 0;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            let Some(datagram) = channel.try_consume(left) else {
                break;
            };
            if let Ok(batch) = classify(datagram.from, &datagram.payload) {
                for event in &batch {
                    handle(event);
                    events += 1;
                }
            }
        }
        events
    }
}
