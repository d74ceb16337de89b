//! Per-segment retransmission.
//!
//! A [`Retransmitter`] owns a private copy of one reliable segment and
//! resends it every `interval` until it is disposed (the segment was
//! acknowledged or the connection went away) or its budget runs out:
//!
//! ```text
//!   start ──interval──▶ fire ──resend──▶ fire ──resend──▶ ... ──▶ fire
//!                                                                  │
//!                              retransmissions == max (max > 0) ───┘
//!                                            │
//!                                            ▼
//!                                    on_expired(endpoint)
//! ```
//!
//! The first transmission is the caller's job; only resends happen here.
//! Every resend hands the channel a fresh lease, never the stored copy.
//! An optional [`RefreshHook`] patches that lease first, so fields that go
//! stale while the segment waits (the piggybacked ack) are current on the
//! wire.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::buffer::PooledBuffer;
use crate::channel::Channel;
use crate::timer::{TimerHandle, Timers};

/// Called once, from the timer thread, when the budget is exhausted.
pub type ExpiryHook = Arc<dyn Fn(SocketAddr) + Send + Sync>;

/// Rewrites a resend's copy of the segment just before it is queued.
pub type RefreshHook = Arc<dyn Fn(&mut [u8]) + Send + Sync>;

/// Retry budget and interval for one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitPolicy {
    /// Resends allowed before expiry.  0 means unbounded.
    pub max_retransmissions: u8,
    pub interval: Duration,
}

struct State {
    segment: PooledBuffer,
    retransmissions: u32,
    timer: Option<TimerHandle>,
    disposed: bool,
}

struct Inner {
    state: Mutex<State>,
    channel: Arc<Channel>,
    timers: Timers,
    endpoint: SocketAddr,
    policy: RetransmitPolicy,
    on_expired: ExpiryHook,
    refresh: Option<RefreshHook>,
}

/// Resend loop for one in-flight segment.  Dropping it disposes it.
pub struct Retransmitter {
    inner: Arc<Inner>,
}

impl Retransmitter {
    /// Arm the first resend one `interval` from now.
    pub fn start(
        channel: Arc<Channel>,
        timers: &Timers,
        segment: PooledBuffer,
        endpoint: SocketAddr,
        policy: RetransmitPolicy,
        on_expired: ExpiryHook,
        refresh: Option<RefreshHook>,
    ) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                segment,
                retransmissions: 0,
                timer: None,
                disposed: false,
            }),
            channel,
            timers: timers.clone(),
            endpoint,
            policy,
            on_expired,
            refresh,
        });
        let mut state = inner.state.lock();
        state.timer = Some(arm(&inner));
        drop(state);
        Self { inner }
    }

    /// Stop resending.  Safe to call more than once.
    pub fn dispose(&self) {
        let mut state = self.inner.state.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    /// Resends performed so far.
    pub fn retransmissions(&self) -> u32 {
        self.inner.state.lock().retransmissions
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.inner.endpoint
    }
}

impl Drop for Retransmitter {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Retransmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Retransmitter")
            .field("endpoint", &self.inner.endpoint)
            .field("retransmissions", &state.retransmissions)
            .field("disposed", &state.disposed)
            .finish()
    }
}

fn arm(inner: &Arc<Inner>) -> TimerHandle {
    let fired = Arc::clone(inner);
    inner
        .timers
        .schedule(inner.policy.interval, move || fire(&fired))
}

fn fire(inner: &Arc<Inner>) {
    let mut state = inner.state.lock();
    if state.disposed {
        return;
    }

    let max = u32::from(inner.policy.max_retransmissions);
    if max > 0 && state.retransmissions >= max {
        state.disposed = true;
        state.timer = None;
        drop(state);
        inner.channel.stats().record_expiration();
        log::debug!(
            "[rtx] segment to {} expired after {max} retransmissions",
            inner.endpoint
        );
        (inner.on_expired)(inner.endpoint);
        return;
    }

    let mut copy = state.segment.clone();
    if let Some(refresh) = &inner.refresh {
        refresh(&mut copy[..]);
    }
    if let Err(e) = inner.channel.send(copy, inner.endpoint) {
        log::debug!("[rtx] resend to {} failed: {e}", inner.endpoint);
    }
    state.retransmissions = state.retransmissions.saturating_add(1);
    inner.channel.stats().record_retransmission();
    log::trace!(
        "[rtx] resend #{} to {}",
        state.retransmissions,
        inner.endpoint
    );
    state.timer = Some(arm(inner));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::channel::ChannelOptions;
    use crate::stats::Stats;
    use crate::timer::TimerQueue;
    use std::net::{Ipv4Addr, UdpSocket};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    struct Rig {
        channel: Arc<Channel>,
        queue: TimerQueue,
        sink: UdpSocket,
    }

    fn rig() -> Rig {
        let channel = Arc::new(Channel::new(
            ChannelOptions::default(),
            BufferPool::new(16),
            Arc::new(Stats::default()),
        ));
        channel.bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
        channel.open().unwrap();
        let sink = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        sink.set_read_timeout(Some(Duration::from_millis(150))).unwrap();
        Rig {
            channel,
            queue: TimerQueue::new().unwrap(),
            sink,
        }
    }

    fn count_datagrams(sink: &UdpSocket) -> usize {
        let mut buf = [0u8; 64];
        let mut n = 0;
        while sink.recv_from(&mut buf).is_ok() {
            n += 1;
        }
        n
    }

    fn segment(rig: &Rig) -> PooledBuffer {
        rig.channel.pool().copy_from(&[0x40, 0x80, 7, 0, b'x'])
    }

    #[test]
    fn budget_gives_exactly_n_resends_then_one_expiry() {
        let rig = rig();
        let (tx, rx) = mpsc::channel();
        let expiries = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&expiries);
        let hook: ExpiryHook = Arc::new(move |addr| {
            e.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(addr);
        });

        let rtx = Retransmitter::start(
            Arc::clone(&rig.channel),
            &rig.queue.handle(),
            segment(&rig),
            rig.sink.local_addr().unwrap(),
            RetransmitPolicy {
                max_retransmissions: 3,
                interval: Duration::from_millis(20),
            },
            hook,
            None,
        );

        let expired = rx.recv_timeout(Duration::from_secs(2)).expect("expiry");
        assert_eq!(expired, rig.sink.local_addr().unwrap());
        thread::sleep(Duration::from_millis(60));

        assert_eq!(count_datagrams(&rig.sink), 3);
        assert_eq!(expiries.load(Ordering::SeqCst), 1);
        assert_eq!(rtx.retransmissions(), 3);
        assert!(rtx.is_disposed());
        let snap = rig.channel.stats().snapshot();
        assert_eq!(snap.retransmissions, 3);
        assert_eq!(snap.expirations, 1);
    }

    #[test]
    fn zero_budget_resends_until_disposed() {
        let rig = rig();
        let hook: ExpiryHook = Arc::new(|_| panic!("unbounded retransmitter expired"));
        let rtx = Retransmitter::start(
            Arc::clone(&rig.channel),
            &rig.queue.handle(),
            segment(&rig),
            rig.sink.local_addr().unwrap(),
            RetransmitPolicy {
                max_retransmissions: 0,
                interval: Duration::from_millis(10),
            },
            hook,
            None,
        );

        thread::sleep(Duration::from_millis(150));
        rtx.dispose();
        let after_dispose = rtx.retransmissions();
        assert!(after_dispose >= 5, "only {after_dispose} resends");

        thread::sleep(Duration::from_millis(50));
        assert_eq!(rtx.retransmissions(), after_dispose);
        assert_eq!(rig.channel.stats().snapshot().expirations, 0);
    }

    #[test]
    fn dispose_before_first_fire_sends_nothing() {
        let rig = rig();
        let rtx = Retransmitter::start(
            Arc::clone(&rig.channel),
            &rig.queue.handle(),
            segment(&rig),
            rig.sink.local_addr().unwrap(),
            RetransmitPolicy {
                max_retransmissions: 2,
                interval: Duration::from_millis(30),
            },
            Arc::new(|_| {}),
            None,
        );
        rtx.dispose();
        rtx.dispose();
        assert_eq!(count_datagrams(&rig.sink), 0);
        assert_eq!(rig.queue.pending(), 0);
    }

    #[test]
    fn resends_carry_the_stored_segment() {
        let rig = rig();
        let rtx = Retransmitter::start(
            Arc::clone(&rig.channel),
            &rig.queue.handle(),
            segment(&rig),
            rig.sink.local_addr().unwrap(),
            RetransmitPolicy {
                max_retransmissions: 1,
                interval: Duration::from_millis(10),
            },
            Arc::new(|_| {}),
            None,
        );

        let mut buf = [0u8; 64];
        let (n, _) = rig.sink.recv_from(&mut buf).expect("resend");
        assert_eq!(&buf[2..n], &[0x40, 0x80, 7, 0, b'x']);
        drop(rtx);
    }

    #[test]
    fn refresh_patches_every_resend() {
        let rig = rig();
        let acks = Arc::new(AtomicUsize::new(40));
        let source = Arc::clone(&acks);
        let refresh: RefreshHook = Arc::new(move |seg: &mut [u8]| {
            seg[3] = source.fetch_add(1, Ordering::SeqCst) as u8;
        });
        let rtx = Retransmitter::start(
            Arc::clone(&rig.channel),
            &rig.queue.handle(),
            segment(&rig),
            rig.sink.local_addr().unwrap(),
            RetransmitPolicy {
                max_retransmissions: 2,
                interval: Duration::from_millis(10),
            },
            Arc::new(|_| {}),
            Some(refresh),
        );

        let mut buf = [0u8; 64];
        let (n, _) = rig.sink.recv_from(&mut buf).expect("first resend");
        assert_eq!(&buf[2..n], &[0x40, 0x80, 7, 40, b'x']);
        let (n, _) = rig.sink.recv_from(&mut buf).expect("second resend");
        assert_eq!(&buf[2..n], &[0x40, 0x80, 7, 41, b'x']);
        drop(rtx);
    }
}
