//! Checksum-framed datagram I/O on dedicated threads.
//!
//! [`Channel`] owns the UDP socket and two threads:
//!
//! ```text
//!   send(buf, to) ──▶ [outbound ring] ──▶ send thread ──seal──▶ socket
//!                                                                 │
//!   consume() ◀──── [inbound ring] ◀── recv thread ◀──verify─────┘
//! ```
//!
//! Every datagram on the wire is a 2-byte checksum followed by the segment.
//! Datagrams that are too short or fail the checksum are dropped silently;
//! a lossy path is expected to produce them.  Transient socket errors are
//! swallowed and the loops carry on.  Protocol semantics live elsewhere.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::buffer::{BufferPool, PooledBuffer};
use crate::checksum::{self, CHECKSUM_LEN};
use crate::connection::ConnError;
use crate::packet::HEADER_LEN;
use crate::ring::{Consumed, Overflow, RingBuffer};
use crate::simulator::{Fate, Simulator, SimulatorConfig};
use crate::stats::Stats;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

/// Largest application payload one segment can carry.
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - CHECKSUM_LEN - HEADER_LEN;

/// Smallest datagram worth decoding: checksum prefix plus header.
const MIN_DATAGRAM: usize = CHECKSUM_LEN + HEADER_LEN;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Transport tuning for a [`Channel`].
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Capacity of each of the send and receive queues.
    pub queue_size: usize,
    /// How long the I/O threads block before re-checking the open flag.
    pub poll_interval: Duration,
    /// For IPv6 binds: refuse IPv4-mapped traffic.
    pub ipv6_only: bool,
    /// Fault injection on the send path.
    pub simulator: Option<SimulatorConfig>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            queue_size: 512,
            poll_interval: Duration::from_millis(50),
            ipv6_only: false,
            simulator: None,
        }
    }
}

/// An inbound datagram with its checksum prefix removed.
#[derive(Debug)]
pub struct Datagram {
    pub from: SocketAddr,
    pub payload: PooledBuffer,
}

struct Outbound {
    payload: PooledBuffer,
    to: SocketAddr,
}

/// Rewrite `addr` into the family of a socket bound to `local`.
///
/// A dual-stack IPv6 socket sees IPv4 peers as `::ffff:a.b.c.d`; an IPv4
/// socket cannot reach a mapped address directly.
pub fn normalize(addr: SocketAddr, local: SocketAddr) -> SocketAddr {
    match (local, addr) {
        (SocketAddr::V6(_), SocketAddr::V4(v4)) => {
            SocketAddr::new(v4.ip().to_ipv6_mapped().into(), v4.port())
        }
        (SocketAddr::V4(_), SocketAddr::V6(v6)) => match v6.ip().to_ipv4_mapped() {
            Some(ip) => SocketAddr::new(ip.into(), v6.port()),
            None => addr,
        },
        _ => addr,
    }
}

/// Returns true if the error is likely transient (the loop may continue).
fn is_transient_io_error(e: &io::Error) -> bool {
    use io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
    )
}

fn bind_socket(addr: SocketAddr, options: &ChannelOptions) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(options.ipv6_only)?;
    }
    socket.bind(&SockAddr::from(addr))?;
    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(options.poll_interval.max(Duration::from_millis(1))))?;
    Ok(socket)
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

struct Shared {
    open: AtomicBool,
    outbound: RingBuffer<Outbound>,
    inbound: RingBuffer<Datagram>,
    pool: Arc<BufferPool>,
    stats: Arc<Stats>,
    options: ChannelOptions,
}

#[derive(Default)]
struct Io {
    socket: Option<Arc<UdpSocket>>,
    local_addr: Option<SocketAddr>,
    threads: Option<(JoinHandle<()>, JoinHandle<()>)>,
}

/// A bound UDP socket with a receive thread and a send thread.
pub struct Channel {
    shared: Arc<Shared>,
    io: Mutex<Io>,
}

impl Channel {
    pub fn new(options: ChannelOptions, pool: Arc<BufferPool>, stats: Arc<Stats>) -> Self {
        let queue_size = options.queue_size;
        Self {
            shared: Arc::new(Shared {
                open: AtomicBool::new(false),
                outbound: RingBuffer::new(queue_size, Overflow::RejectNewest),
                inbound: RingBuffer::new(queue_size, Overflow::RejectNewest),
                pool,
                stats,
                options,
            }),
            io: Mutex::new(Io::default()),
        }
    }

    /// Bind the socket.  Returns the resolved local address.
    pub fn bind(&self, addr: SocketAddr) -> Result<SocketAddr, ConnError> {
        let mut io = self.io.lock();
        if let Some(bound) = io.local_addr {
            return Err(ConnError::AlreadyBound(bound));
        }
        let socket = bind_socket(addr, &self.shared.options)?;
        let local = socket.local_addr()?;
        io.socket = Some(Arc::new(socket));
        io.local_addr = Some(local);
        log::debug!("[channel] bound {local}");
        Ok(local)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.io.lock().local_addr
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Start the I/O threads.  No-op when already open.
    pub fn open(&self) -> Result<(), ConnError> {
        let mut io = self.io.lock();
        let (socket, local) = match (&io.socket, io.local_addr) {
            (Some(socket), Some(local)) => (Arc::clone(socket), local),
            _ => return Err(ConnError::NotBound),
        };
        if io.threads.is_some() {
            return Ok(());
        }

        self.shared.outbound.reopen();
        self.shared.open.store(true, Ordering::Release);

        let recv = {
            let shared = Arc::clone(&self.shared);
            let socket = Arc::clone(&socket);
            thread::Builder::new()
                .name("rudp-recv".into())
                .spawn(move || recv_loop(&shared, &socket))?
        };
        let send = {
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name("rudp-send".into())
                .spawn(move || send_loop(&shared, &socket, local))
        };
        let send = match send {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.open.store(false, Ordering::Release);
                let _ = recv.join();
                return Err(e.into());
            }
        };
        io.threads = Some((recv, send));
        log::debug!("[channel] opened {local}");
        Ok(())
    }

    /// Stop both threads and wait for them.  Queued sends are flushed first.
    /// No-op when already closed.
    pub fn close(&self) -> Result<(), ConnError> {
        let mut io = self.io.lock();
        if io.socket.is_none() {
            return Err(ConnError::NotBound);
        }
        let Some((recv, send)) = io.threads.take() else {
            return Ok(());
        };
        self.shared.open.store(false, Ordering::Release);
        self.shared.outbound.close();
        if recv.join().is_err() {
            log::warn!("[channel] receive thread panicked");
        }
        if send.join().is_err() {
            log::warn!("[channel] send thread panicked");
        }
        log::debug!("[channel] closed {:?}", io.local_addr);
        Ok(())
    }

    /// Queue `payload` for transmission to `to`.  Never blocks.
    pub fn send(&self, payload: PooledBuffer, to: SocketAddr) -> Result<(), ConnError> {
        if !self.is_open() {
            return Err(ConnError::ChannelClosed);
        }
        if self.shared.outbound.produce(Outbound { payload, to }).is_some() {
            self.shared.stats.record_dropped();
            log::warn!("[channel] send queue full, dropping datagram to {to}");
        }
        Ok(())
    }

    /// Block until a datagram arrives.
    pub fn consume(&self) -> Option<Datagram> {
        self.shared.inbound.consume()
    }

    /// Wait at most `timeout` for a datagram.
    pub fn try_consume(&self, timeout: Duration) -> Option<Datagram> {
        self.shared.inbound.try_consume(timeout).item()
    }

    /// Rewrite `addr` into this channel's address family.
    pub fn normalize(&self, addr: SocketAddr) -> SocketAddr {
        match self.local_addr() {
            Some(local) => normalize(addr, local),
            None => addr,
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.shared.pool
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.shared.stats
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let _ = self.close();
        self.shared.inbound.close();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("local_addr", &self.local_addr())
            .field("open", &self.is_open())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// I/O loops
// ---------------------------------------------------------------------------

fn recv_loop(shared: &Shared, socket: &UdpSocket) {
    let mut buf = vec![0u8; MAX_DATAGRAM + 1];
    while shared.open.load(Ordering::Acquire) {
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if is_transient_io_error(&e) => continue,
            Err(e) => {
                log::warn!("[channel] receive error: {e}");
                thread::sleep(shared.options.poll_interval);
                continue;
            }
        };

        let frame = &buf[..n];
        if n < MIN_DATAGRAM {
            log::debug!("[channel] ← {n}-byte runt from {from}, dropped");
            continue;
        }
        if !checksum::verify(frame) {
            shared.stats.record_checksum_failure();
            log::debug!("[channel] ← checksum mismatch from {from}, dropped");
            continue;
        }

        shared.stats.record_received(n);
        let payload = shared.pool.copy_from(&frame[CHECKSUM_LEN..]);
        log::trace!("[channel] ← {n} bytes from {from}");
        if shared.inbound.produce(Datagram { from, payload }).is_some() {
            shared.stats.record_dropped();
            log::warn!("[channel] receive queue full, dropping datagram from {from}");
        }
    }
}

fn send_loop(shared: &Shared, socket: &UdpSocket, local: SocketAddr) {
    let mut simulator = shared.options.simulator.clone().map(Simulator::new);
    let mut frame = Vec::with_capacity(MAX_DATAGRAM);
    let mut held: Option<Outbound> = None;

    loop {
        let wait = match (&held, &simulator) {
            (Some(_), Some(sim)) => sim.config().reorder_delay,
            _ => shared.options.poll_interval,
        };
        let next = match shared.outbound.try_consume(wait) {
            Consumed::Item(next) => next,
            Consumed::TimedOut => {
                if let Some(late) = held.take() {
                    transmit(shared, socket, local, &mut frame, &late, None);
                }
                continue;
            }
            Consumed::Closed => break,
        };

        match simulator.as_mut().map_or(Fate::Deliver, Simulator::decide) {
            Fate::Deliver => transmit(shared, socket, local, &mut frame, &next, None),
            Fate::Drop => log::trace!("[channel] simulator dropped datagram to {}", next.to),
            Fate::Duplicate => {
                transmit(shared, socket, local, &mut frame, &next, None);
                transmit(shared, socket, local, &mut frame, &next, None);
            }
            Fate::Corrupt(bit) => transmit(shared, socket, local, &mut frame, &next, Some(bit)),
            Fate::Reorder => {
                if let Some(late) = held.replace(next) {
                    transmit(shared, socket, local, &mut frame, &late, None);
                }
                continue;
            }
        }
        if let Some(late) = held.take() {
            transmit(shared, socket, local, &mut frame, &late, None);
        }
    }

    if let Some(late) = held.take() {
        transmit(shared, socket, local, &mut frame, &late, None);
    }
}

fn transmit(
    shared: &Shared,
    socket: &UdpSocket,
    local: SocketAddr,
    frame: &mut Vec<u8>,
    out: &Outbound,
    corrupt_bit: Option<usize>,
) {
    frame.clear();
    frame.extend_from_slice(&[0; CHECKSUM_LEN]);
    frame.extend_from_slice(&out.payload);
    checksum::seal(frame);
    if let Some(bit) = corrupt_bit {
        Simulator::corrupt(frame, CHECKSUM_LEN, bit);
    }

    let to = normalize(out.to, local);
    match socket.send_to(frame, to) {
        Ok(n) => {
            shared.stats.record_sent(n);
            log::trace!("[channel] → {n} bytes to {to}");
        }
        Err(e) => log::debug!("[channel] send to {to} failed: {e}"),
    }
}
