//! Per-connection state machine.
//!
//! A [`ConnectionHandler`] owns one remote endpoint's three delivery
//! disciplines, its inbound queue and its connection timers.  It is driven
//! from three directions:
//!
//! - the application thread (`connect`, `send`, `consume`, `reset`);
//! - the dispatch thread, through a [`PacketListener`] subscription filtered
//!   to the remote endpoint;
//! - the timer thread (cumulative-ack flush, keep-alive, retransmit expiry).
//!
//! ```text
//!  client: Idle ──connect──▶ Connecting ──SYN|ACK ok──▶ Established
//!                               │  bad reply: RST ──▶ Closed(Refused)
//!  server: Idle ──accept_syn──▶ Listening ──▶ Established ──reply──▶
//!
//!  Established ──RST in──▶ Closed(RemoteReset)
//!              ──budget──▶ RST out, Closed(Expired)
//!              ──reset───▶ RST out, Closed(Local)
//! ```
//!
//! Closing is idempotent and tears down everything: subscription, timers,
//! retransmitters, window state.  Data already queued for the application
//! stays readable until drained.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::buffer::PooledBuffer;
use crate::channel::{Channel, MAX_PAYLOAD};
use crate::connection::{ConnError, Connection};
use crate::consumer::{PacketConsumer, PacketEvent, PacketKind, PacketListener};
use crate::handler::{Delivery, HandlerObserver, Link};
use crate::ordered::OrderedHandler;
use crate::packet::{controls, Header, Syn};
use crate::parameters::{ConnectionParameters, PROTOCOL_VERSION};
use crate::reliable::ReliableHandler;
use crate::ring::{Consumed, Overflow, RingBuffer};
use crate::state::{CloseReason, ConnectionState};
use crate::timer::{TimerHandle, Timers};
use crate::unreliable::UnreliableHandler;

/// Live connections of one connector, by remote endpoint.
pub(crate) type Registry = Mutex<HashMap<SocketAddr, Arc<ConnectionHandler>>>;

/// Everything a handler borrows from its connector.
#[derive(Clone)]
pub(crate) struct HandlerContext {
    pub channel: Arc<Channel>,
    pub consumer: Arc<PacketConsumer>,
    pub timers: Timers,
    pub registry: Weak<Registry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    role: Option<Role>,
    connection: Option<Connection>,
    /// Sequence number of our SYN (client).
    syn_seq: Option<u8>,
    /// Encoded SYN reply, repeated on duplicate requests (server).
    syn_reply: Option<PooledBuffer>,
    subscription: Option<u64>,
    ack_timer: Option<TimerHandle>,
    nul_timer: Option<TimerHandle>,
}

pub struct ConnectionHandler {
    me: Weak<ConnectionHandler>,
    link: Arc<Link>,
    consumer: Arc<PacketConsumer>,
    registry: Weak<Registry>,
    params: ConnectionParameters,
    inner: Mutex<Inner>,
    changed: Condvar,
    unreliable: UnreliableHandler,
    reliable: ReliableHandler,
    ordered: Mutex<Option<Arc<OrderedHandler>>>,
    inbox: RingBuffer<Vec<u8>>,
}

impl ConnectionHandler {
    /// `params` are this side's parameters: as configured for a client,
    /// already negotiated for a server.
    pub(crate) fn new(ctx: HandlerContext, remote: SocketAddr, params: ConnectionParameters) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<ConnectionHandler>| {
            let observer: Weak<dyn HandlerObserver> = me.clone();
            let link = Link::new(ctx.channel, ctx.timers, remote, observer);
            Self {
                me: me.clone(),
                unreliable: UnreliableHandler::new(Arc::clone(&link)),
                reliable: ReliableHandler::new(Arc::clone(&link), &params),
                link,
                consumer: ctx.consumer,
                registry: ctx.registry,
                params,
                inner: Mutex::new(Inner::default()),
                changed: Condvar::new(),
                ordered: Mutex::new(None),
                inbox: RingBuffer::new(usize::MAX, Overflow::RejectNewest),
            }
        })
    }

    pub fn remote(&self) -> SocketAddr {
        self.link.remote()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// The negotiated connection, once established.
    pub fn connection(&self) -> Option<Connection> {
        self.inner.lock().connection.clone()
    }

    /// Largest payload one send may carry.
    pub fn max_payload(&self) -> usize {
        self.inner
            .lock()
            .connection
            .as_ref()
            .map_or(MAX_PAYLOAD, Connection::max_payload)
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    /// Send a SYN and wait for a valid reply.  Returns `Ok(false)` when
    /// `timeout` elapses first; the attempt is then reset.
    pub fn connect(&self, timeout: Option<Duration>) -> Result<bool, ConnError> {
        {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Idle {
                return Err(ConnError::BadState(inner.state));
            }
            inner.state = ConnectionState::Connecting;
            inner.role = Some(Role::Client);
            inner.syn_seq = Some(self.reliable.isn());
        }
        self.subscribe();
        log::info!("[conn] connecting to {}", self.remote());
        if let Err(e) = self.reliable.send_syn(&self.params) {
            self.close(CloseReason::Local);
            return Err(e);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        while inner.state == ConnectionState::Connecting {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut inner, deadline).timed_out() {
                        break;
                    }
                }
                None => self.changed.wait(&mut inner),
            }
        }
        match inner.state {
            ConnectionState::Established => Ok(true),
            ConnectionState::Closed(reason) => Err(reason.into()),
            _ => {
                drop(inner);
                log::info!("[conn] connect to {} timed out", self.remote());
                self.reset();
                Ok(false)
            }
        }
    }

    /// Server side: establish from a validated client SYN and reply.
    pub(crate) fn accept_syn(&self, syn: &Syn) -> Result<(), ConnError> {
        {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Idle {
                return Err(ConnError::BadState(inner.state));
            }
            inner.state = ConnectionState::Listening;
            inner.role = Some(Role::Server);
        }
        self.subscribe();
        self.establish(syn.clone());

        match self.reliable.send_syn_reply(syn.header.seq, &self.params) {
            Ok(reply) => {
                self.inner.lock().syn_reply = Some(reply);
                Ok(())
            }
            Err(e) => {
                self.close(CloseReason::Local);
                Err(e)
            }
        }
    }

    fn subscribe(&self) {
        let me = self.me.clone();
        let listener: Arc<dyn PacketListener> = Arc::new(move |event: &PacketEvent| {
            if let Some(handler) = me.upgrade() {
                handler.on_packet(event);
            }
        });
        let id = self.consumer.subscribe(Some(self.remote()), listener);
        self.inner.lock().subscription = Some(id);
    }

    fn on_syn(&self, header: &Header, syn: &Syn) {
        let inner = self.inner.lock();
        let (state, role) = (inner.state, inner.role);
        match (state, role) {
            (ConnectionState::Connecting, Some(Role::Client)) => {
                let expected = inner.syn_seq;
                drop(inner);
                match self.check_reply(header, syn, expected) {
                    Ok(()) => self.establish(syn.clone()),
                    Err(why) => {
                        log::warn!("[conn] refusing SYN reply from {}: {why}", self.remote());
                        if let Err(e) = self.unreliable.send_rst() {
                            log::debug!("[conn] RST to {} not sent: {e}", self.remote());
                        }
                        self.close(CloseReason::Refused);
                    }
                }
            }
            (ConnectionState::Established, Some(Role::Server)) if header.controls == controls::SYN => {
                let repeat = inner
                    .connection
                    .as_ref()
                    .filter(|conn| conn.peer_syn().header.seq == header.seq)
                    .and(inner.syn_reply.clone());
                drop(inner);
                if let Some(reply) = repeat {
                    log::debug!("[conn] repeating SYN reply to {}", self.remote());
                    if let Err(e) = self.link.send(reply) {
                        log::debug!("[conn] SYN reply to {} not sent: {e}", self.remote());
                    }
                }
            }
            _ => {}
        }
    }

    fn check_reply(&self, header: &Header, syn: &Syn, expected: Option<u8>) -> Result<(), &'static str> {
        if header.controls != controls::SYN | controls::ACK {
            return Err("not a SYN reply");
        }
        if Some(header.ack) != expected {
            return Err("acknowledges the wrong sequence number");
        }
        if syn.params.version != PROTOCOL_VERSION {
            return Err("unsupported protocol version");
        }
        if syn.params.validate().is_err() {
            return Err("invalid parameters");
        }
        if !self.params.negotiable_eq(&syn.params) {
            return Err("negotiated parameters differ from the request");
        }
        Ok(())
    }

    fn establish(&self, peer: Syn) {
        let connection = Connection::new(self.remote(), self.params.clone(), peer);
        self.reliable.merge(&connection);
        *self.ordered.lock() = Some(Arc::new(OrderedHandler::new(Arc::clone(&self.link), &connection)));

        let role = {
            let mut inner = self.inner.lock();
            if inner.state.is_closed() {
                return;
            }
            inner.state = ConnectionState::Established;
            inner.connection = Some(connection.clone());
            inner.role
        };
        self.changed.notify_all();

        let ack_period = connection.cumulative_ack_timeout();
        self.arm_ack_timer(ack_period, ack_period);
        if let Some(period) = connection.null_packet_timeout() {
            self.arm_nul_timer(period, period);
        }
        if role == Some(Role::Client) {
            self.link.stats().record_connection_opened();
        }
        log::info!(
            "[conn] established with {} (window {}/{}, max payload {})",
            self.remote(),
            connection.send_window(),
            connection.recv_window(),
            connection.max_payload()
        );
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    fn arm_ack_timer(&self, delay: Duration, period: Duration) {
        let me = self.me.clone();
        let handle = self.link.timers().schedule(delay, move || {
            if let Some(handler) = me.upgrade() {
                handler.on_ack_timer(period);
            }
        });
        let mut inner = self.inner.lock();
        if inner.state.is_closed() {
            handle.cancel();
        } else {
            inner.ack_timer = Some(handle);
        }
    }

    /// Flush acks that have waited a whole period.  Acks piggybacked on
    /// outbound data restart the wait.
    fn on_ack_timer(&self, period: Duration) {
        if self.state() != ConnectionState::Established {
            return;
        }
        let mut next = flush_when_due(self.reliable.ack_idle_for(), period, || {
            self.reliable.flush_acks()
        });
        if let Some(ordered) = self.ordered() {
            next = next.min(flush_when_due(ordered.ack_idle_for(), period, || ordered.flush_acks()));
        }
        self.arm_ack_timer(next, period);
    }

    fn arm_nul_timer(&self, delay: Duration, period: Duration) {
        let me = self.me.clone();
        let handle = self.link.timers().schedule(delay, move || {
            if let Some(handler) = me.upgrade() {
                handler.on_nul_timer(period);
            }
        });
        let mut inner = self.inner.lock();
        if inner.state.is_closed() {
            handle.cancel();
        } else {
            inner.nul_timer = Some(handle);
        }
    }

    /// Send a keep-alive only when nothing went out for a whole period.
    fn on_nul_timer(&self, period: Duration) {
        if self.state() != ConnectionState::Established {
            return;
        }
        let idle = self.link.idle_for();
        if idle < period {
            self.arm_nul_timer(period - idle, period);
            return;
        }
        match self.reliable.send_nul() {
            Ok(seq) => log::trace!("[conn] → NUL {seq} to {}", self.remote()),
            Err(e) => log::debug!("[conn] NUL to {} not sent: {e}", self.remote()),
        }
        self.arm_nul_timer(period, period);
    }

    // -----------------------------------------------------------------------
    // Data path
    // -----------------------------------------------------------------------

    fn ordered(&self) -> Option<Arc<OrderedHandler>> {
        self.ordered.lock().clone()
    }

    fn on_packet(&self, event: &PacketEvent) {
        if let PacketKind::Syn(syn) = &event.kind {
            self.on_syn(&event.header, syn);
            return;
        }
        match self.state() {
            ConnectionState::Established => {}
            ConnectionState::Connecting if matches!(event.kind, PacketKind::Ack | PacketKind::Rst) => {}
            _ => return,
        }
        self.unreliable.handle(event);
        self.reliable.handle(event);
        if let Some(ordered) = self.ordered() {
            ordered.handle(event);
        }
    }

    pub fn send(&self, data: &[u8], delivery: Delivery) -> Result<(), ConnError> {
        match self.state() {
            ConnectionState::Established => {}
            ConnectionState::Closed(reason) => return Err(reason.into()),
            other => return Err(ConnError::BadState(other)),
        }
        match delivery {
            Delivery::Unreliable => self.unreliable.send(data),
            Delivery::Reliable => self.reliable.send(data).map(drop),
            Delivery::Ordered => match self.ordered() {
                Some(ordered) => ordered.send(data).map(drop),
                None => Err(ConnError::Closed),
            },
        }
    }

    /// Block until data arrives.  Once closed and drained, reports why.
    pub fn consume(&self) -> Result<Vec<u8>, ConnError> {
        self.inbox.consume().ok_or_else(|| self.close_error())
    }

    pub fn try_consume(&self, timeout: Duration) -> Result<Option<Vec<u8>>, ConnError> {
        match self.inbox.try_consume(timeout) {
            Consumed::Item(data) => Ok(Some(data)),
            Consumed::TimedOut => Ok(None),
            Consumed::Closed => Err(self.close_error()),
        }
    }

    fn close_error(&self) -> ConnError {
        match self.state() {
            ConnectionState::Closed(reason) => reason.into(),
            _ => ConnError::Closed,
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Send RST and close.  No-op once closed.
    pub fn reset(&self) {
        if self.state().is_closed() {
            return;
        }
        if let Err(e) = self.unreliable.send_rst() {
            log::debug!("[conn] RST to {} not sent: {e}", self.remote());
        }
        self.close(CloseReason::Local);
    }

    /// Returns `false` if already closed.
    fn close(&self, reason: CloseReason) -> bool {
        let (subscription, timers) = {
            let mut inner = self.inner.lock();
            if inner.state.is_closed() {
                return false;
            }
            inner.state = ConnectionState::Closed(reason);
            inner.syn_reply = None;
            (
                inner.subscription.take(),
                [inner.ack_timer.take(), inner.nul_timer.take()],
            )
        };
        self.changed.notify_all();

        if let Some(id) = subscription {
            self.consumer.unsubscribe(id);
        }
        for timer in timers.into_iter().flatten() {
            timer.cancel();
        }
        self.reliable.dispose();
        let ordered = self.ordered.lock().take();
        if let Some(ordered) = ordered {
            ordered.dispose();
        }
        self.inbox.close();
        self.deregister();
        log::info!("[conn] {} closed: {reason}", self.remote());
        true
    }

    fn deregister(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let removed = {
            let mut map = registry.lock();
            let ours = map
                .get(&self.remote())
                .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), self));
            if ours {
                map.remove(&self.remote())
            } else {
                None
            }
        };
        drop(removed);
    }
}

impl HandlerObserver for ConnectionHandler {
    fn on_data(&self, data: Vec<u8>) {
        if self.inbox.produce(data).is_some() {
            log::debug!("[conn] data from {} after close, dropped", self.remote());
        }
    }

    fn on_reset(&self, from: SocketAddr) {
        let reason = match self.state() {
            ConnectionState::Connecting => CloseReason::Refused,
            _ => CloseReason::RemoteReset,
        };
        log::info!("[conn] reset by {from}");
        self.close(reason);
    }

    fn on_expired(&self, to: SocketAddr) {
        log::warn!("[conn] retransmissions to {to} exhausted, resetting");
        if let Err(e) = self.unreliable.send_rst() {
            log::debug!("[conn] RST to {to} not sent: {e}");
        }
        self.close(CloseReason::Expired);
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.close(CloseReason::Local);
    }
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("remote", &self.remote())
            .field("state", &self.state())
            .finish()
    }
}

/// Run `flush` once the last ack is a whole `period` old.  Returns how long
/// until the next check.
fn flush_when_due(idle: Duration, period: Duration, flush: impl FnOnce()) -> Duration {
    if idle >= period {
        flush();
        period
    } else {
        period - idle
    }
}
