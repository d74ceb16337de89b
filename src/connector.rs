//! Public entry point: one bound socket, many connections.
//!
//! A [`Connector`] owns the shared machinery (channel, dispatch thread,
//! timer thread) and a registry of live connections keyed by remote
//! endpoint.  `accept` and `connect` each hand back a [`Peer`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::buffer::BufferPool;
use crate::channel::{Channel, ChannelOptions};
use crate::connection::ConnError;
use crate::connection_handler::{ConnectionHandler, HandlerContext, Registry};
use crate::consumer::{PacketConsumer, PacketEvent, PacketKind};
use crate::handler::Delivery;
use crate::packet::{controls, Packet, Syn};
use crate::parameters::{ConnectionParameters, PROTOCOL_VERSION};
use crate::peer::Peer;
use crate::ring::Consumed;
use crate::stats::{Stats, StatsSnapshot};
use crate::timer::TimerQueue;

/// Idle buffers kept for reuse.
const POOL_IDLE: usize = 256;

/// Longest single wait in `accept`, so a closed channel is noticed.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

pub struct Connector {
    channel: Arc<Channel>,
    consumer: Arc<PacketConsumer>,
    timers: TimerQueue,
    params: ConnectionParameters,
    registry: Arc<Registry>,
    local_addr: SocketAddr,
}

impl Connector {
    /// Bind with default parameters and start listening.
    pub fn bind(addr: SocketAddr) -> Result<Self, ConnError> {
        Self::bind_with(addr, ConnectionParameters::default())
    }

    pub fn bind_with(addr: SocketAddr, params: ConnectionParameters) -> Result<Self, ConnError> {
        Self::bind_with_options(addr, params, ChannelOptions::default())
    }

    pub fn bind_with_options(
        addr: SocketAddr,
        params: ConnectionParameters,
        options: ChannelOptions,
    ) -> Result<Self, ConnError> {
        params.validate()?;
        let channel = Arc::new(Channel::new(
            options,
            BufferPool::new(POOL_IDLE),
            Arc::new(Stats::default()),
        ));
        let local_addr = channel.bind(addr)?;
        let connector = Self {
            consumer: Arc::new(PacketConsumer::new(Arc::clone(&channel))),
            channel,
            timers: TimerQueue::new()?,
            params,
            registry: Arc::new(Mutex::new(HashMap::new())),
            local_addr,
        };
        connector.start()?;
        log::info!("[connector] listening on {local_addr}");
        Ok(connector)
    }

    /// Open the channel and start dispatching.  No-op when active.
    pub fn start(&self) -> Result<(), ConnError> {
        self.channel.open()?;
        self.consumer.start()
    }

    /// Reset every connection, then stop the threads.  The connector can be
    /// started again.
    pub fn close(&self) -> Result<(), ConnError> {
        let live: Vec<Arc<ConnectionHandler>> = self.registry.lock().values().cloned().collect();
        for handler in live {
            handler.reset();
        }
        self.consumer.stop()?;
        if self.channel.is_open() {
            self.channel.close()?;
            log::info!("[connector] {} closed", self.local_addr);
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.channel.is_open() && self.consumer.is_running()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.channel.stats().snapshot()
    }

    /// Live connections.
    pub fn connections(&self) -> usize {
        self.registry.lock().len()
    }

    /// Ordered send to every live connection.  Returns how many accepted it.
    pub fn broadcast(&self, data: &[u8]) -> usize {
        let live: Vec<Arc<ConnectionHandler>> = self.registry.lock().values().cloned().collect();
        live.iter()
            .filter(|handler| match handler.send(data, Delivery::Ordered) {
                Ok(()) => true,
                Err(e) => {
                    log::debug!("[connector] broadcast to {} failed: {e}", handler.remote());
                    false
                }
            })
            .count()
    }

    fn context(&self) -> HandlerContext {
        HandlerContext {
            channel: Arc::clone(&self.channel),
            consumer: Arc::clone(&self.consumer),
            timers: self.timers.handle(),
            registry: Arc::downgrade(&self.registry),
        }
    }

    fn ensure_active(&self) -> Result<(), ConnError> {
        if !self.is_active() {
            log::debug!("[connector] reopening {}", self.local_addr);
            self.start()?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Accept
    // -----------------------------------------------------------------------

    /// Block until a client completes the handshake.
    pub fn accept(&self) -> Result<Peer, ConnError> {
        self.accept_until(None)?.ok_or(ConnError::ChannelClosed)
    }

    /// Like [`accept`](Self::accept), giving up with `Ok(None)` after
    /// `timeout`.
    pub fn try_accept(&self, timeout: Duration) -> Result<Option<Peer>, ConnError> {
        self.accept_until(Some(Instant::now() + timeout))
    }

    fn accept_until(&self, deadline: Option<Instant>) -> Result<Option<Peer>, ConnError> {
        self.ensure_active()?;
        loop {
            if !self.channel.is_open() {
                return Err(ConnError::ChannelClosed);
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    (deadline - now).min(ACCEPT_POLL)
                }
                None => ACCEPT_POLL,
            };
            let registry = &self.registry;
            let fresh = |event: &PacketEvent| {
                event.header.controls == controls::SYN && !registry.lock().contains_key(&event.from)
            };
            match self.consumer.wait_for_syn(wait, fresh) {
                Consumed::Item(event) => {
                    if let Some(peer) = self.admit(event)? {
                        return Ok(Some(peer));
                    }
                }
                Consumed::TimedOut => {}
                Consumed::Closed => return Err(ConnError::ChannelClosed),
            }
        }
    }

    /// Validate a client SYN and start its connection.  Invalid requests
    /// are answered with RST and yield `None`.
    fn admit(&self, event: PacketEvent) -> Result<Option<Peer>, ConnError> {
        let PacketKind::Syn(syn) = event.kind else {
            return Ok(None);
        };
        let from = event.from;
        if syn.params.version != PROTOCOL_VERSION {
            log::warn!("[connector] SYN from {from} has version {}, refusing", syn.params.version);
            self.refuse(from, &syn);
            return Ok(None);
        }
        if let Err(e) = syn.params.validate() {
            log::warn!("[connector] SYN from {from} refused: {e}");
            self.refuse(from, &syn);
            return Ok(None);
        }

        let handler = ConnectionHandler::new(self.context(), from, self.params.negotiate(&syn.params));
        {
            let mut registry = self.registry.lock();
            if registry.contains_key(&from) {
                return Ok(None);
            }
            registry.insert(from, Arc::clone(&handler));
        }
        handler.accept_syn(&syn)?;
        let repeats = self.consumer.discard_syns_from(from);
        if repeats > 0 {
            log::debug!("[connector] dropped {repeats} repeated SYN(s) from {from}");
        }
        self.channel.stats().record_connection_accepted();
        log::info!("[connector] accepted {from}");
        Ok(Some(Peer::new(handler)))
    }

    fn refuse(&self, to: SocketAddr, syn: &Syn) {
        let rst = Packet::rst(0, syn.header.seq).encode_pooled(self.channel.pool());
        match self.channel.send(rst, to) {
            Ok(()) => self.channel.stats().record_reset_sent(),
            Err(e) => log::debug!("[connector] RST to {to} not sent: {e}"),
        }
    }

    // -----------------------------------------------------------------------
    // Connect
    // -----------------------------------------------------------------------

    /// Handshake with `remote`, using this connector's parameters unless
    /// `params` is given.  Fails once the SYN exhausts its retransmissions.
    pub fn connect(
        &self,
        remote: SocketAddr,
        params: Option<ConnectionParameters>,
    ) -> Result<Peer, ConnError> {
        self.connect_within(remote, params, None)?
            .ok_or(ConnError::Closed)
    }

    /// Like [`connect`](Self::connect), giving up with `Ok(None)` after
    /// `timeout`.
    pub fn try_connect(
        &self,
        remote: SocketAddr,
        params: Option<ConnectionParameters>,
        timeout: Duration,
    ) -> Result<Option<Peer>, ConnError> {
        self.connect_within(remote, params, Some(timeout))
    }

    fn connect_within(
        &self,
        remote: SocketAddr,
        params: Option<ConnectionParameters>,
        timeout: Option<Duration>,
    ) -> Result<Option<Peer>, ConnError> {
        let params = match params {
            Some(params) => {
                params.validate()?;
                params
            }
            None => self.params.clone(),
        };
        self.ensure_active()?;

        let remote = self.channel.normalize(remote);
        let handler = ConnectionHandler::new(self.context(), remote, params);
        {
            let mut registry = self.registry.lock();
            if registry.contains_key(&remote) {
                return Err(ConnError::AlreadyConnected(remote));
            }
            registry.insert(remote, Arc::clone(&handler));
        }
        if handler.connect(timeout)? {
            Ok(Some(Peer::new(handler)))
        } else {
            Ok(None)
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::debug!("[connector] close on drop: {e}");
        }
        self.consumer.dispose();
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("local_addr", &self.local_addr)
            .field("active", &self.is_active())
            .field("connections", &self.connections())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, UdpSocket};

    fn loopback() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    #[test]
    fn invalid_parameters_are_rejected_before_binding() {
        let params = ConnectionParameters {
            retransmission_timeout: 10,
            ..Default::default()
        };
        assert!(matches!(
            Connector::bind_with(loopback(), params),
            Err(ConnError::InvalidParameters(_))
        ));
    }

    #[test]
    fn close_and_reopen() {
        let connector = Connector::bind(loopback()).unwrap();
        assert!(connector.is_active());
        connector.close().unwrap();
        assert!(!connector.is_active());
        connector.close().unwrap();

        assert!(connector.try_accept(Duration::from_millis(50)).unwrap().is_none());
        assert!(connector.is_active());
    }

    #[test]
    fn bad_version_gets_rst_and_accept_keeps_listening() {
        let connector = Connector::bind(loopback()).unwrap();
        let raw = UdpSocket::bind(loopback()).unwrap();
        raw.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let params = ConnectionParameters {
            version: 9,
            ..Default::default()
        };
        let mut frame = vec![0, 0];
        frame.extend(Packet::Syn(Syn::request(5, params)).encode());
        crate::checksum::seal(&mut frame);
        raw.send_to(&frame, connector.local_addr()).unwrap();

        assert!(connector.try_accept(Duration::from_millis(300)).unwrap().is_none());
        let mut buf = [0u8; 64];
        let (n, _) = raw.recv_from(&mut buf).expect("RST");
        let header = crate::packet::Header::decode(&buf[2..n]).unwrap();
        assert!(header.has(controls::RST));
        assert_eq!(header.ack, 5);
        assert_eq!(connector.connections(), 0);
        assert_eq!(connector.stats().resets_sent, 1);
    }

    #[test]
    fn second_connect_to_the_same_endpoint_is_refused() {
        let server = Connector::bind(loopback()).unwrap();
        let client = Connector::bind(loopback()).unwrap();
        let addr = server.local_addr();

        let accepting = std::thread::spawn(move || {
            let peer = server.accept().unwrap();
            (server, peer)
        });
        let _peer = client.connect(addr, None).unwrap();
        assert!(matches!(
            client.connect(addr, None),
            Err(ConnError::AlreadyConnected(a)) if a == addr
        ));
        let (_server, _accepted) = accepting.join().unwrap();
        assert_eq!(client.connections(), 1);
    }

    #[test]
    fn broadcast_reaches_every_peer() {
        let server = Connector::bind(loopback()).unwrap();
        let addr = server.local_addr();
        let clients: Vec<Connector> = (0..3).map(|_| Connector::bind(loopback()).unwrap()).collect();

        let handles: Vec<_> = clients
            .into_iter()
            .map(|client| {
                std::thread::spawn(move || {
                    let peer = client.connect(addr, None).unwrap();
                    let got = peer.try_consume(Duration::from_secs(3)).unwrap();
                    drop(peer);
                    drop(client);
                    got
                })
            })
            .collect();

        let peers: Vec<Peer> = (0..3).map(|_| server.accept().unwrap()).collect();
        assert_eq!(server.connections(), 3);
        assert_eq!(server.broadcast(b"hello all"), 3);
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Some(b"hello all".to_vec()));
        }
        assert_eq!(server.stats().connections_accepted, 3);
        drop(peers);
    }

    #[test]
    fn repeated_syn_yields_one_peer() {
        let connector = Connector::bind(loopback()).unwrap();
        let raw = UdpSocket::bind(loopback()).unwrap();
        let mut frame = vec![0, 0];
        frame.extend(Packet::Syn(Syn::request(17, ConnectionParameters::default())).encode());
        crate::checksum::seal(&mut frame);
        raw.send_to(&frame, connector.local_addr()).unwrap();
        raw.send_to(&frame, connector.local_addr()).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let peer = connector.try_accept(Duration::from_secs(1)).unwrap().expect("peer");
        assert_eq!(peer.remote_addr(), raw.local_addr().unwrap());
        drop(peer);
        assert_eq!(connector.connections(), 0);

        assert!(connector.try_accept(Duration::from_millis(300)).unwrap().is_none());
        assert_eq!(connector.stats().connections_accepted, 1);
    }
}
