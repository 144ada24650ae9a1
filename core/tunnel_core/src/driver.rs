//! mio event loop around the engine
//!
//! The engine is sans-IO; the driver owns the UDP socket, the virtual
//! interface and the signaling channel and shuttles bytes between them:
//!
//! ```text
//! loop {
//!     poll(min(engine timeout, max wait))
//!     socket    -> engine.handle_network
//!     signaling -> engine.handle_signaling
//!     device    -> engine.route_outbound
//!     timers    -> engine.handle_timeout
//!     engine.poll_transmit -> socket
//!     engine.poll_inbound  -> device
//!     engine.poll_event    -> signaling / caller
//! }
//! ```

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Registry, Token};

use crate::device::VirtualInterface;
use crate::engine::{ControlPlane, Engine, EngineEvent};
use crate::p2p::signaling::{decode_messages, encode_message, Envelope};
use crate::PeerId;

// ============================================================================
// Constants
// ============================================================================

const SOCKET_TOKEN: Token = Token(0);
const SIGNALING_TOKEN: Token = Token(1);

const MAX_DATAGRAM_SIZE: usize = 65535;

/// Longest a poll may block, so the device gets serviced
const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(100);

/// Minimum spacing of signaling reconnect attempts
const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Signaling Channel
// ============================================================================

/// Reliable, ordered transport for signaling envelopes
///
/// Outbound envelopes name the destination peer, inbound ones the sender.
pub trait SignalingChannel {
    fn register(&mut self, _registry: &Registry, _token: Token) -> io::Result<()> {
        Ok(())
    }

    fn send(&mut self, envelope: &Envelope) -> io::Result<()>;

    /// Next inbound envelope, `Ok(None)` when none is pending
    fn recv(&mut self) -> io::Result<Option<Envelope>>;

    /// True once after the channel re-established its connection
    fn take_reconnected(&mut self) -> bool {
        false
    }
}

/// In-process signaling between two engines
pub struct ChannelSignaling {
    local: PeerId,
    tx: Sender<Envelope>,
    rx: Receiver<Envelope>,
}

impl ChannelSignaling {
    /// Connected endpoints for peers `a` and `b`
    pub fn pair(a: PeerId, b: PeerId) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        (
            Self {
                local: a,
                tx: a_tx,
                rx: a_rx,
            },
            Self {
                local: b,
                tx: b_tx,
                rx: b_rx,
            },
        )
    }
}

impl SignalingChannel for ChannelSignaling {
    fn send(&mut self, envelope: &Envelope) -> io::Result<()> {
        let delivered = Envelope {
            peer: self.local,
            message: envelope.message.clone(),
        };
        self.tx
            .send(delivered)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "signaling peer gone"))
    }

    fn recv(&mut self) -> io::Result<Option<Envelope>> {
        match self.rx.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(None),
        }
    }
}

/// Signaling over a TCP connection to a signaling server
///
/// Frames use the length-prefixed envelope encoding. A lost connection is
/// re-established on the next use, at most once per second.
pub struct TcpSignaling {
    server: SocketAddr,
    stream: Option<TcpStream>,
    registration: Option<(Registry, Token)>,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    inbound: VecDeque<Envelope>,
    last_attempt: Instant,
    reconnected: bool,
}

impl TcpSignaling {
    pub fn connect(server: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(server)?;
        log::info!("Connecting to signaling server {}", server);
        Ok(Self {
            server,
            stream: Some(stream),
            registration: None,
            read_buf: Vec::new(),
            write_buf: Vec::new(),
            inbound: VecDeque::new(),
            last_attempt: Instant::now(),
            reconnected: false,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn ensure_connected(&mut self) -> io::Result<()> {
        if self.stream.is_some() || self.last_attempt.elapsed() < RECONNECT_INTERVAL {
            return Ok(());
        }
        self.last_attempt = Instant::now();

        let mut stream = TcpStream::connect(self.server)?;
        if let Some((registry, token)) = &self.registration {
            registry.register(&mut stream, *token, Interest::READABLE | Interest::WRITABLE)?;
        }
        log::info!("Reconnected to signaling server {}", self.server);
        self.stream = Some(stream);
        self.read_buf.clear();
        self.reconnected = true;
        Ok(())
    }

    fn disconnect(&mut self, reason: &str) {
        if let Some(mut stream) = self.stream.take() {
            if let Some((registry, _)) = &self.registration {
                let _ = registry.deregister(&mut stream);
            }
            log::warn!("Signaling connection to {} lost: {}", self.server, reason);
        }
        // Half-written frames cannot be resumed on a new connection
        self.write_buf.clear();
        self.read_buf.clear();
    }

    fn flush(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        let mut lost = None;
        while !self.write_buf.is_empty() {
            match stream.write(&self.write_buf) {
                Ok(0) => {
                    lost = Some("write returned zero".to_string());
                    break;
                }
                Ok(n) => {
                    self.write_buf.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::NotConnected => break,
                Err(e) => {
                    lost = Some(e.to_string());
                    break;
                }
            }
        }
        if let Some(reason) = lost {
            self.disconnect(&reason);
        }
    }

    fn fill(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        let mut chunk = [0u8; 4096];
        let mut lost = None;
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    lost = Some("closed by server".to_string());
                    break;
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::NotConnected => break,
                Err(e) => {
                    lost = Some(e.to_string());
                    break;
                }
            }
        }

        match decode_messages(&self.read_buf) {
            Ok((envelopes, rest)) => {
                self.inbound.extend(envelopes);
                self.read_buf = rest;
            }
            Err(e) => lost = Some(format!("corrupt frame: {}", e)),
        }

        if let Some(reason) = lost {
            self.disconnect(&reason);
        }
    }
}

impl SignalingChannel for TcpSignaling {
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            registry.register(stream, token, Interest::READABLE | Interest::WRITABLE)?;
        }
        self.registration = Some((registry.try_clone()?, token));
        Ok(())
    }

    fn send(&mut self, envelope: &Envelope) -> io::Result<()> {
        self.ensure_connected()?;
        if self.stream.is_none() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "signaling disconnected"));
        }
        let frame = encode_message(envelope).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.write_buf.extend_from_slice(&frame);
        self.flush();
        Ok(())
    }

    fn recv(&mut self) -> io::Result<Option<Envelope>> {
        if self.inbound.is_empty() {
            self.ensure_connected()?;
            self.flush();
            self.fill();
        }
        Ok(self.inbound.pop_front())
    }

    fn take_reconnected(&mut self) -> bool {
        std::mem::take(&mut self.reconnected)
    }
}

// ============================================================================
// Driver
// ============================================================================

pub struct Driver<C: ControlPlane, D: VirtualInterface, S: SignalingChannel> {
    poll: Poll,
    events: Events,
    socket: UdpSocket,
    engine: Engine<C>,
    device: D,
    signaling: S,
    shutdown: Arc<AtomicBool>,
    recv_buf: Vec<u8>,
    max_wait: Duration,
}

impl<C: ControlPlane, D: VirtualInterface, S: SignalingChannel> Driver<C, D, S> {
    pub fn new(
        engine: Engine<C>,
        mut socket: UdpSocket,
        device: D,
        mut signaling: S,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;
        signaling.register(poll.registry(), SIGNALING_TOKEN)?;

        log::info!("Engine {} socket bound to {}", engine.local_id(), socket.local_addr()?);

        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            socket,
            engine,
            device,
            signaling,
            shutdown,
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
            max_wait: DEFAULT_MAX_WAIT,
        })
    }

    /// Cap on how long one `step` may block
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn engine(&self) -> &Engine<C> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine<C> {
        &mut self.engine
    }

    /// Run until the shutdown flag is set
    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        while !self.shutdown.load(Ordering::Relaxed) {
            for event in self.step()? {
                log_event(&event);
            }
        }

        log::info!("Engine {} shutting down", self.engine.local_id());
        self.engine.reset(Instant::now());
        self.flush_transmits();
        Ok(())
    }

    /// One loop iteration
    ///
    /// Returns the engine events that are not signaling messages.
    pub fn step(&mut self) -> io::Result<Vec<EngineEvent>> {
        let now = Instant::now();
        let wait = self
            .engine
            .poll_timeout()
            .map(|deadline| deadline.saturating_duration_since(now).min(self.max_wait))
            .unwrap_or(self.max_wait);

        match self.poll.poll(&mut self.events, Some(wait)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        // Sources are drained on every pass, edge-triggered readiness
        // only tells us when to wake up
        let now = Instant::now();
        self.process_socket(now);
        self.process_signaling(now);
        self.process_device(now);

        if self.engine.poll_timeout().map(|t| t <= now).unwrap_or(false) {
            self.engine.handle_timeout(now);
        }

        self.flush_transmits();
        self.flush_inbound();
        Ok(self.flush_events())
    }

    fn process_socket(&mut self, now: Instant) {
        loop {
            match self.socket.recv_from(&mut self.recv_buf) {
                Ok((len, from)) => {
                    log::trace!("Received {} bytes from {}", len, from);
                    self.engine.handle_network(from, &self.recv_buf[..len], now);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("Socket receive error: {:?}", e);
                    break;
                }
            }
        }
    }

    fn process_signaling(&mut self, now: Instant) {
        loop {
            match self.signaling.recv() {
                Ok(Some(envelope)) => {
                    if let Err(e) = self.engine.handle_signaling(envelope.peer, envelope.message, now) {
                        log::debug!("Signaling from {} rejected: {}", envelope.peer, e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::debug!("Signaling receive error: {}", e);
                    break;
                }
            }
        }

        if self.signaling.take_reconnected() {
            self.engine.on_signaling_reconnected(now);
        }
    }

    fn process_device(&mut self, now: Instant) {
        loop {
            match self.device.read_packet(&mut self.recv_buf) {
                Ok(Some(len)) => {
                    if let Err(e) = self.engine.route_outbound(&self.recv_buf[..len], now) {
                        log::trace!("Outbound packet dropped: {}", e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Virtual interface read error: {}", e);
                    break;
                }
            }
        }
    }

    fn flush_transmits(&mut self) {
        while let Some(transmit) = self.engine.poll_transmit() {
            if let Err(e) = self.socket.send_to(&transmit.payload, transmit.dst) {
                // UDP is lossy anyway; retransmission lives in the engine
                log::debug!("Send to {} failed: {:?}", transmit.dst, e);
            }
        }
    }

    fn flush_inbound(&mut self) {
        while let Some(packet) = self.engine.poll_inbound() {
            if let Err(e) = self.device.write_packet(&packet) {
                log::warn!("Virtual interface write error: {}", e);
            }
        }
    }

    fn flush_events(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.engine.poll_event() {
            match event {
                EngineEvent::Signal(envelope) => {
                    if let Err(e) = self.signaling.send(&envelope) {
                        log::warn!("Cannot signal peer {}: {}", envelope.peer, e);
                    }
                }
                other => events.push(other),
            }
        }
        events
    }
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::ConnectionFailed { peer, error } => log::warn!("Connection to {} failed: {}", peer, error),
        EngineEvent::ConnectionClosed { peer, reason } => log::info!("Connection to {} closed: {:?}", peer, reason),
        other => log::debug!("{:?}", other),
    }
}

// ============================================================================
// Tests
// ============================================================================
