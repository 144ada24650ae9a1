//! Relay event loops
//!
//! One dispatcher thread owns the listen socket and the optional metrics
//! listener. Every datagram is handed to the worker whose shard owns the
//! sender's address. Each worker runs its own mio poll over the relayed
//! sockets of its allocations and answers clients through a clone of the
//! listen socket, so no lock is taken on the forwarding path.
//!
//! ```text
//!                       ┌──► worker 0 (poll, shard 0, relayed sockets)
//!  listen ──► dispatch ─┼──► worker 1
//!                       └──► worker N-1
//! ```

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tunnel_core::relay::message::AllocationId;

use crate::config::RelayConfig;
use crate::metrics::Metrics;
use crate::shard::{shard_for_ip, AllocationCeiling, Output, RelaySockets, RelayShard};

// ============================================================================
// Constants
// ============================================================================

const SOCKET_TOKEN: Token = Token(0);
const METRICS_TOKEN: Token = Token(1);
const FIRST_CONN_TOKEN: usize = 2;

const WAKER_TOKEN: Token = Token(0);
const FIRST_RELAYED_TOKEN: usize = 1;

const MAX_DATAGRAM_SIZE: usize = 65535;

/// Longest a loop blocks before re-checking for shutdown
const MAX_WAIT: Duration = Duration::from_millis(100);

// ============================================================================
// Dispatcher
// ============================================================================

struct Inbound {
    from: SocketAddr,
    payload: Vec<u8>,
}

/// Outcome of handing a datagram to a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Queued,
    /// Worker is behind; the datagram was dropped
    Full,
    /// Worker thread has exited
    Gone,
}

/// Queue a datagram without blocking the dispatcher
fn dispatch(tx: &SyncSender<Inbound>, inbound: Inbound, metrics: &Metrics) -> Dispatch {
    match tx.try_send(inbound) {
        Ok(()) => Dispatch::Queued,
        Err(TrySendError::Full(_)) => {
            Metrics::incr(&metrics.dropped_worker_queue_total);
            Dispatch::Full
        }
        Err(TrySendError::Disconnected(_)) => Dispatch::Gone,
    }
}

struct WorkerHandle {
    tx: SyncSender<Inbound>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
}

pub struct RelayServer {
    poll: Poll,
    events: Events,
    socket: UdpSocket,
    metrics: Arc<Metrics>,
    metrics_listener: Option<TcpListener>,
    metrics_conns: HashMap<Token, TcpStream>,
    next_token: usize,
    workers: Vec<WorkerHandle>,
    /// Set by the operator (signal) to stop serving
    shutdown: Arc<AtomicBool>,
    /// Set by the dispatcher to stop the workers
    stop: Arc<AtomicBool>,
    recv_buf: Vec<u8>,
}

impl RelayServer {
    /// Bind the listen socket and start the workers
    pub fn bind(config: RelayConfig, shutdown: Arc<AtomicBool>) -> io::Result<Self> {
        let config = Arc::new(config);
        let metrics = Arc::new(Metrics::new());
        let ceiling = Arc::new(AllocationCeiling::new(config.max_allocations));
        let stop = Arc::new(AtomicBool::new(false));

        let std_socket = std::net::UdpSocket::bind(config.listen)?;
        std_socket.set_nonblocking(true)?;
        let listen = std_socket.local_addr()?;

        if config.advertised_ip().is_unspecified() {
            log::warn!("No public IP configured, relayed addresses will be unusable by peers");
        }

        let mut pending = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let (tx, rx) = mpsc::sync_channel(config.worker_queue_capacity);
            let worker = Worker::new(
                index,
                Arc::clone(&config),
                std_socket.try_clone()?,
                rx,
                Arc::clone(&metrics),
                Arc::clone(&ceiling),
                Arc::clone(&stop),
            )?;
            pending.push((tx, worker));
        }

        let poll = Poll::new()?;
        let mut socket = UdpSocket::from_std(std_socket);
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

        let metrics_listener = match config.metrics_port {
            Some(port) => {
                let mut listener = TcpListener::bind(SocketAddr::new(listen.ip(), port))?;
                poll.registry()
                    .register(&mut listener, METRICS_TOKEN, Interest::READABLE)?;
                log::info!("Metrics on {}", listener.local_addr()?);
                Some(listener)
            }
            None => None,
        };

        let mut server = RelayServer {
            poll,
            events: Events::with_capacity(1024),
            socket,
            metrics,
            metrics_listener,
            metrics_conns: HashMap::new(),
            next_token: FIRST_CONN_TOKEN,
            workers: Vec::with_capacity(pending.len()),
            shutdown,
            stop,
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
        };

        // Workers already started are stopped by Drop on error
        for (index, (tx, worker)) in pending.into_iter().enumerate() {
            let waker = Arc::clone(&worker.waker);
            let thread = std::thread::Builder::new()
                .name(format!("relay-worker-{}", index))
                .spawn(move || worker.run())?;
            server.workers.push(WorkerHandle {
                tx,
                waker,
                thread: Some(thread),
            });
        }

        log::info!("Relay listening on {} with {} workers", listen, server.workers.len());
        Ok(server)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Serve until the shutdown flag is set
    pub fn run(&mut self) -> io::Result<()> {
        while !self.shutdown.load(Ordering::Relaxed) {
            match self.poll.poll(&mut self.events, Some(MAX_WAIT)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.stop_workers();
                    return Err(e);
                }
            }

            let tokens: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
            for token in tokens {
                match token {
                    SOCKET_TOKEN => self.process_socket(),
                    METRICS_TOKEN => self.accept_metrics(),
                    token => self.serve_metrics(token),
                }
            }
        }

        log::info!("Shutting down relay");
        self.stop_workers();
        Ok(())
    }

    fn process_socket(&mut self) {
        let mut woken = vec![false; self.workers.len()];

        loop {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("Listen socket receive error: {:?}", e);
                    break;
                }
            };

            // Allocation ids are generated so that id % workers names this
            // same shard, so requests naming another client's allocation
            // land where it is unknown
            let index = shard_for_ip(from.ip(), self.workers.len());
            let inbound = Inbound {
                from,
                payload: self.recv_buf[..len].to_vec(),
            };
            match dispatch(&self.workers[index].tx, inbound, &self.metrics) {
                Dispatch::Queued => {}
                Dispatch::Full => log::debug!("Worker {} queue full, dropping datagram from {}", index, from),
                Dispatch::Gone => {
                    log::warn!("Worker {} is gone, dropping datagram from {}", index, from);
                    continue;
                }
            }
            // A full queue still has work for the worker
            woken[index] = true;
        }

        for (index, wake) in woken.into_iter().enumerate() {
            if wake {
                if let Err(e) = self.workers[index].waker.wake() {
                    log::warn!("Failed to wake worker {}: {}", index, e);
                }
            }
        }
    }

    fn accept_metrics(&mut self) {
        let Some(listener) = self.metrics_listener.as_ref() else {
            return;
        };

        loop {
            match listener.accept() {
                Ok((mut stream, addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) = self
                        .poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)
                    {
                        log::debug!("Cannot register metrics connection from {}: {}", addr, e);
                        continue;
                    }
                    self.metrics_conns.insert(token, stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("Metrics accept error: {}", e);
                    break;
                }
            }
        }
    }

    /// Answer once the request has been read, then close
    fn serve_metrics(&mut self, token: Token) {
        let Some(stream) = self.metrics_conns.get_mut(&token) else {
            return;
        };

        let mut buf = [0u8; 1024];
        let mut request_done = false;
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    request_done = true;
                    break;
                }
                Ok(n) => {
                    if buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
                        request_done = true;
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("Metrics read error: {}", e);
                    request_done = true;
                    break;
                }
            }
        }

        if !request_done {
            return;
        }

        if let Some(mut stream) = self.metrics_conns.remove(&token) {
            if let Err(e) = stream.write_all(&self.metrics.http_response()) {
                log::debug!("Metrics write error: {}", e);
            }
            let _ = self.poll.registry().deregister(&mut stream);
        }
    }

    fn stop_workers(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for worker in &self.workers {
            let _ = worker.waker.wake();
        }
        for (index, worker) in self.workers.iter_mut().enumerate() {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    log::warn!("Worker {} panicked", index);
                }
            }
        }
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Relayed sockets of one worker, registered with its poll
pub struct WorkerSockets {
    registry: Registry,
    bind_ip: IpAddr,
    advertised_ip: IpAddr,
    sockets: HashMap<AllocationId, (Token, UdpSocket)>,
    tokens: HashMap<Token, AllocationId>,
    next_token: usize,
}

impl WorkerSockets {
    fn new(registry: Registry, bind_ip: IpAddr, advertised_ip: IpAddr) -> Self {
        Self {
            registry,
            bind_ip,
            advertised_ip,
            sockets: HashMap::new(),
            tokens: HashMap::new(),
            next_token: FIRST_RELAYED_TOKEN,
        }
    }

    fn allocation_for(&self, token: Token) -> Option<AllocationId> {
        self.tokens.get(&token).copied()
    }

    fn recv_from(&self, id: AllocationId, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match self.sockets.get(&id) {
            Some((_, socket)) => socket.recv_from(buf),
            None => Err(io::ErrorKind::NotFound.into()),
        }
    }

    fn send_to(&self, id: AllocationId, dst: SocketAddr, payload: &[u8]) {
        let Some((_, socket)) = self.sockets.get(&id) else {
            return;
        };
        if let Err(e) = socket.send_to(payload, dst) {
            log::debug!("Relayed send to {} failed: {}", dst, e);
        }
    }
}

impl RelaySockets for WorkerSockets {
    fn open(&mut self, id: AllocationId) -> io::Result<SocketAddr> {
        let mut socket = UdpSocket::bind(SocketAddr::new(self.bind_ip, 0))?;
        let token = Token(self.next_token);
        self.next_token += 1;
        self.registry
            .register(&mut socket, token, Interest::READABLE)?;

        let port = socket.local_addr()?.port();
        self.sockets.insert(id, (token, socket));
        self.tokens.insert(token, id);
        Ok(SocketAddr::new(self.advertised_ip, port))
    }

    fn close(&mut self, id: AllocationId) {
        if let Some((token, mut socket)) = self.sockets.remove(&id) {
            let _ = self.registry.deregister(&mut socket);
            self.tokens.remove(&token);
        }
    }
}

struct Worker {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    rx: Receiver<Inbound>,
    /// Clone of the listen socket, for answers to clients
    socket: std::net::UdpSocket,
    shard: RelayShard<WorkerSockets>,
    stop: Arc<AtomicBool>,
    recv_buf: Vec<u8>,
}

impl Worker {
    fn new(
        index: usize,
        config: Arc<RelayConfig>,
        socket: std::net::UdpSocket,
        rx: Receiver<Inbound>,
        metrics: Arc<Metrics>,
        ceiling: Arc<AllocationCeiling>,
        stop: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let sockets = WorkerSockets::new(
            poll.registry().try_clone()?,
            config.listen.ip(),
            config.advertised_ip(),
        );
        let shards = config.workers;
        let shard = RelayShard::new(index, shards, config, sockets, metrics, ceiling, Instant::now());

        Ok(Worker {
            poll,
            events: Events::with_capacity(1024),
            waker,
            rx,
            socket,
            shard,
            stop,
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
        })
    }

    fn run(mut self) {
        log::debug!("Worker {} started", self.shard.index());

        while !self.stop.load(Ordering::Relaxed) {
            let wait = self
                .shard
                .poll_timeout()
                .saturating_duration_since(Instant::now())
                .min(MAX_WAIT);

            match self.poll.poll(&mut self.events, Some(wait)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::error!("Worker {} poll failed: {}", self.shard.index(), e);
                    break;
                }
            }

            let now = Instant::now();
            let tokens: Vec<Token> = self
                .events
                .iter()
                .map(|event| event.token())
                .filter(|token| *token != WAKER_TOKEN)
                .collect();

            self.process_inbound(now);
            for token in tokens {
                self.process_relayed(token, now);
            }

            self.shard.handle_timeout(now);
            self.flush_outputs();
        }

        self.shard.release_all();
        log::debug!("Worker {} stopped", self.shard.index());
    }

    fn process_inbound(&mut self, now: Instant) {
        loop {
            match self.rx.try_recv() {
                Ok(inbound) => {
                    if let Err(code) = self.shard.handle_client(inbound.from, &inbound.payload, now) {
                        log::trace!("Datagram from {} not relayed: {}", inbound.from, code);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.stop.store(true, Ordering::Relaxed);
                    break;
                }
            }
        }
    }

    fn process_relayed(&mut self, token: Token, now: Instant) {
        let Some(id) = self.shard.sockets().allocation_for(token) else {
            return;
        };

        loop {
            let received = self.shard.sockets().recv_from(id, &mut self.recv_buf);
            let (len, from) = match received {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("Relayed socket receive error on {}: {:?}", id, e);
                    break;
                }
            };

            if let Err(code) = self.shard.handle_peer(id, from, &self.recv_buf[..len], now) {
                log::trace!("Datagram from {} on allocation {} not relayed: {}", from, id, code);
                if self.shard.allocation(id).is_none() {
                    break;
                }
            }
        }
    }

    fn flush_outputs(&mut self) {
        while let Some(output) = self.shard.poll_output() {
            match output {
                Output::ToClient { dst, payload } => {
                    if let Err(e) = self.socket.send_to(&payload, dst) {
                        log::debug!("Send to client {} failed: {}", dst, e);
                    }
                }
                Output::ToPeer {
                    allocation,
                    dst,
                    payload,
                } => self.shard.sockets().send_to(allocation, dst, &payload),
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(byte: u8) -> Inbound {
        Inbound {
            from: "192.0.2.1:4000".parse().unwrap(),
            payload: vec![byte],
        }
    }

    #[test]
    fn test_full_worker_queue_drops_and_counts() {
        let metrics = Metrics::new();
        let (tx, rx) = mpsc::sync_channel(2);

        assert_eq!(dispatch(&tx, inbound(1), &metrics), Dispatch::Queued);
        assert_eq!(dispatch(&tx, inbound(2), &metrics), Dispatch::Queued);
        assert_eq!(dispatch(&tx, inbound(3), &metrics), Dispatch::Full);
        assert_eq!(dispatch(&tx, inbound(4), &metrics), Dispatch::Full);
        assert_eq!(metrics.dropped_worker_queue_total.load(Ordering::Relaxed), 2);

        // The queue keeps what fit, in order
        let queued: Vec<u8> = rx.try_iter().map(|i| i.payload[0]).collect();
        assert_eq!(queued, vec![1, 2]);
        assert_eq!(dispatch(&tx, inbound(5), &metrics), Dispatch::Queued);

        drop(rx);
        assert_eq!(dispatch(&tx, inbound(6), &metrics), Dispatch::Gone);
        assert_eq!(metrics.dropped_worker_queue_total.load(Ordering::Relaxed), 2);
    }
}
