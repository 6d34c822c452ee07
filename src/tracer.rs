//! Shared raw-socket transport and the per-destination TTL walk.
//!
//! One tracer owns one raw socket per address family plus a registry of
//! active sessions keyed by destination. All concurrent walks share the
//! sockets; a blocking receive thread per socket decodes inbound ICMP and
//! fans replies out to whichever sessions claim the destination.

use std::collections::HashMap;
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use nix::unistd::Uid;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::packet::{self, Decoded, PacketError};

/// Replies queued per session before the receive loop starts dropping the
/// newest ones. Stale path replies lose their value fast, so backing up the
/// shared loop would be worse than the loss.
const REPLY_QUEUE_CAPACITY: usize = 64;

/// Receive threads wake this often to check the shutdown flag.
const RECV_POLL: Duration = Duration::from_millis(100);

const RECV_BUFFER: usize = 1500;

/// Probe pacing and patience knobs shared by every session of a tracer.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Pause between consecutive TTL steps.
    pub delay: Duration,
    /// How long a probe stays matchable, and how long the final drain waits.
    pub timeout: Duration,
    pub max_hops: u8,
    /// Full TTL sweeps per walk.
    pub count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(50),
            timeout: Duration::from_millis(500),
            max_hops: 15,
            count: 1,
        }
    }
}

/// One matched reply, already resolved to a hop distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub from: IpAddr,
    /// TTL sent minus TTL remaining plus one, clamped to 1.
    pub distance: usize,
    pub rtt: Duration,
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("raw ICMP transport unavailable: {0}")]
    Setup(Arc<io::Error>),
    #[error("IPv6 transport unavailable")]
    NoIpv6,
    #[error("malformed probe: {0}")]
    Codec(#[from] PacketError),
    #[error("probe send failed: {0}")]
    Send(io::Error),
}

/// The two wire framings. IPv4 probes carry their own header; IPv6 probes
/// are payload-only with the hop limit applied as a socket option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn decode(self, datagram: &[u8]) -> Result<Decoded, PacketError> {
        match self {
            Family::V4 => packet::decode_v4(datagram),
            Family::V6 => packet::decode_v6(datagram),
        }
    }
}

/// What a receive thread hands to sessions, before probe matching.
#[derive(Debug, Clone, Copy)]
struct RawReply {
    from: IpAddr,
    id: u16,
    ttl_remaining: u8,
    at: Instant,
}

struct Probe {
    id: u16,
    ttl: u8,
    sent: Instant,
}

struct SessionState {
    probes: Mutex<Vec<Probe>>,
    timeout: Duration,
    tx: mpsc::Sender<Reply>,
}

impl SessionState {
    /// Matches a raw reply against the oldest outstanding probe and forwards
    /// the resolved hop. Expired probes are pruned on every arrival.
    fn handle(&self, raw: &RawReply) {
        let mut probes = self.probes.lock().unwrap_or_else(|e| e.into_inner());
        probes.retain(|probe| raw.at.duration_since(probe.sent) <= self.timeout);

        // Kernel-chosen flow labels make the recovered id unreliable for
        // IPv6, so there any outstanding probe is accepted.
        let loose = raw.from.is_ipv6();
        let Some(position) = probes.iter().position(|probe| loose || probe.id == raw.id) else {
            return;
        };
        let probe = probes.remove(position);
        drop(probes);

        let distance = probe.ttl as isize - raw.ttl_remaining as isize + 1;
        let reply = Reply {
            from: raw.from,
            distance: distance.max(1) as usize,
            rtt: raw.at.duration_since(probe.sent),
        };
        match self.tx.try_send(reply) {
            Ok(()) => {}
            // Saturated or abandoned queue: the newest reply is the one lost.
            Err(TrySendError::Full(_)) => debug!("Reply queue full, dropping reply from {}", raw.from),
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn outstanding_within(&self, ceiling: u8) -> bool {
        let probes = self.probes.lock().unwrap_or_else(|e| e.into_inner());
        probes.iter().any(|probe| probe.ttl <= ceiling)
    }
}

/// Active sessions keyed by destination. Dispatch takes the shared lock,
/// session setup and teardown take the exclusive one.
#[derive(Default)]
struct Registry {
    sessions: RwLock<HashMap<IpAddr, Vec<Arc<SessionState>>>>,
}

impl Registry {
    fn insert(&self, destination: IpAddr, state: Arc<SessionState>) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.entry(destination).or_default().push(state);
    }

    fn remove(&self, destination: &IpAddr, state: &Arc<SessionState>) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = sessions.get_mut(destination) {
            list.retain(|other| !Arc::ptr_eq(other, state));
            if list.is_empty() {
                sessions.remove(destination);
            }
        }
    }

    fn dispatch(&self, destination: &IpAddr, raw: &RawReply) {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = sessions.get(destination) {
            for session in list {
                session.handle(raw);
            }
        }
    }
}

struct Transport {
    v4: Arc<Socket>,
    v6: Option<Arc<Socket>>,
    /// The hop limit is per-socket state, so IPv6 sends serialize the
    /// set-hops/send pair.
    v6_send: Mutex<()>,
    closed: Arc<AtomicBool>,
}

impl Transport {
    fn open(registry: &Arc<Registry>) -> io::Result<Transport> {
        let closed = Arc::new(AtomicBool::new(false));

        let v4 = match Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)) {
            Ok(socket) => socket,
            Err(err) => {
                if !Uid::effective().is_root() {
                    warn!("Failed to create raw ICMP socket ({}), try running as root", err);
                }
                return Err(err);
            }
        };
        v4.set_header_included_v4(true)?;
        v4.set_read_timeout(Some(RECV_POLL))?;
        let v4 = Arc::new(v4);
        spawn_receiver("icmp4-recv", Family::V4, Arc::clone(&v4), Arc::clone(registry), Arc::clone(&closed))?;

        // A host without IPv6 still traces IPv4 targets, so this one is
        // allowed to fail.
        let v6 = match Self::open_v6() {
            Ok(socket) => {
                let socket = Arc::new(socket);
                spawn_receiver("icmp6-recv", Family::V6, Arc::clone(&socket), Arc::clone(registry), Arc::clone(&closed))?;
                Some(socket)
            }
            Err(err) => {
                warn!("IPv6 transport unavailable: {}", err);
                None
            }
        };

        Ok(Transport { v4, v6, v6_send: Mutex::new(()), closed })
    }

    fn open_v6() -> io::Result<Socket> {
        let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))?;
        socket.set_read_timeout(Some(RECV_POLL))?;
        Ok(socket)
    }

    fn send(&self, destination: IpAddr, ttl: u8, id: u16) -> Result<(), TraceError> {
        let target = SockAddr::from(SocketAddr::new(destination, 0));
        match destination {
            IpAddr::V4(v4) => {
                let datagram = packet::build_probe_v4(v4, ttl, id)?;
                self.v4.send_to(&datagram, &target).map_err(TraceError::Send)?;
            }
            IpAddr::V6(_) => {
                let socket = self.v6.as_ref().ok_or(TraceError::NoIpv6)?;
                let message = packet::build_probe_v6(id)?;
                let _sending = self.v6_send.lock().unwrap_or_else(|e| e.into_inner());
                socket.set_unicast_hops_v6(u32::from(ttl)).map_err(TraceError::Send)?;
                socket.send_to(&message, &target).map_err(TraceError::Send)?;
            }
        }
        Ok(())
    }
}

fn spawn_receiver(
    name: &str,
    family: Family,
    socket: Arc<Socket>,
    registry: Arc<Registry>,
    closed: Arc<AtomicBool>,
) -> io::Result<()> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || receive_loop(family, socket, registry, closed))?;
    Ok(())
}

fn receive_loop(family: Family, socket: Arc<Socket>, registry: Arc<Registry>, closed: Arc<AtomicBool>) {
    let mut buffer = [MaybeUninit::uninit(); RECV_BUFFER];
    while !closed.load(Ordering::Relaxed) {
        let (size, addr) = match socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(err) => {
                if !matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) {
                    debug!("Socket recv error: {}", err);
                }
                continue;
            }
        };
        let received_at = Instant::now();
        let Some(from) = addr.as_socket().map(|address| address.ip()) else {
            continue;
        };
        let datagram: Vec<u8> = buffer[..size]
            .iter()
            .map(|b| unsafe { b.assume_init() })
            .collect();

        match family.decode(&datagram) {
            // The destination answered: distance equals the probe's own TTL.
            Ok(Decoded::EchoReply { id }) => {
                registry.dispatch(&from, &RawReply { from, id, ttl_remaining: 1, at: received_at });
            }
            // A router on the way answered: the embedded header names the
            // session this belongs to.
            Ok(Decoded::TimeExceeded { dst, id, ttl }) => {
                registry.dispatch(&dst, &RawReply { from, id, ttl_remaining: ttl, at: received_at });
            }
            Ok(Decoded::Other) => {}
            Err(err) => debug!("Dropping undecodable ICMP from {}: {}", from, err),
        }
    }
}

/// One TTL walk's handle on the tracer: its registry slot, outstanding
/// probes and reply queue.
struct Session<'t> {
    tracer: &'t Tracer,
    destination: IpAddr,
    state: Arc<SessionState>,
    rx: mpsc::Receiver<Reply>,
}

impl Session<'_> {
    /// Registers the probe before the send so a fast reply cannot race it.
    fn send_probe(&self, ttl: u8) -> Result<(), TraceError> {
        let id = self.tracer.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut probes = self.state.probes.lock().unwrap_or_else(|e| e.into_inner());
            probes.push(Probe { id, ttl, sent: Instant::now() });
        }
        let transport = self.tracer.transport()?;
        if let Err(err) = transport.send(self.destination, ttl, id) {
            let mut probes = self.state.probes.lock().unwrap_or_else(|e| e.into_inner());
            probes.retain(|probe| probe.id != id);
            return Err(err);
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Reply> {
        self.rx.recv().await
    }

    fn is_done(&self, ceiling: u8) -> bool {
        !self.state.outstanding_within(ceiling)
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        // Deregister before the queue goes away; late replies then fall on
        // the floor instead of a dead channel.
        self.tracer.registry.remove(&self.destination, &self.state);
    }
}

/// A reply from the destination itself caps how deep later probing goes.
fn lower_ceiling(ceiling: &mut u8, destination: IpAddr, reply: &Reply) {
    if reply.from == destination {
        let distance = reply.distance.min(usize::from(u8::MAX)) as u8;
        if distance < *ceiling {
            *ceiling = distance;
        }
    }
}

/// Owns the raw sockets, the session registry and probe id assignment.
/// Sockets and receive threads come up lazily on the first walk; `close`
/// shuts the receive threads down at the end of the run.
pub struct Tracer {
    config: Config,
    registry: Arc<Registry>,
    transport: OnceLock<Result<Transport, Arc<io::Error>>>,
    next_id: AtomicU16,
}

impl Tracer {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: Arc::new(Registry::default()),
            transport: OnceLock::new(),
            next_id: AtomicU16::new(rand::random()),
        }
    }

    fn transport(&self) -> Result<&Transport, TraceError> {
        let slot = self
            .transport
            .get_or_init(|| Transport::open(&self.registry).map_err(Arc::new));
        match slot {
            Ok(transport) => Ok(transport),
            Err(err) => Err(TraceError::Setup(Arc::clone(err))),
        }
    }

    /// Stops the receive threads. Sessions still running drain whatever
    /// already reached their queues.
    pub fn close(&self) {
        if let Some(Ok(transport)) = self.transport.get() {
            transport.closed.store(true, Ordering::Relaxed);
        }
    }

    fn new_session(&self, destination: IpAddr) -> Result<Session<'_>, TraceError> {
        let transport = self.transport()?;
        if destination.is_ipv6() && transport.v6.is_none() {
            return Err(TraceError::NoIpv6);
        }
        let (tx, rx) = mpsc::channel(REPLY_QUEUE_CAPACITY);
        let state = Arc::new(SessionState {
            probes: Mutex::new(Vec::new()),
            timeout: self.config.timeout,
            tx,
        });
        self.registry.insert(destination, Arc::clone(&state));
        Ok(Session { tracer: self, destination, state, rx })
    }

    /// Walks TTLs 1..=max_hops toward `destination`, invoking `on_reply` for
    /// every matched reply. The walk stops early once the destination itself
    /// answers and everything below that distance has resolved or expired.
    ///
    /// Cancellation is not an error: the replies seen so far stand.
    pub async fn trace<F>(
        &self,
        destination: IpAddr,
        cancel: &CancellationToken,
        mut on_reply: F,
    ) -> Result<(), TraceError>
    where
        F: FnMut(Reply),
    {
        let mut session = self.new_session(destination)?;
        let Config { delay, timeout, max_hops, count } = self.config;
        let mut ceiling = max_hops;

        for _ in 0..count {
            let mut ttl = 1u8;
            while ttl <= ceiling {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                session.send_probe(ttl)?;
                ttl += 1;

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    reply = session.recv() => match reply {
                        Some(reply) => {
                            lower_ceiling(&mut ceiling, destination, &reply);
                            on_reply(reply);
                        }
                        None => return Ok(()),
                    },
                    _ = cancel.cancelled() => return Ok(()),
                }
            }
        }

        if session.is_done(ceiling) {
            return Ok(());
        }

        // One timeout's worth of patience for stragglers below the ceiling.
        let drain = tokio::time::sleep(timeout);
        tokio::pin!(drain);
        loop {
            tokio::select! {
                _ = &mut drain => return Ok(()),
                reply = session.recv() => match reply {
                    Some(reply) => {
                        lower_ceiling(&mut ceiling, destination, &reply);
                        on_reply(reply);
                        if session.is_done(ceiling) {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                },
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }
}
