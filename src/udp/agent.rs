use super::stun::Binding;
use crate::candidate::{Candidate, CandidateType};
use crate::config::SessionConfig;
use crate::descriptor::SessionDescriptor;
use crate::error::{Error, Result};
use crate::host::{self, Credentials};
use crate::transport::{ComponentState, Event, Transport};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::{Duration, Instant};

const CHECK: u8 = 1;
const ACK: u8 = 2;
const DATA: u8 = 3;

const CHECK_INTERVAL: Duration = Duration::from_millis(200);
/// idle time after which the selected path is refreshed, below common NAT UDP timeouts
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const RECV_BUF: usize = 64 * 1024;

/// Datagram engine.
///
/// One UDP socket carries connectivity checks, STUN and relayed data.
/// Every packet starts with a tag byte: `CHECK` carries
/// `<remote ufrag>:<local ufrag> <remote password>`, `ACK` echoes the
/// username back, `DATA` carries one relayed chunk. The first source that
/// acknowledges one of our checks becomes the peer.
///
/// ```no_run
/// use punchpipe::config::{Mode, Role, SessionConfig};
/// use punchpipe::transport::Transport;
/// use punchpipe::udp::Agent;
///
/// let config = SessionConfig::new(Role::Caller, Mode::Datagram);
/// let mut agent = Agent::new(&config);
/// agent.gather().unwrap();
/// ```
pub struct Agent {
    bind_ip: Option<IpAddr>,
    stun_server: Option<SocketAddr>,
    timeout: Duration,
    local: Credentials,
    remote: Option<Credentials>,
    socket: Option<UdpSocket>,
    candidates: Vec<Candidate>,
    binding: Option<Binding>,
    targets: Vec<SocketAddr>,
    peer: Option<SocketAddr>,
    state: ComponentState,
    last_check: Option<Instant>,
    deadline: Option<Instant>,
    keepalive: Duration,
    /// last packet sent to the selected peer
    last_sent: Option<Instant>,
    events: VecDeque<Event>,
    buf: Vec<u8>,
}

impl Agent {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            bind_ip: config.bind_ip,
            stun_server: config.stun,
            timeout: config.negotiation_timeout,
            local: Credentials::random(),
            remote: None,
            socket: None,
            candidates: Vec::new(),
            binding: None,
            targets: Vec::new(),
            peer: None,
            state: ComponentState::Disconnected,
            last_check: None,
            deadline: None,
            keepalive: KEEPALIVE_INTERVAL,
            last_sent: None,
            events: VecDeque::new(),
            buf: vec![0; RECV_BUF],
        }
    }

    /// bound address of the socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// selected remote address
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Once a peer is selected, a check goes out after this much idle time.
    pub fn set_keepalive(&mut self, interval: Duration) {
        self.keepalive = interval;
    }

    fn set_state(&mut self, state: ComponentState) {
        if self.state != state {
            log::debug!("component {:?} -> {:?}", self.state, state);
            self.state = state;
            self.events.push_back(Event::StateChanged(state));
        }
    }

    fn create_socket(bind: SocketAddr) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&bind.into())?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }

    fn send_to(&self, packet: &[u8], addr: SocketAddr) {
        if let Some(s) = &self.socket {
            if let Err(e) = s.send_to(packet, addr) {
                log::trace!("send to {} failed: {}", addr, e);
            }
        }
    }

    fn tagged(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(body.len() + 1);
        packet.push(tag);
        packet.extend_from_slice(body);
        packet
    }

    fn check_packet(&self, remote: &Credentials) -> Vec<u8> {
        let body = format!("{}:{} {}", remote.ufrag, self.local.ufrag, remote.password);
        Self::tagged(CHECK, body.as_bytes())
    }

    fn step(&mut self) -> Result<()> {
        loop {
            let received = match &self.socket {
                Some(s) => s.recv_from(&mut self.buf),
                None => return Ok(()),
            };

            match received {
                Ok((n, from)) => {
                    let packet = self.buf[..n].to_vec();
                    self.on_packet(packet, from);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e)
                    if e.kind() == ErrorKind::ConnectionRefused
                        || e.kind() == ErrorKind::ConnectionReset
                        || e.kind() == ErrorKind::Interrupted =>
                {
                    continue
                }
                Err(e) => return Err(Error::TransportFailed(e.to_string())),
            }
        }

        self.on_timers(Instant::now());
        Ok(())
    }

    fn on_packet(&mut self, packet: Vec<u8>, from: SocketAddr) {
        if let Some(b) = &self.binding {
            if from == b.server() {
                if let Some(mapped) = b.parse_response(&packet) {
                    self.on_mapped(mapped);
                }
                return;
            }
        }

        match packet.first() {
            Some(&CHECK) => self.on_check(&packet[1..], from),
            Some(&ACK) => self.on_ack(&packet[1..], from),
            Some(&DATA) if Some(from) == self.peer => {
                self.events.push_back(Event::Received(packet[1..].to_vec()))
            }
            _ => log::trace!("dropped {} bytes from {}", packet.len(), from),
        }
    }

    fn on_mapped(&mut self, mapped: SocketAddr) {
        self.binding = None;

        if self.candidates.iter().any(|c| c.socket_addr() == mapped) {
            log::debug!("reflexive address {} equals host address", mapped);
        } else {
            log::info!("server reflexive address {}", mapped);
            let priority = Candidate::priority_for(CandidateType::ServerReflexive, 65535, 1);
            self.candidates.push(Candidate::new(
                "2",
                priority,
                mapped,
                CandidateType::ServerReflexive,
            ));
        }

        self.events.push_back(Event::GatheringDone);
    }

    fn on_check(&mut self, body: &[u8], from: SocketAddr) {
        let remote = match &self.remote {
            Some(r) => r.clone(),
            None => return,
        };

        let expect = format!("{}:{} {}", self.local.ufrag, remote.ufrag, self.local.password);
        if body != expect.as_bytes() {
            log::debug!("ignore check from {}", from);
            return;
        }

        let ack = format!("{}:{}", remote.ufrag, self.local.ufrag);
        self.send_to(&Self::tagged(ACK, ack.as_bytes()), from);

        // peer reflexive, and answer with a check of our own
        if !self.targets.contains(&from) {
            log::debug!("learned remote address {}", from);
            self.targets.push(from);
        }
        if self.peer.is_none() {
            let check = self.check_packet(&remote);
            self.send_to(&check, from);
        }
    }

    fn on_ack(&mut self, body: &[u8], from: SocketAddr) {
        if self.peer.is_some() || self.state == ComponentState::Failed {
            return;
        }
        let remote = match &self.remote {
            Some(r) => r,
            None => return,
        };

        let expect = format!("{}:{}", self.local.ufrag, remote.ufrag);
        if body != expect.as_bytes() {
            log::debug!("ignore ack from {}", from);
            return;
        }

        log::info!("selected remote {}", from);
        self.peer = Some(from);
        self.deadline = None;
        self.last_sent = Some(Instant::now());
        self.set_state(ComponentState::Connected);
        self.set_state(ComponentState::Ready);
    }

    fn on_timers(&mut self, now: Instant) {
        if let Some(b) = &mut self.binding {
            if b.expired(now) {
                log::warn!("no answer from stun server {}", b.server());
                self.binding = None;
                self.events.push_back(Event::GatheringDone);
            } else if b.due(now) {
                let (req, server) = (b.request(), b.server());
                self.send_to(&req, server);
            }
        }

        if let (Some(peer), Some(remote)) = (self.peer, &self.remote) {
            let idle = self
                .last_sent
                .map_or(true, |t| now.duration_since(t) >= self.keepalive);
            if idle {
                log::trace!("keepalive to {}", peer);
                let check = self.check_packet(remote);
                self.send_to(&check, peer);
                self.last_sent = Some(now);
            }
            return;
        }

        let deadline = match self.deadline {
            Some(d) => d,
            None => return,
        };
        if now > deadline {
            log::warn!("no remote candidate answered");
            self.deadline = None;
            self.set_state(ComponentState::Failed);
            return;
        }

        let due = self
            .last_check
            .map_or(true, |t| now.duration_since(t) >= CHECK_INTERVAL);
        if let (true, Some(remote)) = (due, &self.remote) {
            let check = self.check_packet(remote);
            for t in &self.targets {
                self.send_to(&check, *t);
            }
            self.last_check = Some(now);
        }
    }
}

impl Transport for Agent {
    fn gather(&mut self) -> Result<()> {
        let socket = Self::create_socket(host::bind_addr(self.bind_ip))
            .map_err(|e| Error::GatheringFailed(e.to_string()))?;
        let port = socket.local_addr()?.port();
        self.socket = Some(socket);
        self.set_state(ComponentState::Gathering);

        let host = SocketAddr::new(host::host_ip(self.bind_ip), port);
        log::debug!("host candidate {}", host);
        let priority = Candidate::priority_for(CandidateType::Host, 65535, 1);
        self.candidates
            .push(Candidate::new("1", priority, host, CandidateType::Host));

        match self.stun_server {
            Some(server) => {
                log::debug!("binding request to {}", server);
                self.binding = Some(Binding::new(server));
                self.on_timers(Instant::now());
            }
            None => self.events.push_back(Event::GatheringDone),
        }

        Ok(())
    }

    fn local_descriptor(&self) -> Result<SessionDescriptor> {
        SessionDescriptor::new(
            self.local.ufrag.as_str(),
            self.local.password.as_str(),
            self.candidates.clone(),
        )
        .map_err(|e| Error::GatheringFailed(e.to_string()))
    }

    fn set_remote_credentials(&mut self, ufrag: &str, password: &str) -> Result<()> {
        self.remote = Some(Credentials::new(ufrag, password));
        Ok(())
    }

    fn set_remote_candidates(&mut self, candidates: &[Candidate]) -> Result<usize> {
        if self.remote.is_none() {
            return Err(Error::TransportFailed("remote credentials not set".into()));
        }

        for c in candidates {
            let addr = c.socket_addr();
            if !self.targets.contains(&addr) {
                self.targets.push(addr);
            }
        }

        self.deadline = Some(Instant::now() + self.timeout);
        self.last_check = None;
        self.set_state(ComponentState::Connecting);
        Ok(candidates.len())
    }

    fn send(&mut self, data: &[u8]) -> Result<usize> {
        let (socket, peer) = match (&self.socket, self.peer) {
            (Some(s), Some(p)) => (s, p),
            _ => return Err(Error::TransportFailed("not connected".into())),
        };

        let n = socket
            .send_to(&Self::tagged(DATA, data), peer)
            .map_err(|e| Error::TransportFailed(e.to_string()))?;
        self.last_sent = Some(Instant::now());
        Ok(n.saturating_sub(1))
    }

    fn poll_event(&mut self) -> Result<Option<Event>> {
        if self.events.is_empty() {
            self.step()?;
        }
        Ok(self.events.pop_front())
    }

    fn poll_fds(&self) -> Vec<BorrowedFd<'_>> {
        self.socket.iter().map(|s| s.as_fd()).collect()
    }
}
