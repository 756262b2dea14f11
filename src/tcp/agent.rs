use crate::candidate::{Candidate, CandidateType};
use crate::config::SessionConfig;
use crate::descriptor::SessionDescriptor;
use crate::error::{Error, Result};
use crate::host::{self, Credentials};
use crate::poller;
use crate::transport::{ComponentState, Event, Transport};
use nix::errno::Errno;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::mem;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::{Duration, Instant};

const DIAL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_LINE: usize = 256;
const READ_BUF: usize = 64 * 1024;

/// a connect in flight
struct Dial {
    socket: Socket,
    target: SocketAddr,
}

/// an established connection still proving who is on the other end
struct Link {
    stream: TcpStream,
    peer: Option<SocketAddr>,
    pending: Vec<u8>,
    greeted: bool,
}

impl Link {
    fn new(stream: TcpStream, peer: Option<SocketAddr>) -> Self {
        Self {
            stream,
            peer,
            pending: Vec::new(),
            greeted: false,
        }
    }
}

enum Handshake {
    Pending,
    Drop,
    /// bytes that followed the handshake line
    Selected(Vec<u8>),
}

/// Reliable engine.
///
/// Listens and dials from the same port (TCP simultaneous open). Every
/// connection that comes up is verified with one line each way: the
/// controlling side sends `CHECK <remote ufrag>:<local ufrag> <remote password>`,
/// the controlled side answers `ACK <remote ufrag>:<local ufrag>` on the
/// first connection it accepts. That connection carries the relayed bytes.
pub struct Agent {
    controlling: bool,
    bind_ip: Option<IpAddr>,
    timeout: Duration,
    local: Credentials,
    remote: Option<Credentials>,
    listener: Option<Socket>,
    bound: Option<SocketAddr>,
    candidates: Vec<Candidate>,
    targets: Vec<SocketAddr>,
    dials: Vec<Dial>,
    links: Vec<Link>,
    stream: Option<TcpStream>,
    state: ComponentState,
    last_dial: Option<Instant>,
    deadline: Option<Instant>,
    events: VecDeque<Event>,
    buf: Vec<u8>,
}

impl Agent {
    pub fn new(config: &SessionConfig) -> Self {
        if config.stun.is_some() {
            log::warn!("stun server is not used in reliable mode");
        }

        Self {
            controlling: config.role.is_controlling(),
            bind_ip: config.bind_ip,
            timeout: config.negotiation_timeout,
            local: Credentials::random(),
            remote: None,
            listener: None,
            bound: None,
            candidates: Vec::new(),
            targets: Vec::new(),
            dials: Vec::new(),
            links: Vec::new(),
            stream: None,
            state: ComponentState::Disconnected,
            last_dial: None,
            deadline: None,
            events: VecDeque::new(),
            buf: vec![0; READ_BUF],
        }
    }

    /// address the listener and every dial are bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound
    }

    /// remote end of the selected connection
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    fn set_state(&mut self, state: ComponentState) {
        if self.state != state {
            log::debug!("component {:?} -> {:?}", self.state, state);
            self.state = state;
            self.events.push_back(Event::StateChanged(state));
        }
    }

    fn bind(local_addr: SocketAddr) -> io::Result<Socket> {
        let s = Socket::new(Domain::for_address(local_addr), Type::STREAM, Some(Protocol::TCP))?;
        s.set_reuse_address(true)?;
        #[cfg(unix)]
        s.set_reuse_port(true)?;
        s.bind(&local_addr.into())?;

        Ok(s)
    }

    fn start_connect(s: Socket, target: SocketAddr) -> io::Result<Socket> {
        s.set_nonblocking(true)?;
        match s.connect(&target.into()) {
            Ok(()) => Ok(s),
            Err(e)
                if e.raw_os_error() == Some(Errno::EINPROGRESS as i32)
                    || e.kind() == ErrorKind::WouldBlock =>
            {
                Ok(s)
            }
            Err(e) => Err(e),
        }
    }

    fn step(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return self.read_stream();
        }

        self.accept();

        if let Some(deadline) = self.deadline {
            let now = Instant::now();
            if now > deadline {
                log::warn!("no remote candidate answered");
                self.deadline = None;
                self.dials.clear();
                self.links.clear();
                self.set_state(ComponentState::Failed);
                return Ok(());
            }
            self.dial(now);
        }

        self.progress_dials();

        let links = mem::take(&mut self.links);
        for mut link in links {
            if self.stream.is_some() {
                break;
            }
            match self.advance(&mut link) {
                Handshake::Pending => self.links.push(link),
                Handshake::Drop => log::debug!("dropped connection with {:?}", link.peer),
                Handshake::Selected(rest) => self.select(link, rest)?,
            }
        }

        Ok(())
    }

    fn accept(&mut self) {
        let listener = match &self.listener {
            Some(l) => l,
            None => return,
        };

        loop {
            match listener.accept() {
                Ok((s, addr)) => {
                    let peer = addr.as_socket();
                    log::debug!("accepted {:?}", peer);
                    if let Err(e) = s.set_nonblocking(true) {
                        log::debug!("drop accepted {:?}: {}", peer, e);
                        continue;
                    }
                    self.links.push(Link::new(s.into(), peer));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("accept: {}", e);
                    break;
                }
            }
        }
    }

    fn dial(&mut self, now: Instant) {
        let due = self
            .last_dial
            .map_or(true, |t| now.duration_since(t) >= DIAL_INTERVAL);
        let bound = match (due, self.bound) {
            (true, Some(b)) => b,
            _ => return,
        };
        self.last_dial = Some(now);

        for target in self.targets.clone() {
            if self.candidates.iter().any(|c| c.socket_addr() == target)
                || self.dials.iter().any(|d| d.target == target)
            {
                continue;
            }

            match Self::bind(bound).and_then(|s| Self::start_connect(s, target)) {
                Ok(socket) => {
                    log::trace!("dialing {}", target);
                    self.dials.push(Dial { socket, target });
                }
                Err(e) => log::debug!("dial {} failed: {}", target, e),
            }
        }
    }

    fn progress_dials(&mut self) {
        for dial in mem::take(&mut self.dials) {
            match dial.socket.take_error() {
                Ok(None) => {}
                Ok(Some(e)) | Err(e) => {
                    log::debug!("dial {} failed: {}", dial.target, e);
                    continue;
                }
            }

            if dial.socket.peer_addr().is_ok() {
                log::debug!("connected to {}", dial.target);
                self.links
                    .push(Link::new(dial.socket.into(), Some(dial.target)));
            } else {
                self.dials.push(dial);
            }
        }
    }

    fn advance(&self, link: &mut Link) -> Handshake {
        let remote = match &self.remote {
            Some(r) => r,
            None => return Handshake::Pending,
        };

        if self.controlling && !link.greeted {
            let check = format!(
                "CHECK {}:{} {}\n",
                remote.ufrag, self.local.ufrag, remote.password
            );
            if let Err(e) = link.stream.write_all(check.as_bytes()) {
                log::debug!("check to {:?}: {}", link.peer, e);
                return Handshake::Drop;
            }
            link.greeted = true;
        }

        let mut buf = [0u8; MAX_LINE];
        loop {
            match link.stream.read(&mut buf) {
                Ok(0) => return Handshake::Drop,
                Ok(n) => link.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("read from {:?}: {}", link.peer, e);
                    return Handshake::Drop;
                }
            }
        }

        let pos = match link.pending.iter().position(|&b| b == b'\n') {
            Some(pos) => pos,
            None if link.pending.len() > MAX_LINE => return Handshake::Drop,
            None => return Handshake::Pending,
        };
        let line = String::from_utf8_lossy(&link.pending[..pos]).into_owned();
        let rest = link.pending[pos + 1..].to_vec();

        if self.controlling {
            if line == format!("ACK {}:{}", self.local.ufrag, remote.ufrag) {
                return Handshake::Selected(rest);
            }
        } else if line
            == format!(
                "CHECK {}:{} {}",
                self.local.ufrag, remote.ufrag, self.local.password
            )
        {
            let ack = format!("ACK {}:{}\n", remote.ufrag, self.local.ufrag);
            return match link.stream.write_all(ack.as_bytes()) {
                Ok(()) => Handshake::Selected(rest),
                Err(e) => {
                    log::debug!("ack to {:?}: {}", link.peer, e);
                    Handshake::Drop
                }
            };
        }

        log::debug!("unexpected handshake from {:?}", link.peer);
        Handshake::Drop
    }

    fn select(&mut self, link: Link, rest: Vec<u8>) -> Result<()> {
        log::info!("selected remote {:?}", link.peer);
        link.stream.set_nonblocking(false)?;
        link.stream.set_nodelay(true)?;

        self.stream = Some(link.stream);
        self.listener = None;
        self.dials.clear();
        self.deadline = None;

        self.set_state(ComponentState::Connected);
        self.set_state(ComponentState::Ready);
        self.events.push_back(Event::Writable);
        if !rest.is_empty() {
            self.events.push_back(Event::Received(rest));
        }
        Ok(())
    }

    fn read_stream(&mut self) -> Result<()> {
        let stream = match &mut self.stream {
            Some(s) => s,
            None => return Ok(()),
        };
        if !poller::readable(stream.as_fd())? {
            return Ok(());
        }

        match stream.read(&mut self.buf) {
            Ok(0) => {
                log::info!("remote closed the connection");
                self.stream = None;
                self.set_state(ComponentState::Disconnected);
            }
            Ok(n) => self.events.push_back(Event::Received(self.buf[..n].to_vec())),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                log::warn!("connection lost: {}", e);
                self.stream = None;
                self.set_state(ComponentState::Failed);
            }
        }

        Ok(())
    }
}

impl Transport for Agent {
    fn gather(&mut self) -> Result<()> {
        let listener = Self::bind(host::bind_addr(self.bind_ip))
            .and_then(|s| {
                s.listen(8)?;
                s.set_nonblocking(true)?;
                Ok(s)
            })
            .map_err(|e| Error::GatheringFailed(e.to_string()))?;
        let bound = listener
            .local_addr()?
            .as_socket()
            .ok_or_else(|| Error::GatheringFailed("listener has no address".into()))?;
        self.listener = Some(listener);
        self.bound = Some(bound);
        self.set_state(ComponentState::Gathering);

        let host = SocketAddr::new(host::host_ip(self.bind_ip), bound.port());
        log::debug!("host candidate {}", host);
        let priority = Candidate::priority_for(CandidateType::Host, 65535, 1);
        self.candidates
            .push(Candidate::new("1", priority, host, CandidateType::Host));
        self.events.push_back(Event::GatheringDone);

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
        self.last_dial = None;
        self.set_state(ComponentState::Connecting);
        Ok(candidates.len())
    }

    fn send(&mut self, data: &[u8]) -> Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::TransportFailed("not writable".into()))?;
        stream
            .write_all(data)
            .map_err(|e| Error::TransportFailed(e.to_string()))?;
        Ok(data.len())
    }

    fn poll_event(&mut self) -> Result<Option<Event>> {
        if self.events.is_empty() {
            self.step()?;
        }
        Ok(self.events.pop_front())
    }

    fn poll_fds(&self) -> Vec<BorrowedFd<'_>> {
        let mut fds: Vec<BorrowedFd<'_>> = Vec::new();
        if let Some(l) = &self.listener {
            fds.push(l.as_fd());
        }
        fds.extend(self.links.iter().map(|l| l.stream.as_fd()));
        if let Some(s) = &self.stream {
            fds.push(s.as_fd());
        }
        fds
    }
}
