//! Session sequencing: gather, publish, lookup, negotiate, relay.

use crate::config::{LocalSpec, Mode, SessionConfig};
use crate::error::{Error, Result};
use crate::poller;
use crate::relay::{self, LocalEndpoint, Pump, RelayBridge, MAX_CHUNK};
use crate::rendezvous::{Exchange, RendezvousClient};
use crate::transport::{ComponentState, Event, Transport};
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpListener};
use std::os::fd::AsFd;

/// poll timeout, engines run their timers on this tick
const TICK_MS: u16 = 100;

/// Bound on engine events handled before the local endpoint gets a turn.
const MAX_EVENTS_PER_TURN: usize = 64;

/// Most inbound bytes kept while no local endpoint is open.
///
/// Engine events stop being drained once a chunk is held, so this is only
/// reached by a single oversized delivery.
const MAX_HELD: usize = 8 * MAX_CHUNK;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::Failure => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Gathering,
    Publishing,
    LookingUp,
    AwaitingNegotiation,
    Relaying,
    Terminated(Outcome),
}

enum Local {
    Closed,
    /// forward mode, waiting for the one local client
    Listening(TcpListener),
    Open(LocalEndpoint),
}

pub struct Orchestrator<'a, T, E> {
    config: &'a SessionConfig,
    transport: T,
    rendezvous: RendezvousClient<E>,
    state: State,
    local: Local,
    bridge: RelayBridge,
    /// inbound bytes waiting for the local endpoint
    held: Vec<u8>,
}

impl<'a, T: Transport, E: Exchange> Orchestrator<'a, T, E> {
    pub fn new(config: &'a SessionConfig, transport: T, exchange: E) -> Self {
        Self {
            config,
            transport,
            rendezvous: RendezvousClient::new(config, exchange),
            state: State::Idle,
            local: Local::Closed,
            bridge: RelayBridge::new(config.mode),
            held: Vec::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self.state {
            State::Terminated(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.outcome().is_some()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn rendezvous(&self) -> &RendezvousClient<E> {
        &self.rendezvous
    }

    /// Address of the forwarding listener while it waits for its client.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        match &self.local {
            Local::Listening(l) => l.local_addr().ok(),
            _ => None,
        }
    }

    /// Run the session to completion on the current thread.
    pub fn run(&mut self) -> Result<()> {
        self.start()?;

        while !self.is_terminated() {
            let local_ready = match self.wait() {
                Ok(ready) => ready,
                Err(e) => return self.guard(move |_| Err(e)),
            };

            self.drain_events()?;

            if local_ready && !self.is_terminated() {
                self.on_local_readable()?;
            }
        }

        Ok(())
    }

    /// Idle -> Gathering.
    pub fn start(&mut self) -> Result<()> {
        self.guard(|this| {
            if this.state != State::Idle {
                return Ok(());
            }

            if let LocalSpec::Listen(port) = this.config.local {
                this.local = Local::Listening(relay::listen(port)?);
            }

            this.enter(State::Gathering);
            this.transport.gather().map_err(|e| match e {
                Error::GatheringFailed(_) => e,
                e => Error::GatheringFailed(e.to_string()),
            })
        })
    }

    pub fn handle_event(&mut self, event: Event) -> Result<()> {
        self.guard(|this| this.transition(event))
    }

    /// Relay one outbound cycle, or accept the local client in forward mode.
    pub fn on_local_readable(&mut self) -> Result<()> {
        self.guard(|this| this.relay_local())
    }

    fn guard<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let r = f(self);
        if let Err(e) = &r {
            log::error!("failed while {:?}: {}", self.state, e);
            self.finish(Outcome::Failure);
        }
        r
    }

    fn enter(&mut self, state: State) {
        log::debug!("{:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn finish(&mut self, outcome: Outcome) {
        if self.is_terminated() {
            return;
        }

        self.enter(State::Terminated(outcome));
        self.local = Local::Closed;
        log::info!(
            "relayed {} bytes out, {} bytes in",
            self.bridge.sent(),
            self.bridge.received()
        );
    }

    fn transition(&mut self, event: Event) -> Result<()> {
        let mode = self.config.mode;

        match (self.state, event) {
            (State::Terminated(_), _) => Ok(()),
            (_, Event::StateChanged(ComponentState::Failed)) => {
                Err(Error::TransportFailed("negotiation failed".into()))
            }
            (State::Gathering, Event::GatheringDone) => self.exchange_credentials(),
            (State::AwaitingNegotiation, Event::StateChanged(ComponentState::Ready))
                if mode == Mode::Datagram =>
            {
                self.start_relay()
            }
            (State::AwaitingNegotiation, Event::Writable) if mode == Mode::Reliable => {
                self.start_relay()
            }
            (State::AwaitingNegotiation | State::Relaying, Event::Received(data)) => {
                self.on_received(data)
            }
            (State::Relaying, Event::StateChanged(ComponentState::Disconnected)) => {
                log::info!("peer closed the transport");
                self.finish(Outcome::Success);
                Ok(())
            }
            (state, Event::StateChanged(s)) => {
                log::debug!("component {:?} while {:?}", s, state);
                Ok(())
            }
            (state, event) => {
                log::debug!("ignoring {:?} while {:?}", event, state);
                Ok(())
            }
        }
    }

    fn exchange_credentials(&mut self) -> Result<()> {
        log::debug!("candidate gathering done");

        self.enter(State::Publishing);
        let local = self.transport.local_descriptor()?;
        self.rendezvous.publish(&local)?;

        self.enter(State::LookingUp);
        let remote = self.rendezvous.lookup()?;

        self.transport
            .set_remote_credentials(&remote.ufrag, &remote.password)?;
        // negotiation starts here
        if self.transport.set_remote_candidates(&remote.candidates)? < 1 {
            return Err(Error::TransportFailed(
                "no remote candidate accepted".into(),
            ));
        }

        self.enter(State::AwaitingNegotiation);
        log::debug!("waiting for the transport to become ready");
        Ok(())
    }

    fn start_relay(&mut self) -> Result<()> {
        log::info!("transport ready");

        if self.config.unpublish {
            self.rendezvous.unpublish();
        }

        match self.config.local {
            LocalSpec::Stdio => self.local = Local::Open(LocalEndpoint::stdio()?),
            LocalSpec::Connect(port) => {
                self.local = Local::Open(LocalEndpoint::connect(port).map_err(Error::RelayIo)?)
            }
            LocalSpec::Listen(_) => {}
        }

        self.enter(State::Relaying);
        self.flush_held()
    }

    fn on_received(&mut self, data: Vec<u8>) -> Result<()> {
        match &mut self.local {
            Local::Open(endpoint) if self.state == State::Relaying => {
                self.bridge.deliver(endpoint, &data)
            }
            _ => {
                if self.held.len() + data.len() > MAX_HELD {
                    return Err(Error::RelayIo(io::Error::new(
                        ErrorKind::Other,
                        format!(
                            "{} inbound bytes held with no local endpoint",
                            self.held.len() + data.len()
                        ),
                    )));
                }
                log::trace!("holding {} bytes", data.len());
                self.held.extend_from_slice(&data);
                Ok(())
            }
        }
    }

    fn flush_held(&mut self) -> Result<()> {
        if self.held.is_empty() {
            return Ok(());
        }

        if let Local::Open(endpoint) = &mut self.local {
            let held = std::mem::take(&mut self.held);
            self.bridge.deliver(endpoint, &held)?;
        }
        Ok(())
    }

    fn relay_local(&mut self) -> Result<()> {
        if self.state != State::Relaying {
            return Ok(());
        }

        let accepted = match &self.local {
            Local::Listening(l) => Some(l.accept()),
            _ => None,
        };

        match accepted {
            // the listener is dropped here, later clients are refused
            Some(Ok((s, addr))) => {
                log::info!("accepted local connection from {}", addr);
                self.local = Local::Open(LocalEndpoint::from_stream(s).map_err(Error::RelayIo)?);
                return self.flush_held();
            }
            Some(Err(e)) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
            Some(Err(e)) => return Err(Error::RelayIo(e)),
            None => {}
        }

        if let Local::Open(endpoint) = &mut self.local {
            if self.bridge.pump(endpoint, &mut self.transport)? == Pump::Closed {
                log::info!("local end of stream");
                self.finish(Outcome::Success);
            }
        }
        Ok(())
    }

    /// Relaying without a local endpoint and a chunk already held: the
    /// transport is left unread so the peer sees backpressure.
    fn inbound_paused(&self) -> bool {
        self.state == State::Relaying
            && !matches!(self.local, Local::Open(_))
            && self.held.len() >= MAX_CHUNK
    }

    /// Wait one tick; true when the local side is readable.
    fn wait(&self) -> Result<bool> {
        let mut fds = match self.inbound_paused() {
            true => Vec::new(),
            false => self.transport.poll_fds(),
        };

        let local = match &self.local {
            Local::Listening(l) if self.state == State::Relaying => Some(l.as_fd()),
            Local::Open(endpoint) => Some(endpoint.fd()),
            _ => None,
        };
        if let Some(fd) = local {
            fds.push(fd);
        }

        let ready = poller::wait_readable(&fds, TICK_MS)?;
        Ok(local.is_some() && ready.last() == Some(&true))
    }

    fn drain_events(&mut self) -> Result<()> {
        for _ in 0..MAX_EVENTS_PER_TURN {
            if self.is_terminated() || self.inbound_paused() {
                break;
            }

            let event = match self.transport.poll_event() {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => return self.guard(move |_| Err(e)),
            };

            log::trace!("event {:?}", event);
            self.handle_event(event)?;
        }
        Ok(())
    }
}
