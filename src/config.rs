use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Callee = 0,
    Caller = 1,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Callee => Role::Caller,
            Role::Caller => Role::Callee,
        }
    }

    /// the caller drives nomination
    pub fn is_controlling(self) -> bool {
        self == Role::Caller
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0" | "callee" => Ok(Role::Callee),
            "1" | "caller" => Ok(Role::Caller),
            _ => Err(format!("invalid role `{}`, expect 0|1", s)),
        }
    }
}

/// Transport contract, fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Reliable,
    Datagram,
}

/// Where relayed bytes come from and go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalSpec {
    Stdio,
    /// accept one connection on this port
    Listen(u16),
    /// connect to this port on localhost
    Connect(u16),
}

impl LocalSpec {
    /// Caller listens, callee connects.
    pub fn forward(role: Role, port: u16) -> Self {
        match role {
            Role::Caller => LocalSpec::Listen(port),
            Role::Callee => LocalSpec::Connect(port),
        }
    }
}

/// Immutable session settings, built once at startup.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub role: Role,
    /// session (remote host) name, part of the rendezvous key
    pub session: Option<String>,
    pub channel: String,
    pub mode: Mode,
    pub local: LocalSpec,
    /// retract the published descriptor once the transport is ready
    pub unpublish: bool,
    pub stun: Option<SocketAddr>,
    pub bind_ip: Option<IpAddr>,
    pub lookup_timeout: Duration,
    pub lookup_interval: Duration,
    pub negotiation_timeout: Duration,
}

impl SessionConfig {
    pub fn new(role: Role, mode: Mode) -> Self {
        Self {
            role,
            session: None,
            channel: "default".into(),
            mode,
            local: LocalSpec::Stdio,
            unpublish: true,
            stun: None,
            bind_ip: None,
            lookup_timeout: Duration::from_secs(60),
            lookup_interval: Duration::from_secs(1),
            negotiation_timeout: Duration::from_secs(30),
        }
    }
}
