//!A peer-to-peer byte pipe between two hosts behind NAT or firewall.
//!
//!Two processes, a caller and a callee, each gather their local candidates, publish them through
//!an external rendezvous command, look up the other side, and run connectivity checks until a
//!direct path is found. From then on bytes flow between a local endpoint (stdin/stdout, or a
//!forwarded TCP port) and the peer.
//!
//!## How it works
//!Each side builds a session descriptor, one text line:
//!`<ufrag> <password> <candidate> ...` where every candidate is
//!`<foundation>,<priority>,<address>,<port>,<type>`.
//!
//!The line is handed to the exchange command as `<role> [<host>] publish <channel>` on stdin, and
//!the peer's line is fetched with `<peer role> [<host>] lookup <channel>`. The command may be anything
//!that stores a line somewhere both sides can reach, a shell script over ssh is enough.
//!
//!Once the remote line is known the engine verifies candidates with the exchanged credentials:
//!- datagram mode: one UDP socket, optional STUN for the server reflexive address.
//!- reliable mode: TCP simultaneous open, listening and dialing from the same port.
//!
//!The same port trick depends on SO_REUSEADDR and SO_REUSEPORT, so it is OS dependent.
//!
//!## Feature flags
//!- `udp`: datagram engine [`udp::Agent`]
//!- `tcp`: reliable engine [`tcp::Agent`]
//!
//!The binary needs both, plus `env_logger` and `structopt`.
//!
//!```no_run
//!use punchpipe::config::{Mode, Role, SessionConfig};
//!use punchpipe::orchestrator::Orchestrator;
//!use punchpipe::rendezvous::CommandExchange;
//!
//!let config = SessionConfig::new(Role::Caller, Mode::Datagram);
//!let exchange = CommandExchange::new("./exchange.sh");
//!let mut o = Orchestrator::new(&config, punchpipe::udp::Agent::new(&config), exchange);
//!let _ = o.run();
//!std::process::exit(o.outcome().map_or(1, |o| o.exit_code()));
//!```

pub mod candidate;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod host;
pub mod orchestrator;
pub mod poller;
pub mod relay;
pub mod rendezvous;
pub mod transport;

#[cfg(feature = "tcp")]
pub mod tcp;
#[cfg(feature = "udp")]
pub mod udp;

pub use candidate::{Candidate, CandidateType};
pub use descriptor::SessionDescriptor;
pub use error::{Error, Result};
