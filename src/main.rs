use punchpipe::config::{LocalSpec, Mode, Role, SessionConfig};
use punchpipe::orchestrator::{Orchestrator, Outcome};
use punchpipe::rendezvous::CommandExchange;
use punchpipe::transport::Transport;
use punchpipe::{tcp, udp};
use std::io::{Error, ErrorKind, Result};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "punchpipe", about = "Pipe bytes to a peer behind NAT")]
struct Opt {
    /// 0 (callee) or 1 (caller)
    #[structopt(short = "c", long = "role")]
    role: Role,

    /// session name, part of the rendezvous key
    #[structopt(short = "H", long = "hostname")]
    hostname: Option<String>,

    #[structopt(long = "channel", default_value = "default")]
    channel: String,

    #[structopt(short = "s", long = "stun-host")]
    stun_host: Option<String>,

    #[structopt(short = "p", long = "stun-port", default_value = "3478")]
    stun_port: u16,

    /// datagram mode instead of a reliable stream
    #[structopt(short = "u", long = "not-reliable")]
    not_reliable: bool,

    /// caller listens on this port, callee connects to it
    #[structopt(short = "P", long = "forward-port")]
    forward_port: Option<u16>,

    /// rendezvous command, extra words are leading arguments
    #[structopt(long = "exchange", default_value = "./exchange.sh")]
    exchange: String,

    #[structopt(long = "bind")]
    bind: Option<IpAddr>,

    /// leave the descriptor in the store after connecting
    #[structopt(long = "keep-published")]
    keep_published: bool,

    /// seconds to wait for the peer's descriptor
    #[structopt(long = "lookup-timeout", default_value = "60")]
    lookup_timeout: u64,

    /// seconds to wait for connectivity checks
    #[structopt(long = "timeout", default_value = "30")]
    timeout: u64,

    #[structopt(short = "v", parse(from_occurrences))]
    verbose: u8,
}

fn main() {
    let opt = Opt::from_args();

    let level = match opt.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let code = match run(&opt) {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            log::error!("{}", e);
            Outcome::Failure.exit_code()
        }
    };
    std::process::exit(code);
}

fn run(opt: &Opt) -> Result<Outcome> {
    let config = session_config(opt)?;
    let exchange = CommandExchange::from_command_line(&opt.exchange)?;

    let outcome = match config.mode {
        Mode::Datagram => session(&config, udp::Agent::new(&config), exchange),
        Mode::Reliable => session(&config, tcp::Agent::new(&config), exchange),
    };
    Ok(outcome)
}

fn session<T: Transport>(config: &SessionConfig, transport: T, exchange: CommandExchange) -> Outcome {
    let mut o = Orchestrator::new(config, transport, exchange);
    if let Err(e) = o.run() {
        log::debug!("session ended with {}", e);
    }
    o.outcome().unwrap_or(Outcome::Failure)
}

fn session_config(opt: &Opt) -> Result<SessionConfig> {
    let mode = match opt.not_reliable {
        true => Mode::Datagram,
        false => Mode::Reliable,
    };

    let mut config = SessionConfig::new(opt.role, mode);
    config.session = opt.hostname.clone();
    config.channel = opt.channel.clone();
    config.unpublish = !opt.keep_published;
    config.bind_ip = opt.bind;
    config.lookup_timeout = Duration::from_secs(opt.lookup_timeout);
    config.negotiation_timeout = Duration::from_secs(opt.timeout);

    if let Some(port) = opt.forward_port {
        config.local = LocalSpec::forward(opt.role, port);
    }

    if let Some(host) = &opt.stun_host {
        config.stun = Some(resolve(host, opt.stun_port, opt.bind)?);
    }

    Ok(config)
}

/// First address of the bind address family, IPv4 by default.
fn resolve(host: &str, port: u16, bind: Option<IpAddr>) -> Result<SocketAddr> {
    let want_v6 = bind.map_or(false, |ip| ip.is_ipv6());
    (host, port)
        .to_socket_addrs()?
        .find(|addr| addr.is_ipv6() == want_v6)
        .ok_or_else(|| Error::new(ErrorKind::Other, format!("stun host {} has no address", host)))
}
