//! Local credentials and host address discovery shared by the engines.

use rand::{distributions::Alphanumeric, Rng};
use std::io::Result;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

pub const UFRAG_LEN: usize = 8;
pub const PASSWORD_LEN: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ufrag: String,
    pub password: String,
}

impl Credentials {
    pub fn new<U: Into<String>, P: Into<String>>(ufrag: U, password: P) -> Self {
        Self {
            ufrag: ufrag.into(),
            password: password.into(),
        }
    }

    pub fn random() -> Self {
        Self::new(token(UFRAG_LEN), token(PASSWORD_LEN))
    }
}

fn token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Address to bind engine sockets to.
pub fn bind_addr(bind_ip: Option<IpAddr>) -> SocketAddr {
    SocketAddr::new(bind_ip.unwrap_or(Ipv4Addr::UNSPECIFIED.into()), 0)
}

/// Address advertised in the host candidate.
///
/// An unspecified bind address is resolved to the interface the default
/// route leaves through; no packet is sent.
pub fn host_ip(bind_ip: Option<IpAddr>) -> IpAddr {
    match bind_ip {
        Some(ip) if !ip.is_unspecified() => ip,
        _ => match route_ip() {
            Ok(ip) => ip,
            Err(e) => {
                log::warn!("no default route ({}), advertising loopback", e);
                Ipv4Addr::LOCALHOST.into()
            }
        },
    }
}

fn route_ip() -> Result<IpAddr> {
    let s = UdpSocket::bind("0.0.0.0:0")?;
    s.connect("8.8.8.8:53")?;
    Ok(s.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_credentials() {
        let a = Credentials::random();
        let b = Credentials::random();
        assert_eq!(a.ufrag.len(), UFRAG_LEN);
        assert_eq!(a.password.len(), PASSWORD_LEN);
        assert!(a.ufrag.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_host_ip() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(host_ip(Some(ip)), ip);
        assert!(!host_ip(None).is_unspecified());
        assert_eq!(bind_addr(None).to_string(), "0.0.0.0:0");
    }
}
