//! Candidate wire form: `foundation,priority,address,port,type`.

use crate::error::CandidateError;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Longest foundation kept, longer ones are truncated.
pub const MAX_FOUNDATION_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    pub fn name(self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        }
    }

    /// RFC 8445 type preference.
    pub fn preference(self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relay => 0,
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CandidateType {
    type Err = CandidateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(CandidateType::Host),
            "srflx" => Ok(CandidateType::ServerReflexive),
            "prflx" => Ok(CandidateType::PeerReflexive),
            "relay" => Ok(CandidateType::Relay),
            _ => Err(CandidateError::UnknownType(s.to_string())),
        }
    }
}

/// One address a peer may be reached at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    foundation: String,
    pub priority: u32,
    pub addr: IpAddr,
    pub port: u16,
    pub kind: CandidateType,
}

impl Candidate {
    /// Separator characters (`,` and whitespace) are dropped from `foundation`
    /// so the candidate always encodes to a decodable token.
    pub fn new(foundation: &str, priority: u32, addr: SocketAddr, kind: CandidateType) -> Self {
        let foundation: String = foundation
            .chars()
            .filter(|c| *c != ',' && !c.is_whitespace())
            .collect();

        Self {
            foundation: truncate(&foundation).to_string(),
            priority,
            addr: addr.ip(),
            port: addr.port(),
            kind,
        }
    }

    pub fn foundation(&self) -> &str {
        &self.foundation
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// `(2^24)*type_pref + (2^8)*local_pref + (256 - component)`
    pub fn priority_for(kind: CandidateType, local_pref: u16, component: u8) -> u32 {
        (kind.preference() << 24) + ((local_pref as u32) << 8) + (256 - component as u32)
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn decode(s: &str) -> Result<Self, CandidateError> {
        s.parse()
    }
}

fn truncate(foundation: &str) -> &str {
    match foundation.char_indices().nth(MAX_FOUNDATION_LEN) {
        Some((idx, _)) => &foundation[..idx],
        None => foundation,
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{}",
            self.foundation, self.priority, self.addr, self.port, self.kind
        )
    }
}

impl FromStr for Candidate {
    type Err = CandidateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(',').collect();
        if fields.len() != 5 {
            return Err(CandidateError::FieldCount(fields.len()));
        }

        let kind: CandidateType = fields[4].parse()?;

        let addr: IpAddr = fields[2]
            .parse()
            .map_err(|_| CandidateError::Address(fields[2].to_string()))?;

        // malformed numbers read as 0, the way peers have always been lenient here
        let priority = fields[1].parse().unwrap_or_else(|_| {
            log::debug!("candidate priority `{}` read as 0", fields[1]);
            0
        });
        let port = fields[3].parse().unwrap_or_else(|_| {
            log::debug!("candidate port `{}` read as 0", fields[3]);
            0
        });

        Ok(Self {
            foundation: truncate(fields[0]).to_string(),
            priority,
            addr,
            port,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        let c = Candidate::new(
            "1",
            2000,
            "192.0.2.1:5000".parse().unwrap(),
            CandidateType::Host,
        );
        assert_eq!(c.encode(), "1,2000,192.0.2.1,5000,host");
    }

    #[test]
    fn test_round_trip() {
        for s in [
            "1,2000,192.0.2.1,5000,host",
            "5,1500,203.0.113.9,6000,srflx",
            "abc,4294967295,::1,65535,prflx",
            "z,0,2001:db8::7,1,relay",
        ] {
            let c = Candidate::decode(s).unwrap();
            assert_eq!(c.encode(), s);
            assert_eq!(Candidate::decode(&c.encode()).unwrap(), c);
        }
    }

    #[test]
    fn test_field_count() {
        assert_eq!(
            Candidate::decode("1,2000,192.0.2.1,5000"),
            Err(CandidateError::FieldCount(4))
        );
        assert_eq!(
            Candidate::decode("1,2000,192.0.2.1,5000,host,x"),
            Err(CandidateError::FieldCount(6))
        );
        assert_eq!(Candidate::decode(""), Err(CandidateError::FieldCount(1)));
    }

    #[test]
    fn test_unknown_type() {
        assert_eq!(
            Candidate::decode("1,2000,192.0.2.1,5000,HOST"),
            Err(CandidateError::UnknownType("HOST".into()))
        );
    }

    #[test]
    fn test_bad_address() {
        assert_eq!(
            Candidate::decode("A,100,bad-address,5000,host"),
            Err(CandidateError::Address("bad-address".into()))
        );
    }

    #[test]
    fn test_lenient_numbers() {
        let c = Candidate::decode("f,high,10.0.0.1,99999,host").unwrap();
        assert_eq!(c.priority, 0);
        assert_eq!(c.port, 0);
    }

    #[test]
    fn test_foundation_truncated() {
        let long = "x".repeat(40);
        let c = Candidate::decode(&format!("{},1,10.0.0.1,1,host", long)).unwrap();
        assert_eq!(c.foundation().len(), MAX_FOUNDATION_LEN);
    }

    #[test]
    fn test_foundation_separators_dropped() {
        let c = Candidate::new(
            "a, b\tc",
            100,
            "10.0.0.1:4000".parse().unwrap(),
            CandidateType::Host,
        );
        assert_eq!(c.foundation(), "abc");
        assert_eq!(c.encode(), "abc,100,10.0.0.1,4000,host");
        assert_eq!(Candidate::decode(&c.encode()).unwrap(), c);

        let d = crate::SessionDescriptor::new("u", "p", vec![c.clone()]).unwrap();
        assert_eq!(crate::SessionDescriptor::decode(&d.encode()).unwrap(), d);
    }

    #[test]
    fn test_priority_formula() {
        assert_eq!(
            Candidate::priority_for(CandidateType::Host, 65535, 1),
            2130706431
        );
    }
}
