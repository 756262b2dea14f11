//! Just enough STUN (RFC 5389) to learn the server reflexive address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const MAGIC_COOKIE: u32 = 0x2112_A442;
const HEADER_LEN: usize = 20;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const RETRANSMIT: Duration = Duration::from_millis(500);
const GIVE_UP: Duration = Duration::from_secs(3);

/// An outstanding binding request.
pub struct Binding {
    server: SocketAddr,
    txid: [u8; 12],
    started: Instant,
    last_sent: Option<Instant>,
}

impl Binding {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            txid: rand::random(),
            started: Instant::now(),
            last_sent: None,
        }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn request(&self) -> [u8; HEADER_LEN] {
        let mut req = [0u8; HEADER_LEN];
        req[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
        req[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        req[8..20].copy_from_slice(&self.txid);
        req
    }

    /// true when the request should be (re)sent now
    pub fn due(&mut self, now: Instant) -> bool {
        match self.last_sent {
            Some(t) if now.duration_since(t) < RETRANSMIT => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }

    pub fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.started) > GIVE_UP
    }

    /// Mapped address from a success response to this request.
    pub fn parse_response(&self, buf: &[u8]) -> Option<SocketAddr> {
        if buf.len() < HEADER_LEN {
            return None;
        }

        let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if msg_type != BINDING_SUCCESS
            || buf[4..8] != MAGIC_COOKIE.to_be_bytes()
            || buf[8..20] != self.txid
        {
            return None;
        }

        let mut attrs = buf.get(HEADER_LEN..HEADER_LEN + len)?;
        let mut mapped = None;
        while attrs.len() >= 4 {
            let kind = u16::from_be_bytes([attrs[0], attrs[1]]);
            let alen = u16::from_be_bytes([attrs[2], attrs[3]]) as usize;
            let value = attrs.get(4..4 + alen)?;

            match kind {
                ATTR_XOR_MAPPED_ADDRESS => return decode_address(value, Some(&buf[4..20])),
                ATTR_MAPPED_ADDRESS => mapped = decode_address(value, None),
                _ => {}
            }

            // attributes are padded to 4 bytes
            let padded = (alen + 3) & !3;
            attrs = attrs.get(4 + padded..).unwrap_or(&[]);
        }

        mapped
    }
}

/// `mask` is cookie + transaction id for XOR-MAPPED-ADDRESS.
fn decode_address(value: &[u8], mask: Option<&[u8]>) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }

    let unmask = |bytes: &[u8]| -> Vec<u8> {
        match mask {
            Some(m) => bytes.iter().zip(m).map(|(b, m)| b ^ m).collect(),
            None => bytes.to_vec(),
        }
    };

    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if mask.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip: IpAddr = match value[1] {
        0x01 => {
            let b: [u8; 4] = unmask(value.get(4..8)?).try_into().ok()?;
            Ipv4Addr::from(b).into()
        }
        0x02 => {
            let b: [u8; 16] = unmask(value.get(4..20)?).try_into().ok()?;
            Ipv6Addr::from(b).into()
        }
        _ => return None,
    };

    Some(SocketAddr::new(ip, port))
}
