//! Datagram transport.
//!
//! use `Agent` to gather candidates and run connectivity checks over UDP.

mod agent;
mod stun;

pub use agent::Agent;

#[cfg(test)]
mod tests {
    use super::Agent;
    use crate::config::{Mode, Role, SessionConfig};
    use crate::transport::{ComponentState, Event, Transport};
    use socket2::{Domain, Protocol, Socket, Type};
    use std::net::{SocketAddr, UdpSocket};
    use std::thread::sleep;
    use std::time::{Duration, Instant};

    fn agent(role: Role, timeout: Duration) -> Agent {
        let mut config = SessionConfig::new(role, Mode::Datagram);
        config.bind_ip = Some("127.0.0.1".parse().unwrap());
        config.negotiation_timeout = timeout;
        let mut a = Agent::new(&config);
        a.gather().unwrap();
        assert_eq!(a.poll_event().unwrap(), Some(Event::StateChanged(ComponentState::Gathering)));
        assert_eq!(a.poll_event().unwrap(), Some(Event::GatheringDone));
        a
    }

    fn introduce(a: &mut Agent, b: &Agent) {
        let remote = b.local_descriptor().unwrap();
        a.set_remote_credentials(&remote.ufrag, &remote.password)
            .unwrap();
        assert_eq!(a.set_remote_candidates(&remote.candidates).unwrap(), 1);
    }

    /// poll both until `until` holds for the events seen so far
    fn drive<F>(a: &mut Agent, b: &mut Agent, mut until: F) -> (Vec<Event>, Vec<Event>)
    where
        F: FnMut(&[Event], &[Event]) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        let (mut seen_a, mut seen_b) = (Vec::new(), Vec::new());
        while Instant::now() < deadline {
            while let Some(e) = a.poll_event().unwrap() {
                seen_a.push(e);
            }
            while let Some(e) = b.poll_event().unwrap() {
                seen_b.push(e);
            }
            if until(&seen_a, &seen_b) {
                return (seen_a, seen_b);
            }
            sleep(Duration::from_millis(5));
        }
        panic!("timed out, seen {:?} and {:?}", seen_a, seen_b);
    }

    fn ready(events: &[Event]) -> bool {
        events.contains(&Event::StateChanged(ComponentState::Ready))
    }

    #[test]
    fn test_connect_and_send() {
        let timeout = Duration::from_secs(5);
        let mut a = agent(Role::Caller, timeout);
        let mut b = agent(Role::Callee, timeout);

        let desc = a.local_descriptor().unwrap();
        assert_eq!(desc.candidates[0].socket_addr(), a.local_addr().unwrap());

        introduce(&mut a, &b);
        introduce(&mut b, &a);

        let (seen_a, _) = drive(&mut a, &mut b, |a, b| ready(a) && ready(b));
        assert!(seen_a.contains(&Event::StateChanged(ComponentState::Connected)));
        assert_eq!(a.peer_addr(), b.local_addr());
        assert_eq!(b.peer_addr(), a.local_addr());

        assert_eq!(a.send(b"hello").unwrap(), 5);
        let (_, seen_b) = drive(&mut a, &mut b, |_, b| !b.is_empty());
        assert_eq!(seen_b, vec![Event::Received(b"hello".to_vec())]);
    }

    #[test]
    fn test_no_answer_fails() {
        let mut a = agent(Role::Caller, Duration::from_millis(300));
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let remote = format!(
            "ufragB passB 1,100,127.0.0.1,{},host",
            silent.local_addr().unwrap().port()
        );
        let remote = crate::SessionDescriptor::decode(&remote).unwrap();

        a.set_remote_credentials(&remote.ufrag, &remote.password)
            .unwrap();
        a.set_remote_candidates(&remote.candidates).unwrap();

        let mut b = agent(Role::Callee, Duration::from_secs(1));
        let (seen, _) = drive(&mut a, &mut b, |a, _| {
            a.contains(&Event::StateChanged(ComponentState::Failed))
        });
        assert!(!ready(&seen));

        // the silent socket saw our checks
        silent.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 128];
        let (n, _) = silent.recv_from(&mut buf).unwrap();
        assert_eq!(buf[0], 1);
        assert!(std::str::from_utf8(&buf[1..n]).unwrap().starts_with("ufragB:"));
        assert!(a.send(b"x").is_err());
    }

    #[test]
    fn test_keepalive_after_selection() {
        let mut a = agent(Role::Caller, Duration::from_secs(5));
        a.set_keepalive(Duration::from_millis(50));

        // a bare socket plays the remote side
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let remote = format!(
            "ufragB passB 1,100,127.0.0.1,{},host",
            peer.local_addr().unwrap().port()
        );
        let remote = crate::SessionDescriptor::decode(&remote).unwrap();
        a.set_remote_credentials(&remote.ufrag, &remote.password)
            .unwrap();
        a.set_remote_candidates(&remote.candidates).unwrap();

        let mut buf = [0u8; 128];
        while a.poll_event().unwrap().is_some() {}
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(buf[0], 1);
        let body = std::str::from_utf8(&buf[1..n]).unwrap().to_string();
        let local_ufrag = body
            .split(' ')
            .next()
            .and_then(|user| user.strip_prefix("ufragB:"))
            .unwrap();

        let mut ack = vec![2u8];
        ack.extend_from_slice(format!("{}:ufragB", local_ufrag).as_bytes());
        peer.send_to(&ack, from).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(Event::StateChanged(ComponentState::Ready)) = a.poll_event().unwrap() {
                break;
            }
            assert!(Instant::now() < deadline, "never became ready");
            sleep(Duration::from_millis(5));
        }

        // drop the checks sent before selection
        peer.set_nonblocking(true).unwrap();
        while peer.recv_from(&mut buf).is_ok() {}
        peer.set_nonblocking(false).unwrap();

        // idle path: a check still reaches the peer
        sleep(Duration::from_millis(100));
        while a.poll_event().unwrap().is_some() {}
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(buf[0], 1);
        assert_eq!(std::str::from_utf8(&buf[1..n]).unwrap(), body);
    }

    #[test]
    fn test_candidates_without_credentials() {
        let mut a = agent(Role::Caller, Duration::from_secs(1));
        let b = agent(Role::Callee, Duration::from_secs(1));
        let remote = b.local_descriptor().unwrap();
        assert!(a.set_remote_candidates(&remote.candidates).is_err());
    }

    #[test]
    fn test_reuse_bind() {
        let local_addr: SocketAddr = "0.0.0.0:0".parse().unwrap();
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).unwrap();
        socket.set_reuse_address(true).unwrap();
        socket.bind(&local_addr.into()).unwrap();

        let socket2 = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).unwrap();
        socket2.set_reuse_address(true).unwrap();
        socket2.bind(&socket.local_addr().unwrap()).unwrap();
        let remote_addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        socket2.send_to(b"hello", &remote_addr.into()).unwrap();
    }
}
