//! The connectivity engine seen from the application.

use crate::candidate::Candidate;
use crate::descriptor::SessionDescriptor;
use crate::error::Result;
use std::os::fd::BorrowedFd;

/// Component state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Disconnected,
    Gathering,
    Connecting,
    Connected,
    Ready,
    Failed,
}

/// Engine notifications, delivered one at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    GatheringDone,
    StateChanged(ComponentState),
    /// reliable transport accepts data
    Writable,
    Received(Vec<u8>),
}

pub trait Transport {
    /// Start gathering, `Event::GatheringDone` follows.
    fn gather(&mut self) -> Result<()>;

    /// Local credentials and gathered candidates.
    fn local_descriptor(&self) -> Result<SessionDescriptor>;

    fn set_remote_credentials(&mut self, ufrag: &str, password: &str) -> Result<()>;

    /// Starts negotiation. Returns how many candidates were accepted.
    fn set_remote_candidates(&mut self, candidates: &[Candidate]) -> Result<usize>;

    fn send(&mut self, data: &[u8]) -> Result<usize>;

    /// Performs pending non-blocking I/O and returns the next event, if any.
    fn poll_event(&mut self) -> Result<Option<Event>>;

    /// Descriptors to watch for readability.
    fn poll_fds(&self) -> Vec<BorrowedFd<'_>> {
        Vec::new()
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::error::Error;
    use std::collections::VecDeque;

    /// Scripted engine recording every call made on it.
    pub struct FakeTransport {
        pub local: SessionDescriptor,
        pub calls: Vec<&'static str>,
        pub sent: Vec<Vec<u8>>,
        pub events: VecDeque<Event>,
        pub fail_send: bool,
        pub fail_gather: bool,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self {
                local: SessionDescriptor::decode("ufragA passA 1,2000,192.0.2.1,5000,host")
                    .unwrap(),
                calls: Vec::new(),
                sent: Vec::new(),
                events: VecDeque::new(),
                fail_send: false,
                fail_gather: false,
            }
        }
    }

    impl Transport for FakeTransport {
        fn gather(&mut self) -> Result<()> {
            self.calls.push("gather");
            if self.fail_gather {
                return Err(Error::GatheringFailed("no interfaces".into()));
            }
            Ok(())
        }

        fn local_descriptor(&self) -> Result<SessionDescriptor> {
            Ok(self.local.clone())
        }

        fn set_remote_credentials(&mut self, _ufrag: &str, _password: &str) -> Result<()> {
            self.calls.push("set_remote_credentials");
            Ok(())
        }

        fn set_remote_candidates(&mut self, candidates: &[Candidate]) -> Result<usize> {
            self.calls.push("set_remote_candidates");
            Ok(candidates.len())
        }

        fn send(&mut self, data: &[u8]) -> Result<usize> {
            if self.fail_send {
                return Err(Error::TransportFailed("send refused".into()));
            }
            self.sent.push(data.to_vec());
            Ok(data.len())
        }

        fn poll_event(&mut self) -> Result<Option<Event>> {
            Ok(self.events.pop_front())
        }
    }
}
