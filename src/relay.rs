//! Moving bytes between the local endpoint and the negotiated transport.

use crate::config::Mode;
use crate::error::{Error, Result};
use crate::poller;
use crate::transport::Transport;
use std::fs::File;
use std::io::{self, ErrorKind, Read, Stdout, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};

/// Largest run of bytes read from the local endpoint and sent at once.
pub const MAX_CHUNK: usize = 10 * 1024;

/// Result of one outbound relay cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    /// nothing more to read right now
    Drained,
    /// local end-of-stream
    Closed,
}

pub struct RelayBridge {
    mode: Mode,
    buf: Vec<u8>,
    sent: u64,
    received: u64,
}

impl RelayBridge {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            buf: vec![0; MAX_CHUNK],
            sent: 0,
            received: 0,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// bytes forwarded to the transport
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// bytes delivered to the local sink
    pub fn received(&self) -> u64 {
        self.received
    }

    /// One outbound cycle, run when the local endpoint is readable.
    ///
    /// Reliable mode reads until a short read; datagram mode reads once.
    /// `WouldBlock` from `src` means no data is pending.
    pub fn pump<R, T>(&mut self, src: &mut R, transport: &mut T) -> Result<Pump>
    where
        R: Read + ?Sized,
        T: Transport + ?Sized,
    {
        loop {
            let n = match src.read(&mut self.buf) {
                Ok(0) => return Ok(Pump::Closed),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Pump::Drained),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::RelayIo(e)),
            };

            self.forward(n, transport)?;

            if self.mode == Mode::Datagram || n < MAX_CHUNK {
                return Ok(Pump::Drained);
            }
        }
    }

    fn forward<T: Transport + ?Sized>(&mut self, n: usize, transport: &mut T) -> Result<()> {
        let sent = transport.send(&self.buf[..n]).map_err(|e| match e {
            Error::TransportFailed(_) => e,
            e => Error::TransportFailed(e.to_string()),
        })?;
        if sent != n {
            return Err(Error::TransportFailed(format!("sent {} of {} bytes", sent, n)));
        }

        self.sent += n as u64;
        log::trace!("sent {} bytes", n);
        Ok(())
    }

    /// Write bytes that arrived from the transport to the local sink.
    pub fn deliver<W: Write + ?Sized>(&mut self, sink: &mut W, data: &[u8]) -> Result<()> {
        sink.write_all(data)
            .and_then(|_| sink.flush())
            .map_err(Error::RelayIo)?;
        self.received += data.len() as u64;
        Ok(())
    }
}

/// The local side of the pipe.
///
/// Reads never block: when nothing is pending they fail with `WouldBlock`.
pub enum LocalEndpoint {
    Stdio { input: File, output: Stdout },
    Tcp(TcpStream),
}

impl LocalEndpoint {
    pub fn stdio() -> io::Result<Self> {
        // unbuffered handle, so poll sees everything not yet read
        let input = File::from(io::stdin().as_fd().try_clone_to_owned()?);
        Ok(LocalEndpoint::Stdio {
            input,
            output: io::stdout(),
        })
    }

    pub fn connect(port: u16) -> io::Result<Self> {
        let s = TcpStream::connect(("localhost", port))?;
        log::debug!("connected to local port {}", port);
        Self::from_stream(s)
    }

    pub fn from_stream(s: TcpStream) -> io::Result<Self> {
        s.set_nonblocking(false)?;
        s.set_nodelay(true)?;
        Ok(LocalEndpoint::Tcp(s))
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        match self {
            LocalEndpoint::Stdio { input, .. } => input.as_fd(),
            LocalEndpoint::Tcp(s) => s.as_fd(),
        }
    }
}

impl Read for LocalEndpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !poller::readable(self.fd())? {
            return Err(ErrorKind::WouldBlock.into());
        }

        match self {
            LocalEndpoint::Stdio { input, .. } => input.read(buf),
            LocalEndpoint::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for LocalEndpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            LocalEndpoint::Stdio { output, .. } => output.write(buf),
            LocalEndpoint::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LocalEndpoint::Stdio { output, .. } => output.flush(),
            LocalEndpoint::Tcp(s) => s.flush(),
        }
    }
}

/// Listener for port forwarding, bound on loopback.
pub fn listen(port: u16) -> io::Result<TcpListener> {
    let l = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
    l.set_nonblocking(true)?;
    log::debug!("listening on {}", l.local_addr()?);
    Ok(l)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeTransport;
    use std::io::Cursor;

    struct WouldBlock;

    impl Read for WouldBlock {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(ErrorKind::WouldBlock.into())
        }
    }

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(ErrorKind::Other, "broken"))
        }
    }

    #[test]
    fn test_reliable_full_chunk_then_eof() {
        let mut bridge = RelayBridge::new(Mode::Reliable);
        let mut t = FakeTransport::new();
        let mut src = Cursor::new(vec![7u8; MAX_CHUNK]);

        assert_eq!(bridge.pump(&mut src, &mut t).unwrap(), Pump::Closed);
        assert_eq!(t.sent.len(), 1);
        assert_eq!(t.sent[0].len(), 10240);
        assert_eq!(bridge.sent(), 10240);
    }

    #[test]
    fn test_reliable_short_read_drains() {
        let mut bridge = RelayBridge::new(Mode::Reliable);
        let mut t = FakeTransport::new();
        let mut src = Cursor::new(vec![1u8; MAX_CHUNK + 100]);

        assert_eq!(bridge.pump(&mut src, &mut t).unwrap(), Pump::Drained);
        assert_eq!(
            t.sent.iter().map(|s| s.len()).collect::<Vec<_>>(),
            vec![MAX_CHUNK, 100]
        );

        assert_eq!(bridge.pump(&mut src, &mut t).unwrap(), Pump::Closed);
        assert_eq!(t.sent.len(), 2);
    }

    #[test]
    fn test_reliable_would_block() {
        let mut bridge = RelayBridge::new(Mode::Reliable);
        let mut t = FakeTransport::new();
        let mut src = Cursor::new(vec![1u8; MAX_CHUNK]).chain(WouldBlock);

        assert_eq!(bridge.pump(&mut src, &mut t).unwrap(), Pump::Drained);
        assert_eq!(t.sent.len(), 1);
    }

    #[test]
    fn test_datagram_would_block() {
        let mut bridge = RelayBridge::new(Mode::Datagram);
        let mut t = FakeTransport::new();

        assert_eq!(bridge.pump(&mut WouldBlock, &mut t).unwrap(), Pump::Drained);
        assert!(t.sent.is_empty());
    }

    #[test]
    fn test_datagram_one_receive_per_cycle() {
        let mut bridge = RelayBridge::new(Mode::Datagram);
        let mut t = FakeTransport::new();
        let mut src = Cursor::new(vec![2u8; 2 * MAX_CHUNK]);

        assert_eq!(bridge.pump(&mut src, &mut t).unwrap(), Pump::Drained);
        assert_eq!(t.sent.len(), 1);
        assert_eq!(t.sent[0].len(), MAX_CHUNK);
    }

    #[test]
    fn test_read_error() {
        let mut bridge = RelayBridge::new(Mode::Datagram);
        let mut t = FakeTransport::new();
        assert!(matches!(
            bridge.pump(&mut Broken, &mut t),
            Err(Error::RelayIo(_))
        ));
    }

    #[test]
    fn test_send_failure() {
        let mut bridge = RelayBridge::new(Mode::Reliable);
        let mut t = FakeTransport::new();
        t.fail_send = true;
        let mut src = Cursor::new(b"hello".to_vec());
        assert!(matches!(
            bridge.pump(&mut src, &mut t),
            Err(Error::TransportFailed(_))
        ));
        assert_eq!(bridge.sent(), 0);
    }

    #[test]
    fn test_deliver() {
        let mut bridge = RelayBridge::new(Mode::Reliable);
        let mut sink = Vec::new();
        bridge.deliver(&mut sink, b"hello ").unwrap();
        bridge.deliver(&mut sink, b"world").unwrap();
        assert_eq!(sink, b"hello world");
        assert_eq!(bridge.received(), 11);
    }

    #[test]
    fn test_tcp_endpoint() {
        let listener = listen(0).unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut local = LocalEndpoint::connect(port).unwrap();

        listener.set_nonblocking(false).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(
            local.read(&mut buf).unwrap_err().kind(),
            ErrorKind::WouldBlock
        );

        peer.write_all(b"ping").unwrap();
        poller::wait_readable(&[local.fd()], 1000).unwrap();
        assert_eq!(local.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");

        local.write_all(b"pong").unwrap();
        peer.read_exact(&mut buf[..4]).unwrap();
        assert_eq!(&buf[..4], b"pong");
    }
}
