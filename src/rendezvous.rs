//! Session descriptor exchange through an external key-value store.
//!
//! Each side publishes its descriptor under its own role and looks up the
//! peer's under the complementary role. The store itself is opaque: in
//! production an external program, see [`CommandExchange`].

use crate::config::{Role, SessionConfig};
use crate::descriptor::SessionDescriptor;
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, ErrorKind, Write};
use std::process::{Command, Stdio};
use std::rc::Rc;
use std::thread::{self, sleep};
use std::time::{Duration, Instant};

/// Environment variable carrying the session name to the exchange program.
pub const REMOTE_HOST_ENV: &str = "PUNCHPIPE_REMOTE_HOST";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RendezvousKey {
    pub role: Role,
    pub session: Option<String>,
    pub channel: String,
}

impl RendezvousKey {
    /// `<role> [<session>] <op> <channel>`
    fn args(&self, op: &str) -> Vec<String> {
        let mut args = vec![self.role.to_string()];
        if let Some(session) = &self.session {
            args.push(session.clone());
        }
        args.push(op.to_string());
        args.push(self.channel.clone());
        args
    }
}

/// Store primitive, one synchronous call per operation.
pub trait Exchange {
    fn publish(&mut self, key: &RendezvousKey, payload: &str) -> io::Result<()>;

    /// Empty output means nothing is stored under `key` yet.
    fn lookup(&mut self, key: &RendezvousKey) -> io::Result<String>;

    fn unpublish(&mut self, key: &RendezvousKey) -> io::Result<()>;
}

/// Runs an external program per operation.
///
/// ```no_run
/// use punchpipe::rendezvous::CommandExchange;
///
/// let exchange = CommandExchange::new("ssh").arg("rendezvous.example.org").arg("store");
/// ```
#[derive(Debug, Clone)]
pub struct CommandExchange {
    program: String,
    args: Vec<String>,
}

impl CommandExchange {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Leading argument, placed before the key arguments.
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Split a command line with shell quoting rules, first word is the program.
    pub fn from_command_line(cmd: &str) -> io::Result<Self> {
        let words = shell_words::split(cmd)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        let mut words = words.into_iter();
        let program = words
            .next()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "empty exchange command"))?;
        Ok(words.fold(Self::new(program), |c, w| c.arg(w)))
    }

    fn execute(&self, key: &RendezvousKey, op: &str, input: Option<&str>) -> io::Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .args(key.args(op))
            .stdin(match input {
                Some(_) => Stdio::piped(),
                None => Stdio::null(),
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(session) = &key.session {
            cmd.env(REMOTE_HOST_ENV, session);
        }

        log::debug!("executing {:?}", cmd);
        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take();

        // feed stdin while stdout and stderr are drained
        let (written, output) = thread::scope(|s| {
            let writer = s.spawn(move || match (input, stdin) {
                (Some(input), Some(mut stdin)) => match stdin.write_all(input.as_bytes()) {
                    Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
                    r => r,
                },
                _ => Ok(()),
            });
            let output = child.wait_with_output();
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(io::Error::new(ErrorKind::Other, "stdin writer panicked")));
            (written, output)
        });

        let output = output?;
        written?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let msg = if stderr.is_empty() {
                format!("{} {} returned {}", self.program, op, output.status)
            } else {
                format!("{} {} returned {}: {}", self.program, op, output.status, stderr)
            };
            return Err(io::Error::new(ErrorKind::Other, msg));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Exchange for CommandExchange {
    fn publish(&mut self, key: &RendezvousKey, payload: &str) -> io::Result<()> {
        self.execute(key, "publish", Some(payload)).map(|_| ())
    }

    fn lookup(&mut self, key: &RendezvousKey) -> io::Result<String> {
        self.execute(key, "lookup", None)
    }

    fn unpublish(&mut self, key: &RendezvousKey) -> io::Result<()> {
        self.execute(key, "unpublish", None).map(|_| ())
    }
}

/// In-process store. Clones share the same entries, so two clients in one
/// process can rendezvous through it.
#[derive(Debug, Clone, Default)]
pub struct MemoryExchange {
    entries: Rc<RefCell<HashMap<RendezvousKey, String>>>,
}

impl MemoryExchange {
    pub fn get(&self, key: &RendezvousKey) -> Option<String> {
        self.entries.borrow().get(key).cloned()
    }

    pub fn insert(&self, key: RendezvousKey, payload: &str) {
        self.entries.borrow_mut().insert(key, payload.to_string());
    }
}

impl Exchange for MemoryExchange {
    fn publish(&mut self, key: &RendezvousKey, payload: &str) -> io::Result<()> {
        self.insert(key.clone(), payload);
        Ok(())
    }

    fn lookup(&mut self, key: &RendezvousKey) -> io::Result<String> {
        Ok(self.get(key).unwrap_or_default())
    }

    fn unpublish(&mut self, key: &RendezvousKey) -> io::Result<()> {
        self.entries.borrow_mut().remove(key);
        Ok(())
    }
}

pub struct RendezvousClient<E> {
    exchange: E,
    local: RendezvousKey,
    remote: RendezvousKey,
    lookup_timeout: Duration,
    lookup_interval: Duration,
    published: bool,
}

impl<E: Exchange> RendezvousClient<E> {
    pub fn new(config: &SessionConfig, exchange: E) -> Self {
        let key = |role| RendezvousKey {
            role,
            session: config.session.clone(),
            channel: config.channel.clone(),
        };

        Self {
            exchange,
            local: key(config.role),
            remote: key(config.role.peer()),
            lookup_timeout: config.lookup_timeout,
            lookup_interval: config.lookup_interval,
            published: false,
        }
    }

    pub fn local_key(&self) -> &RendezvousKey {
        &self.local
    }

    pub fn remote_key(&self) -> &RendezvousKey {
        &self.remote
    }

    pub fn exchange(&self) -> &E {
        &self.exchange
    }

    /// Publish the local descriptor. A session publishes at most once.
    pub fn publish(&mut self, local: &SessionDescriptor) -> Result<()> {
        if self.published {
            return Err(Error::PublishFailed("already published".into()));
        }

        self.exchange
            .publish(&self.local, &local.encode())
            .map_err(|e| Error::PublishFailed(e.to_string()))?;
        self.published = true;

        log::debug!("published local credentials");
        Ok(())
    }

    /// Fetch the peer's descriptor, waiting until the peer has published.
    pub fn lookup(&mut self) -> Result<SessionDescriptor> {
        let deadline = Instant::now() + self.lookup_timeout;

        loop {
            let line = self
                .exchange
                .lookup(&self.remote)
                .map_err(|e| Error::LookupFailed(e.to_string()))?;

            if !line.trim().is_empty() {
                let remote = SessionDescriptor::decode(&line)?;
                log::debug!("lookup remote credentials done");
                return Ok(remote);
            }

            if Instant::now() + self.lookup_interval > deadline {
                return Err(Error::LookupFailed(format!(
                    "no descriptor published for role {} after {:?}",
                    self.remote.role, self.lookup_timeout
                )));
            }

            log::trace!("peer not published yet");
            sleep(self.lookup_interval);
        }
    }

    /// Retract the local descriptor. Failure is only logged.
    pub fn unpublish(&mut self) {
        if !self.published {
            return;
        }

        match self.exchange.unpublish(&self.local) {
            Ok(_) => log::debug!("unpublish local credentials done"),
            Err(e) => log::warn!("unpublish failed: {}", e),
        }
        self.published = false;
    }
}
