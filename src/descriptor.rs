use crate::candidate::Candidate;
use crate::error::DescriptorError;
use std::fmt;
use std::str::FromStr;

/// One side's negotiation parameters, exchanged as
/// `<ufrag> <password> <cand1> ... <candN>\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub ufrag: String,
    pub password: String,
    pub candidates: Vec<Candidate>,
}

impl SessionDescriptor {
    pub fn new<U: Into<String>, P: Into<String>>(
        ufrag: U,
        password: P,
        candidates: Vec<Candidate>,
    ) -> Result<Self, DescriptorError> {
        let ufrag = ufrag.into();
        let password = password.into();

        let valid = |s: &str| !s.is_empty() && !s.contains(char::is_whitespace);
        if !valid(&ufrag) || !valid(&password) {
            return Err(DescriptorError::MissingCredentials);
        }
        if candidates.is_empty() {
            return Err(DescriptorError::NoCandidates);
        }

        Ok(Self {
            ufrag,
            password,
            candidates,
        })
    }

    /// The line published to the rendezvous store, newline terminated.
    pub fn encode(&self) -> String {
        format!("{}\n", self)
    }

    pub fn decode(line: &str) -> Result<Self, DescriptorError> {
        line.parse()
    }
}

impl fmt::Display for SessionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.ufrag, self.password)?;
        for c in &self.candidates {
            write!(f, " {}", c)?;
        }
        Ok(())
    }
}

impl FromStr for SessionDescriptor {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s
            .split(|c| c == ' ' || c == '\t' || c == '\n')
            .filter(|t| !t.is_empty());

        let (ufrag, password) = match (tokens.next(), tokens.next()) {
            (Some(u), Some(p)) => (u, p),
            _ => return Err(DescriptorError::MissingCredentials),
        };

        let candidates = tokens
            .map(|t| {
                t.parse::<Candidate>().map_err(|e| {
                    log::debug!("failed to parse candidate: {}", t);
                    e
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if candidates.is_empty() {
            return Err(DescriptorError::NoCandidates);
        }

        Ok(Self {
            ufrag: ufrag.to_string(),
            password: password.to_string(),
            candidates,
        })
    }
}
