use std::io;
use thiserror::Error;

/// Why a single candidate token was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CandidateError {
    #[error("expected 5 comma separated fields, found {0}")]
    FieldCount(usize),
    #[error("unknown candidate type `{0}`")]
    UnknownType(String),
    #[error("failed to parse address `{0}`")]
    Address(String),
}

/// Why a session descriptor line was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("missing ufrag or password")]
    MissingCredentials,
    #[error("line must have at least ufrag, password, and one candidate")]
    NoCandidates,
    #[error("failed to parse candidate: {0}")]
    Candidate(#[from] CandidateError),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid candidate: {0}")]
    InvalidCandidate(#[from] CandidateError),
    #[error("invalid session descriptor: {0}")]
    InvalidDescriptor(#[from] DescriptorError),
    #[error("candidate gathering failed: {0}")]
    GatheringFailed(String),
    #[error("rendezvous publish failed: {0}")]
    PublishFailed(String),
    #[error("rendezvous lookup failed: {0}")]
    LookupFailed(String),
    #[error("transport failed: {0}")]
    TransportFailed(String),
    #[error("relay i/o error: {0}")]
    RelayIo(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
