//! Reliable transport.
//!
//! use `Agent` to listen and dial from one port until a verified connection comes up.

mod agent;
pub use agent::Agent;
