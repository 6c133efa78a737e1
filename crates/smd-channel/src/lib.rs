//! Command Channel — request/response transport between `smctl` clients
//! and the daemon. One outstanding request at a time; the default
//! transport is two polled JSON files, but dispatch logic only depends on
//! the [`transport::CommandTransport`] trait.

pub mod protocol;
pub mod transport;

pub use protocol::{CandidatePayload, Command, Request, Response, StatusPayload};
pub use transport::{ChannelError, CommandTransport, FileClient, FileTransport};
