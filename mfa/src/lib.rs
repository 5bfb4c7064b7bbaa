//! Mail filter agent.
//!
//! Sits between the SMTP front-end and the lookup agent, validates sender and
//! recipient addresses, and runs every transaction stage past the configured
//! filter plugins before relaying the decision.
use filter_api::{FilterError, HookKind, SessionId};
use miette::Diagnostic;
use thiserror::Error;

pub mod address;
pub mod agent;
pub mod config;
pub mod coordinator;
pub mod envelope;
pub mod filters;
pub mod imsg;
pub mod lifecycle;
pub mod logging;
pub mod peer;

use imsg::ImsgType;
use peer::Peer;

#[derive(Debug, Error, Diagnostic)]
pub enum MfaError {
    #[error("IO error")]
    #[diagnostic(code(mfa::io_error))]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Protocol(#[from] FilterError),

    #[error("malformed {tag} payload")]
    #[diagnostic(code(mfa::malformed_payload))]
    MalformedPayload {
        tag: ImsgType,
        #[source]
        source: serde_json::Error,
    },

    #[error("unexpected message tag {tag} from {peer}")]
    #[diagnostic(code(mfa::unexpected_message))]
    UnexpectedMessage { peer: Peer, tag: u32 },

    #[error("session {0:#018x} already has an outstanding hook")]
    #[diagnostic(
        code(mfa::session_in_flight),
        help("the front-end must wait for a decision before sending the next hook")
    )]
    SessionInFlight(SessionId),

    #[error("decision for unknown session {0:#018x}")]
    #[diagnostic(code(mfa::unknown_session))]
    UnknownSession(SessionId),

    #[error("filter {filter} answered {found} for session {id:#018x}, expected {expected}")]
    #[diagnostic(code(mfa::filter_mismatch))]
    FilterMismatch {
        filter: String,
        id: SessionId,
        expected: HookKind,
        found: HookKind,
    },

    #[error("no channel to {0}")]
    #[diagnostic(code(mfa::peer_gone))]
    PeerGone(Peer),

    #[error("{peer} channel failed")]
    #[diagnostic(code(mfa::peer_failed))]
    PeerFailed {
        peer: Peer,
        #[source]
        source: FilterError,
    },

    #[error("cannot connect to {peer} at {path}")]
    #[diagnostic(code(mfa::connect))]
    Connect {
        peer: Peer,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot start filter {name}")]
    #[diagnostic(code(mfa::filter_spawn))]
    FilterSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("filter {name} sent tag {tag} before registering")]
    #[diagnostic(code(mfa::not_registered))]
    NotRegistered { name: String, tag: u32 },

    #[error("filter {0} did not register in time")]
    #[diagnostic(code(mfa::register_timeout))]
    RegisterTimeout(String),

    #[error("filter {0} exited")]
    #[diagnostic(code(mfa::filter_exited))]
    FilterExited(String),

    #[error("configuration received twice")]
    #[diagnostic(code(mfa::reconfigure))]
    Reconfigure,

    #[error("unexpected SIGCHLD")]
    #[diagnostic(code(mfa::unexpected_sigchld))]
    UnexpectedSigchld,

    #[error("unknown user {0}")]
    #[diagnostic(code(mfa::unknown_user))]
    UnknownUser(String),

    #[error("cannot drop privileges")]
    #[diagnostic(code(mfa::privileges))]
    Privileges(#[source] nix::Error),

    #[error("cannot fork")]
    #[diagnostic(code(mfa::fork))]
    Fork(#[source] nix::Error),

    #[error("logging setup failed: {0}")]
    #[diagnostic(code(mfa::logging))]
    Logging(String),
}
