//! Filter plugin side of the mail filter protocol.
//!
//! A filter plugin is a separate process spawned by the mail filter agent. It
//! talks to the agent over a single framed channel (its stdin/stdout), announces
//! the hooks it wants once, then receives one decision request per hook
//! invocation and answers each with exactly one accept or reject.
//!
//! ```no_run
//! use filter_api::{FilterRuntime, Channel};
//!
//! # async fn plugin() -> Result<(), filter_api::FilterError> {
//! let mut runtime = FilterRuntime::new(Channel::stdio());
//! runtime.on_rcpt(|decisions, id, rcpt| {
//!     if rcpt.domain == "example.org" {
//!         decisions.reject(id, 550, "5.7.1 No mail for you")?;
//!         return Ok(());
//!     }
//!     decisions.accept(id)
//! });
//! runtime.run().await
//! # }
//! ```
use miette::Diagnostic;
use thiserror::Error;

mod channel;
mod codec;
pub mod protocol;
mod runtime;

pub use channel::Channel;
pub use codec::{Frame, FrameCodec, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD};
pub use protocol::{
    clamp_reject_code, fit_status_line, ConnectInfo, FilterMessage, HookKind, HookMask,
    HookPayload, MailAddress, SessionId, DEFAULT_REJECT_CODE, FILTER_API_VERSION,
    FILTER_MESSAGE_SIZE, STATUS_LINE_SIZE, TAG_REGISTER,
};
pub use runtime::{DecisionHandle, Decisions, FilterRuntime, Handler};

#[derive(Debug, Error, Diagnostic)]
pub enum FilterError {
    #[error("IO error")]
    #[diagnostic(code(filter::io_error))]
    IoError(#[from] std::io::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    #[diagnostic(code(filter::frame_too_large))]
    FrameTooLarge { len: usize, max: usize },

    #[error("corrupted message: tag {tag} carries {actual} bytes, expected {expected}")]
    #[diagnostic(code(filter::corrupted_message))]
    CorruptedMessage {
        tag: u32,
        expected: usize,
        actual: usize,
    },

    #[error("unsupported message tag {0}")]
    #[diagnostic(code(filter::unknown_message))]
    UnknownMessage(u32),

    #[error("API version mismatch: expected {expected}, got {found}")]
    #[diagnostic(
        code(filter::version_mismatch),
        help("the agent and the plugin must be built against the same filter API")
    )]
    VersionMismatch { expected: u32, found: u32 },

    #[error("invalid hook mask {0:#x}")]
    #[diagnostic(code(filter::invalid_mask))]
    InvalidMask(u32),

    #[error("received {0} hook but no callback is registered for it")]
    #[diagnostic(code(filter::unregistered_hook))]
    UnregisteredHook(HookKind),

    #[error("no pending decision for session {0:#018x}")]
    #[diagnostic(
        code(filter::unknown_session),
        help("each hook request must be answered exactly once")
    )]
    UnknownSession(SessionId),

    #[error("session {0:#018x} already has an outstanding hook request")]
    #[diagnostic(code(filter::session_in_flight))]
    SessionInFlight(SessionId),

    #[error("filter runtime is no longer running")]
    #[diagnostic(code(filter::runtime_stopped))]
    RuntimeStopped,
}
