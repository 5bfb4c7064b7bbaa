use std::fmt;

use filter_api::{FilterError, Frame, HookKind};
use serde::{de::DeserializeOwned, Serialize};

use crate::MfaError;

/// Message types exchanged with the collaborating processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImsgType {
    MfaConnect,
    MfaHelo,
    MfaEhlo,
    MfaMail,
    MfaRcpt,
    MfaDataline,
    MfaQuit,
    MfaClose,
    MfaRset,
    LkaMail,
    LkaRcpt,
    LkaRulematch,
    ConfStart,
    ConfFilter,
    ConfEnd,
    CtlVerbose,
}

impl ImsgType {
    const ALL: [ImsgType; 16] = [
        ImsgType::MfaConnect,
        ImsgType::MfaHelo,
        ImsgType::MfaEhlo,
        ImsgType::MfaMail,
        ImsgType::MfaRcpt,
        ImsgType::MfaDataline,
        ImsgType::MfaQuit,
        ImsgType::MfaClose,
        ImsgType::MfaRset,
        ImsgType::LkaMail,
        ImsgType::LkaRcpt,
        ImsgType::LkaRulematch,
        ImsgType::ConfStart,
        ImsgType::ConfFilter,
        ImsgType::ConfEnd,
        ImsgType::CtlVerbose,
    ];

    pub fn tag(self) -> u32 {
        match self {
            ImsgType::MfaConnect => 100,
            ImsgType::MfaHelo => 101,
            ImsgType::MfaEhlo => 102,
            ImsgType::MfaMail => 103,
            ImsgType::MfaRcpt => 104,
            ImsgType::MfaDataline => 105,
            ImsgType::MfaQuit => 106,
            ImsgType::MfaClose => 107,
            ImsgType::MfaRset => 108,
            ImsgType::LkaMail => 120,
            ImsgType::LkaRcpt => 121,
            ImsgType::LkaRulematch => 122,
            ImsgType::ConfStart => 130,
            ImsgType::ConfFilter => 131,
            ImsgType::ConfEnd => 132,
            ImsgType::CtlVerbose => 140,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.tag() == tag)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ImsgType::MfaConnect => "MFA_CONNECT",
            ImsgType::MfaHelo => "MFA_HELO",
            ImsgType::MfaEhlo => "MFA_EHLO",
            ImsgType::MfaMail => "MFA_MAIL",
            ImsgType::MfaRcpt => "MFA_RCPT",
            ImsgType::MfaDataline => "MFA_DATALINE",
            ImsgType::MfaQuit => "MFA_QUIT",
            ImsgType::MfaClose => "MFA_CLOSE",
            ImsgType::MfaRset => "MFA_RSET",
            ImsgType::LkaMail => "LKA_MAIL",
            ImsgType::LkaRcpt => "LKA_RCPT",
            ImsgType::LkaRulematch => "LKA_RULEMATCH",
            ImsgType::ConfStart => "CONF_START",
            ImsgType::ConfFilter => "CONF_FILTER",
            ImsgType::ConfEnd => "CONF_END",
            ImsgType::CtlVerbose => "CTL_VERBOSE",
        }
    }

    /// Message carrying the front-end's hook request and its final decision.
    pub fn for_hook(kind: HookKind) -> Self {
        match kind {
            HookKind::Connect => ImsgType::MfaConnect,
            HookKind::Helo => ImsgType::MfaHelo,
            HookKind::Ehlo => ImsgType::MfaEhlo,
            HookKind::Mail => ImsgType::MfaMail,
            HookKind::Rcpt => ImsgType::MfaRcpt,
            HookKind::DataLine => ImsgType::MfaDataline,
            HookKind::Quit => ImsgType::MfaQuit,
            HookKind::Close => ImsgType::MfaClose,
            HookKind::Rset => ImsgType::MfaRset,
        }
    }

    pub fn hook(self) -> Option<HookKind> {
        HookKind::ALL
            .into_iter()
            .find(|kind| Self::for_hook(*kind) == self)
    }

    pub fn decode<T: DeserializeOwned>(self, payload: &[u8]) -> Result<T, MfaError> {
        serde_json::from_slice(payload).map_err(|source| MfaError::MalformedPayload { tag: self, source })
    }

    pub fn compose<T: Serialize>(self, value: &T) -> Result<Frame, MfaError> {
        let payload = serde_json::to_vec(value)
            .map_err(|source| MfaError::MalformedPayload { tag: self, source })?;
        Ok(Frame::new(self.tag(), payload))
    }
}

impl fmt::Display for ImsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CTL_VERBOSE carries one big-endian integer; non-zero turns debug on.
pub fn decode_verbose(payload: &[u8]) -> Result<bool, MfaError> {
    let bytes: [u8; 4] = payload
        .try_into()
        .map_err(|_| FilterError::CorruptedMessage {
            tag: ImsgType::CtlVerbose.tag(),
            expected: 4,
            actual: payload.len(),
        })?;
    Ok(i32::from_be_bytes(bytes) != 0)
}

pub fn encode_verbose(verbose: bool) -> Frame {
    Frame::new(
        ImsgType::CtlVerbose.tag(),
        i32::from(verbose).to_be_bytes().to_vec(),
    )
}
