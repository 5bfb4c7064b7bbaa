//! Records exchanged with the front-end, the lookup agent and the parent.
use std::net::SocketAddr;

use camino::Utf8PathBuf;
use filter_api::{MailAddress, SessionId};
use serde::{Deserialize, Serialize};

/// Transaction context the front-end attaches to each hook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Envelope {
    pub session_id: SessionId,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    /// Reverse name of the remote end.
    pub hostname: String,
    /// Name given in HELO/EHLO.
    pub helo: String,
    pub sender: MailAddress,
    pub rcpt: MailAddress,
    /// Resolved destination, set once a recipient matched a rule.
    pub dest: MailAddress,
    pub flags: u32,
}

/// Working record of one hook evaluation.
///
/// Also the payload of every decision relayed to the front-end and of the
/// lookup round trips, which echo it back with `code` and `addr` filled in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitStatus {
    pub id: SessionId,
    pub code: u32,
    pub status_line: String,
    pub addr: MailAddress,
    pub line: String,
    pub envelope: Envelope,
}

impl SubmitStatus {
    pub fn from_envelope(envelope: Envelope) -> Self {
        SubmitStatus {
            id: envelope.session_id,
            envelope,
            ..Default::default()
        }
    }
}

/// One filter plugin as configured by the parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDef {
    pub name: String,
    pub path: Utf8PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_default() {
        let ss: SubmitStatus =
            serde_json::from_str(r#"{"id": 7, "line": "Subject: hello"}"#).unwrap();
        assert_eq!(ss.id, 7);
        assert_eq!(ss.code, 0);
        assert_eq!(ss.line, "Subject: hello");
        assert!(ss.envelope.sender.is_null());
    }

    #[test]
    fn test_from_envelope_copies_session() {
        let envelope = Envelope {
            session_id: 0x42,
            helo: "mx.example.org".into(),
            ..Default::default()
        };
        let ss = SubmitStatus::from_envelope(envelope);
        assert_eq!(ss.id, 0x42);
        assert_eq!(ss.envelope.helo, "mx.example.org");
    }

    #[test]
    fn test_filter_def_args_optional() {
        let def: FilterDef =
            serde_json::from_str(r#"{"name": "spam", "path": "/usr/libexec/filter-spam"}"#)
                .unwrap();
        assert_eq!(def.path.file_name(), Some("filter-spam"));
        assert!(def.args.is_empty());
    }
}
