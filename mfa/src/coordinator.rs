//! Per-hook decision flow of the mail filter agent.
//!
//! The coordinator is a plain state machine: every entry point consumes one
//! inbound message and queues the resulting messages in an outbox which the
//! agent drains and routes to the right peer. It owns no I/O.
use std::collections::HashMap;
use std::mem;

use filter_api::{
    clamp_reject_code, ConnectInfo, FilterMessage, HookKind, HookMask, HookPayload, SessionId,
};
use tracing::{debug, info};

use crate::address::{strip_source_route, valid_mailaddr};
use crate::envelope::{Envelope, SubmitStatus};
use crate::imsg::ImsgType;
use crate::peer::Peer;
use crate::MfaError;

type Result<T, E = MfaError> = std::result::Result<T, E>;

/// Reply code relayed for an accepted hook.
pub const ACCEPT_CODE: u32 = 250;
/// Reply code for addresses refused by local syntax checks.
pub const INVALID_ADDRESS_CODE: u32 = 553;

const INVALID_SENDER: &str = "5.1.7 Invalid sender address";
const INVALID_RECIPIENT: &str = "5.1.3 Invalid recipient address";

/// A registered filter plugin, in configuration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSlot {
    pub name: String,
    pub mask: HookMask,
}

/// A message the agent has to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Smtp(ImsgType, SubmitStatus),
    Lookup(ImsgType, SubmitStatus),
    Filter { index: usize, message: FilterMessage },
}

// A hook waiting for the verdict of one filter.
#[derive(Debug)]
struct Inflight {
    hook: HookKind,
    filter: usize,
    status: SubmitStatus,
}

#[derive(Debug, Default)]
pub struct Coordinator {
    filters: Vec<FilterSlot>,
    inflight: HashMap<SessionId, Inflight>,
    outbox: Vec<Outbound>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a filter to the chain and returns its index.
    pub fn add_filter(&mut self, slot: FilterSlot) -> usize {
        self.filters.push(slot);
        self.filters.len() - 1
    }

    pub fn filters(&self) -> &[FilterSlot] {
        &self.filters
    }

    /// Sessions currently waiting on a filter.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Takes everything queued since the last call.
    pub fn drain(&mut self) -> Vec<Outbound> {
        mem::take(&mut self.outbox)
    }

    pub fn test_connect(&mut self, envelope: Envelope) -> Result<()> {
        self.session(SubmitStatus::from_envelope(envelope), HookKind::Connect)
    }

    pub fn test_helo(&mut self, envelope: Envelope) -> Result<()> {
        self.session(SubmitStatus::from_envelope(envelope), HookKind::Helo)
    }

    pub fn test_ehlo(&mut self, envelope: Envelope) -> Result<()> {
        self.session(SubmitStatus::from_envelope(envelope), HookKind::Ehlo)
    }

    /// The null sender `<>` is accepted whatever the syntax checks say.
    pub fn test_mail(&mut self, envelope: Envelope) -> Result<()> {
        let mut ss = SubmitStatus::from_envelope(envelope);
        ss.addr = ss.envelope.sender.clone();
        self.admit(ss.id)?;

        if strip_source_route(&mut ss.addr.user) {
            debug!(session_id = ss.id, "stripped source route from sender");
        }
        if !ss.addr.is_null() && !valid_mailaddr(&ss.addr) {
            return self.refuse(HookKind::Mail, ss, INVALID_SENDER);
        }
        self.session(ss, HookKind::Mail)
    }

    pub fn test_rcpt(&mut self, envelope: Envelope) -> Result<()> {
        let mut ss = SubmitStatus::from_envelope(envelope);
        ss.addr = ss.envelope.rcpt.clone();
        ss.envelope.dest = ss.envelope.rcpt.clone();
        self.admit(ss.id)?;

        strip_source_route(&mut ss.addr.user);
        if !valid_mailaddr(&ss.addr) {
            return self.refuse(HookKind::Rcpt, ss, INVALID_RECIPIENT);
        }
        self.session(ss, HookKind::Rcpt)
    }

    pub fn test_dataline(&mut self, mut ss: SubmitStatus) -> Result<()> {
        ss.code = ACCEPT_CODE;
        self.session(ss, HookKind::DataLine)
    }

    pub fn test_quit(&mut self, envelope: Envelope) -> Result<()> {
        self.session(SubmitStatus::from_envelope(envelope), HookKind::Quit)
    }

    pub fn test_close(&mut self, envelope: Envelope) -> Result<()> {
        self.session(SubmitStatus::from_envelope(envelope), HookKind::Close)
    }

    pub fn test_rset(&mut self, envelope: Envelope) -> Result<()> {
        self.session(SubmitStatus::from_envelope(envelope), HookKind::Rset)
    }

    /// Handles a reply of the lookup agent.
    ///
    /// A session still waiting on a filter has no lookup outstanding, so a
    /// reply for it means the peers are out of step.
    pub fn lookup_reply(&mut self, ty: ImsgType, ss: SubmitStatus) -> Result<()> {
        self.admit(ss.id)?;
        match ty {
            ImsgType::LkaMail => self.relay(HookKind::Mail, ss),
            ImsgType::LkaRcpt => self.relay(HookKind::Rcpt, ss),
            ImsgType::LkaRulematch => self.rcpt_resume(ss),
            other => {
                return Err(MfaError::UnexpectedMessage {
                    peer: Peer::Lookup,
                    tag: other.tag(),
                })
            }
        }
        Ok(())
    }

    /// Second half of the recipient flow, once the rule match is known.
    ///
    /// Filters are not consulted again: a failed match goes straight back to
    /// the front-end, a successful one goes on to the lookup agent with the
    /// matched address as destination.
    pub fn rcpt_resume(&mut self, mut ss: SubmitStatus) {
        if ss.code != ACCEPT_CODE {
            debug!(session_id = ss.id, code = ss.code, "recipient did not match a rule");
            self.relay(HookKind::Rcpt, ss);
            return;
        }
        ss.envelope.dest = ss.addr.clone();
        self.outbox.push(Outbound::Lookup(ImsgType::LkaRcpt, ss));
    }

    /// Applies the verdict of filter `index`; the first reject wins.
    pub fn filter_decision(&mut self, index: usize, message: FilterMessage) -> Result<()> {
        let id = message.id;
        let entry = self
            .inflight
            .remove(&id)
            .ok_or(MfaError::UnknownSession(id))?;
        if entry.filter != index || entry.hook != message.kind() {
            return Err(MfaError::FilterMismatch {
                filter: self.filter_name(index),
                id,
                expected: entry.hook,
                found: message.kind(),
            });
        }

        let Inflight {
            hook, mut status, ..
        } = entry;
        if !message.is_accept() {
            status.code = clamp_reject_code(message.code);
            status.status_line = message.status_line;
            info!(
                session_id = id,
                hook = %hook,
                filter = %self.filters[index].name,
                code = status.code,
                "rejected by filter"
            );
            self.relay(hook, status);
            return Ok(());
        }

        match self.next_filter(hook, index + 1) {
            Some(next) => self.dispatch(next, hook, status),
            None => self.accepted(hook, status),
        }
        Ok(())
    }

    fn admit(&self, id: SessionId) -> Result<()> {
        if self.inflight.contains_key(&id) {
            return Err(MfaError::SessionInFlight(id));
        }
        Ok(())
    }

    fn session(&mut self, ss: SubmitStatus, hook: HookKind) -> Result<()> {
        self.admit(ss.id)?;
        match self.next_filter(hook, 0) {
            Some(index) => self.dispatch(index, hook, ss),
            None => self.accepted(hook, ss),
        }
        Ok(())
    }

    fn refuse(&mut self, hook: HookKind, mut ss: SubmitStatus, status_line: &str) -> Result<()> {
        info!(session_id = ss.id, hook = %hook, addr = %ss.addr, "invalid address");
        ss.code = INVALID_ADDRESS_CODE;
        ss.status_line = status_line.to_string();
        self.relay(hook, ss);
        Ok(())
    }

    fn next_filter(&self, hook: HookKind, from: usize) -> Option<usize> {
        self.filters
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, slot)| slot.mask.contains(hook))
            .map(|(index, _)| index)
    }

    fn dispatch(&mut self, index: usize, hook: HookKind, status: SubmitStatus) {
        let id = status.id;
        let message = FilterMessage::request(id, hook_payload(hook, &status));
        debug!(session_id = id, hook = %hook, filter = %self.filters[index].name, "asking filter");
        self.outbox.push(Outbound::Filter { index, message });
        self.inflight.insert(
            id,
            Inflight {
                hook,
                filter: index,
                status,
            },
        );
    }

    fn accepted(&mut self, hook: HookKind, mut ss: SubmitStatus) {
        ss.code = ACCEPT_CODE;
        match hook {
            HookKind::Mail => self.outbox.push(Outbound::Lookup(ImsgType::LkaMail, ss)),
            HookKind::Rcpt => self
                .outbox
                .push(Outbound::Lookup(ImsgType::LkaRulematch, ss)),
            _ => self.relay(hook, ss),
        }
    }

    fn relay(&mut self, hook: HookKind, ss: SubmitStatus) {
        debug!(session_id = ss.id, hook = %hook, code = ss.code, "decision");
        self.outbox
            .push(Outbound::Smtp(ImsgType::for_hook(hook), ss));
    }

    fn filter_name(&self, index: usize) -> String {
        self.filters
            .get(index)
            .map(|slot| slot.name.clone())
            .unwrap_or_else(|| format!("#{index}"))
    }
}

fn hook_payload(hook: HookKind, ss: &SubmitStatus) -> HookPayload {
    let envelope = &ss.envelope;
    match hook {
        HookKind::Connect => HookPayload::Connect(ConnectInfo {
            local: envelope.local,
            remote: envelope.remote,
            hostname: envelope.hostname.clone(),
        }),
        HookKind::Helo => HookPayload::Helo(envelope.helo.clone()),
        HookKind::Ehlo => HookPayload::Ehlo(envelope.helo.clone()),
        HookKind::Mail => HookPayload::Mail(ss.addr.clone()),
        HookKind::Rcpt => HookPayload::Rcpt(ss.addr.clone()),
        HookKind::DataLine => HookPayload::DataLine(ss.line.clone()),
        HookKind::Quit => HookPayload::Quit,
        HookKind::Close => HookPayload::Close,
        HookKind::Rset => HookPayload::Rset,
    }
}
