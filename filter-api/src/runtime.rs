use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::codec::Frame;
use crate::protocol::{
    clamp_reject_code, fit_status_line, ConnectInfo, FilterMessage, HookKind, HookMask,
    HookPayload, MailAddress, SessionId, TAG_REGISTER,
};
use crate::FilterError;

type Result<T, E = FilterError> = std::result::Result<T, E>;

pub type ConnectCallback =
    Box<dyn FnMut(&mut Decisions, SessionId, &ConnectInfo) -> Result<()> + Send>;
pub type HostCallback = Box<dyn FnMut(&mut Decisions, SessionId, &str) -> Result<()> + Send>;
pub type AddressCallback =
    Box<dyn FnMut(&mut Decisions, SessionId, &MailAddress) -> Result<()> + Send>;
pub type LineCallback = Box<dyn FnMut(&mut Decisions, SessionId, &str) -> Result<()> + Send>;
pub type EventCallback = Box<dyn FnMut(&mut Decisions, SessionId) -> Result<()> + Send>;

/// A callback bound to the hook it handles.
pub enum Handler {
    Connect(ConnectCallback),
    Helo(HostCallback),
    Ehlo(HostCallback),
    Mail(AddressCallback),
    Rcpt(AddressCallback),
    DataLine(LineCallback),
    Quit(EventCallback),
    Close(EventCallback),
    Rset(EventCallback),
}

impl Handler {
    pub fn kind(&self) -> HookKind {
        match self {
            Handler::Connect(_) => HookKind::Connect,
            Handler::Helo(_) => HookKind::Helo,
            Handler::Ehlo(_) => HookKind::Ehlo,
            Handler::Mail(_) => HookKind::Mail,
            Handler::Rcpt(_) => HookKind::Rcpt,
            Handler::DataLine(_) => HookKind::DataLine,
            Handler::Quit(_) => HookKind::Quit,
            Handler::Close(_) => HookKind::Close,
            Handler::Rset(_) => HookKind::Rset,
        }
    }
}

#[derive(Default)]
struct Handlers {
    mask: HookMask,
    connect: Option<ConnectCallback>,
    helo: Option<HostCallback>,
    ehlo: Option<HostCallback>,
    mail: Option<AddressCallback>,
    rcpt: Option<AddressCallback>,
    dataline: Option<LineCallback>,
    quit: Option<EventCallback>,
    close: Option<EventCallback>,
    rset: Option<EventCallback>,
}

impl Handlers {
    fn register(&mut self, handler: Handler) {
        self.mask.insert(handler.kind());
        match handler {
            Handler::Connect(cb) => self.connect = Some(cb),
            Handler::Helo(cb) => self.helo = Some(cb),
            Handler::Ehlo(cb) => self.ehlo = Some(cb),
            Handler::Mail(cb) => self.mail = Some(cb),
            Handler::Rcpt(cb) => self.rcpt = Some(cb),
            Handler::DataLine(cb) => self.dataline = Some(cb),
            Handler::Quit(cb) => self.quit = Some(cb),
            Handler::Close(cb) => self.close = Some(cb),
            Handler::Rset(cb) => self.rset = Some(cb),
        }
    }

    fn invoke(
        &mut self,
        decisions: &mut Decisions,
        id: SessionId,
        payload: &HookPayload,
    ) -> Result<()> {
        let unregistered = || FilterError::UnregisteredHook(payload.kind());
        match payload {
            HookPayload::Connect(info) => {
                let cb = self.connect.as_mut().ok_or_else(unregistered)?;
                cb(decisions, id, info)
            }
            HookPayload::Helo(host) => {
                let cb = self.helo.as_mut().ok_or_else(unregistered)?;
                cb(decisions, id, host.as_str())
            }
            HookPayload::Ehlo(host) => {
                let cb = self.ehlo.as_mut().ok_or_else(unregistered)?;
                cb(decisions, id, host.as_str())
            }
            HookPayload::Mail(addr) => {
                let cb = self.mail.as_mut().ok_or_else(unregistered)?;
                cb(decisions, id, addr)
            }
            HookPayload::Rcpt(addr) => {
                let cb = self.rcpt.as_mut().ok_or_else(unregistered)?;
                cb(decisions, id, addr)
            }
            HookPayload::DataLine(line) => {
                let cb = self.dataline.as_mut().ok_or_else(unregistered)?;
                cb(decisions, id, line.as_str())
            }
            HookPayload::Quit => {
                let cb = self.quit.as_mut().ok_or_else(unregistered)?;
                cb(decisions, id)
            }
            HookPayload::Close => {
                let cb = self.close.as_mut().ok_or_else(unregistered)?;
                cb(decisions, id)
            }
            HookPayload::Rset => {
                let cb = self.rset.as_mut().ok_or_else(unregistered)?;
                cb(decisions, id)
            }
        }
    }
}

/// Hook requests waiting for the plugin's verdict, keyed by session.
///
/// Every entry is removed by the same call that emits its decision.
#[derive(Default)]
pub struct Decisions {
    sessions: HashMap<SessionId, FilterMessage>,
    outgoing: Vec<Frame>,
}

impl Decisions {
    pub fn accept(&mut self, id: SessionId) -> Result<()> {
        let mut message = self.take(id)?;
        message.code = 0;
        debug!(session_id = id, hook = %message.kind(), "accepting");
        self.emit(message);
        Ok(())
    }

    /// Rejects the pending hook of `id`.
    ///
    /// Codes outside `[400, 600)` become 530. The status line is cut to the
    /// wire field size; the returned flag is `true` when that happened.
    pub fn reject(&mut self, id: SessionId, code: u32, status: &str) -> Result<bool> {
        let mut message = self.take(id)?;
        let (line, truncated) = fit_status_line(status);
        message.code = clamp_reject_code(code);
        message.status_line = line.to_string();
        if message.code != code {
            warn!(session_id = id, code, "invalid reject code, using {}", message.code);
        }
        if truncated {
            warn!(session_id = id, len = status.len(), "status line truncated");
        }
        debug!(session_id = id, hook = %message.kind(), code = message.code, "rejecting");
        self.emit(message);
        Ok(truncated)
    }

    pub fn is_pending(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn pending(&self) -> usize {
        self.sessions.len()
    }

    fn apply(&mut self, verdict: Verdict) -> Result<()> {
        match verdict {
            Verdict::Accept(id) => self.accept(id),
            Verdict::Reject { id, code, status } => self.reject(id, code, &status).map(|_| ()),
        }
    }

    fn open(&mut self, message: FilterMessage) -> Result<()> {
        let id = message.id;
        if self.sessions.contains_key(&id) {
            return Err(FilterError::SessionInFlight(id));
        }
        self.sessions.insert(id, message);
        Ok(())
    }

    fn take(&mut self, id: SessionId) -> Result<FilterMessage> {
        self.sessions
            .remove(&id)
            .ok_or(FilterError::UnknownSession(id))
    }

    fn emit(&mut self, message: FilterMessage) {
        self.outgoing
            .push(Frame::new(message.kind().tag(), message.encode()));
    }
}

#[derive(Debug)]
enum Verdict {
    Accept(SessionId),
    Reject {
        id: SessionId,
        code: u32,
        status: String,
    },
}

/// Decides pending sessions from outside a hook callback.
///
/// Verdicts are applied by [`FilterRuntime::run`] in the order they were
/// sent, and are held to the same rules as [`Decisions`]: a verdict for a
/// session with nothing pending stops the runtime with
/// [`FilterError::UnknownSession`].
#[derive(Debug, Clone)]
pub struct DecisionHandle {
    tx: mpsc::UnboundedSender<Verdict>,
}

impl DecisionHandle {
    pub fn accept(&self, id: SessionId) -> Result<()> {
        self.send(Verdict::Accept(id))
    }

    /// Same as [`Decisions::reject`]; the returned flag tells whether the
    /// status line will be cut.
    pub fn reject(&self, id: SessionId, code: u32, status: &str) -> Result<bool> {
        let (_, truncated) = fit_status_line(status);
        self.send(Verdict::Reject {
            id,
            code,
            status: status.to_string(),
        })?;
        Ok(truncated)
    }

    fn send(&self, verdict: Verdict) -> Result<()> {
        self.tx
            .send(verdict)
            .map_err(|_| FilterError::RuntimeStopped)
    }
}

/// Per-process state of a filter plugin: its channel to the agent, the
/// registered callbacks and the sessions awaiting a decision.
pub struct FilterRuntime<R, W> {
    channel: Channel<R, W>,
    handlers: Handlers,
    decisions: Decisions,
    deferred_tx: mpsc::UnboundedSender<Verdict>,
    deferred: mpsc::UnboundedReceiver<Verdict>,
}

impl<R, W> FilterRuntime<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(channel: Channel<R, W>) -> Self {
        let (deferred_tx, deferred) = mpsc::unbounded_channel();
        FilterRuntime {
            channel,
            handlers: Handlers::default(),
            decisions: Decisions::default(),
            deferred_tx,
            deferred,
        }
    }

    /// A handle for answering hook requests after their callback returned.
    pub fn handle(&self) -> DecisionHandle {
        DecisionHandle {
            tx: self.deferred_tx.clone(),
        }
    }

    /// Installs `handler`, replacing any earlier one for the same hook.
    pub fn register(&mut self, handler: Handler) -> &mut Self {
        self.handlers.register(handler);
        self
    }

    pub fn on_connect<F>(&mut self, cb: F) -> &mut Self
    where
        F: FnMut(&mut Decisions, SessionId, &ConnectInfo) -> Result<()> + Send + 'static,
    {
        self.register(Handler::Connect(Box::new(cb)))
    }

    pub fn on_helo<F>(&mut self, cb: F) -> &mut Self
    where
        F: FnMut(&mut Decisions, SessionId, &str) -> Result<()> + Send + 'static,
    {
        self.register(Handler::Helo(Box::new(cb)))
    }

    pub fn on_ehlo<F>(&mut self, cb: F) -> &mut Self
    where
        F: FnMut(&mut Decisions, SessionId, &str) -> Result<()> + Send + 'static,
    {
        self.register(Handler::Ehlo(Box::new(cb)))
    }

    pub fn on_mail<F>(&mut self, cb: F) -> &mut Self
    where
        F: FnMut(&mut Decisions, SessionId, &MailAddress) -> Result<()> + Send + 'static,
    {
        self.register(Handler::Mail(Box::new(cb)))
    }

    pub fn on_rcpt<F>(&mut self, cb: F) -> &mut Self
    where
        F: FnMut(&mut Decisions, SessionId, &MailAddress) -> Result<()> + Send + 'static,
    {
        self.register(Handler::Rcpt(Box::new(cb)))
    }

    pub fn on_dataline<F>(&mut self, cb: F) -> &mut Self
    where
        F: FnMut(&mut Decisions, SessionId, &str) -> Result<()> + Send + 'static,
    {
        self.register(Handler::DataLine(Box::new(cb)))
    }

    pub fn on_quit<F>(&mut self, cb: F) -> &mut Self
    where
        F: FnMut(&mut Decisions, SessionId) -> Result<()> + Send + 'static,
    {
        self.register(Handler::Quit(Box::new(cb)))
    }

    pub fn on_close<F>(&mut self, cb: F) -> &mut Self
    where
        F: FnMut(&mut Decisions, SessionId) -> Result<()> + Send + 'static,
    {
        self.register(Handler::Close(Box::new(cb)))
    }

    pub fn on_rset<F>(&mut self, cb: F) -> &mut Self
    where
        F: FnMut(&mut Decisions, SessionId) -> Result<()> + Send + 'static,
    {
        self.register(Handler::Rset(Box::new(cb)))
    }

    pub fn mask(&self) -> HookMask {
        self.handlers.mask
    }

    /// Announces the registered hooks, then serves hook requests until the
    /// agent closes the channel.
    ///
    /// Any protocol violation ends the loop with an error; the caller is
    /// expected to exit.
    pub async fn run(mut self) -> Result<()> {
        info!(hooks = ?self.handlers.mask.iter().collect::<Vec<_>>(), "registering filter");
        self.channel
            .compose(TAG_REGISTER, self.handlers.mask.encode());

        loop {
            tokio::select! {
                frame = self.channel.recv() => {
                    let Some(frame) = frame? else {
                        info!(pending = self.decisions.pending(), "agent closed the channel");
                        return Ok(());
                    };
                    self.dispatch(frame)?;
                }
                Some(verdict) = self.deferred.recv() => self.decisions.apply(verdict)?,
            }
            for frame in self.decisions.outgoing.drain(..) {
                self.channel.send(frame);
            }
        }
    }

    fn dispatch(&mut self, frame: Frame) -> Result<()> {
        let kind = HookKind::from_tag(frame.tag).ok_or(FilterError::UnknownMessage(frame.tag))?;
        let message = FilterMessage::decode(kind, &frame.payload)?;
        if !self.handlers.mask.contains(kind) {
            return Err(FilterError::UnregisteredHook(kind));
        }

        let id = message.id;
        let payload = message.payload.clone();
        self.decisions.open(message)?;
        debug!(session_id = id, hook = %kind, "hook request");
        self.handlers.invoke(&mut self.decisions, id, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rcpt(id: SessionId, user: &str, domain: &str) -> FilterMessage {
        FilterMessage::request(id, HookPayload::Rcpt(MailAddress::new(user, domain)))
    }

    #[test]
    fn test_accept_removes_entry() {
        let mut decisions = Decisions::default();
        decisions.open(rcpt(1, "a", "b.org")).unwrap();
        assert!(decisions.is_pending(1));

        decisions.accept(1).unwrap();
        assert!(!decisions.is_pending(1));
        assert_eq!(decisions.outgoing.len(), 1);

        let frame = &decisions.outgoing[0];
        assert_eq!(frame.tag, HookKind::Rcpt.tag());
        let reply = FilterMessage::decode(HookKind::Rcpt, &frame.payload).unwrap();
        assert!(reply.is_accept());
        assert_eq!(reply.id, 1);
    }

    #[test]
    fn test_second_decision_is_an_error() {
        let mut decisions = Decisions::default();
        decisions.open(rcpt(5, "a", "b.org")).unwrap();
        decisions.accept(5).unwrap();

        assert!(matches!(decisions.accept(5), Err(FilterError::UnknownSession(5))));
        assert!(matches!(
            decisions.reject(5, 550, "no"),
            Err(FilterError::UnknownSession(5))
        ));
        assert_eq!(decisions.outgoing.len(), 1);
    }

    #[test]
    fn test_reject_clamps_code() {
        let mut decisions = Decisions::default();
        for (id, code) in [(1, 250), (2, 550), (3, 999)] {
            decisions.open(rcpt(id, "a", "b.org")).unwrap();
            let truncated = decisions.reject(id, code, "5.7.1 denied").unwrap();
            assert!(!truncated);
        }

        let codes: Vec<u32> = decisions
            .outgoing
            .iter()
            .map(|f| FilterMessage::decode(HookKind::Rcpt, &f.payload).unwrap().code)
            .collect();
        assert_eq!(codes, vec![530, 550, 530]);
    }

    #[test]
    fn test_reject_reports_truncation() {
        let mut decisions = Decisions::default();
        decisions.open(rcpt(1, "a", "b.org")).unwrap();
        let long = "y".repeat(4096);
        assert!(decisions.reject(1, 451, &long).unwrap());

        let reply = FilterMessage::decode(HookKind::Rcpt, &decisions.outgoing[0].payload).unwrap();
        assert_eq!(reply.code, 451);
        assert!(long.starts_with(&reply.status_line));
    }

    #[test]
    fn test_open_twice_is_an_error() {
        let mut decisions = Decisions::default();
        decisions.open(rcpt(9, "a", "b.org")).unwrap();
        assert!(matches!(
            decisions.open(rcpt(9, "c", "d.org")),
            Err(FilterError::SessionInFlight(9))
        ));
    }

    #[test]
    fn test_register_is_last_write_wins() {
        let (a, _b) = tokio::io::duplex(64);
        let (r, w) = tokio::io::split(a);
        let mut runtime = FilterRuntime::new(Channel::new(r, w));
        runtime.on_quit(|d, id| d.reject(id, 421, "first").map(|_| ()));
        runtime.on_quit(|d, id| d.accept(id));
        assert_eq!(runtime.mask(), [HookKind::Quit].into_iter().collect::<HookMask>());

        runtime
            .dispatch(Frame::new(
                HookKind::Quit.tag(),
                FilterMessage::request(3, HookPayload::Quit).encode(),
            ))
            .unwrap();
        let reply =
            FilterMessage::decode(HookKind::Quit, &runtime.decisions.outgoing[0].payload).unwrap();
        assert!(reply.is_accept());
    }

    #[test]
    fn test_dispatch_unregistered_hook() {
        let (a, _b) = tokio::io::duplex(64);
        let (r, w) = tokio::io::split(a);
        let mut runtime = FilterRuntime::new(Channel::new(r, w));
        runtime.on_rcpt(|d, id, _| d.accept(id));

        let err = runtime
            .dispatch(Frame::new(
                HookKind::Helo.tag(),
                FilterMessage::request(1, HookPayload::Helo("mx".into())).encode(),
            ))
            .unwrap_err();
        assert!(matches!(err, FilterError::UnregisteredHook(HookKind::Helo)));
        assert_eq!(runtime.decisions.pending(), 0);
    }

    #[test]
    fn test_dispatch_unknown_tag() {
        let (a, _b) = tokio::io::duplex(64);
        let (r, w) = tokio::io::split(a);
        let mut runtime = FilterRuntime::new(Channel::new(r, w));
        let err = runtime.dispatch(Frame::new(999, Vec::new())).unwrap_err();
        assert!(matches!(err, FilterError::UnknownMessage(999)));
    }
}
