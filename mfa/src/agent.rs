//! Event loop of the mail filter worker.
use std::collections::HashMap;
use std::mem;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use filter_api::{Channel, FilterMessage, Frame, HookKind, HookMask};
use futures::future::try_join_all;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::process::Child;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CfgPeers;
use crate::coordinator::{Coordinator, FilterSlot, Outbound};
use crate::envelope::FilterDef;
use crate::filters;
use crate::imsg::{self, ImsgType};
use crate::logging::LogHandle;
use crate::peer::{self, Peer, PeerEvent, PeerLink};
use crate::MfaError;

type Result<T, E = MfaError> = std::result::Result<T, E>;

const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

enum Flow {
    Continue,
    Shutdown,
}

enum Conf {
    Unconfigured,
    Loading(Vec<FilterDef>),
    Configured,
}

pub struct Agent {
    coordinator: Coordinator,
    links: HashMap<Peer, PeerLink>,
    events_tx: Sender<PeerEvent>,
    events: Receiver<PeerEvent>,
    pumps: Vec<JoinHandle<()>>,
    children: Vec<(String, Child)>,
    conf: Conf,
    log: LogHandle,
    cancel: CancellationToken,
}

impl Agent {
    pub fn new(log: LogHandle) -> Self {
        let (events_tx, events) = async_channel::unbounded();
        Agent {
            coordinator: Coordinator::new(),
            links: HashMap::new(),
            events_tx,
            events,
            pumps: Vec::new(),
            children: Vec::new(),
            conf: Conf::Unconfigured,
            log,
            cancel: CancellationToken::new(),
        }
    }

    /// Connects to the parent, the front-end, the lookup agent and control.
    pub async fn connect(peers: &CfgPeers, log: LogHandle) -> Result<Self> {
        let mut agent = Agent::new(log);
        for (peer, path) in [
            (Peer::Parent, &peers.parent),
            (Peer::Smtp, &peers.smtp),
            (Peer::Lookup, &peers.lookup),
            (Peer::Control, &peers.control),
        ] {
            let stream = UnixStream::connect(path)
                .await
                .map_err(|source| MfaError::Connect {
                    peer,
                    path: path.to_string(),
                    source,
                })?;
            let (reader, writer) = stream.into_split();
            agent.attach(peer, Channel::new(reader, writer));
            debug!(%peer, %path, "connected");
        }
        Ok(agent)
    }

    pub fn attach<R, W>(&mut self, peer: Peer, channel: Channel<R, W>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (link, pump) = peer::spawn_peer(
            peer,
            channel,
            self.events_tx.clone(),
            self.cancel.child_token(),
        );
        self.links.insert(peer, link);
        self.pumps.push(pump);
    }

    /// Appends a registered filter to the chain.
    pub fn add_filter<R, W>(&mut self, name: String, mask: HookMask, channel: Channel<R, W>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        info!(filter = %name, hooks = ?mask.iter().collect::<Vec<_>>(), "filter registered");
        let index = self.coordinator.add_filter(FilterSlot { name, mask });
        self.attach(Peer::Filter(index), channel);
    }

    /// Hands a child process to the agent, which waits for it on shutdown.
    pub fn supervise(&mut self, name: String, child: Child) {
        self.children.push((name, child));
    }

    /// Serves until a signal or a collaborator hanging up asks for shutdown.
    ///
    /// In-flight sessions are dropped; the peers notice the closed channels.
    pub async fn run(mut self) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigchld = signal(SignalKind::child())?;
        info!("mail filter ready");

        let result = loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("received SIGINT");
                    break Ok(());
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM");
                    break Ok(());
                }
                _ = sighup.recv() => debug!("ignoring SIGHUP"),
                _ = sigchld.recv() => break Err(MfaError::UnexpectedSigchld),
                Ok(event) = self.events.recv() => match self.handle(event).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Shutdown) => break Ok(()),
                    Err(e) => break Err(e),
                },
            }
        };

        if let Err(e) = &result {
            error!("mail filter failed: {e}");
        }
        self.shutdown().await;
        result?;
        info!("mail filter exiting");
        Ok(())
    }

    async fn handle(&mut self, event: PeerEvent) -> Result<Flow> {
        match event {
            PeerEvent::Frame(peer, frame) => self.dispatch(peer, frame).await?,
            PeerEvent::Closed(Peer::Filter(index)) => {
                return Err(MfaError::FilterExited(self.filter_name(index)));
            }
            PeerEvent::Closed(peer) => {
                info!(%peer, "peer closed the channel");
                return Ok(Flow::Shutdown);
            }
            PeerEvent::Failed(peer, source) => return Err(MfaError::PeerFailed { peer, source }),
        }
        self.flush()?;
        Ok(Flow::Continue)
    }

    async fn dispatch(&mut self, peer: Peer, frame: Frame) -> Result<()> {
        let unexpected = MfaError::UnexpectedMessage {
            peer,
            tag: frame.tag,
        };

        if let Peer::Filter(index) = peer {
            let kind = HookKind::from_tag(frame.tag).ok_or(unexpected)?;
            let message = FilterMessage::decode(kind, &frame.payload)?;
            return self.coordinator.filter_decision(index, message);
        }

        let Some(ty) = ImsgType::from_tag(frame.tag) else {
            return Err(unexpected);
        };
        let payload = &frame.payload[..];
        debug!(%peer, msg = %ty, len = payload.len(), "received");

        match (peer, ty) {
            (Peer::Smtp, ImsgType::MfaConnect) => self.coordinator.test_connect(ty.decode(payload)?),
            (Peer::Smtp, ImsgType::MfaHelo) => self.coordinator.test_helo(ty.decode(payload)?),
            (Peer::Smtp, ImsgType::MfaEhlo) => self.coordinator.test_ehlo(ty.decode(payload)?),
            (Peer::Smtp, ImsgType::MfaMail) => self.coordinator.test_mail(ty.decode(payload)?),
            (Peer::Smtp, ImsgType::MfaRcpt) => self.coordinator.test_rcpt(ty.decode(payload)?),
            (Peer::Smtp, ImsgType::MfaDataline) => {
                self.coordinator.test_dataline(ty.decode(payload)?)
            }
            (Peer::Smtp, ImsgType::MfaQuit) => self.coordinator.test_quit(ty.decode(payload)?),
            (Peer::Smtp, ImsgType::MfaClose) => self.coordinator.test_close(ty.decode(payload)?),
            (Peer::Smtp, ImsgType::MfaRset) => self.coordinator.test_rset(ty.decode(payload)?),
            (Peer::Lookup, ImsgType::LkaMail | ImsgType::LkaRcpt | ImsgType::LkaRulematch) => {
                self.coordinator.lookup_reply(ty, ty.decode(payload)?)
            }
            (Peer::Parent, ImsgType::ConfStart) => self.conf_start(),
            (Peer::Parent, ImsgType::ConfFilter) => self.conf_filter(ty.decode(payload)?, unexpected),
            (Peer::Parent, ImsgType::ConfEnd) => self.conf_end(unexpected).await,
            (Peer::Parent | Peer::Control, ImsgType::CtlVerbose) => {
                self.set_verbose(imsg::decode_verbose(payload)?);
                Ok(())
            }
            _ => Err(unexpected),
        }
    }

    fn conf_start(&mut self) -> Result<()> {
        match self.conf {
            Conf::Unconfigured => {
                self.conf = Conf::Loading(Vec::new());
                Ok(())
            }
            _ => Err(MfaError::Reconfigure),
        }
    }

    // A later definition replaces an earlier one of the same name.
    fn conf_filter(&mut self, def: FilterDef, unexpected: MfaError) -> Result<()> {
        let Conf::Loading(defs) = &mut self.conf else {
            return Err(unexpected);
        };
        match defs.iter_mut().find(|d| d.name == def.name) {
            Some(existing) => *existing = def,
            None => defs.push(def),
        }
        Ok(())
    }

    async fn conf_end(&mut self, unexpected: MfaError) -> Result<()> {
        let Conf::Loading(defs) = mem::replace(&mut self.conf, Conf::Configured) else {
            return Err(unexpected);
        };

        let mut spawned = Vec::with_capacity(defs.len());
        for def in defs {
            let (child, channel) = filters::spawn_filter(&def)?;
            spawned.push((def.name, child, channel));
        }

        let masks = try_join_all(spawned.iter_mut().map(|(name, _, channel)| async move {
            tokio::time::timeout(REGISTER_TIMEOUT, filters::await_registration(name, channel))
                .await
                .unwrap_or_else(|_| Err(MfaError::RegisterTimeout(name.clone())))
        }))
        .await?;

        for ((name, child, channel), mask) in spawned.into_iter().zip(masks) {
            self.supervise(name.clone(), child);
            self.add_filter(name, mask, channel);
        }
        info!(filters = self.coordinator.filters().len(), "configuration loaded");
        Ok(())
    }

    fn set_verbose(&self, verbose: bool) {
        match self.log.set_verbose(verbose) {
            Ok(()) => info!(verbose, "log verbosity changed"),
            Err(e) => warn!("cannot change log verbosity: {e}"),
        }
    }

    fn flush(&mut self) -> Result<()> {
        for out in self.coordinator.drain() {
            let (peer, frame) = match out {
                Outbound::Smtp(ty, ss) => (Peer::Smtp, ty.compose(&ss)?),
                Outbound::Lookup(ty, ss) => (Peer::Lookup, ty.compose(&ss)?),
                Outbound::Filter { index, message } => (
                    Peer::Filter(index),
                    Frame::new(message.kind().tag(), message.encode()),
                ),
            };
            self.links
                .get(&peer)
                .ok_or(MfaError::PeerGone(peer))?
                .send(frame)?;
        }
        Ok(())
    }

    fn filter_name(&self, index: usize) -> String {
        self.coordinator
            .filters()
            .get(index)
            .map(|slot| slot.name.clone())
            .unwrap_or_else(|| Peer::Filter(index).to_string())
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.links.clear();
        for pump in self.pumps.drain(..) {
            let _ = pump.await;
        }

        for (name, mut child) in self.children.drain(..) {
            match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => debug!(filter = %name, %status, "filter exited"),
                Ok(Err(e)) => warn!(filter = %name, "cannot reap filter: {e}"),
                Err(_) => {
                    warn!(filter = %name, "filter did not exit, killing it");
                    let _ = child.kill().await;
                }
            }
        }

        if self.coordinator.in_flight() > 0 {
            debug!(sessions = self.coordinator.in_flight(), "dropping in-flight sessions");
        }
    }
}
