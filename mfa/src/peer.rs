use std::fmt;

use async_channel::{Receiver, Sender};
use filter_api::{Channel, FilterError, Frame};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::MfaError;

/// Process at the other end of one of the agent's channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Peer {
    Parent,
    Smtp,
    Lookup,
    Control,
    /// Filter plugin, by position in the configured chain.
    Filter(usize),
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Parent => f.write_str("parent"),
            Peer::Smtp => f.write_str("smtp"),
            Peer::Lookup => f.write_str("lookup"),
            Peer::Control => f.write_str("control"),
            Peer::Filter(index) => write!(f, "filter #{index}"),
        }
    }
}

#[derive(Debug)]
pub enum PeerEvent {
    Frame(Peer, Frame),
    Closed(Peer),
    Failed(Peer, FilterError),
}

/// Sending side of a peer's channel. Never waits.
#[derive(Debug, Clone)]
pub struct PeerLink {
    peer: Peer,
    outbound: Sender<Frame>,
}

impl PeerLink {
    pub fn peer(&self) -> Peer {
        self.peer
    }

    pub fn send(&self, frame: Frame) -> Result<(), MfaError> {
        self.outbound
            .try_send(frame)
            .map_err(|_| MfaError::PeerGone(self.peer))
    }
}

/// Moves frames between `channel` and the agent's event queue.
///
/// The task ends after reporting end of stream or a channel error, when the
/// token is cancelled, or once every [`PeerLink`] is dropped. Ending drops the
/// channel, which closes the connection.
pub fn spawn_peer<R, W>(
    peer: Peer,
    channel: Channel<R, W>,
    events: Sender<PeerEvent>,
    cancel: CancellationToken,
) -> (PeerLink, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound, queue) = async_channel::unbounded();
    let pump = tokio::spawn(pump(peer, channel, queue, events, cancel));
    (PeerLink { peer, outbound }, pump)
}

async fn pump<R, W>(
    peer: Peer,
    mut channel: Channel<R, W>,
    queue: Receiver<Frame>,
    events: Sender<PeerEvent>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let last = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(%peer, queued = channel.queued(), "dropping channel");
                return;
            }
            frame = queue.recv() => match frame {
                Ok(frame) => channel.send(frame),
                Err(_) => match channel.flush().await {
                    Ok(()) => {
                        debug!(%peer, "hanging up");
                        return;
                    }
                    Err(e) => break PeerEvent::Failed(peer, e),
                },
            },
            inbound = channel.recv() => match inbound {
                Ok(Some(frame)) => {
                    if events.send(PeerEvent::Frame(peer, frame)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break PeerEvent::Closed(peer),
                Err(e) => break PeerEvent::Failed(peer, e),
            },
        }
    };
    let _ = events.send(last).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type Remote = Channel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn setup(
        peer: Peer,
        cancel: CancellationToken,
    ) -> (PeerLink, JoinHandle<()>, Receiver<PeerEvent>, Remote) {
        let (a, b) = tokio::io::duplex(4096);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let (events_tx, events) = async_channel::unbounded();
        let (link, pump) = spawn_peer(peer, Channel::new(ar, aw), events_tx, cancel);
        (link, pump, events, Channel::new(br, bw))
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (link, _pump, events, mut remote) = setup(Peer::Smtp, CancellationToken::new());

        link.send(Frame::new(100, &b"to remote"[..])).unwrap();
        let frame = remote.recv().await.unwrap().unwrap();
        assert_eq!(frame.tag, 100);
        assert_eq!(&frame.payload[..], b"to remote");

        remote.compose(101, &b"to agent"[..]);
        remote.flush().await.unwrap();
        match events.recv().await.unwrap() {
            PeerEvent::Frame(Peer::Smtp, frame) => assert_eq!(frame.tag, 101),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_close_is_reported() {
        let (_link, pump, events, remote) = setup(Peer::Lookup, CancellationToken::new());
        drop(remote);
        assert!(matches!(
            events.recv().await.unwrap(),
            PeerEvent::Closed(Peer::Lookup)
        ));
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_links_hangs_up() {
        let (link, pump, _events, mut remote) = setup(Peer::Filter(2), CancellationToken::new());
        link.send(Frame::new(18, Vec::new())).unwrap();
        drop(link);
        pump.await.unwrap();

        // The queued frame is written before the hang-up.
        assert_eq!(remote.recv().await.unwrap().unwrap().tag, 18);
        assert!(remote.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_stops_the_pump() {
        let cancel = CancellationToken::new();
        let (link, pump, _events, mut remote) = setup(Peer::Parent, cancel.clone());
        cancel.cancel();
        pump.await.unwrap();

        assert!(remote.recv().await.unwrap().is_none());
        assert!(matches!(
            link.send(Frame::new(1, Vec::new())),
            Err(MfaError::PeerGone(Peer::Parent))
        ));
    }
}
