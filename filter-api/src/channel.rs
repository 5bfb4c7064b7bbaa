use std::collections::VecDeque;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, Stdin, Stdout};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::{Frame, FrameCodec};
use crate::FilterError;

/// Ordered, message framed, bidirectional link to exactly one peer.
///
/// [`Channel::send`] never waits: frames are queued and written out while the
/// owner is inside [`Channel::recv`], so a busy peer cannot stall the caller.
pub struct Channel<R, W> {
    reader: FramedRead<R, FrameCodec>,
    writer: FramedWrite<W, FrameCodec>,
    outbox: Outbox,
}

#[derive(Default)]
struct Outbox {
    frames: VecDeque<Frame>,
    // Frames were handed to the writer but not flushed yet.
    unflushed: bool,
}

impl Outbox {
    fn is_idle(&self) -> bool {
        self.frames.is_empty() && !self.unflushed
    }
}

impl Channel<Stdin, Stdout> {
    /// The channel a spawned plugin inherits from the agent.
    pub fn stdio() -> Self {
        Channel::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<R, W> Channel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Channel {
            reader: FramedRead::new(reader, FrameCodec::default()),
            writer: FramedWrite::new(writer, FrameCodec::default()),
            outbox: Outbox::default(),
        }
    }

    pub fn send(&mut self, frame: Frame) {
        self.outbox.frames.push_back(frame);
    }

    pub fn compose(&mut self, tag: u32, payload: impl Into<Bytes>) {
        self.send(Frame::new(tag, payload));
    }

    /// Frames waiting to be written.
    pub fn queued(&self) -> usize {
        self.outbox.frames.len()
    }

    /// Waits for the next inbound frame while draining the write queue.
    ///
    /// Returns `Ok(None)` once the peer closed its end.
    pub async fn recv(&mut self) -> Result<Option<Frame>, FilterError> {
        loop {
            if self.outbox.is_idle() {
                return self.reader.next().await.transpose();
            }

            tokio::select! {
                frame = self.reader.next() => return frame.transpose(),
                res = drain(&mut self.writer, &mut self.outbox) => res?,
            }
        }
    }

    /// Writes out everything queued so far.
    pub async fn flush(&mut self) -> Result<(), FilterError> {
        drain(&mut self.writer, &mut self.outbox).await
    }
}

// Cancel safe: a frame leaves the queue only in the same poll that hands it
// to the writer.
async fn drain<W>(writer: &mut FramedWrite<W, FrameCodec>, outbox: &mut Outbox) -> Result<(), FilterError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbox.frames.front() {
        writer.feed(frame.clone()).await?;
        outbox.frames.pop_front();
        outbox.unflushed = true;
    }
    writer.flush().await?;
    outbox.unflushed = false;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (a, b) = tokio::io::duplex(64);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let mut left = Channel::new(ar, aw);
        let mut right = Channel::new(br, bw);

        // Larger than the duplex buffer, so writes need the peer to read.
        left.compose(1, vec![1u8; 200]);
        left.compose(2, &b"second"[..]);
        assert_eq!(left.queued(), 2);

        let writer = tokio::spawn(async move {
            left.flush().await.unwrap();
            left
        });

        let first = right.recv().await.unwrap().unwrap();
        assert_eq!(first.tag, 1);
        assert_eq!(first.payload.len(), 200);
        let second = right.recv().await.unwrap().unwrap();
        assert_eq!(second.tag, 2);
        assert_eq!(&second.payload[..], b"second");

        let left = writer.await.unwrap();
        assert_eq!(left.queued(), 0);
    }

    #[tokio::test]
    async fn test_recv_drains_queue_while_waiting() {
        let (a, b) = tokio::io::duplex(1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let mut left = Channel::new(ar, aw);
        let mut right = Channel::new(br, bw);

        left.compose(9, &b"ping"[..]);
        let echo = tokio::spawn(async move {
            let frame = right.recv().await.unwrap().unwrap();
            right.send(Frame::new(frame.tag + 1, frame.payload));
            right.flush().await.unwrap();
        });

        let reply = left.recv().await.unwrap().unwrap();
        assert_eq!(reply.tag, 10);
        assert_eq!(&reply.payload[..], b"ping");
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_end_of_stream() {
        let (a, b) = tokio::io::duplex(64);
        let (ar, aw) = tokio::io::split(a);
        let mut channel = Channel::new(ar, aw);
        drop(b);
        assert!(channel.recv().await.unwrap().is_none());
    }
}
