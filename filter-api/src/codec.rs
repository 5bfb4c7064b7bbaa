use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::FilterError;

/// `tag: u32 BE` followed by `len: u32 BE`.
pub const FRAME_HEADER_SIZE: usize = 8;
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// One discrete message on a channel: a type tag and its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(tag: u32, payload: impl Into<Bytes>) -> Self {
        Frame {
            tag,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        FrameCodec { max_payload }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new(MAX_FRAME_PAYLOAD)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FilterError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FilterError> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &src[..FRAME_HEADER_SIZE];
        let tag = header.get_u32();
        let len = header.get_u32() as usize;
        if len > self.max_payload {
            return Err(FilterError::FrameTooLarge {
                len,
                max: self.max_payload,
            });
        }

        let total = FRAME_HEADER_SIZE + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_SIZE);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { tag, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FilterError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FilterError> {
        let len = frame.payload.len();
        if len > self.max_payload {
            return Err(FilterError::FrameTooLarge {
                len,
                max: self.max_payload,
            });
        }

        dst.reserve(FRAME_HEADER_SIZE + len);
        dst.put_u32(frame.tag);
        dst.put_u32(len as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(42, &b"hello"[..]), &mut buf)
            .unwrap();
        assert_eq!(buf.len(), FRAME_HEADER_SIZE + 5);

        let mut partial = buf.split_to(FRAME_HEADER_SIZE + 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.tag, 42);
        assert_eq!(&frame.payload[..], b"hello");
        assert!(partial.is_empty());
    }

    #[test]
    fn test_decode_two_frames_in_one_read() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Frame::new(1, &b"a"[..]), &mut buf).unwrap();
        codec.encode(Frame::new(2, Bytes::new()), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().tag, 1);
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.tag, 2);
        assert!(second.payload.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_is_an_error() {
        let mut codec = FrameCodec::new(4);
        let mut buf = BytesMut::new();
        buf.put_u32(7);
        buf.put_u32(5);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FilterError::FrameTooLarge { len: 5, max: 4 })
        ));

        let mut out = BytesMut::new();
        assert!(codec
            .encode(Frame::new(7, &b"12345"[..]), &mut out)
            .is_err());
    }
}
