//! The 8-byte smux frame header and its codec.
//!
//! Wire layout: `version(1) | cmd(1) | length(2, LE) | stream_id(4, LE)`
//! followed by `length` payload bytes. Grounded on the header-then-payload
//! framing in `examples/original_source/smux.cpp`'s `do_receive_frame` and
//! restated with `bytes::{Buf, BufMut}` the way the KCP engine encodes its
//! own segment header.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 8;
pub const SMUX_VERSION: u8 = 1;

/// Maximum payload a single smux frame may carry; `async_write` on a stream
/// enforces this at the caller.
pub const MAX_FRAME_PAYLOAD: usize = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    Syn = 0,
    Fin = 1,
    Psh = 2,
    Nop = 3,
}

impl Cmd {
    fn from_u8(v: u8) -> Option<Cmd> {
        match v {
            0 => Some(Cmd::Syn),
            1 => Some(Cmd::Fin),
            2 => Some(Cmd::Psh),
            3 => Some(Cmd::Nop),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unrecognized smux cmd {0}")]
    UnknownCmd(u8),
    #[error("frame payload length {0} exceeds {MAX_FRAME_PAYLOAD}")]
    PayloadTooLarge(usize),
}

/// A decoded smux frame header, paired with its (already-read) payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub version: u8,
    pub cmd: Cmd,
    pub stream_id: u32,
    pub payload: Bytes,
}

/// Just the header, before its payload has been read off the wire.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub version: u8,
    pub cmd: Cmd,
    pub length: u16,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn decode(buf: &[u8; FRAME_HEADER_LEN]) -> Result<FrameHeader, FrameError> {
        let mut cur = &buf[..];
        let version = cur.get_u8();
        let cmd_byte = cur.get_u8();
        let length = cur.get_u16_le();
        let stream_id = cur.get_u32_le();
        let cmd = Cmd::from_u8(cmd_byte).ok_or(FrameError::UnknownCmd(cmd_byte))?;
        Ok(FrameHeader {
            version,
            cmd,
            length,
            stream_id,
        })
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(self.version);
        out.put_u8(self.cmd as u8);
        out.put_u16_le(self.length);
        out.put_u32_le(self.stream_id);
    }
}

impl Frame {
    pub fn syn(stream_id: u32) -> Frame {
        Frame {
            version: SMUX_VERSION,
            cmd: Cmd::Syn,
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn fin(stream_id: u32) -> Frame {
        Frame {
            version: SMUX_VERSION,
            cmd: Cmd::Fin,
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn nop() -> Frame {
        Frame {
            version: SMUX_VERSION,
            cmd: Cmd::Nop,
            stream_id: 0,
            payload: Bytes::new(),
        }
    }

    pub fn psh(stream_id: u32, payload: Bytes) -> Result<Frame, FrameError> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        Ok(Frame {
            version: SMUX_VERSION,
            cmd: Cmd::Psh,
            stream_id,
            payload,
        })
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            version: self.version,
            cmd: self.cmd,
            length: self.payload.len() as u16,
            stream_id: self.stream_id,
        }
    }

    /// Encode header + payload into a single contiguous buffer.
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        self.header().encode(&mut out);
        out.extend_from_slice(&self.payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(cmd: Cmd, length: u16, stream_id: u32) {
        let header = FrameHeader {
            version: SMUX_VERSION,
            cmd,
            length,
            stream_id,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), FRAME_HEADER_LEN);
        let mut arr = [0u8; FRAME_HEADER_LEN];
        arr.copy_from_slice(&buf);
        let decoded = FrameHeader::decode(&arr).unwrap();
        assert_eq!(decoded.version, SMUX_VERSION);
        assert_eq!(decoded.cmd, cmd);
        assert_eq!(decoded.length, length);
        assert_eq!(decoded.stream_id, stream_id);
    }

    #[test]
    fn header_roundtrip_all_cmds() {
        roundtrip(Cmd::Syn, 0, 1);
        roundtrip(Cmd::Fin, 0, 2);
        roundtrip(Cmd::Psh, 65535, u32::MAX);
        roundtrip(Cmd::Nop, 0, 0);
    }

    #[test]
    fn unknown_cmd_rejected() {
        let buf = [1u8, 200, 0, 0, 0, 0, 0, 0];
        assert!(FrameHeader::decode(&buf).is_err());
    }

    #[test]
    fn psh_rejects_oversized_payload() {
        let big = Bytes::from(vec![0u8; MAX_FRAME_PAYLOAD + 1]);
        assert!(Frame::psh(1, big).is_err());
    }

    #[test]
    fn full_frame_encode_matches_header_plus_payload() {
        let f = Frame::psh(7, Bytes::from_static(b"hello")).unwrap();
        let encoded = f.encode();
        assert_eq!(encoded.len(), FRAME_HEADER_LEN + 5);
        assert_eq!(&encoded[FRAME_HEADER_LEN..], b"hello");
    }
}
