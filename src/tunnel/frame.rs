//! Tunnel frames share the UDP flow with control messages, distinguished by the first byte.
//!
//! ```ascii
//! 0: 0x40 | kind (u8)       Connect=1 ConnectAck=2 Data=3 Close=4
//! 1: session id (u32)
//! 5: Data only: sequence number (u32), followed by the payload (rest of the datagram)
//! ```

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::messaging::codec::ProtocolType;

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum FrameKind {
    Connect = 1,
    ConnectAck = 2,
    Data = 3,
    Close = 4,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TunnelFrame {
    Connect { session_id: u32 },
    ConnectAck { session_id: u32 },
    Data { session_id: u32, seq: u32, payload: Bytes },
    Close { session_id: u32 },
}

impl TunnelFrame {
    pub fn session_id(&self) -> u32 {
        match self {
            TunnelFrame::Connect { session_id } => *session_id,
            TunnelFrame::ConnectAck { session_id } => *session_id,
            TunnelFrame::Data { session_id, .. } => *session_id,
            TunnelFrame::Close { session_id } => *session_id,
        }
    }

    fn kind(&self) -> FrameKind {
        match self {
            TunnelFrame::Connect { .. } => FrameKind::Connect,
            TunnelFrame::ConnectAck { .. } => FrameKind::ConnectAck,
            TunnelFrame::Data { .. } => FrameKind::Data,
            TunnelFrame::Close { .. } => FrameKind::Close,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(ProtocolType::TUNNEL_DISCRIMINATOR | u8::from(self.kind()));
        buf.put_u32(self.session_id());
        if let TunnelFrame::Data { seq, payload, .. } = self {
            buf.put_u32(*seq);
            buf.put_slice(payload);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn try_deser(buf: &[u8]) -> anyhow::Result<TunnelFrame> {
        let mut buf = buf;
        let first = buf.try_get_u8()?;
        if ProtocolType::of_datagram(&[first]) != Some(ProtocolType::TunnelPayload) {
            bail!("not a tunnel frame: discriminator {:02x}", first);
        }
        let raw_kind = first & !ProtocolType::TUNNEL_DISCRIMINATOR;
        let kind = FrameKind::try_from(raw_kind)
            .map_err(|_| anyhow!("invalid tunnel frame kind {}", raw_kind))?;
        let session_id = buf.try_get_u32()?;

        let frame = match kind {
            FrameKind::Connect => TunnelFrame::Connect { session_id },
            FrameKind::ConnectAck => TunnelFrame::ConnectAck { session_id },
            FrameKind::Data => {
                let seq = buf.try_get_u32()?;
                let payload = Bytes::copy_from_slice(buf);
                buf.advance(buf.len());
                TunnelFrame::Data { session_id, seq, payload }
            }
            FrameKind::Close => TunnelFrame::Close { session_id },
        };

        if buf.has_remaining() {
            bail!("{} trailing bytes after tunnel frame", buf.remaining());
        }
        Ok(frame)
    }
}
