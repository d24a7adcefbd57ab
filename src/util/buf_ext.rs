use std::fmt::{Display, Formatter};

use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

/// Marker error for reads that ran past the end of the buffer. Decoders use it to tell a
///  truncated buffer apart from a malformed one.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BufferUnderflow;

impl Display for BufferUnderflow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "buffer underflow")
    }
}
impl std::error::Error for BufferUnderflow {}

pub fn is_underflow(e: &anyhow::Error) -> bool {
    e.is::<BufferUnderflow>() || e.is::<bytes::TryGetError>()
}

pub trait BufExt: Buf + VarIntSupport {
    fn try_get_len_varint(&mut self) -> anyhow::Result<usize> {
        match self.try_get_usize_varint() {
            Ok(len) => Ok(len),
            Err(_) if !self.has_remaining() => Err(BufferUnderflow.into()),
            Err(e) => Err(anyhow!("VarInt error: {:?}", e)),
        }
    }

    fn try_get_array<const N: usize>(&mut self) -> anyhow::Result<[u8; N]> {
        if self.remaining() < N {
            return Err(BufferUnderflow.into());
        }
        let mut result = [0u8; N];
        self.copy_to_slice(&mut result);
        Ok(result)
    }

    /// reads a varint length followed by that many bytes, rejecting lengths above `max_len`
    fn try_get_len_prefixed(&mut self, max_len: usize) -> anyhow::Result<Bytes> {
        let len = self.try_get_len_varint()?;
        if len > max_len {
            return Err(anyhow!("length prefix {} exceeds maximum of {}", len, max_len));
        }
        if self.remaining() < len {
            return Err(BufferUnderflow.into());
        }
        Ok(self.copy_to_bytes(len))
    }
}

pub trait BufMutExt: BufMut + VarIntSupportMut {
    fn put_len_prefixed(&mut self, data: &[u8]) {
        self.put_usize_varint(data.len());
        self.put_slice(data);
    }
}

impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}
