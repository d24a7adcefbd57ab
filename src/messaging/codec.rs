//! Binary encoding of control messages.
//!
//! ```ascii
//! 0:  discriminator: 0x00 for control messages (tunnel frames start with 0x40)
//! 1:  p2p version (u32)
//! 5:  message id (u32)
//! 9:  message type (u8)
//! 10: command (u8)
//! 11: flags (u8): keep-alive, UDP, requires tunnel, signed
//! 12: sender peer address, recipient peer address
//! *:  payload (varint length + bytes)
//! *:  if signed: public key, signature over all preceding bytes
//! *:  CRC-32 over all preceding bytes (u32)
//! ```
//!
//! All numbers are in network byte order.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::config::MAX_MESSAGE_SIZE;
use crate::messaging::message::{Command, Message, MessageType};
use crate::messaging::peer_address::PeerAddress;
use crate::messaging::signature::{KeyPair, SignatureProvider};
use crate::util::buf_ext::{is_underflow, BufExt, BufMutExt};

const CHECKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const FLAG_KEEP_ALIVE: u8 = 1;
const FLAG_UDP: u8 = 2;
const FLAG_REQUIRES_TUNNEL: u8 = 4;
const FLAG_SIGNED: u8 = 8;

/// The first byte of every datagram tells what kind of data follows. Routing on it never looks
///  at anything beyond that byte.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProtocolType {
    ControlMessage,
    TunnelPayload,
}

impl ProtocolType {
    pub const CONTROL_DISCRIMINATOR: u8 = 0;
    pub const TUNNEL_DISCRIMINATOR: u8 = 1 << 6;

    /// `None` for an empty buffer or a discriminator outside the known protocol types
    pub fn of_datagram(buf: &[u8]) -> Option<ProtocolType> {
        match buf.first()? >> 6 {
            0 => Some(ProtocolType::ControlMessage),
            1 => Some(ProtocolType::TunnelPayload),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum Decoded {
    Complete(Message),
    /// the buffer ended before the message did
    Incomplete,
}

pub trait WireCodec: Send + Sync + 'static {
    /// Encodes a message, signing it with the key pair if the message asks for a signature.
    fn encode(&self, message: &Message, key_pair: Option<&KeyPair>) -> anyhow::Result<Bytes>;

    /// Decodes a message received on `local` from `remote`. A signed message is only returned if
    ///  its signature verifies.
    fn decode(&self, buf: &[u8], local: SocketAddr, remote: SocketAddr) -> anyhow::Result<Decoded>;
}

pub struct BinaryWireCodec {
    signature_provider: Arc<dyn SignatureProvider>,
}

impl BinaryWireCodec {
    pub fn new(signature_provider: Arc<dyn SignatureProvider>) -> BinaryWireCodec {
        BinaryWireCodec { signature_provider }
    }

    fn try_decode(&self, buf: &[u8], local: SocketAddr, remote: SocketAddr) -> anyhow::Result<Message> {
        let mut cursor = buf;

        let discriminator = cursor.try_get_u8()?;
        if discriminator != ProtocolType::CONTROL_DISCRIMINATOR {
            bail!("not a control message: discriminator {:02x}", discriminator);
        }

        let version = cursor.try_get_u32()?;
        let message_id = cursor.try_get_u32()?;
        let raw_type = cursor.try_get_u8()?;
        let message_type = MessageType::try_from(raw_type)
            .map_err(|_| anyhow!("invalid message type {}", raw_type))?;
        let command = Command(cursor.try_get_u8()?);
        let flags = cursor.try_get_u8()?;

        let sender = PeerAddress::try_deser(&mut cursor)?;
        let recipient = PeerAddress::try_deser(&mut cursor)?;
        let payload = cursor.try_get_len_prefixed(MAX_MESSAGE_SIZE)?;

        let signed = flags & FLAG_SIGNED != 0;
        let mut signature_parts = None;
        if signed {
            let public_key = self.signature_provider.decode_public_key(&mut cursor)?;
            let signed_len = buf.len() - cursor.len();
            let signature = self.signature_provider.decode_signature(&mut cursor)?;
            signature_parts = Some((public_key, signed_len, signature));
        }

        let checked_len = buf.len() - cursor.len();
        let expected_checksum = cursor.try_get_u32()?;
        if cursor.has_remaining() {
            bail!("{} trailing bytes after message", cursor.remaining());
        }
        if CHECKSUM.checksum(&buf[..checked_len]) != expected_checksum {
            bail!("checksum mismatch");
        }

        let (public_key, signature) = match signature_parts {
            Some((public_key, signed_len, signature)) => {
                if !self.signature_provider.verify(&public_key, &buf[..signed_len], &signature) {
                    bail!("invalid signature in message {:08x} from {:?}", message_id, sender.peer_id);
                }
                (Some(public_key), Some(signature))
            }
            None => (None, None),
        };

        Ok(Message {
            message_id,
            version,
            message_type,
            command,
            sender,
            recipient,
            payload,
            keep_alive: flags & FLAG_KEEP_ALIVE != 0,
            is_udp: flags & FLAG_UDP != 0,
            requires_tunnel: flags & FLAG_REQUIRES_TUNNEL != 0,
            sign: signed,
            public_key,
            signature,
            local_socket: Some(local),
            remote_socket: Some(remote),
        })
    }
}

impl WireCodec for BinaryWireCodec {
    fn encode(&self, message: &Message, key_pair: Option<&KeyPair>) -> anyhow::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(128 + message.payload.len());

        buf.put_u8(ProtocolType::CONTROL_DISCRIMINATOR);
        buf.put_u32(message.version);
        buf.put_u32(message.message_id);
        buf.put_u8(message.message_type.into());
        buf.put_u8(message.command.0);

        let mut flags = 0;
        if message.keep_alive { flags |= FLAG_KEEP_ALIVE; }
        if message.is_udp { flags |= FLAG_UDP; }
        if message.requires_tunnel { flags |= FLAG_REQUIRES_TUNNEL; }
        if message.sign { flags |= FLAG_SIGNED; }
        buf.put_u8(flags);

        message.sender.ser(&mut buf);
        message.recipient.ser(&mut buf);
        buf.put_len_prefixed(&message.payload);

        if message.sign {
            let key_pair = key_pair
                .ok_or_else(|| anyhow!("{:?} should be signed, but there is no key pair", message))?;
            self.signature_provider.encode_public_key(&key_pair.public_key, &mut buf);
            let signature = self.signature_provider.sign(&key_pair.private_key, &buf)?;
            self.signature_provider.encode_signature(&signature, &mut buf);
        }

        let checksum = CHECKSUM.checksum(&buf);
        buf.put_u32(checksum);

        if buf.len() > MAX_MESSAGE_SIZE {
            bail!("encoded message has {} bytes, exceeding the maximum of {}", buf.len(), MAX_MESSAGE_SIZE);
        }
        Ok(buf.freeze())
    }

    fn decode(&self, buf: &[u8], local: SocketAddr, remote: SocketAddr) -> anyhow::Result<Decoded> {
        match self.try_decode(buf, local, remote) {
            Ok(message) => Ok(Decoded::Complete(message)),
            Err(e) if is_underflow(&e) => Ok(Decoded::Incomplete),
            Err(e) => Err(e),
        }
    }
}
