use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;

use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::messaging::peer_address::{PeerAddress, PeerId};
use crate::messaging::signature::{PublicKey, Signature};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    Ack = 1,
    Ok = 2,
    PartiallyOk = 3,
    NotFound = 4,
    Denied = 5,
    UnknownId = 6,
    Exception = 7,
}

impl MessageType {
    pub fn is_request(&self) -> bool {
        *self == MessageType::Request
    }

    pub fn is_ack(&self) -> bool {
        *self == MessageType::Ack
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, MessageType::Ok | MessageType::PartiallyOk)
    }

    /// a regular negative answer, i.e. the remote peer processed the request
    pub fn is_not_ok(&self) -> bool {
        matches!(self, MessageType::NotFound | MessageType::Denied)
    }

    /// the remote peer could not process the request at all
    pub fn is_error(&self) -> bool {
        matches!(self, MessageType::UnknownId | MessageType::Exception)
    }
}

/// Opcode selecting the handler for a request
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Command(pub u8);

impl Command {
    pub const PING: Command = Command(0);
}

impl Debug for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if *self == Command::PING {
            write!(f, "PING")
        }
        else {
            write!(f, "CMD{}", self.0)
        }
    }
}

/// How [crate::connection::sender::Sender] treats an outbound message
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendMode {
    /// wait for the reply
    RequestReply,
    /// transmit and return, no reply is expected
    FireAndForget,
    /// fire-and-forget to every UDP socket address of the recipient
    Broadcast,
}

/// Correlates a reply with the request that caused it. It is unique among concurrently
///  outstanding exchanges since message ids are random.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ExchangeKey {
    pub message_id: u32,
    pub sender: PeerId,
    pub recipient: PeerId,
}

impl ExchangeKey {
    pub fn of_request(request: &Message) -> ExchangeKey {
        ExchangeKey {
            message_id: request.message_id,
            sender: request.sender.peer_id,
            recipient: request.recipient.peer_id,
        }
    }

    /// The key of the request a reply answers: sender and recipient are swapped.
    pub fn of_reply(reply: &Message) -> ExchangeKey {
        ExchangeKey {
            message_id: reply.message_id,
            sender: reply.recipient.peer_id,
            recipient: reply.sender.peer_id,
        }
    }

    /// the key of a request sent to [PeerId::ZERO] that this reply may answer
    pub fn with_zero_recipient(&self) -> ExchangeKey {
        ExchangeKey {
            recipient: PeerId::ZERO,
            ..*self
        }
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct Message {
    pub message_id: u32,
    pub version: u32,
    pub message_type: MessageType,
    pub command: Command,
    pub sender: PeerAddress,
    pub recipient: PeerAddress,
    pub payload: Bytes,

    pub keep_alive: bool,
    pub is_udp: bool,
    pub requires_tunnel: bool,

    /// Outbound: sign the message when encoding it. Inbound: the message carried a signature,
    ///  which was verified by the codec.
    pub sign: bool,
    pub public_key: Option<PublicKey>,
    pub signature: Option<Signature>,

    /// Socket addresses the message was received on / from. They are filled in when a message is
    ///  decoded and are never sent over the wire.
    pub local_socket: Option<SocketAddr>,
    pub remote_socket: Option<SocketAddr>,
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message{{{:?} {:?} id={:08x} {:?} -> {:?}, {} bytes",
               self.message_type,
               self.command,
               self.message_id,
               self.sender.peer_id,
               self.recipient.peer_id,
               self.payload.len(),
        )?;
        if self.keep_alive { write!(f, " keep-alive")?; }
        if !self.is_udp { write!(f, " tcp")?; }
        if self.requires_tunnel { write!(f, " tunnel")?; }
        if self.sign { write!(f, " signed")?; }
        write!(f, "}}")
    }
}

impl Message {
    /// A new request with a fresh random message id. The version tag is stamped by the sender.
    pub fn request(sender: PeerAddress, recipient: PeerAddress, command: Command, payload: impl Into<Bytes>) -> Message {
        Message {
            message_id: rand::random(),
            version: 0,
            message_type: MessageType::Request,
            command,
            sender,
            recipient,
            payload: payload.into(),
            keep_alive: false,
            is_udp: true,
            requires_tunnel: false,
            sign: false,
            public_key: None,
            signature: None,
            local_socket: None,
            remote_socket: None,
        }
    }

    /// A reply of the given type: same message id, command and transport flags as the request,
    ///  sender and recipient swapped, empty payload.
    pub fn reply_to(request: &Message, message_type: MessageType) -> Message {
        Message {
            message_id: request.message_id,
            version: request.version,
            message_type,
            command: request.command,
            sender: request.recipient.clone(),
            recipient: request.sender.clone(),
            payload: Bytes::new(),
            keep_alive: request.keep_alive,
            is_udp: request.is_udp,
            requires_tunnel: false,
            sign: false,
            public_key: None,
            signature: None,
            local_socket: None,
            remote_socket: request.remote_socket,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Message {
        self.payload = payload.into();
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Message {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_tcp(mut self) -> Message {
        self.is_udp = false;
        self
    }

    pub fn with_tunnel(mut self) -> Message {
        self.requires_tunnel = true;
        self
    }

    pub fn with_signature(mut self) -> Message {
        self.sign = true;
        self
    }

    pub fn exchange_key(&self) -> ExchangeKey {
        if self.message_type.is_request() {
            ExchangeKey::of_request(self)
        }
        else {
            ExchangeKey::of_reply(self)
        }
    }
}
