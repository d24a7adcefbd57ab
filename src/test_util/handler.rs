use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::sleep;

use crate::connection::dispatcher::{Handler, Responder};
use crate::messaging::message::{Message, MessageType};

/// replies `Ok` with the request's payload
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(&self, request: Message, responder: Responder) {
        let reply = Message::reply_to(&request, MessageType::Ok)
            .with_payload(request.payload.clone());
        responder.respond(reply);
    }
}

/// replies with a fixed type and payload, regardless of the request
pub struct FixedReplyHandler {
    message_type: MessageType,
    payload: Bytes,
}

impl FixedReplyHandler {
    pub fn new(message_type: MessageType, payload: &'static str) -> FixedReplyHandler {
        FixedReplyHandler {
            message_type,
            payload: Bytes::from_static(payload.as_bytes()),
        }
    }
}

#[async_trait]
impl Handler for FixedReplyHandler {
    async fn handle(&self, request: Message, responder: Responder) {
        responder.respond(Message::reply_to(&request, self.message_type)
            .with_payload(self.payload.clone()));
    }
}

/// echoes like [EchoHandler], after a delay
pub struct DelayedEchoHandler(pub Duration);

#[async_trait]
impl Handler for DelayedEchoHandler {
    async fn handle(&self, request: Message, responder: Responder) {
        sleep(self.0).await;
        EchoHandler.handle(request, responder).await;
    }
}
