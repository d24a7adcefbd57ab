use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, trace, warn};

use crate::connection::peer_status::{FailureReason, PeerStatusListeners};
use crate::messaging::message::{Command, Message, MessageType};
use crate::messaging::peer_address::PeerId;

/// Application code that answers requests for a command.
///
/// This is called on a task of its own per request, so it may take its time. It must use the
///  [Responder] exactly once; a responder that is dropped unused sends an `Exception` reply.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: Message, responder: Responder);
}

#[derive(Debug)]
pub enum HandlerOutcome {
    Respond(Message),
    /// the request was fire-and-forget, nothing is sent back
    FireAndForget,
}

pub struct Responder {
    /// template for failure replies
    failure_reply: Message,
    outcome: Option<oneshot::Sender<HandlerOutcome>>,
}

impl Debug for Responder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Responder{{{:?}}}", self.failure_reply)
    }
}

impl Responder {
    pub fn new(request: &Message) -> (Responder, oneshot::Receiver<HandlerOutcome>) {
        let (outcome, outcome_recv) = oneshot::channel();
        let responder = Responder {
            failure_reply: Message::reply_to(request, MessageType::Exception),
            outcome: Some(outcome),
        };
        (responder, outcome_recv)
    }

    pub fn respond(mut self, reply: Message) {
        self.complete(HandlerOutcome::Respond(reply));
    }

    /// Replies with the given (failure) type and the reason as payload
    pub fn fail(mut self, message_type: MessageType, reason: &str) {
        let mut reply = self.failure_reply.clone();
        reply.message_type = message_type;
        reply.payload = Bytes::copy_from_slice(reason.as_bytes());
        self.complete(HandlerOutcome::Respond(reply));
    }

    pub fn respond_fire_and_forget(mut self) {
        self.complete(HandlerOutcome::FireAndForget);
    }

    fn complete(&mut self, outcome: HandlerOutcome) {
        if let Some(sender) = self.outcome.take() {
            sender.send(outcome).ok();
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.outcome.is_some() {
            warn!("handler for {:?} dropped its responder without responding", self.failure_reply.command);
            let reply = self.failure_reply.clone()
                .with_payload("handler did not respond");
            self.complete(HandlerOutcome::Respond(reply));
        }
    }
}

type HandlerMap = FxHashMap<Command, Arc<dyn Handler>>;

/// Routes inbound requests to registered handlers.
///
/// Handlers are registered per `(owner, on_behalf_of)` pair: a peer registers its own handlers
///  with `owner == on_behalf_of == own id`, a relay additionally registers handlers on behalf of
///  the peers it relays for.
pub struct Dispatcher {
    p2p_version: u32,
    local_server_id: PeerId,
    handlers: RwLock<BTreeMap<(PeerId, PeerId), HandlerMap>>,
    peer_status: Arc<PeerStatusListeners>,
}

impl Dispatcher {
    pub fn new(p2p_version: u32, local_server_id: PeerId, peer_status: Arc<PeerStatusListeners>) -> Dispatcher {
        Dispatcher {
            p2p_version,
            local_server_id,
            handlers: Default::default(),
            peer_status,
        }
    }

    pub fn local_server_id(&self) -> PeerId {
        self.local_server_id
    }

    /// Replaces a handler registered for the same key
    pub async fn register(&self, owner: PeerId, on_behalf_of: PeerId, command: Command, handler: Arc<dyn Handler>) {
        debug!(?owner, ?on_behalf_of, ?command, "registering handler");
        let prev = self.handlers.write().await
            .entry((owner, on_behalf_of))
            .or_default()
            .insert(command, handler);
        if prev.is_some() {
            debug!(?owner, ?on_behalf_of, ?command, "replaced previously registered handler");
        }
    }

    /// Removes all handlers for the pair, returning `false` if there were none
    pub async fn unregister(&self, owner: PeerId, on_behalf_of: PeerId) -> bool {
        debug!(?owner, ?on_behalf_of, "unregistering handlers");
        self.handlers.write().await
            .remove(&(owner, on_behalf_of))
            .is_some()
    }

    /// Looks up the handler for a request: handlers the recipient owns come first, handlers
    ///  this peer registered on the recipient's behalf second.
    pub async fn associated_handler(&self, message: &Message) -> Option<Arc<dyn Handler>> {
        let recipient = if message.recipient.peer_id.is_zero() && message.command == Command::PING {
            self.local_server_id
        }
        else {
            message.recipient.peer_id
        };

        let handlers = self.handlers.read().await;
        [(recipient, recipient), (self.local_server_id, recipient)].iter()
            .filter_map(|key| handlers.get(key))
            .find_map(|by_command| by_command.get(&message.command))
            .cloned()
    }

    async fn known_commands(&self, message: &Message) -> Vec<Command> {
        let handlers = self.handlers.read().await;
        let recipient = message.recipient.peer_id;
        let mut result = [(recipient, recipient), (self.local_server_id, recipient)].iter()
            .filter_map(|key| handlers.get(key))
            .flat_map(|by_command| by_command.keys().copied())
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    /// Handles an inbound request, returning the reply to send back (if any).
    pub async fn dispatch(&self, message: Message) -> Option<Message> {
        if message.version != self.p2p_version {
            warn!("message {:?} has p2p version {}, expected {} - dropping", message, message.version, self.p2p_version);
            self.peer_status.peer_failed(&message.sender, FailureReason::ProtocolError("wrong p2p version".to_string())).await;
            return None;
        }

        if message.message_type.is_ack() {
            trace!("received ACK from {:?}", message.sender.peer_id);
            self.peer_status.peer_found(&message.sender).await;
            return None;
        }

        if !message.message_type.is_request() {
            warn!("dispatcher received a reply {:?} - ignoring", message);
            return None;
        }

        let Some(handler) = self.associated_handler(&message).await else {
            warn!("no handler for {:?}, known commands for the recipient are {:?}", message, self.known_commands(&message).await);
            return Some(self.finish_reply(Message::reply_to(&message, MessageType::UnknownId)));
        };

        let (responder, outcome) = Responder::new(&message);
        handler.handle(message, responder).await;

        match outcome.await {
            Ok(HandlerOutcome::Respond(reply)) => Some(self.finish_reply(reply)),
            Ok(HandlerOutcome::FireAndForget) => None,
            // the responder's drop handler always completes the outcome
            Err(_) => None,
        }
    }

    fn finish_reply(&self, mut reply: Message) -> Message {
        reply.version = self.p2p_version;
        if reply.sender.peer_id.is_zero() {
            reply.sender.peer_id = self.local_server_id;
        }
        reply
    }
}

#[cfg(test)]
mod test {
    use mockall::predicate::eq;
    use tokio::runtime::Builder;

    use crate::connection::peer_status::MockPeerStatusListener;
    use crate::messaging::peer_address::PeerAddress;
    use crate::test_util::handler::{EchoHandler, FixedReplyHandler};
    use crate::test_util::peer::test_peer_address_from_number;

    use super::*;

    const VERSION: u32 = 7;

    fn runtime() -> tokio::runtime::Runtime {
        Builder::new_current_thread().enable_all().build().unwrap()
    }

    fn dispatcher(server: u16) -> Dispatcher {
        Dispatcher::new(VERSION, PeerId::from(server as u64), Arc::new(PeerStatusListeners::default()))
    }

    fn request(to: PeerAddress, command: Command) -> Message {
        let mut request = Message::request(test_peer_address_from_number(1), to, command, "hi");
        request.version = VERSION;
        request
    }

    #[test]
    fn test_unknown_command_yields_unknown_id() {
        runtime().block_on(async {
            let dispatcher = dispatcher(2);
            let request = request(test_peer_address_from_number(2), Command(9));

            let reply = dispatcher.dispatch(request.clone()).await.unwrap();
            assert_eq!(reply.message_type, MessageType::UnknownId);
            assert_eq!(reply.message_id, request.message_id);
            assert_eq!(reply.version, VERSION);
        });
    }

    #[test]
    fn test_dispatch_to_handler() {
        runtime().block_on(async {
            let dispatcher = dispatcher(2);
            let id = PeerId::from(2);
            dispatcher.register(id, id, Command(1), Arc::new(EchoHandler)).await;

            let reply = dispatcher.dispatch(request(test_peer_address_from_number(2), Command(1))).await.unwrap();
            assert_eq!(reply.message_type, MessageType::Ok);
            assert_eq!(reply.payload.as_ref(), b"hi");
        });
    }

    #[test]
    fn test_lookup_prefers_direct_ownership() {
        runtime().block_on(async {
            let dispatcher = dispatcher(2);
            let server = PeerId::from(2);
            let relayed = PeerId::from(5);
            dispatcher.register(relayed, relayed, Command(1), Arc::new(FixedReplyHandler::new(MessageType::Ok, "direct"))).await;
            dispatcher.register(server, relayed, Command(1), Arc::new(FixedReplyHandler::new(MessageType::Ok, "on behalf"))).await;

            let reply = dispatcher.dispatch(request(test_peer_address_from_number(5), Command(1))).await.unwrap();
            assert_eq!(reply.payload.as_ref(), b"direct");

            assert!(dispatcher.unregister(relayed, relayed).await);
            assert!(!dispatcher.unregister(relayed, relayed).await);

            let reply = dispatcher.dispatch(request(test_peer_address_from_number(5), Command(1))).await.unwrap();
            assert_eq!(reply.payload.as_ref(), b"on behalf");
        });
    }

    #[test]
    fn test_register_replaces_previous_handler() {
        runtime().block_on(async {
            let dispatcher = dispatcher(2);
            let id = PeerId::from(2);
            dispatcher.register(id, id, Command(1), Arc::new(FixedReplyHandler::new(MessageType::Ok, "first"))).await;
            dispatcher.register(id, id, Command(1), Arc::new(FixedReplyHandler::new(MessageType::Ok, "second"))).await;

            let reply = dispatcher.dispatch(request(test_peer_address_from_number(2), Command(1))).await.unwrap();
            assert_eq!(reply.payload.as_ref(), b"second");
        });
    }

    #[test]
    fn test_ping_to_zero_id_uses_server_handlers() {
        runtime().block_on(async {
            let dispatcher = dispatcher(2);
            let id = PeerId::from(2);
            dispatcher.register(id, id, Command::PING, Arc::new(FixedReplyHandler::new(MessageType::Ok, "pong"))).await;

            let mut to = test_peer_address_from_number(2);
            to.peer_id = PeerId::ZERO;
            let reply = dispatcher.dispatch(request(to, Command::PING)).await.unwrap();
            assert_eq!(reply.payload.as_ref(), b"pong");
            assert_eq!(reply.sender.peer_id, id);
        });
    }

    #[test]
    fn test_ack_marks_sender_found() {
        runtime().block_on(async {
            let sender = test_peer_address_from_number(2);

            let mut listener = MockPeerStatusListener::new();
            listener.expect_on_peer_found()
                .with(eq(sender.clone()))
                .times(1)
                .return_const(());
            let listeners = Arc::new(PeerStatusListeners::default());
            listeners.add(Arc::new(listener)).await;
            let dispatcher = Dispatcher::new(VERSION, PeerId::from(1), listeners);

            let mut ack = Message::reply_to(&request(sender, Command(1)), MessageType::Ack);
            ack.version = VERSION;
            assert!(dispatcher.dispatch(ack).await.is_none());
        });
    }

    #[test]
    fn test_version_mismatch_reports_sender() {
        runtime().block_on(async {
            let mut listener = MockPeerStatusListener::new();
            listener.expect_on_peer_failed()
                .with(eq(test_peer_address_from_number(1)), eq(FailureReason::ProtocolError("wrong p2p version".to_string())))
                .times(1)
                .return_const(());
            let listeners = Arc::new(PeerStatusListeners::default());
            listeners.add(Arc::new(listener)).await;
            let dispatcher = Dispatcher::new(VERSION, PeerId::from(2), listeners);
            let id = PeerId::from(2);
            dispatcher.register(id, id, Command(1), Arc::new(EchoHandler)).await;

            let mut request = request(test_peer_address_from_number(2), Command(1));
            request.version = VERSION + 1;
            assert!(dispatcher.dispatch(request).await.is_none());
        });
    }

    #[test]
    fn test_dropped_responder_yields_exception() {
        runtime().block_on(async {
            let dispatcher = dispatcher(2);
            let id = PeerId::from(2);

            let mut handler = MockHandler::new();
            handler.expect_handle()
                .times(1)
                .returning(|_, responder| drop(responder));
            dispatcher.register(id, id, Command(1), Arc::new(handler)).await;

            let reply = dispatcher.dispatch(request(test_peer_address_from_number(2), Command(1))).await.unwrap();
            assert_eq!(reply.message_type, MessageType::Exception);
        });
    }

    #[test]
    fn test_fire_and_forget_and_fail() {
        runtime().block_on(async {
            let dispatcher = dispatcher(2);
            let id = PeerId::from(2);

            let mut silent = MockHandler::new();
            silent.expect_handle()
                .returning(|_, responder| responder.respond_fire_and_forget());
            dispatcher.register(id, id, Command(1), Arc::new(silent)).await;

            let mut denying = MockHandler::new();
            denying.expect_handle()
                .returning(|_, responder| responder.fail(MessageType::Denied, "not allowed"));
            dispatcher.register(id, id, Command(2), Arc::new(denying)).await;

            assert!(dispatcher.dispatch(request(test_peer_address_from_number(2), Command(1))).await.is_none());

            let reply = dispatcher.dispatch(request(test_peer_address_from_number(2), Command(2))).await.unwrap();
            assert_eq!(reply.message_type, MessageType::Denied);
            assert_eq!(reply.payload.as_ref(), b"not allowed");
        });
    }
}
