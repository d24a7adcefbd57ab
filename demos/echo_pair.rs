use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use clap::Parser;
use clap_derive::Parser;
use peerwire::config::TransportConfig;
use peerwire::connection::dispatcher::{Handler, Responder};
use peerwire::messaging::message::{Command, Message, MessageType};
use peerwire::messaging::peer_address::PeerId;
use peerwire::metrics::NoopMetrics;
use peerwire::peer_transport::PeerTransport;
use tracing::{info, Level};

const ECHO: Command = Command(1);

/// Starts two peers on localhost and lets one of them send echo requests to the other
#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = 10)]
    count: usize,

    /// send over TCP instead of UDP
    #[clap(long, default_value_t = false)]
    tcp: bool,

    /// open a tunnel after the echo requests, and send the payloads through it
    #[clap(long, default_value_t = false)]
    tunnel: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn handle(&self, request: Message, responder: Responder) {
        let reply = Message::reply_to(&request, MessageType::Ok)
            .with_payload(request.payload.clone());
        responder.respond(reply);
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let client = PeerTransport::start(TransportConfig::localhost(), PeerId::random(), None, Arc::new(NoopMetrics)).await?;
    let server = PeerTransport::start(TransportConfig::localhost(), PeerId::random(), None, Arc::new(NoopMetrics)).await?;
    server.register_handler(ECHO, Arc::new(Echo)).await;

    let start = Instant::now();
    for i in 0..args.count {
        let mut request = Message::request(client.self_address().clone(), server.self_address().clone(), ECHO, format!("echo #{}", i));
        if args.tcp {
            request = request.with_tcp();
        }
        let reply = client.sender().request(request).await?;
        info!("reply: {}", String::from_utf8_lossy(&reply.payload));
    }
    info!("{} round trips in {:?}", args.count, start.elapsed());

    if args.tunnel {
        let request = Message::request(client.self_address().clone(), server.self_address().clone(), ECHO, "tunnel");
        let (_, initiator) = client.sender().open_tunnel(request).await?;
        let responder = server.tunnel_broker().accept().await
            .ok_or_else(|| anyhow::anyhow!("server stopped accepting tunnels"))?;

        for i in 0..args.count {
            initiator.send(format!("frame #{}", i)).await?;
        }
        for _ in 0..args.count {
            if let Some(frame) = responder.recv().await {
                info!("tunnel frame: {}", String::from_utf8_lossy(&frame));
            }
        }
        initiator.close().await;
    }

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}
