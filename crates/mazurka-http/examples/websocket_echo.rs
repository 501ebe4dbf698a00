//! WebSocket echo: upgrade on /ws and repeat every text message back.

use std::sync::Arc;

use mazurka_http::conn::Conn;
use mazurka_http::error::HttpResult;
use mazurka_http::filters::websocket;
use mazurka_http::packet::{Packet, PacketTag};
use mazurka_http::queue::QueueId;
use mazurka_http::router::Route;
use mazurka_http::stage::{Stage, StageKind};
use mazurka_http::{Endpoint, Host, Http, Server, init_logging};

struct EchoHandler;

impl Stage for EchoHandler {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn kind(&self) -> StageKind {
        StageKind::Handler
    }

    /// Each delivered message comes back as a text frame.
    fn incoming(&self, conn: &mut Conn, _q: QueueId, packet: Packet) -> HttpResult<()> {
        if packet.tag == PacketTag::Data && !packet.content.is_empty() {
            let text = String::from_utf8_lossy(&packet.content).into_owned();
            websocket::send_text(conn, &text);
        }
        Ok(())
    }
}

fn main() -> mazurka_http::HttpResult<()> {
    init_logging();
    let http = Http::new();
    http.register_stage(Arc::new(EchoHandler));

    let host = Host::new("*");
    let mut ws = Route::new("ws", "^/ws$");
    ws.set_handler("echo");
    ws.websocket_protocols = vec!["echo".into()];
    ws.websocket_ping_period = Some(std::time::Duration::from_secs(30));
    host.add_route(ws)?;
    http.add_host(host);

    http.add_endpoint(Endpoint::new("0.0.0.0", 8080)?);
    println!("websocket echo on ws://0.0.0.0:8080/ws");
    Server::new(http).serve()
}
