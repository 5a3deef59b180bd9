//! Demo entry point: a WebSocket echo server
//!
//! Two workers, one app, one plaintext port. Every text or binary message
//! is echoed back to its sender; a client saying "quit" is closed with an
//! app-chosen code.

use anyhow::Context;
use tracing::info;

use spool::{
    AppContext,
    AppHandler,
    AppSpec,
    ClientId,
    Message,
    PortConfig,
    Server,
    ServerConfig,
    Verdict,
};

struct EchoApp;

impl AppHandler for EchoApp {
    fn on_open(&mut self, _ctx: &mut AppContext<'_>, client: ClientId) -> Verdict {
        info!(%client, "client connected");
        Verdict::Ok
    }

    fn on_read(
        &mut self,
        ctx: &mut AppContext<'_>,
        client: ClientId,
        msg: &Message<'_>
    ) -> Verdict {
        if msg.is_text && msg.raw == b"quit" {
            return Verdict::Close(4000);
        }
        if let Err(e) = ctx.to_cur(msg.raw, !msg.is_text) {
            info!(%client, error = %e, "echo failed");
            return Verdict::Fatal;
        }
        Verdict::Ok
    }

    fn on_close(&mut self, _ctx: &mut AppContext<'_>, client: ClientId, code: u16) -> Verdict {
        info!(%client, code, "client departed");
        Verdict::Ok
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = ServerConfig::new(2)
        .context("worker count")?
        .with_port(PortConfig::plain("0.0.0.0:8080".parse()?, 0));

    let server = Server::start(config, vec![AppSpec::new(Box::new(EchoApp))])
        .context("server start")?;

    info!("echo server on ws://0.0.0.0:8080 (send \"quit\" to be closed)");
    server.join().context("server run")?;
    Ok(())
}
