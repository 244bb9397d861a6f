//! Built-in handlers that drive negotiation and registration.

use crate::caps::CapLine;
use crate::dispatch::{Dispatcher, Event};
use crate::error::Result;
use crate::handshake::{ERR_NICKNAMEINUSE, RPL_WELCOME};
use crate::message::Message;

pub fn register_defaults(dispatcher: &Dispatcher) {
    dispatcher.register("CAP", handle_cap);
    dispatcher.register(RPL_WELCOME, handle_welcome);
    dispatcher.register(ERR_NICKNAMEINUSE, handle_nick_in_use);
    dispatcher.register("PING", handle_ping);
}

fn handle_cap(event: &Event) -> Result<()> {
    let line = CapLine::from_params(event.params())?;
    event
        .server
        .advance(|session, identity| session.on_cap(&line, identity))
}

/// Servers may truncate or rename the nick we asked for; the welcome line
/// tells us which one we actually got.
fn handle_welcome(event: &Event) -> Result<()> {
    let nick = event.param(0)?;
    event.server.advance(|session, _| {
        session.on_welcome(nick);
        Vec::new()
    })
}

fn handle_nick_in_use(event: &Event) -> Result<()> {
    event.server.advance(|session, _| session.on_nick_in_use())
}

fn handle_ping(event: &Event) -> Result<()> {
    let token = event.params().last().map_or("", String::as_str);
    event
        .server
        .send(&Message::new("PONG", [token]).with_trailing())
}
