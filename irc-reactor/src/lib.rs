//! Client-side IRC connection engine.
//!
//! A [`Reactor`] owns named [`ServerConnection`]s that share one
//! [`Dispatcher`]. Each connection negotiates IRCv3 capabilities, registers
//! with the server, then hands every incoming line to the dispatcher as an
//! [`Event`]:
//!
//! ```no_run
//! # async fn run() -> irc_reactor::Result<()> {
//! use std::sync::Arc;
//! use irc_reactor::{Reactor, TlsOptions};
//!
//! let reactor = Reactor::new();
//! reactor.register("PRIVMSG", |ev| {
//!     println!("{:?}: {}", ev.source_nick(), ev.param(1)?);
//!     Ok(())
//! });
//!
//! let server = reactor.create_server("libera")?;
//! server.connect("irc.libera.chat:6697", Some(TlsOptions::default())).await?;
//! tokio::spawn(Arc::clone(&server).receive_loop());
//! # reactor.shutdown("bye").await;
//! # Ok(())
//! # }
//! ```

pub mod caps;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod formatting;
pub mod handlers;
pub mod handshake;
pub mod message;
pub mod reactor;
pub mod transport;

pub use caps::CapabilitySet;
pub use connection::{Lifecycle, ServerConnection};
pub use dispatch::{ALL_EVENTS, Dispatcher, Event};
pub use error::{ReactorError, Result};
pub use handshake::{Identity, Phase};
pub use message::{Message, ParseError, Tags};
pub use reactor::Reactor;
pub use transport::TlsOptions;
