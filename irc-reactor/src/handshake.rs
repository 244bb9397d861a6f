//! Capability negotiation and registration state machine.
//!
//! The machine is pure: every transition mutates the [`Session`] and returns
//! the messages that must be written, in order. The connection sends them
//! after releasing the session lock.

use crate::caps::{CapLine, CapSubcommand, CapabilitySet};
use crate::message::Message;

pub const RPL_WELCOME: &str = "001";
pub const ERR_NICKNAMEINUSE: &str = "433";

/// Protocol version advertised in `CAP LS`.
pub const CAP_VERSION: &str = "302";

/// Where a connection is in the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    /// No transport yet, nothing sent.
    #[default]
    Start,
    /// `CAP LS 302` sent, collecting the advertised list.
    AwaitingCapList,
    /// `CAP REQ` sent, waiting for ACK or NAK.
    AwaitingCapResponse,
    /// `CAP END`, `NICK` and `USER` sent, waiting for the welcome.
    NegotiationDone,
    /// Welcome received.
    Registered,
}

/// Desired identity, fixed once the connection starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub nick: String,
    pub user: String,
    pub realname: String,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            nick: "reactor".to_string(),
            user: "reactor".to_string(),
            realname: "irc-reactor".to_string(),
        }
    }
}

/// Per-connection handshake state, owned by the connection's receive task.
#[derive(Debug, Default)]
pub struct Session {
    pub phase: Phase,
    /// Current nickname: the desired one until the server confirms another.
    pub nick: String,
    pub caps: CapabilitySet,
}

impl Session {
    pub fn is_registered(&self) -> bool {
        self.phase == Phase::Registered
    }

    /// Open negotiation on a freshly attached transport.
    pub fn begin(&mut self, identity: &Identity) -> Vec<Message> {
        match self.phase {
            Phase::Start => {
                self.nick = identity.nick.clone();
                self.phase = Phase::AwaitingCapList;
                vec![Message::new("CAP", ["LS", CAP_VERSION])]
            }
            _ => Vec::new(),
        }
    }

    pub fn on_cap(&mut self, line: &CapLine, identity: &Identity) -> Vec<Message> {
        use CapSubcommand::*;
        use Phase::*;

        match (self.phase, line.subcommand) {
            (_, Ls) if line.more => {
                self.caps.add_caps(&line.caps);
                Vec::new()
            }
            (Start | AwaitingCapList, Ls) => {
                self.caps.add_caps(&line.caps);
                let request = self.caps.to_request_line();
                if request.is_empty() {
                    self.finish_negotiation(identity)
                } else {
                    self.phase = AwaitingCapResponse;
                    vec![cap_request(request)]
                }
            }
            (AwaitingCapResponse, Ls) => {
                self.caps.add_caps(&line.caps);
                Vec::new()
            }
            // A post-registration `CAP LS` re-query: request anything new,
            // but negotiation is already over so no `CAP END`.
            (NegotiationDone | Registered, Ls) | (NegotiationDone | Registered, New) => {
                self.caps.add_caps(&line.caps);
                let request = self.caps.to_request_line();
                if request.is_empty() {
                    Vec::new()
                } else {
                    vec![cap_request(request)]
                }
            }
            (Start | AwaitingCapList | AwaitingCapResponse, New) => {
                self.caps.add_caps(&line.caps);
                Vec::new()
            }
            (AwaitingCapResponse, Ack) => {
                self.caps.acknowledge(&line.caps);
                self.finish_negotiation(identity)
            }
            (AwaitingCapResponse, Nak) => {
                self.caps.reject(&line.caps);
                self.finish_negotiation(identity)
            }
            (Start | AwaitingCapList, Ack | Nak) => {
                tracing::warn!(
                    caps = ?line.caps,
                    "CAP {:?} before any CAP REQ, completing registration anyway",
                    line.subcommand
                );
                self.finish_negotiation(identity)
            }
            (NegotiationDone | Registered, Ack) => {
                self.caps.acknowledge(&line.caps);
                Vec::new()
            }
            (NegotiationDone | Registered, Nak) => {
                self.caps.reject(&line.caps);
                Vec::new()
            }
            (_, Del) => {
                self.caps.remove_caps(&line.caps);
                Vec::new()
            }
            (_, List | Other) => Vec::new(),
        }
    }

    /// The welcome numeric carries the nickname the server actually gave us.
    pub fn on_welcome(&mut self, nick: &str) {
        self.nick = nick.to_string();
        self.phase = Phase::Registered;
    }

    /// Our `NICK` was refused while registering: try again with a suffix.
    pub fn on_nick_in_use(&mut self) -> Vec<Message> {
        if self.phase != Phase::NegotiationDone {
            return Vec::new();
        }
        self.nick.push('_');
        vec![Message::new("NICK", [self.nick.as_str()])]
    }

    /// `CAP END` followed by the registration commands. Only reachable from
    /// the negotiating phases, so registration is sent at most once.
    fn finish_negotiation(&mut self, identity: &Identity) -> Vec<Message> {
        self.phase = Phase::NegotiationDone;
        self.nick = identity.nick.clone();
        vec![
            Message::new("CAP", ["END"]),
            Message::new("NICK", [identity.nick.as_str()]),
            Message::new(
                "USER",
                [identity.user.as_str(), "0", "*", identity.realname.as_str()],
            )
            .with_trailing(),
        ]
    }
}

fn cap_request(request: String) -> Message {
    Message::new("CAP", ["REQ".to_string(), request]).with_trailing()
}
