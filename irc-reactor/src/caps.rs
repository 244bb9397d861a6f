//! Capability bookkeeping for one connection.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ReactorError, Result};

/// Capabilities offered by the server, requested by us and confirmed by it.
///
/// A name is only ever requested if it is supported, and only ever
/// acknowledged if it was requested.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    /// Advertised names mapped to their `=value` suffix, if any.
    supported: BTreeMap<String, Option<String>>,
    requested: BTreeSet<String>,
    acknowledged: BTreeSet<String>,
    rejected: BTreeSet<String>,
    /// When set, only these names are ever requested.
    allowed: Option<BTreeSet<String>>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record advertised capabilities. Tokens may carry a `=value` suffix,
    /// which is kept for [`value`](Self::value) but ignored for membership.
    pub fn add_caps<I, S>(&mut self, tokens: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for token in tokens {
            let token = token.as_ref().trim();
            if token.is_empty() {
                continue;
            }
            let (name, value) = match token.split_once('=') {
                Some((name, value)) => (name, Some(value.to_string())),
                None => (token, None),
            };
            if name.is_empty() {
                continue;
            }
            self.supported.insert(name.to_string(), value);
        }
    }

    /// Forget capabilities the server withdrew (`CAP DEL`).
    pub fn remove_caps<I, S>(&mut self, tokens: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for token in tokens {
            let name = cap_name(token.as_ref());
            self.supported.remove(name);
            self.requested.remove(name);
            self.acknowledged.remove(name);
        }
    }

    /// Only request capabilities from `names` from now on.
    pub fn restrict_to<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = Some(names.into_iter().map(Into::into).collect());
    }

    /// Space-joined names to send in `CAP REQ`, in name order.
    ///
    /// Every name returned is moved to the requested set, so calling this
    /// twice in one round yields an empty second line.
    pub fn to_request_line(&mut self) -> String {
        let wanted: Vec<String> = self
            .supported
            .keys()
            .filter(|name| !self.requested.contains(*name))
            .filter(|name| self.allowed.as_ref().is_none_or(|allowed| allowed.contains(*name)))
            .cloned()
            .collect();
        self.requested.extend(wanted.iter().cloned());
        wanted.join(" ")
    }

    /// Record a `CAP ACK`. Names that were never requested are ignored, as
    /// are `-name` disable acknowledgements beyond dropping the name.
    pub fn acknowledge<I, S>(&mut self, tokens: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for token in tokens {
            let token = token.as_ref().trim();
            if let Some(disabled) = token.strip_prefix('-') {
                self.acknowledged.remove(cap_name(disabled));
                continue;
            }
            let name = cap_name(token);
            if self.requested.contains(name) {
                self.acknowledged.insert(name.to_string());
            } else if !name.is_empty() {
                tracing::debug!(cap = name, "ignoring ACK for a capability we never requested");
            }
        }
    }

    /// Record a `CAP NAK`.
    pub fn reject<I, S>(&mut self, tokens: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for token in tokens {
            let name = cap_name(token.as_ref());
            if self.requested.contains(name) {
                self.rejected.insert(name.to_string());
            }
        }
    }

    pub fn is_supported(&self, name: &str) -> bool {
        self.supported.contains_key(name)
    }

    pub fn is_requested(&self, name: &str) -> bool {
        self.requested.contains(name)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.acknowledged.contains(name)
    }

    pub fn is_rejected(&self, name: &str) -> bool {
        self.rejected.contains(name)
    }

    /// The `=value` part of an advertised capability, e.g. `PLAIN` for `sasl=PLAIN`.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.supported.get(name)?.as_deref()
    }

    pub fn supported(&self) -> impl Iterator<Item = &str> {
        self.supported.keys().map(String::as_str)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &str> {
        self.acknowledged.iter().map(String::as_str)
    }
}

fn cap_name(token: &str) -> &str {
    let token = token.trim();
    token.split_once('=').map_or(token, |(name, _)| name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapSubcommand {
    Ls,
    Ack,
    Nak,
    New,
    Del,
    List,
    Other,
}

/// A server `CAP` line decoded once: `CAP <target> <sub> [*] :<caps>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapLine {
    pub target: String,
    pub subcommand: CapSubcommand,
    /// More chunks of this reply follow (the `*` continuation marker).
    pub more: bool,
    pub caps: Vec<String>,
}

impl CapLine {
    pub fn from_params(params: &[String]) -> Result<Self> {
        let (target, sub, rest) = match params {
            [target, sub, rest @ ..] => (target, sub, rest),
            _ => {
                return Err(ReactorError::MalformedCap(format!(
                    "expected at least 2 parameters, got {}",
                    params.len()
                )));
            }
        };
        let subcommand = match sub.to_ascii_uppercase().as_str() {
            "LS" => CapSubcommand::Ls,
            "ACK" => CapSubcommand::Ack,
            "NAK" => CapSubcommand::Nak,
            "NEW" => CapSubcommand::New,
            "DEL" => CapSubcommand::Del,
            "LIST" => CapSubcommand::List,
            _ => CapSubcommand::Other,
        };
        let (more, payload) = match rest {
            [] => (false, ""),
            [payload] => (false, payload.as_str()),
            [marker, payload, ..] if marker == "*" => (true, payload.as_str()),
            [_, ..] => {
                return Err(ReactorError::MalformedCap(format!(
                    "unexpected parameters after {sub}: {rest:?}"
                )));
            }
        };
        Ok(Self {
            target: target.clone(),
            subcommand,
            more,
            caps: payload.split_whitespace().map(str::to_string).collect(),
        })
    }
}
