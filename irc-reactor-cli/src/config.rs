//! Configuration for the irc-reactor binary.
//!
//! The config file lives at `~/.config/irc-reactor/config.toml` unless
//! `--config` points elsewhere. It holds shared identity defaults and one
//! `[[server]]` table per network:
//!
//! ```toml
//! nick = "ferris"
//!
//! [[server]]
//! name = "libera"
//! addr = "irc.libera.chat:6697"
//! channels = ["#rust"]
//! caps = ["server-time", "multi-prefix"]
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use irc_reactor::Identity;
use serde::{Deserialize, Serialize};

use crate::Cli;

pub const DEFAULT_NICK: &str = "reactor";
pub const DEFAULT_REALNAME: &str = "irc-reactor";
pub const TLS_PORT_SUFFIX: &str = ":6697";

/// Contents of the config file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub nick: Option<String>,
    pub user: Option<String>,
    pub realname: Option<String>,
    #[serde(default, rename = "server")]
    pub servers: Vec<ServerProfile>,
}

/// One `[[server]]` table. Unset fields fall back to the top-level values.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerProfile {
    pub name: String,
    pub addr: String,
    /// Use TLS. Assumed for port 6697 when unset.
    pub tls: Option<bool>,
    pub tls_insecure: Option<bool>,
    /// PEM bundle to trust instead of the default roots.
    pub ca_file: Option<PathBuf>,
    pub nick: Option<String>,
    pub user: Option<String>,
    pub realname: Option<String>,
    /// Only request these capabilities. All advertised ones when unset.
    pub caps: Option<Vec<String>>,
    #[serde(default)]
    pub channels: Vec<String>,
}

pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("irc-reactor")
        .join("config.toml")
}

impl Config {
    /// Read `explicit` if given (it must exist), else the default path if
    /// present, else an empty config.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let path = default_path();
                if !path.exists() {
                    tracing::debug!(path = %path.display(), "no config file");
                    return Ok(Self::default());
                }
                path
            }
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("can't read {}", path.display()))?;
        let config = toml::from_str(&text).with_context(|| format!("bad config file {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}

/// A server profile with every field decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub name: String,
    pub addr: String,
    pub tls: bool,
    pub tls_insecure: bool,
    pub ca_file: Option<PathBuf>,
    pub identity: Identity,
    pub caps: Option<Vec<String>>,
    pub channels: Vec<String>,
}

/// Merge: CLI overrides > server table > top-level config > defaults.
///
/// `--server` on the command line replaces the file's server list with a
/// single profile.
pub fn resolve(cli: &Cli, config: &Config) -> Result<Vec<Resolved>> {
    let profiles = match &cli.server {
        Some(addr) => vec![ServerProfile {
            name: cli.name.clone(),
            addr: addr.clone(),
            ..Default::default()
        }],
        None => config.servers.clone(),
    };
    if profiles.is_empty() {
        bail!(
            "no servers configured: pass --server or add a [[server]] table to {}",
            default_path().display()
        );
    }

    let mut seen = std::collections::HashSet::new();
    let mut resolved = Vec::with_capacity(profiles.len());
    for profile in profiles {
        if !seen.insert(profile.name.clone()) {
            bail!("server name {:?} is configured twice", profile.name);
        }
        resolved.push(merge(cli, config, profile));
    }
    Ok(resolved)
}

fn merge(cli: &Cli, config: &Config, profile: ServerProfile) -> Resolved {
    let addr = if profile.addr.contains(':') {
        profile.addr
    } else {
        format!("{}{TLS_PORT_SUFFIX}", profile.addr)
    };

    let tls = cli.tls || profile.tls.unwrap_or_else(|| addr.ends_with(TLS_PORT_SUFFIX));
    let tls_insecure = cli.tls_insecure || profile.tls_insecure.unwrap_or(false);
    let ca_file = cli.ca_file.clone().or(profile.ca_file);

    let nick = cli
        .nick
        .clone()
        .or(profile.nick)
        .or_else(|| config.nick.clone())
        .unwrap_or_else(|| DEFAULT_NICK.to_string());
    let user = cli
        .user
        .clone()
        .or(profile.user)
        .or_else(|| config.user.clone())
        .unwrap_or_else(|| nick.clone());
    let realname = cli
        .realname
        .clone()
        .or(profile.realname)
        .or_else(|| config.realname.clone())
        .unwrap_or_else(|| DEFAULT_REALNAME.to_string());

    let caps = cli.caps.as_deref().map(split_list).or(profile.caps);
    let channels = match &cli.channels {
        Some(list) => split_list(list),
        None => profile.channels,
    };

    Resolved {
        name: profile.name,
        addr,
        tls,
        tls_insecure,
        ca_file,
        identity: Identity { nick, user, realname },
        caps,
        channels,
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
