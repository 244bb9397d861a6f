//! irc-reactor: stay connected to one or more IRC networks and log traffic.
//!
//! Servers come from the config file (see [`config`]) or `--server`.
//! Channels are joined after registration; Ctrl-C quits every network.

mod config;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use irc_reactor::transport::{self, rustls};
use irc_reactor::{ALL_EVENTS, Event, Reactor, TlsOptions, formatting};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use config::{Config, Resolved};

#[derive(Parser, Debug)]
#[command(name = "irc-reactor", about = "Headless multi-server IRC client")]
pub struct Cli {
    /// Config file (default: ~/.config/irc-reactor/config.toml)
    #[arg(long, env = "IRC_REACTOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Connect to this server (host:port) instead of the configured list
    #[arg(long, env = "IRC_REACTOR_SERVER")]
    pub server: Option<String>,

    /// Connection name for --server
    #[arg(long, default_value = "default")]
    pub name: String,

    #[arg(long, env = "IRC_REACTOR_NICK")]
    pub nick: Option<String>,

    #[arg(long)]
    pub user: Option<String>,

    #[arg(long)]
    pub realname: Option<String>,

    /// Force TLS (assumed for port 6697)
    #[arg(long)]
    pub tls: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    pub tls_insecure: bool,

    /// PEM file with CA certificates to trust
    #[arg(long)]
    pub ca_file: Option<PathBuf>,

    /// Comma-separated capabilities to request (default: all offered)
    #[arg(long)]
    pub caps: Option<String>,

    /// Comma-separated channels to join after registration
    #[arg(long)]
    pub channels: Option<String>,

    /// QUIT message sent on shutdown
    #[arg(long, default_value = "Bye")]
    pub quit_message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Human-readable by default, JSON with IRC_REACTOR_LOG_JSON=1.
    let json_logs = std::env::var("IRC_REACTOR_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "irc_reactor=info,irc_reactor_cli=info".into());
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let profiles = config::resolve(&cli, &config)?;

    let reactor = Arc::new(Reactor::new());
    install_handlers(&reactor, &profiles);

    let mut loops = connect_all(&reactor, &profiles, &cli.quit_message).await?;

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => tracing::info!("interrupted"),
                Err(e) => tracing::warn!(error = %e, "can't listen for Ctrl-C, shutting down"),
            }
        }
        _ = async { while loops.join_next().await.is_some() {} } => {
            tracing::info!("all connections closed");
        }
    }

    reactor.shutdown(&cli.quit_message).await;
    loops.shutdown().await;
    Ok(())
}

/// Connect every profile and start its receive loop. If one fails, the
/// ones already connected are sent QUIT before the error is returned.
async fn connect_all(reactor: &Reactor, profiles: &[Resolved], quit_message: &str) -> Result<JoinSet<()>> {
    let mut loops = JoinSet::new();
    for profile in profiles {
        if let Err(e) = connect_one(reactor, profile, &mut loops).await {
            reactor.shutdown(quit_message).await;
            loops.shutdown().await;
            return Err(e);
        }
    }
    Ok(loops)
}

async fn connect_one(reactor: &Reactor, profile: &Resolved, loops: &mut JoinSet<()>) -> Result<()> {
    let server = reactor.create_server(&profile.name)?;
    server.set_identity(profile.identity.clone())?;
    if let Some(caps) = &profile.caps {
        server.configure_caps(|set| set.restrict_to(caps));
    }
    let tls = tls_options(profile)?;
    tracing::info!(server = %profile.name, addr = %profile.addr, tls = profile.tls, "connecting");
    server
        .connect(&profile.addr, tls)
        .await
        .with_context(|| format!("connecting {} ({})", profile.name, profile.addr))?;

    loops.spawn(async move {
        let name = server.name().to_string();
        if let Err(e) = server.receive_loop().await {
            tracing::warn!(server = %name, error = %e, "connection lost");
        }
    });
    Ok(())
}

fn install_handlers(reactor: &Reactor, profiles: &[Resolved]) {
    reactor.register(ALL_EVENTS, |ev| {
        tracing::debug!(server = %ev.server.name(), event = %ev.name, line = %ev.message, "<-");
        Ok(())
    });

    reactor.register("PRIVMSG", log_text);
    reactor.register("NOTICE", log_text);

    let channels: HashMap<String, Vec<String>> = profiles
        .iter()
        .filter(|p| !p.channels.is_empty())
        .map(|p| (p.name.clone(), p.channels.clone()))
        .collect();
    reactor.register("001", move |ev| {
        tracing::info!(server = %ev.server.name(), nick = %ev.server.nick(), "welcome");
        match channels.get(ev.server.name()) {
            Some(list) => ev.server.send_command("JOIN", &[list.join(",").as_str()]),
            None => Ok(()),
        }
    });
}

fn log_text(ev: &Event) -> irc_reactor::Result<()> {
    let target = ev.param(0)?;
    let text = formatting::strip(ev.param(1)?);
    tracing::info!(
        server = %ev.server.name(),
        from = ev.source_nick().unwrap_or("*"),
        to = target,
        "{} {text}",
        ev.name
    );
    Ok(())
}

fn tls_options(profile: &Resolved) -> Result<Option<TlsOptions>> {
    if !profile.tls {
        return Ok(None);
    }
    let client_config = match &profile.ca_file {
        Some(path) => Some(Arc::new(transport::client_config_with_roots(load_roots(path)?))),
        None => None,
    };
    Ok(Some(TlsOptions {
        client_config,
        insecure: profile.tls_insecure,
        ..Default::default()
    }))
}

fn load_roots(path: &Path) -> Result<rustls::RootCertStore> {
    let file = std::fs::File::open(path).with_context(|| format!("can't open {}", path.display()))?;
    let mut reader = std::io::BufReader::new(file);
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.with_context(|| format!("bad certificate in {}", path.display()))?;
        roots.add(cert)?;
    }
    tracing::debug!(path = %path.display(), count = roots.len(), "loaded CA file");
    Ok(roots)
}
