//! drift: a line-mode IRC client.
//!
//! Connects one network, prints every event with a timestamp and sends
//! each stdin line through the command grammar (`/join`, `/msg`, plain
//! text to the active target, ...). Ctrl-D or `/quit` disconnects.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use drift::{ConnectionRegistry, DeliveryStatus, Event, MessageKind};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "drift", version, about = "Line-mode IRC client")]
pub struct Cli {
    /// Config file (default: ~/.config/drift/networks.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Network table to use from the config file
    #[arg(long, short)]
    network: Option<String>,

    /// IRC server (host[:port])
    #[arg(long, short)]
    server: Option<String>,

    /// Nickname
    #[arg(long)]
    nick: Option<String>,

    /// Use TLS (implied by port 6697)
    #[arg(long)]
    tls: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,

    /// Proxy URL, e.g. socks5://127.0.0.1:9050
    #[arg(long, env = "DRIFT_PROXY")]
    proxy: Option<String>,

    /// SASL account (defaults to the nick)
    #[arg(long)]
    sasl_account: Option<String>,

    /// SASL password
    #[arg(long, env = "DRIFT_SASL_PASSWORD", hide_env_values = true)]
    sasl_password: Option<String>,

    /// Channels to join, comma-separated
    #[arg(long)]
    channels: Option<String>,
}

fn init_logging() -> Result<()> {
    // JSON logs with DRIFT_LOG_JSON=1, human-readable otherwise. Logs go to
    // stderr so stdout carries only events.
    let json_logs = std::env::var("DRIFT_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("drift=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();
    let file = config::FileConfig::load(cli.config.as_deref())?;
    let resolved = config::Resolved::merge(&cli, &file)?;

    tracing::info!(
        network = %resolved.network,
        server = %resolved.connection.server_addr(),
        nick = %resolved.connection.nick,
        tls = resolved.connection.tls,
        "Starting drift"
    );

    let registry = ConnectionRegistry::new();
    let handle = registry
        .connect(&resolved.network, resolved.connection.clone())
        .await
        .with_context(|| format!("connecting to {}", resolved.connection.server_addr()))?;
    let mut events = handle.subscribe().await?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            ev = events.recv() => {
                let Some(ev) = ev else { break };
                if let Event::Registered { .. } = ev {
                    for channel in &resolved.channels {
                        handle.join_channel(channel, None).await?;
                    }
                }
                if let Some(text) = render(&ev) {
                    println!("{} {text}", chrono::Local::now().format("%H:%M:%S"));
                }
            }
            line = stdin.next_line(), if stdin_open => {
                match line.context("reading stdin")? {
                    Some(line) => {
                        let line = line.trim_end();
                        if line.is_empty() {
                            continue;
                        }
                        if let Some(reason) = quit_reason(line) {
                            handle.disconnect(reason);
                        } else if handle.send_command(line, None).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        stdin_open = false;
                        handle.disconnect(None);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                handle.disconnect(Some("Interrupted"));
            }
        }
    }

    registry.disconnect_all(None).await;
    Ok(())
}

/// `Some(reason)` when the line is `/quit [reason]`.
fn quit_reason(line: &str) -> Option<Option<&str>> {
    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    word.eq_ignore_ascii_case("/quit")
        .then(|| Some(rest.trim()).filter(|r| !r.is_empty()))
}

/// One printable line per event; `None` for wire echoes and raw numerics.
fn render(ev: &Event) -> Option<String> {
    let text = match ev {
        Event::ConnectionState { phase, detail } => match detail {
            Some(d) => format!("*** {phase:?}: {d}"),
            None => format!("*** {phase:?}"),
        },
        Event::Registered { nick } => format!("*** Registered as {nick}"),
        Event::Capabilities { enabled } => format!("*** Capabilities: {}", enabled.join(" ")),
        Event::Authenticated { account } => format!("*** Logged in as {account}"),
        Event::Message(m) => {
            let mark = if m.encrypted { "[enc] " } else { "" };
            match m.kind {
                MessageKind::Privmsg => format!("[{}] {mark}<{}> {}", m.target, m.from, m.text),
                MessageKind::Notice => format!("[{}] {mark}-{}- {}", m.target, m.from, m.text),
                MessageKind::Action => format!("[{}] {mark}* {} {}", m.target, m.from, m.text),
            }
        }
        Event::LocalEcho { target, text, kind, status, .. } => {
            let pending = if *status == DeliveryStatus::Pending { " (sending)" } else { "" };
            match kind {
                MessageKind::Action => format!("[{target}] * me {text}{pending}"),
                _ => format!("[{target}] > {text}{pending}"),
            }
        }
        Event::JoinedChannel { channel } => format!("*** Joined {channel}"),
        Event::Join { channel, nick, .. } => format!("[{channel}] --> {nick} joined"),
        Event::Part { channel, nick, reason } => {
            format!("[{channel}] <-- {nick} left{}", suffix(reason))
        }
        Event::Kick { channel, nick, by, reason } => {
            format!("[{channel}] {by} kicked {nick}{}", suffix(reason))
        }
        Event::Quit { nick, reason, .. } => format!("*** {nick} quit{}", suffix(reason)),
        Event::NickChanged { old_nick, new_nick } => format!("*** {old_nick} is now {new_nick}"),
        Event::Topic { channel, info } => match &info.topic {
            Some(topic) => format!("[{channel}] Topic: {topic}"),
            None => return None,
        },
        Event::Invite { channel, by } => format!("*** {by} invites you to {channel}"),
        Event::ModeChanged { target, modes, args, set_by } => {
            format!("[{target}] {set_by} sets mode {modes} {}", args.join(" "))
        }
        Event::UsersChanged { channel, users } => format!("[{channel}] {} users", users.len()),
        Event::Pong { latency_ms: Some(ms), .. } => format!("*** Lag {ms}ms"),
        Event::CtcpRequest { from, command, .. } => format!("*** CTCP {command} from {from}"),
        Event::CtcpReply { from, command, args, latency_ms } => match latency_ms {
            Some(ms) => format!("*** CTCP {command} reply from {from}: {ms}ms"),
            None => format!("*** CTCP {command} reply from {from}: {}", args.as_deref().unwrap_or("")),
        },
        Event::MonitorStatus { online, offline } => {
            format!("*** Online: [{}] Offline: [{}]", online.join(", "), offline.join(", "))
        }
        Event::Encryption { peer, text } => format!("*** [{peer}] {text}"),
        Event::Display { text } => text.clone(),
        Event::Error { message, .. } => format!("!!! {message}"),
        Event::QueueMessage { target, .. } => format!("*** Not connected; message to {target} not sent"),
        Event::Away { nick, message: Some(m) } => format!("*** {nick} is away: {m}"),
        Event::StsPolicy { port, duration, .. } => {
            format!("*** STS policy: port {port:?}, duration {duration:?}")
        }
        _ => return None,
    };
    Some(text)
}

fn suffix(reason: &Option<String>) -> String {
    reason.as_deref().map(|r| format!(" ({r})")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift::Phase;

    #[test]
    fn quit_parsing() {
        assert_eq!(quit_reason("/quit"), Some(None));
        assert_eq!(quit_reason("/QUIT gone fishing"), Some(Some("gone fishing")));
        assert_eq!(quit_reason("/quiet"), None);
        assert_eq!(quit_reason("hello"), None);
    }

    #[test]
    fn rendering() {
        let ev = Event::ConnectionState {
            phase: Phase::Registered,
            detail: None,
        };
        assert_eq!(render(&ev).unwrap(), "*** Registered");
        assert!(render(&Event::SendRaw { line: "PING :x".into() }).is_none());
        let part = Event::Part {
            channel: "#a".into(),
            nick: "bob".into(),
            reason: Some("bye".into()),
        };
        assert_eq!(render(&part).unwrap(), "[#a] <-- bob left (bye)");
    }
}
