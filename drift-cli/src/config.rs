//! Network configuration for the drift CLI.
//!
//! The config file lives at `~/.config/drift/networks.toml`:
//!
//! ```toml
//! default = "libera"
//!
//! [networks.libera]
//! host = "irc.libera.chat"
//! port = 6697
//! tls = true
//! nick = "drifter"
//! channels = ["#rust"]
//!
//! [networks.libera.sasl]
//! account = "drifter"
//! password = "hunter2"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use drift::config::{ConnectionConfig, ProxyConfig, SaslCredentials};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PLAIN_PORT: u16 = 6667;
pub const DEFAULT_TLS_PORT: u16 = 6697;

/// One `[networks.<name>]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkEntry {
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    /// Channels to join after registration.
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Network used when `--network` is not given.
    pub default: Option<String>,
    pub networks: BTreeMap<String, NetworkEntry>,
}

pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("drift")
        .join("networks.toml")
}

impl FileConfig {
    /// Load `path`, or the default location when `None`. A missing default
    /// file is an empty config; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (default_path(), false),
        };
        if !explicit && !path.exists() {
            tracing::debug!(path = %path.display(), "No config file");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path).with_context(|| format!("can't read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("bad config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// The effective settings: CLI flags > config file > defaults.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub network: String,
    pub connection: ConnectionConfig,
    pub channels: Vec<String>,
}

impl Resolved {
    pub fn merge(cli: &crate::Cli, file: &FileConfig) -> Result<Self> {
        let network = cli
            .network
            .clone()
            .or_else(|| file.default.clone())
            .or_else(|| (file.networks.len() == 1).then(|| file.networks.keys().next().cloned()).flatten())
            .or_else(|| cli.server.as_deref().map(|s| split_server(s).0.to_string()))
            .unwrap_or_else(|| "default".to_string());

        let entry = match file.networks.get(&network) {
            Some(entry) => entry.clone(),
            None if cli.network.is_some() && cli.server.is_none() => {
                bail!("network {network:?} is not in the config file");
            }
            None => NetworkEntry::default(),
        };
        let NetworkEntry {
            connection: mut conn,
            mut channels,
        } = entry;

        if let Some(ref server) = cli.server {
            let (host, port) = split_server(server);
            conn.host = host.to_string();
            conn.port = match port {
                Some(p) => p.parse().with_context(|| format!("bad port in {server:?}"))?,
                None if cli.tls || conn.tls => DEFAULT_TLS_PORT,
                None => DEFAULT_PLAIN_PORT,
            };
        }
        conn.tls = cli.tls || conn.tls || conn.port == DEFAULT_TLS_PORT;
        if cli.insecure {
            conn.tls_verify = false;
        }

        if let Some(ref nick) = cli.nick {
            if conn.username == conn.nick {
                conn.username = nick.clone();
            }
            conn.nick = nick.clone();
        }

        if let Some(ref url) = cli.proxy {
            conn.proxy = Some(ProxyConfig::from_url(url).context("bad --proxy")?);
        }

        if cli.sasl_account.is_some() || cli.sasl_password.is_some() {
            let base = conn.sasl.take().unwrap_or_default();
            conn.sasl = Some(SaslCredentials {
                account: cli.sasl_account.clone().unwrap_or_else(|| {
                    if base.account.is_empty() { conn.nick.clone() } else { base.account.clone() }
                }),
                password: cli.sasl_password.clone().unwrap_or(base.password),
            });
        }

        if let Some(ref list) = cli.channels {
            channels = list
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
        }

        conn.validate().context("invalid connection settings")?;
        Ok(Self {
            network,
            connection: conn,
            channels,
        })
    }
}

/// `host[:port]`, tolerating bracketed IPv6 literals.
fn split_server(server: &str) -> (&str, Option<&str>) {
    if let Some(rest) = server.strip_prefix('[')
        && let Some((host, tail)) = rest.split_once(']')
    {
        return (host, tail.strip_prefix(':'));
    }
    match server.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (host, Some(port)),
        _ => (server, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    const SAMPLE: &str = r##"
default = "libera"

[networks.libera]
host = "irc.libera.chat"
port = 6697
tls = true
nick = "drifter"
username = "drifter"
channels = ["#rust", "#drift"]

[networks.libera.sasl]
account = "drifter"
password = "hunter2"

[networks.local]
host = "127.0.0.1"
nick = "dev"
"##;

    fn cli(args: &[&str]) -> crate::Cli {
        crate::Cli::parse_from(std::iter::once("drift").chain(args.iter().copied()))
    }

    #[test]
    fn file_defaults_apply() {
        let file = FileConfig::parse(SAMPLE).unwrap();
        let r = Resolved::merge(&cli(&[]), &file).unwrap();
        assert_eq!(r.network, "libera");
        assert_eq!(r.connection.host, "irc.libera.chat");
        assert!(r.connection.tls);
        assert_eq!(r.connection.sasl.as_ref().unwrap().password, "hunter2");
        assert_eq!(r.channels, vec!["#rust", "#drift"]);
        assert_eq!(file.networks["local"].connection.port, 6667);
    }

    #[test]
    fn cli_overrides_file() {
        let file = FileConfig::parse(SAMPLE).unwrap();
        let r = Resolved::merge(
            &cli(&["--nick", "other", "--channels", "#a, #b", "--insecure"]),
            &file,
        )
        .unwrap();
        assert_eq!(r.connection.nick, "other");
        assert_eq!(r.connection.username, "other");
        assert!(!r.connection.tls_verify);
        assert_eq!(r.channels, vec!["#a", "#b"]);
    }

    #[test]
    fn server_flag_without_file() {
        let r = Resolved::merge(
            &cli(&["--server", "irc.example.net", "--tls", "--nick", "me"]),
            &FileConfig::default(),
        )
        .unwrap();
        assert_eq!(r.network, "irc.example.net");
        assert_eq!(r.connection.port, 6697);
        assert!(r.connection.tls);
    }

    #[test]
    fn proxy_and_sasl_flags() {
        let r = Resolved::merge(
            &cli(&[
                "--server",
                "irc.example.net:6667",
                "--nick",
                "me",
                "--proxy",
                "socks5://127.0.0.1:9050",
                "--sasl-password",
                "pw",
            ]),
            &FileConfig::default(),
        )
        .unwrap();
        assert_eq!(r.connection.proxy.unwrap().port, 9050);
        let sasl = r.connection.sasl.unwrap();
        assert_eq!(sasl.account, "me");
        assert_eq!(sasl.password, "pw");
        assert!(!r.connection.tls);
    }

    #[test]
    fn unknown_network_is_an_error() {
        let file = FileConfig::parse(SAMPLE).unwrap();
        assert!(Resolved::merge(&cli(&["--network", "efnet"]), &file).is_err());
    }

    #[test]
    fn server_splitting() {
        assert_eq!(split_server("irc.example.net:6697"), ("irc.example.net", Some("6697")));
        assert_eq!(split_server("irc.example.net"), ("irc.example.net", None));
        assert_eq!(split_server("[::1]:6667"), ("::1", Some("6667")));
        assert_eq!(split_server("::1"), ("::1", None));
    }
}
