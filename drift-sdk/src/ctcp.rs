//! Client-to-client protocol: `\x01COMMAND args\x01` bodies.

use chrono::Utc;

const DELIM: char = '\u{1}';

/// Reply body for `CTCP VERSION`.
pub const VERSION_REPLY: &str = concat!("drift ", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Action,
    ClientInfo,
    Ping,
    Time,
    Version,
    Unknown(String),
}

impl Command {
    fn from_token(token: &str) -> Self {
        match token.to_ascii_uppercase().as_str() {
            "ACTION" => Command::Action,
            "CLIENTINFO" => Command::ClientInfo,
            "PING" => Command::Ping,
            "TIME" => Command::Time,
            "VERSION" => Command::Version,
            _ => Command::Unknown(token.to_ascii_uppercase()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Command::Action => "ACTION",
            Command::ClientInfo => "CLIENTINFO",
            Command::Ping => "PING",
            Command::Time => "TIME",
            Command::Version => "VERSION",
            Command::Unknown(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ctcp {
    pub command: Command,
    pub params: Option<String>,
}

pub fn is_ctcp(text: &str) -> bool {
    text.len() >= 2 && text.starts_with(DELIM)
}

/// Split a CTCP body. The closing delimiter is optional, as some clients
/// omit it.
pub fn parse(text: &str) -> Option<Ctcp> {
    let inner = text.strip_prefix(DELIM)?;
    let inner = inner.strip_suffix(DELIM).unwrap_or(inner);
    let (command, params) = match inner.split_once(' ') {
        Some((c, p)) => (c, Some(p.to_string()).filter(|p| !p.is_empty())),
        None => (inner, None),
    };
    if command.is_empty() {
        return None;
    }
    Some(Ctcp {
        command: Command::from_token(command),
        params,
    })
}

/// Wrap `command [params]` in CTCP delimiters.
pub fn encode(command: &str, params: Option<&str>) -> String {
    match params.filter(|p| !p.is_empty()) {
        Some(p) => format!("{DELIM}{} {p}{DELIM}", command.to_ascii_uppercase()),
        None => format!("{DELIM}{}{DELIM}", command.to_ascii_uppercase()),
    }
}

/// NOTICE body answering a request, for the commands answered automatically.
pub fn auto_reply(query: &Ctcp) -> Option<String> {
    let params = match query.command {
        Command::Version => VERSION_REPLY.to_string(),
        Command::Time => Utc::now().to_rfc2822(),
        Command::Ping => query.params.clone().unwrap_or_default(),
        Command::ClientInfo => "ACTION CLIENTINFO PING TIME VERSION".to_string(),
        Command::Action | Command::Unknown(_) => return None,
    };
    Some(encode(query.command.as_str(), Some(&params)))
}

/// Round trip in milliseconds for a PING reply carrying our millis token.
pub fn ping_latency(token: &str, now_millis: i64) -> Option<u64> {
    let sent: i64 = token.trim().parse().ok()?;
    now_millis.checked_sub(sent).and_then(|d| u64::try_from(d).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_and_without_args() {
        let q = parse("\u{1}VERSION\u{1}").unwrap();
        assert_eq!(q.command, Command::Version);
        assert!(q.params.is_none());

        let q = parse("\u{1}PING 12345\u{1}").unwrap();
        assert_eq!(q.command, Command::Ping);
        assert_eq!(q.params.as_deref(), Some("12345"));

        let q = parse("\u{1}ACTION waves hello").unwrap();
        assert_eq!(q.command, Command::Action);
        assert_eq!(q.params.as_deref(), Some("waves hello"));

        assert!(parse("plain text").is_none());
        assert!(parse("\u{1}\u{1}").is_none());
    }

    #[test]
    fn unknown_commands_are_kept() {
        let q = parse("\u{1}finger\u{1}").unwrap();
        assert_eq!(q.command, Command::Unknown("FINGER".into()));
        assert!(auto_reply(&q).is_none());
    }

    #[test]
    fn auto_replies() {
        let ping = parse("\u{1}PING abc\u{1}").unwrap();
        assert_eq!(auto_reply(&ping).unwrap(), "\u{1}PING abc\u{1}");

        let version = parse("\u{1}VERSION\u{1}").unwrap();
        assert!(auto_reply(&version).unwrap().starts_with("\u{1}VERSION drift "));

        let time = auto_reply(&parse("\u{1}TIME\u{1}").unwrap()).unwrap();
        assert!(time.starts_with("\u{1}TIME ") && time.ends_with('\u{1}'));

        assert!(auto_reply(&parse("\u{1}ACTION x\u{1}").unwrap()).is_none());
    }

    #[test]
    fn encode_upper_cases_command() {
        assert_eq!(encode("ping", Some("42")), "\u{1}PING 42\u{1}");
        assert_eq!(encode("version", None), "\u{1}VERSION\u{1}");
    }

    #[test]
    fn latency_from_token() {
        assert_eq!(ping_latency("1000", 1250), Some(250));
        assert_eq!(ping_latency("garbage", 1250), None);
        assert_eq!(ping_latency("2000", 1000), None);
    }

    #[test]
    fn latency_with_extreme_tokens() {
        assert_eq!(ping_latency("-9223372036854775808", 1000), None);
        assert_eq!(ping_latency("9223372036854775807", -1000), None);
        assert_eq!(ping_latency("-9223372036854775808", i64::MIN), Some(0));
    }
}
