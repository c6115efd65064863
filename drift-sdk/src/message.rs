//! IRC message parsing and formatting.
//!
//! Grammar: `[@tags ][:prefix ]<command>[ <param>]*[ :<trailing>]`.
//! IRCv3 tag values are unescaped on parse and escaped on format.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};

/// A parsed IRC message with optional IRCv3 tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// IRCv3 message tags. Valueless tags map to an empty string.
    pub tags: HashMap<String, String>,
    /// Origin: `server.name` or `nick!user@host`.
    pub prefix: Option<String>,
    /// Upper-cased command or three-digit numeric.
    pub command: String,
    pub params: Vec<String>,
}

/// The `nick!user@host` pieces of a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source<'a> {
    pub nick: &'a str,
    pub user: Option<&'a str>,
    pub host: Option<&'a str>,
}

impl Message {
    /// Parse one line. Returns `None` for blank or structurally broken input
    /// (a tag or prefix segment with nothing after it, or no command token).
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut rest = line.trim_start_matches(' ');
        if rest.is_empty() {
            return None;
        }

        let tags = if let Some(after) = rest.strip_prefix('@') {
            let end = after.find(' ')?;
            let tags = parse_tags(&after[..end]);
            rest = after[end..].trim_start_matches(' ');
            tags
        } else {
            HashMap::new()
        };

        let prefix = if let Some(after) = rest.strip_prefix(':') {
            let end = after.find(' ')?;
            let pfx = after[..end].to_string();
            rest = after[end..].trim_start_matches(' ');
            Some(pfx)
        } else {
            None
        };

        let (command, mut rest) = match rest.find(' ') {
            Some(space) => (&rest[..space], &rest[space + 1..]),
            None => (rest, ""),
        };
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.find(' ') {
                Some(space) => {
                    params.push(rest[..space].to_string());
                    rest = &rest[space + 1..];
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Some(Message {
            tags,
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    pub fn new(command: &str, params: Vec<&str>) -> Self {
        Self {
            tags: HashMap::new(),
            prefix: None,
            command: command.to_string(),
            params: params.into_iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Create a message with tags.
    pub fn with_tags(tags: HashMap<String, String>, command: &str, params: Vec<&str>) -> Self {
        Self {
            tags,
            ..Self::new(command, params)
        }
    }

    /// Numeric code, if the command is a three-digit reply.
    pub fn numeric(&self) -> Option<u16> {
        if self.command.len() == 3 && self.command.bytes().all(|b| b.is_ascii_digit()) {
            self.command.parse().ok()
        } else {
            None
        }
    }

    pub fn param(&self, idx: usize) -> Option<&str> {
        self.params.get(idx).map(String::as_str)
    }

    pub fn source(&self) -> Option<Source<'_>> {
        self.prefix.as_deref().map(split_source)
    }

    /// Nick part of the prefix, or the whole prefix for server origins.
    pub fn source_nick(&self) -> &str {
        self.source().map(|s| s.nick).unwrap_or("")
    }

    /// True when the prefix looks like a user (`nick!user@host`), not a server.
    pub fn from_user(&self) -> bool {
        self.prefix.as_deref().is_some_and(|p| p.contains('!') || p.contains('@'))
    }

    /// The `time` tag (IRCv3 server-time), parsed as RFC 3339 with any
    /// fractional precision.
    pub fn server_time(&self) -> Option<DateTime<Utc>> {
        let raw = self.tags.get("time")?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            write!(f, "@")?;
            let mut first = true;
            for (key, value) in &self.tags {
                if !first {
                    write!(f, ";")?;
                }
                first = false;
                if value.is_empty() {
                    write!(f, "{key}")?;
                } else {
                    write!(f, "{key}={}", escape_tag_value(value))?;
                }
            }
            write!(f, " ")?;
        }

        if let Some(ref prefix) = self.prefix {
            write!(f, ":{prefix} ")?;
        }
        write!(f, "{}", self.command)?;
        for (i, param) in self.params.iter().enumerate() {
            if i == self.params.len() - 1
                && (param.contains(' ') || param.starts_with(':') || param.is_empty())
            {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}

/// Split `nick!user@host` into parts. A bare server name becomes the nick.
pub fn split_source(prefix: &str) -> Source<'_> {
    let (nick, rest) = match prefix.split_once('!') {
        Some((n, r)) => (n, Some(r)),
        None => (prefix, None),
    };
    match rest {
        Some(r) => match r.split_once('@') {
            Some((user, host)) => Source {
                nick,
                user: Some(user),
                host: Some(host),
            },
            None => Source {
                nick,
                user: Some(r),
                host: None,
            },
        },
        None => match nick.split_once('@') {
            Some((n, host)) => Source {
                nick: n,
                user: None,
                host: Some(host),
            },
            None => Source {
                nick,
                user: None,
                host: None,
            },
        },
    }
}

/// True if `target` names a channel rather than a user.
pub fn is_channel(target: &str) -> bool {
    target.starts_with(['#', '&', '!', '+'])
}

/// Parse IRCv3 tag string: `key=value;key2=value2`
fn parse_tags(tag_str: &str) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    for pair in tag_str.split(';') {
        if pair.is_empty() {
            continue;
        }
        if let Some((key, value)) = pair.split_once('=') {
            tags.insert(key.to_string(), unescape_tag_value(value));
        } else {
            tags.insert(pair.to_string(), String::new());
        }
    }
    tags
}

/// `\:` → `;`, `\s` → space, `\\` → `\`, `\r` → CR, `\n` → LF
fn unescape_tag_value(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(':') => result.push(';'),
                Some('s') => result.push(' '),
                Some('\\') => result.push('\\'),
                Some('r') => result.push('\r'),
                Some('n') => result.push('\n'),
                // Unknown escapes drop the backslash; a lone trailing one is dropped too.
                Some(other) => result.push(other),
                None => {}
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn escape_tag_value(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ';' => result.push_str("\\:"),
            ' ' => result.push_str("\\s"),
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}
