//! Outbound path: the line serializer and the local `/command` grammar.
//!
//! [`Outbox`] is the only place lines are framed for the wire. [`parse_input`]
//! turns what a user typed into [`Action`]s that the session executes.

use std::collections::VecDeque;

use crate::event::MessageKind;
use crate::message::is_channel;

/// Longest PRIVMSG/NOTICE body sent in one line; longer text is split.
pub const MAX_TEXT_BYTES: usize = 400;

/// Pending wire lines, already terminated with CRLF.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: VecDeque<String>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one line. Anything after an embedded CR or LF is cut so a
    /// single call can never produce two wire commands. Returns the line as
    /// written, without the terminator.
    pub fn push(&mut self, line: &str) -> String {
        let clean = line
            .split(['\r', '\n'])
            .next()
            .unwrap_or_default()
            .to_string();
        self.queue.push_back(format!("{clean}\r\n"));
        clean
    }

    pub fn drain(&mut self) -> Vec<String> {
        self.queue.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// What a line of user input asks the session to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write this line verbatim.
    Raw(String),
    /// Send text to a target with a local echo.
    Say {
        target: String,
        text: String,
        kind: MessageKind,
    },
    Ctcp {
        target: String,
        command: String,
        args: Option<String>,
    },
    SetActive(String),
    Quit(Option<String>),
    Monitor {
        add: bool,
        nicks: Vec<String>,
    },
    KeyOffer(String),
    KeyAccept(String),
    KeyReject(String),
    KeyRequest(String),
    ShareKey {
        channel: String,
        nick: String,
    },
    /// Input could not be used; the text explains why.
    Usage(String),
}

/// Translate user input. `active` is the buffer plain text goes to.
pub fn parse_input(input: &str, active: Option<&str>) -> Vec<Action> {
    let input = input.trim_end_matches(['\r', '\n']);
    if input.trim().is_empty() {
        return Vec::new();
    }
    if let Some(literal) = input.strip_prefix("//") {
        return say_active(active, &format!("/{literal}"), MessageKind::Privmsg);
    }
    let Some(command_line) = input.strip_prefix('/') else {
        return say_active(active, input, MessageKind::Privmsg);
    };

    let (cmd, rest) = match command_line.split_once(' ') {
        Some((c, r)) => (c, r.trim()),
        None => (command_line, ""),
    };
    let cmd = cmd.to_ascii_lowercase();
    let args: Vec<&str> = rest.split_whitespace().collect();
    let usage = |text: &str| vec![Action::Usage(format!("Usage: {text}"))];
    let active_channel = active.filter(|t| is_channel(t));

    match cmd.as_str() {
        "join" | "j" => match args.as_slice() {
            [] => usage("/join <#channel[,#channel]> [keys]"),
            [chans] => vec![Action::Raw(format!("JOIN {chans}"))],
            [chans, keys, ..] => vec![Action::Raw(format!("JOIN {chans} {keys}"))],
        },
        "part" | "leave" => {
            let (channel, reason) = channel_and_rest(rest, active_channel);
            match channel {
                Some(ch) => vec![Action::Raw(with_trailing(&format!("PART {ch}"), reason))],
                None => usage("/part [#channel] [reason]"),
            }
        }
        "nick" => match args.as_slice() {
            [nick] => vec![Action::Raw(format!("NICK {nick}"))],
            _ => usage("/nick <nickname>"),
        },
        "quit" | "exit" => vec![Action::Quit(Some(rest.to_string()).filter(|r| !r.is_empty()))],
        "whois" | "whowas" => match args.as_slice() {
            [] => usage(&format!("/{cmd} <nick>")),
            [nick, ..] => vec![Action::Raw(format!("{} {nick}", cmd.to_ascii_uppercase()))],
        },
        "msg" | "notice" => {
            let kind = if cmd == "msg" {
                MessageKind::Privmsg
            } else {
                MessageKind::Notice
            };
            match rest.split_once(' ') {
                Some((target, text)) if !text.trim().is_empty() => vec![Action::Say {
                    target: target.to_string(),
                    text: text.to_string(),
                    kind,
                }],
                _ => usage(&format!("/{cmd} <target> <text>")),
            }
        }
        "query" => match rest.split_once(' ') {
            Some((target, text)) => {
                let mut actions = vec![Action::SetActive(target.to_string())];
                if !text.trim().is_empty() {
                    actions.push(Action::Say {
                        target: target.to_string(),
                        text: text.to_string(),
                        kind: MessageKind::Privmsg,
                    });
                }
                actions
            }
            None if !rest.is_empty() => vec![Action::SetActive(rest.to_string())],
            None => usage("/query <nick> [text]"),
        },
        "me" | "action" => {
            if rest.is_empty() {
                usage(&format!("/{cmd} <text>"))
            } else {
                say_active(active, rest, MessageKind::Action)
            }
        }
        "mode" => match args.first() {
            Some(first) if !first.starts_with(['+', '-']) => {
                vec![Action::Raw(format!("MODE {rest}"))]
            }
            _ => match active {
                Some(target) if rest.is_empty() => vec![Action::Raw(format!("MODE {target}"))],
                Some(target) => vec![Action::Raw(format!("MODE {target} {rest}"))],
                None => usage("/mode [target] <modes> [args]"),
            },
        },
        "topic" => {
            let (channel, text) = channel_and_rest(rest, active_channel);
            match channel {
                Some(ch) => vec![Action::Raw(with_trailing(&format!("TOPIC {ch}"), text))],
                None => usage("/topic [#channel] [text]"),
            }
        }
        "kick" => {
            let (channel, rest) = channel_and_rest(rest, active_channel);
            let (nick, reason) = match rest.map(|r| r.split_once(' ').unwrap_or((r, ""))) {
                Some((nick, reason)) => (nick, Some(reason).filter(|r| !r.is_empty())),
                None => ("", None),
            };
            match channel {
                Some(ch) if !nick.is_empty() => {
                    vec![Action::Raw(with_trailing(&format!("KICK {ch} {nick}"), reason))]
                }
                _ => usage("/kick [#channel] <nick> [reason]"),
            }
        }
        "invite" => match (args.as_slice(), active_channel) {
            ([nick, channel, ..], _) => vec![Action::Raw(format!("INVITE {nick} {channel}"))],
            ([nick], Some(channel)) => vec![Action::Raw(format!("INVITE {nick} {channel}"))],
            _ => usage("/invite <nick> [#channel]"),
        },
        "away" => vec![Action::Raw(with_trailing(
            "AWAY",
            Some(rest).filter(|r| !r.is_empty()),
        ))],
        "ctcp" => match args.as_slice() {
            [target, command, ..] => {
                let params = rest
                    .splitn(3, ' ')
                    .nth(2)
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string);
                vec![Action::Ctcp {
                    target: target.to_string(),
                    command: command.to_ascii_uppercase(),
                    args: params,
                }]
            }
            _ => usage("/ctcp <target> <command> [args]"),
        },
        "monitor" => match args.as_slice() {
            [sign, nicks @ ..] if (*sign == "+" || *sign == "-") && !nicks.is_empty() => {
                vec![Action::Monitor {
                    add: *sign == "+",
                    nicks: nicks
                        .iter()
                        .flat_map(|n| n.split(','))
                        .filter(|n| !n.is_empty())
                        .map(str::to_string)
                        .collect(),
                }]
            }
            [] => usage("/monitor +|- <nick[,nick]>"),
            _ => vec![Action::Raw(format!("MONITOR {rest}"))],
        },
        "raw" | "quote" => {
            if rest.is_empty() {
                usage(&format!("/{cmd} <line>"))
            } else {
                vec![Action::Raw(rest.to_string())]
            }
        }
        "keyoffer" | "keyaccept" | "keyreject" | "keyrequest" => match args.as_slice() {
            [nick] => {
                let nick = nick.to_string();
                vec![match cmd.as_str() {
                    "keyoffer" => Action::KeyOffer(nick),
                    "keyaccept" => Action::KeyAccept(nick),
                    "keyreject" => Action::KeyReject(nick),
                    _ => Action::KeyRequest(nick),
                }]
            }
            _ => usage(&format!("/{cmd} <nick>")),
        },
        "sharekey" => match args.as_slice() {
            [channel, nick] if is_channel(channel) => vec![Action::ShareKey {
                channel: channel.to_string(),
                nick: nick.to_string(),
            }],
            _ => usage("/sharekey <#channel> <nick>"),
        },
        _ => {
            let upper = cmd.to_ascii_uppercase();
            if rest.is_empty() {
                vec![Action::Raw(upper)]
            } else {
                vec![Action::Raw(format!("{upper} {rest}"))]
            }
        }
    }
}

/// Split text into lines no longer than [`MAX_TEXT_BYTES`], breaking at
/// newlines, then at the last space before the limit when there is one.
pub fn split_text(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in text.split(['\r', '\n']).filter(|l| !l.is_empty()) {
        let mut rest = line;
        while rest.len() > MAX_TEXT_BYTES {
            let mut cut = MAX_TEXT_BYTES;
            while !rest.is_char_boundary(cut) {
                cut -= 1;
            }
            if let Some(space) = rest[..cut].rfind(' ').filter(|&s| s > 0) {
                cut = space;
            }
            out.push(rest[..cut].to_string());
            rest = rest[cut..].trim_start_matches(' ');
        }
        if !rest.is_empty() {
            out.push(rest.to_string());
        }
    }
    out
}

fn say_active(active: Option<&str>, text: &str, kind: MessageKind) -> Vec<Action> {
    match active {
        Some(target) => vec![Action::Say {
            target: target.to_string(),
            text: text.to_string(),
            kind,
        }],
        None => vec![Action::Usage("No active channel or query to send to".into())],
    }
}

/// `[#channel] [rest]`: an explicit channel wins, else the active channel.
fn channel_and_rest<'a>(rest: &'a str, active: Option<&'a str>) -> (Option<&'a str>, Option<&'a str>) {
    let (first, tail) = match rest.split_once(' ') {
        Some((f, t)) => (f, Some(t.trim()).filter(|t| !t.is_empty())),
        None => (rest, None),
    };
    if !first.is_empty() && is_channel(first) {
        (Some(first), tail)
    } else {
        (active, Some(rest).filter(|r| !r.is_empty()))
    }
}

fn with_trailing(head: &str, trailing: Option<&str>) -> String {
    match trailing {
        Some(t) => format!("{head} :{t}"),
        None => head.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(line: &str) -> Vec<Action> {
        vec![Action::Raw(line.to_string())]
    }

    #[test]
    fn outbox_frames_and_strips_injection() {
        let mut out = Outbox::new();
        assert_eq!(out.push("PRIVMSG #a :hi\r\nQUIT"), "PRIVMSG #a :hi");
        assert_eq!(out.drain(), vec!["PRIVMSG #a :hi\r\n"]);
        assert!(out.is_empty());
    }

    #[test]
    fn plain_text_goes_to_active_target() {
        assert_eq!(
            parse_input("hello there", Some("#rust")),
            vec![Action::Say {
                target: "#rust".into(),
                text: "hello there".into(),
                kind: MessageKind::Privmsg
            }]
        );
        assert!(matches!(parse_input("hello", None)[0], Action::Usage(_)));
        assert!(parse_input("   ", Some("#rust")).is_empty());
    }

    #[test]
    fn double_slash_is_literal() {
        assert_eq!(
            parse_input("//shrug", Some("#c")),
            vec![Action::Say {
                target: "#c".into(),
                text: "/shrug".into(),
                kind: MessageKind::Privmsg
            }]
        );
    }

    #[test]
    fn channel_commands_default_to_active() {
        assert_eq!(parse_input("/join #a,#b key", None), raw("JOIN #a,#b key"));
        assert_eq!(parse_input("/part", Some("#a")), raw("PART #a"));
        assert_eq!(parse_input("/part see ya", Some("#a")), raw("PART #a :see ya"));
        assert_eq!(parse_input("/part #b bye", Some("#a")), raw("PART #b :bye"));
        assert_eq!(parse_input("/topic new topic", Some("#a")), raw("TOPIC #a :new topic"));
        assert_eq!(parse_input("/topic #b", Some("#a")), raw("TOPIC #b"));
        assert_eq!(parse_input("/kick bob spam", Some("#a")), raw("KICK #a bob :spam"));
        assert_eq!(parse_input("/kick #b bob", None), raw("KICK #b bob"));
        assert_eq!(parse_input("/mode +o bob", Some("#a")), raw("MODE #a +o bob"));
        assert_eq!(parse_input("/mode alice +i", None), raw("MODE alice +i"));
        assert_eq!(parse_input("/invite bob", Some("#a")), raw("INVITE bob #a"));
        assert!(matches!(parse_input("/part", Some("bob"))[0], Action::Usage(_)));
    }

    #[test]
    fn messaging_commands() {
        assert_eq!(
            parse_input("/msg bob hi there", None),
            vec![Action::Say {
                target: "bob".into(),
                text: "hi there".into(),
                kind: MessageKind::Privmsg
            }]
        );
        assert_eq!(
            parse_input("/me waves", Some("#a")),
            vec![Action::Say {
                target: "#a".into(),
                text: "waves".into(),
                kind: MessageKind::Action
            }]
        );
        let query = parse_input("/query bob psst", None);
        assert_eq!(query[0], Action::SetActive("bob".into()));
        assert_eq!(query.len(), 2);
        assert_eq!(
            parse_input("/ctcp bob version", None),
            vec![Action::Ctcp {
                target: "bob".into(),
                command: "VERSION".into(),
                args: None
            }]
        );
    }

    #[test]
    fn misc_commands() {
        assert_eq!(parse_input("/quit", None), vec![Action::Quit(None)]);
        assert_eq!(parse_input("/quit gone fishing", None), vec![Action::Quit(Some("gone fishing".into()))]);
        assert_eq!(parse_input("/away", None), raw("AWAY"));
        assert_eq!(parse_input("/away lunch", None), raw("AWAY :lunch"));
        assert_eq!(parse_input("/whois bob", None), raw("WHOIS bob"));
        assert_eq!(parse_input("/quote PRIVMSG x :y", None), raw("PRIVMSG x :y"));
        assert_eq!(parse_input("/knock #a please", None), raw("KNOCK #a please"));
        assert_eq!(
            parse_input("/monitor + bob,carol", None),
            vec![Action::Monitor {
                add: true,
                nicks: vec!["bob".into(), "carol".into()]
            }]
        );
        assert_eq!(parse_input("/monitor L", None), raw("MONITOR L"));
    }

    #[test]
    fn encryption_helpers() {
        assert_eq!(parse_input("/keyoffer bob", None), vec![Action::KeyOffer("bob".into())]);
        assert_eq!(parse_input("/keyreject bob", None), vec![Action::KeyReject("bob".into())]);
        assert_eq!(
            parse_input("/sharekey #a bob", None),
            vec![Action::ShareKey {
                channel: "#a".into(),
                nick: "bob".into()
            }]
        );
        assert!(matches!(parse_input("/sharekey bob #a", None)[0], Action::Usage(_)));
    }

    #[test]
    fn long_text_is_split_on_spaces() {
        let word = "abcdefghi ";
        let text = word.repeat(90);
        let parts = split_text(&text);
        assert!(parts.len() > 1);
        assert!(parts.iter().all(|p| p.len() <= MAX_TEXT_BYTES));
        assert_eq!(parts.concat().replace(' ', ""), text.replace(' ', ""));
        assert_eq!(split_text("one\ntwo"), vec!["one", "two"]);
    }
}
