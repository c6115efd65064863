//! Numeric reply handling.
//!
//! Every numeric is first emitted as [`Event::Numeric`]. [`NUMERIC_TABLE`]
//! then maps the code to a handler; codes without an entry are shown as
//! text.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;

use crate::channel::Casemapping;
use crate::error::Error;
use crate::event::Event;
use crate::message::Message;
use crate::registration::MAX_NICK_ATTEMPTS;
use crate::session::Session;

pub const RPL_WELCOME: u16 = 1;
pub const RPL_YOURHOST: u16 = 2;
pub const RPL_CREATED: u16 = 3;
pub const RPL_MYINFO: u16 = 4;
pub const RPL_ISUPPORT: u16 = 5;
pub const RPL_AWAY: u16 = 301;
pub const RPL_UNAWAY: u16 = 305;
pub const RPL_NOWAWAY: u16 = 306;
pub const RPL_WHOISUSER: u16 = 311;
pub const RPL_WHOISSERVER: u16 = 312;
pub const RPL_WHOISOPERATOR: u16 = 313;
pub const RPL_WHOWASUSER: u16 = 314;
pub const RPL_WHOISIDLE: u16 = 317;
pub const RPL_ENDOFWHOIS: u16 = 318;
pub const RPL_WHOISCHANNELS: u16 = 319;
pub const RPL_WHOISACCOUNT: u16 = 330;
pub const RPL_LISTSTART: u16 = 321;
pub const RPL_LIST: u16 = 322;
pub const RPL_LISTEND: u16 = 323;
pub const RPL_CHANNELMODEIS: u16 = 324;
pub const RPL_CREATIONTIME: u16 = 329;
pub const RPL_NOTOPIC: u16 = 331;
pub const RPL_TOPIC: u16 = 332;
pub const RPL_TOPICWHOTIME: u16 = 333;
pub const RPL_WHOREPLY: u16 = 352;
pub const RPL_NAMREPLY: u16 = 353;
pub const RPL_ENDOFNAMES: u16 = 366;
pub const RPL_ENDOFWHOWAS: u16 = 369;
pub const RPL_MOTD: u16 = 372;
pub const RPL_MOTDSTART: u16 = 375;
pub const RPL_ENDOFMOTD: u16 = 376;
pub const ERR_UNKNOWNCOMMAND: u16 = 421;
pub const ERR_NOMOTD: u16 = 422;
pub const ERR_ERRONEUSNICKNAME: u16 = 432;
pub const ERR_NICKNAMEINUSE: u16 = 433;
pub const ERR_YOUREBANNEDCREEP: u16 = 465;
pub const ERR_RESTRICTED: u16 = 484;
pub const RPL_WHOISSECURE: u16 = 671;
pub const RPL_STARTTLS: u16 = 670;
pub const ERR_STARTTLS: u16 = 691;
pub const RPL_MONONLINE: u16 = 730;
pub const RPL_MONOFFLINE: u16 = 731;
pub const RPL_MONLIST: u16 = 732;
pub const RPL_ENDOFMONLIST: u16 = 733;
pub const ERR_MONLISTFULL: u16 = 734;
pub const RPL_LOGGEDIN: u16 = 900;
pub const RPL_LOGGEDOUT: u16 = 901;
pub const ERR_NICKLOCKED: u16 = 902;
pub const RPL_SASLSUCCESS: u16 = 903;
pub const ERR_SASLFAIL: u16 = 904;
pub const ERR_SASLTOOLONG: u16 = 905;
pub const ERR_SASLABORTED: u16 = 906;
pub const ERR_SASLALREADY: u16 = 907;
pub const RPL_SASLMECHS: u16 = 908;

pub type NumericHandler = fn(&mut Session, &Message);

/// LUSERS, STATS, LIST, INFO, LINKS and similar purely informational replies.
const INFORMATIONAL: &[u16] = &[
    2, 3, 4, 8, 10, 42, 200, 201, 202, 203, 204, 205, 206, 207, 208, 209, 210, 211, 212, 213, 214,
    215, 216, 217, 218, 219, 221, 234, 235, 240, 241, 242, 243, 244, 246, 247, 250, 251, 252, 253,
    254, 255, 256, 257, 258, 259, 261, 262, 263, 265, 266, 276, 302, 303, 307, 315, 320, 321, 323,
    325, 335, 338, 341, 342, 346, 347, 348, 349, 351, 354, 364, 365, 367, 368, 371, 374, 378, 379,
    381, 382, 383, 391, 392, 393, 394, 395, 396,
];

/// RFC 1459/2812 error replies (401-502) without special handling.
const ERRORS: &[u16] = &[
    401, 402, 403, 404, 405, 406, 407, 408, 409, 411, 412, 413, 414, 415, 416, 417, 423, 424, 431,
    436, 437, 441, 442, 443, 444, 445, 446, 451, 461, 462, 463, 464, 466, 467, 471, 472, 473, 474,
    475, 476, 477, 478, 481, 482, 483, 485, 489, 491, 501, 502,
];

/// WATCH replies (600-608).
const WATCH: &[u16] = &[600, 601, 602, 603, 604, 605, 606, 607, 608];

pub static NUMERIC_TABLE: Lazy<HashMap<u16, NumericHandler>> = Lazy::new(|| {
    let mut table: HashMap<u16, NumericHandler> = HashMap::new();
    for &code in INFORMATIONAL {
        table.insert(code, show_rest);
    }
    for &code in ERRORS {
        table.insert(code, show_error);
    }
    for &code in WATCH {
        table.insert(code, watch);
    }

    table.insert(RPL_WELCOME, welcome);
    table.insert(RPL_ISUPPORT, isupport);

    table.insert(RPL_AWAY, whois_away);
    table.insert(RPL_UNAWAY, show_trailing);
    table.insert(RPL_NOWAWAY, show_trailing);
    table.insert(RPL_WHOISUSER, whois_user);
    table.insert(RPL_WHOWASUSER, whois_user);
    table.insert(RPL_WHOISSERVER, whois_server);
    table.insert(RPL_WHOISOPERATOR, whois_trailing);
    table.insert(RPL_WHOISIDLE, whois_idle);
    table.insert(RPL_ENDOFWHOIS, show_trailing);
    table.insert(RPL_ENDOFWHOWAS, show_trailing);
    table.insert(RPL_WHOISCHANNELS, whois_channels);
    table.insert(RPL_WHOISACCOUNT, whois_account);
    table.insert(RPL_WHOISSECURE, whois_trailing);
    table.insert(RPL_WHOREPLY, who_reply);

    table.insert(RPL_LIST, list_entry);
    table.insert(RPL_LISTSTART, show_rest);
    table.insert(RPL_LISTEND, show_trailing);

    table.insert(RPL_CHANNELMODEIS, channel_mode_is);
    table.insert(RPL_CREATIONTIME, creation_time);
    table.insert(RPL_NOTOPIC, no_topic);
    table.insert(RPL_TOPIC, topic);
    table.insert(RPL_TOPICWHOTIME, topic_who_time);
    table.insert(RPL_NAMREPLY, names_reply);
    table.insert(RPL_ENDOFNAMES, end_of_names);

    table.insert(RPL_MOTDSTART, motd);
    table.insert(RPL_MOTD, motd);
    table.insert(RPL_ENDOFMOTD, motd);
    table.insert(ERR_NOMOTD, show_trailing);

    table.insert(ERR_UNKNOWNCOMMAND, unknown_command);
    table.insert(ERR_ERRONEUSNICKNAME, nick_collision);
    table.insert(ERR_NICKNAMEINUSE, nick_collision);
    table.insert(ERR_YOUREBANNEDCREEP, connection_blocked);
    table.insert(ERR_RESTRICTED, connection_blocked);

    table.insert(RPL_STARTTLS, show_trailing);
    table.insert(ERR_STARTTLS, show_error);

    table.insert(RPL_MONONLINE, monitor_online);
    table.insert(RPL_MONOFFLINE, monitor_offline);
    table.insert(RPL_MONLIST, show_rest);
    table.insert(RPL_ENDOFMONLIST, show_trailing);
    table.insert(ERR_MONLISTFULL, show_error);

    table.insert(RPL_LOGGEDIN, logged_in);
    table.insert(RPL_LOGGEDOUT, show_trailing);
    table.insert(ERR_NICKLOCKED, sasl_failed);
    table.insert(RPL_SASLSUCCESS, sasl_success);
    table.insert(ERR_SASLFAIL, sasl_failed);
    table.insert(ERR_SASLTOOLONG, sasl_failed);
    table.insert(ERR_SASLABORTED, sasl_failed);
    table.insert(ERR_SASLALREADY, sasl_failed);
    table.insert(RPL_SASLMECHS, sasl_mechs);
    table
});

pub fn dispatch(s: &mut Session, msg: &Message, code: u16) {
    s.emit(Event::Numeric {
        code,
        params: msg.params.clone(),
    });
    match NUMERIC_TABLE.get(&code) {
        Some(handler) => handler(s, msg),
        None => show_rest(s, msg),
    }
}

/// Params after our own nick, joined.
fn rest(msg: &Message) -> String {
    msg.params.get(1..).map(|p| p.join(" ")).unwrap_or_default()
}

fn trailing(msg: &Message) -> &str {
    msg.params.last().map(String::as_str).unwrap_or("")
}

fn show_rest(s: &mut Session, msg: &Message) {
    let text = rest(msg);
    if !text.is_empty() {
        s.display(text);
    }
}

fn show_trailing(s: &mut Session, msg: &Message) {
    if msg.params.len() > 1 {
        s.display(trailing(msg).to_string());
    }
}

fn show_error(s: &mut Session, msg: &Message) {
    tracing::debug!(network = %s.network, command = %msg.command, "Error reply");
    s.display(rest(msg));
}

// ── Registration ──

fn welcome(s: &mut Session, msg: &Message) {
    let nick = msg.param(0).unwrap_or("").to_string();
    s.on_welcome(&nick);
    show_trailing(s, msg);
}

fn isupport(s: &mut Session, msg: &Message) {
    let end = msg.params.len().saturating_sub(1).max(1);
    let tokens = msg.params.get(1..end).unwrap_or(&[]);
    for token in tokens {
        let Some((key, value)) = s.server.apply(token) else { continue };
        match (key.as_str(), value.as_deref()) {
            ("PREFIX", Some(v)) => s.channels.set_prefixes(v),
            ("CASEMAPPING", Some(v)) => s.channels.set_casemapping(Casemapping::from_isupport(v)),
            _ => {}
        }
    }
}

/// ERR_NICKNAMEINUSE / ERR_ERRONEUSNICKNAME. Before registration the next
/// candidate is tried; afterwards the error is only shown.
fn nick_collision(s: &mut Session, msg: &Message) {
    if s.is_registered() {
        show_rest(s, msg);
        return;
    }
    let exhausted = s.nick.attempts() >= MAX_NICK_ATTEMPTS;
    let next = s.nick.on_collision();
    if !exhausted && s.nick.attempts() >= MAX_NICK_ATTEMPTS {
        s.report(&Error::Registration(format!(
            "nick retries exhausted, falling back to {next}"
        )));
    }
    s.display(format!("{}, trying {next}", rest(msg)));
    s.send(format!("NICK {next}"));
}

fn unknown_command(s: &mut Session, msg: &Message) {
    if msg.param(1).is_some_and(|c| c.eq_ignore_ascii_case("CAP")) && s.cap_pending() {
        tracing::info!(network = %s.network, "Server does not support CAP");
        s.end_cap();
        return;
    }
    show_error(s, msg);
}

/// ERR_YOUREBANNEDCREEP / ERR_RESTRICTED end the session.
fn connection_blocked(s: &mut Session, msg: &Message) {
    let text = trailing(msg).to_string();
    s.report(&Error::Server(text.clone()));
    s.request_close(text);
}

// ── SASL ──

fn logged_in(s: &mut Session, msg: &Message) {
    let account = msg.param(2).unwrap_or("").to_string();
    tracing::info!(network = %s.network, %account, "Logged in");
    s.emit(Event::Authenticated { account });
}

fn sasl_success(s: &mut Session, msg: &Message) {
    show_trailing(s, msg);
    s.end_cap();
}

fn sasl_failed(s: &mut Session, msg: &Message) {
    let code = msg.numeric().unwrap_or(0);
    s.report(&Error::Sasl {
        code,
        message: trailing(msg).to_string(),
    });
    if code != ERR_SASLALREADY {
        s.end_cap();
    }
}

fn sasl_mechs(s: &mut Session, msg: &Message) {
    s.display(format!("Server SASL mechanisms: {}", msg.param(1).unwrap_or("")));
}

// ── WHOIS / WHO / LIST ──

fn whois_user(s: &mut Session, msg: &Message) {
    if let [_, nick, user, host, _, realname, ..] = msg.params.as_slice() {
        let verb = if msg.numeric() == Some(RPL_WHOWASUSER) { "was" } else { "is" };
        s.display(format!("{nick} {verb} {user}@{host} ({realname})"));
    } else {
        show_rest(s, msg);
    }
}

fn whois_server(s: &mut Session, msg: &Message) {
    if let [_, nick, server, info, ..] = msg.params.as_slice() {
        s.display(format!("{nick} is connected to {server} ({info})"));
    } else {
        show_rest(s, msg);
    }
}

fn whois_trailing(s: &mut Session, msg: &Message) {
    if let [_, nick, .., text] = msg.params.as_slice() {
        s.display(format!("{nick} {text}"));
    }
}

fn whois_idle(s: &mut Session, msg: &Message) {
    let (Some(nick), Some(idle)) = (msg.param(1), msg.param(2).and_then(|v| v.parse::<u64>().ok())) else {
        show_rest(s, msg);
        return;
    };
    let signon = msg
        .param(3)
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0));
    let mut text = format!("{nick} has been idle {}", format_duration(idle));
    if let Some(at) = signon {
        text.push_str(&format!(", signed on {}", at.format("%Y-%m-%d %H:%M:%S UTC")));
    }
    s.display(text);
}

fn whois_channels(s: &mut Session, msg: &Message) {
    if let [_, nick, channels, ..] = msg.params.as_slice() {
        s.display(format!("{nick} is on {}", channels.trim()));
    }
}

fn whois_account(s: &mut Session, msg: &Message) {
    if let [_, nick, account, ..] = msg.params.as_slice() {
        s.display(format!("{nick} is logged in as {account}"));
    }
}

fn whois_away(s: &mut Session, msg: &Message) {
    if let [_, nick, text, ..] = msg.params.as_slice() {
        s.display(format!("{nick} is away: {text}"));
    }
}

/// `352 me #chan user host server nick flags :hops realname`
fn who_reply(s: &mut Session, msg: &Message) {
    if let [_, channel, user, host, _, nick, flags, ..] = msg.params.as_slice() {
        let away = flags.starts_with('G');
        let touched = s.channels.update_user(nick, |u| {
            u.username = Some(user.clone());
            u.host = Some(host.clone());
            u.away = away;
        });
        if touched.iter().any(|c| s.channels.fold(c) == s.channels.fold(channel)) {
            s.emit_users(channel);
        }
    }
    show_rest(s, msg);
}

fn list_entry(s: &mut Session, msg: &Message) {
    if let [_, channel, count, ..] = msg.params.as_slice() {
        let topic = msg.params.get(3).map(String::as_str).unwrap_or("");
        s.display(format!("{channel} ({count}): {topic}"));
    }
}

// ── Channels ──

fn channel_mode_is(s: &mut Session, msg: &Message) {
    let Some(channel) = msg.param(1) else { return };
    let modes = msg.params.get(2..).map(|m| m.join(" ")).unwrap_or_default();
    let info = s.channels.topic_mut(channel).map(|info| {
        info.modes = Some(modes.clone());
        info.clone()
    });
    match info {
        Some(info) => s.emit(Event::Topic {
            channel: channel.to_string(),
            info,
        }),
        None => s.display(format!("{channel} modes: {modes}")),
    }
}

fn creation_time(s: &mut Session, msg: &Message) {
    let (Some(channel), Some(ts)) = (msg.param(1), msg.param(2).and_then(|t| t.parse::<i64>().ok())) else {
        return;
    };
    if let Some(at) = DateTime::<Utc>::from_timestamp(ts, 0) {
        s.display(format!("{channel} created {}", at.format("%Y-%m-%d %H:%M:%S UTC")));
    }
}

fn no_topic(s: &mut Session, msg: &Message) {
    let Some(channel) = msg.param(1) else { return };
    if let Some(info) = s.channels.topic_mut(channel) {
        info.topic = None;
        let info = info.clone();
        s.emit(Event::Topic {
            channel: channel.to_string(),
            info,
        });
    }
}

fn topic(s: &mut Session, msg: &Message) {
    let (Some(channel), Some(text)) = (msg.param(1), msg.param(2)) else { return };
    let info = s.channels.topic_mut(channel).map(|info| {
        info.topic = Some(text.to_string()).filter(|t| !t.is_empty());
        info.clone()
    });
    match info {
        Some(info) => s.emit(Event::Topic {
            channel: channel.to_string(),
            info,
        }),
        None => s.display(format!("Topic for {channel}: {text}")),
    }
}

/// `333 me #chan setter unix-time`
fn topic_who_time(s: &mut Session, msg: &Message) {
    let (Some(channel), Some(setter)) = (msg.param(1), msg.param(2)) else { return };
    let set_at = msg
        .param(3)
        .and_then(|t| t.parse::<i64>().ok())
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0));
    let setter = crate::message::split_source(setter).nick.to_string();
    let info = s.channels.topic_mut(channel).map(|info| {
        info.set_by = Some(setter);
        info.set_at = set_at;
        info.clone()
    });
    if let Some(info) = info {
        s.emit(Event::Topic {
            channel: channel.to_string(),
            info,
        });
    }
}

/// `353 me <symbol> #chan :names...`; older servers omit the symbol.
fn names_reply(s: &mut Session, msg: &Message) {
    let n = msg.params.len();
    if n < 3 {
        return;
    }
    let channel = &msg.params[n - 2];
    let names = &msg.params[n - 1];
    if s.channels.contains(channel) {
        s.channels.names_chunk(channel, names);
    } else {
        s.display(format!("Users on {channel}: {names}"));
    }
}

fn end_of_names(s: &mut Session, msg: &Message) {
    let Some(channel) = msg.param(1) else { return };
    let userhost = s.cap_enabled("userhost-in-names");
    if s.channels.names_end(channel, userhost) {
        s.emit_users(channel);
    }
}

fn motd(s: &mut Session, msg: &Message) {
    let text = trailing(msg);
    let text = text.strip_prefix("- ").unwrap_or(text).to_string();
    s.display(text);
}

// ── MONITOR / WATCH ──

/// Nicks from a `nick!user@host,nick2!...` target list.
fn target_nicks(list: &str) -> Vec<String> {
    list.split(',')
        .filter(|t| !t.is_empty())
        .map(|t| crate::message::split_source(t).nick.to_string())
        .collect()
}

fn monitor_online(s: &mut Session, msg: &Message) {
    let online = target_nicks(trailing(msg));
    s.emit(Event::MonitorStatus {
        online,
        offline: Vec::new(),
    });
}

fn monitor_offline(s: &mut Session, msg: &Message) {
    let offline = target_nicks(trailing(msg));
    s.emit(Event::MonitorStatus {
        online: Vec::new(),
        offline,
    });
}

/// WATCH: 600/604 online, 601/605 offline, the rest informational.
fn watch(s: &mut Session, msg: &Message) {
    let nick = msg.param(1).map(str::to_string);
    match (msg.numeric(), nick) {
        (Some(600 | 604), Some(nick)) => s.emit(Event::MonitorStatus {
            online: vec![nick],
            offline: Vec::new(),
        }),
        (Some(601 | 605), Some(nick)) => s.emit(Event::MonitorStatus {
            online: Vec::new(),
            offline: vec![nick],
        }),
        _ => show_rest(s, msg),
    }
}

fn format_duration(secs: u64) -> String {
    let (d, h, m, sec) = (secs / 86_400, secs % 86_400 / 3600, secs % 3600 / 60, secs % 60);
    match (d, h, m) {
        (0, 0, 0) => format!("{sec}s"),
        (0, 0, _) => format!("{m}m {sec}s"),
        (0, _, _) => format!("{h}h {m}m"),
        _ => format!("{d}d {h}h"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::error::ErrorKind;
    use crate::session::Phase;

    fn session() -> (Session, tokio::sync::mpsc::UnboundedReceiver<Event>) {
        let mut s = Session::new(ConnectionConfig::new("irc.example.net", 6667, "me"), "test");
        s.start();
        s.on_cap_timeout();
        s.take_outgoing();
        let mut rx = s.subscribe();
        while rx.try_recv().is_ok() {}
        (s, rx)
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn table_covers_extension_ranges() {
        for code in (900..=908).chain(730..=734).chain(600..=608) {
            assert!(NUMERIC_TABLE.contains_key(&code), "{code}");
        }
        for code in [670, 691, 311, 312, 313, 317, 318, 319, 314, 369, 251, 255, 321, 322, 323, 401, 433, 502] {
            assert!(NUMERIC_TABLE.contains_key(&code), "{code}");
        }
    }

    #[test]
    fn welcome_registers_and_adopts_nick() {
        let (mut s, mut rx) = session();
        s.handle_line(":srv 001 me_ :Welcome to the network");
        assert!(s.is_registered());
        assert_eq!(s.current_nick(), "me_");
        let events = drain(&mut rx);
        assert!(matches!(&events[0], Event::Numeric { code: 1, .. }));
        assert!(events.iter().any(|e| matches!(e, Event::Registered { nick } if nick == "me_")));
        assert!(events.iter().any(|e| matches!(e, Event::ConnectionState { phase: Phase::Registered, .. })));
    }

    #[test]
    fn collisions_before_registration_retry() {
        let (mut s, _rx) = session();
        s.handle_line(":srv 433 * me :Nickname is already in use");
        assert_eq!(s.take_outgoing(), vec!["NICK me_\r\n"]);
        s.handle_line(":srv 001 me_ :Welcome");
        s.handle_line(":srv 433 me_ other :Nickname is already in use");
        assert!(s.take_outgoing().is_empty());
    }

    #[test]
    fn exhausted_nick_retries_report_once() {
        let (mut s, mut rx) = session();
        for _ in 0..4 {
            s.handle_line(":srv 433 * me :Nickname is already in use");
        }
        let kinds: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                Event::Error { kind, .. } => Some(kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![ErrorKind::Registration]);
        assert_eq!(s.take_outgoing().len(), 4);
    }

    #[test]
    fn banned_forces_disconnect() {
        let (mut s, mut rx) = session();
        s.handle_line(":srv 465 me :You are banned from this server");
        assert_eq!(s.close_requested(), Some("You are banned from this server"));
        assert!(drain(&mut rx).iter().any(|e| matches!(e, Event::Error { .. })));
    }

    #[test]
    fn names_across_lines_then_end() {
        let (mut s, mut rx) = session();
        s.handle_line(":srv 001 me :Welcome");
        s.handle_line(":me!u@h JOIN #chan");
        s.handle_line(":srv 353 me = #chan :@op +voice");
        s.handle_line(":srv 353 me = #chan :plain");
        drain(&mut rx);
        s.handle_line(":srv 366 me #chan :End of /NAMES list.");
        let users = match drain(&mut rx).pop() {
            Some(Event::UsersChanged { users, .. }) => users,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(users.len(), 3);
        let modes = |nick: &str| users.iter().find(|u| u.nick == nick).unwrap().modes.clone();
        assert_eq!(modes("op"), vec!['o']);
        assert_eq!(modes("voice"), vec!['v']);
        assert!(modes("plain").is_empty());
    }

    #[test]
    fn isupport_prefix_and_casemapping() {
        let (mut s, _rx) = session();
        s.handle_line(":srv 005 me PREFIX=(ov)@+ CASEMAPPING=ascii NETWORK=Example :are supported by this server");
        assert!(!s.channels().is_prefix_mode('q'));
        assert_eq!(s.channels().casemapping(), Casemapping::Ascii);
        assert_eq!(s.server_info().network.as_deref(), Some("Example"));
    }

    #[test]
    fn sasl_failure_reports_and_ends_cap() {
        let mut cfg = ConnectionConfig::new("h", 6667, "me");
        cfg.sasl = Some(crate::config::SaslCredentials {
            account: "me".into(),
            password: "wrong".into(),
        });
        let mut s = Session::new(cfg, "test");
        s.start();
        s.handle_line(":srv CAP * LS :sasl");
        s.handle_line(":srv CAP * ACK :sasl");
        s.handle_line("AUTHENTICATE +");
        s.take_outgoing();
        let mut rx = s.subscribe();
        s.handle_line(":srv 904 me :SASL authentication failed");
        let out = s.take_outgoing();
        assert_eq!(out[0], "CAP END\r\n");
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            Event::Error { kind: crate::error::ErrorKind::Sasl, .. }
        )));
    }

    #[test]
    fn monitor_online_offline() {
        let (mut s, mut rx) = session();
        s.handle_line(":srv 730 me :bob!b@h,carol!c@h");
        s.handle_line(":srv 731 me :dave");
        let statuses: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                Event::MonitorStatus { online, offline } => Some((online, offline)),
                _ => None,
            })
            .collect();
        assert_eq!(statuses[0].0, vec!["bob", "carol"]);
        assert_eq!(statuses[1].1, vec!["dave"]);
    }

    #[test]
    fn topic_numerics_fill_info() {
        let (mut s, _rx) = session();
        s.handle_line(":srv 001 me :Welcome");
        s.handle_line(":me!u@h JOIN #chan");
        s.handle_line(":srv 332 me #chan :Rust talk");
        s.handle_line(":srv 333 me #chan alice!a@h 1700000000");
        s.handle_line(":srv 324 me #chan +nt");
        let info = &s.channels().get("#chan").unwrap().topic;
        assert_eq!(info.topic.as_deref(), Some("Rust talk"));
        assert_eq!(info.set_by.as_deref(), Some("alice"));
        assert_eq!(info.set_at.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(info.modes.as_deref(), Some("+nt"));
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(7260), "2h 1m");
        assert_eq!(format_duration(90_000), "1d 1h");
    }
}
