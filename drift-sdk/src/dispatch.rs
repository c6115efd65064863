//! Routing of parsed lines to handlers.
//!
//! Numerics go to [`crate::numeric::NUMERIC_TABLE`]; textual commands to
//! [`COMMAND_TABLE`]. Anything else becomes a display event carrying the
//! reconstructed line.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;

use crate::channel::ChannelUser;
use crate::ctcp;
use crate::envelope::Envelope;
use crate::error::Error;
use crate::event::{ChatMessage, Event, MessageKind};
use crate::isupport::parse_mode_changes;
use crate::message::{Message, is_channel};
use crate::numeric;
use crate::session::{KEEPALIVE_PREFIX, Session};

pub type CommandHandler = fn(&mut Session, &Message);

pub static COMMAND_TABLE: Lazy<HashMap<&'static str, CommandHandler>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, CommandHandler> = HashMap::new();
    table.insert("PING", on_ping);
    table.insert("PONG", on_pong);
    table.insert("ERROR", on_error);
    table.insert("CAP", on_cap);
    table.insert("AUTHENTICATE", on_authenticate);
    table.insert("INVITE", on_invite);
    table.insert("PRIVMSG", on_privmsg);
    table.insert("NOTICE", on_notice);
    table.insert("JOIN", on_join);
    table.insert("PART", on_part);
    table.insert("QUIT", on_quit);
    table.insert("TOPIC", on_topic);
    table.insert("NICK", on_nick);
    table.insert("KICK", on_kick);
    table.insert("MODE", on_mode);
    table.insert("ACCOUNT", on_account);
    table.insert("AWAY", on_away);
    table.insert("CHGHOST", on_chghost);
    table.insert("BATCH", on_batch);
    table
});

pub fn dispatch(session: &mut Session, msg: &Message) {
    if let Some(code) = msg.numeric() {
        numeric::dispatch(session, msg, code);
        return;
    }
    match COMMAND_TABLE.get(msg.command.as_str()) {
        Some(handler) => handler(session, msg),
        None => session.display(msg.to_string()),
    }
}

fn on_ping(s: &mut Session, msg: &Message) {
    let token = msg.params.last().map(String::as_str).unwrap_or("");
    s.send(format!("PONG :{token}"));
}

fn on_pong(s: &mut Session, msg: &Message) {
    let token = msg.params.last().cloned().unwrap_or_default();
    if s.awaiting_pong.as_deref() == Some(token.as_str()) {
        s.awaiting_pong = None;
    }
    let latency_ms = token
        .strip_prefix(KEEPALIVE_PREFIX)
        .and_then(|millis| ctcp::ping_latency(millis, Utc::now().timestamp_millis()));
    s.emit(Event::Pong { token, latency_ms });
}

fn on_error(s: &mut Session, msg: &Message) {
    let text = msg.params.last().cloned().unwrap_or_else(|| "Closing link".into());
    s.report(&Error::Server(text.clone()));
    s.request_close(text);
}

fn on_cap(s: &mut Session, msg: &Message) {
    let sub = msg.param(1).unwrap_or("").to_ascii_uppercase();
    let args = msg.params.get(2..).unwrap_or(&[]);
    let step = match sub.as_str() {
        "LS" => {
            let step = s.cap.on_ls(args);
            if step != crate::cap::CapStep::Wait {
                emit_sts(s);
            }
            step
        }
        "ACK" => s.cap.on_ack(args),
        "NAK" => {
            tracing::warn!(network = %s.network, caps = ?args.last(), "Capabilities rejected");
            s.cap.on_nak(args)
        }
        "NEW" => {
            let step = s.cap.on_new(args);
            if args.last().is_some_and(|l| l.split_whitespace().any(|c| c.starts_with("sts"))) {
                emit_sts(s);
            }
            step
        }
        "DEL" => s.cap.on_del(args),
        "LIST" => {
            s.display(format!("Enabled capabilities: {}", args.last().map(String::as_str).unwrap_or("")));
            return;
        }
        _ => {
            s.display(msg.to_string());
            return;
        }
    };
    s.apply_cap_step(step);
}

fn emit_sts(s: &mut Session) {
    if let Some(policy) = s.cap.sts_policy() {
        s.emit(Event::StsPolicy {
            port: policy.port,
            duration: policy.duration,
            preload: policy.preload,
        });
    }
}

fn on_authenticate(s: &mut Session, msg: &Message) {
    let param = msg.param(0).unwrap_or("");
    let lines = match s.sasl.as_mut() {
        Some(auth) => auth.on_challenge(param),
        None => return,
    };
    for line in lines {
        s.send(line);
    }
}

fn on_invite(s: &mut Session, msg: &Message) {
    let Some(channel) = msg.param(1) else { return };
    s.emit(Event::Invite {
        channel: channel.to_string(),
        by: msg.source_nick().to_string(),
    });
}

fn on_privmsg(s: &mut Session, msg: &Message) {
    on_text(s, msg, false);
}

fn on_notice(s: &mut Session, msg: &Message) {
    on_text(s, msg, true);
}

fn on_text(s: &mut Session, msg: &Message, notice: bool) {
    let (Some(target), Some(text)) = (msg.param(0), msg.param(1)) else {
        s.display(msg.to_string());
        return;
    };
    let from = msg.source_nick().to_string();
    if notice && !msg.from_user() {
        s.display(format!("-{from}- {text}"));
        return;
    }
    if s.is_me(&from) && s.cap_enabled("echo-message") && s.confirm_echo(target, text) {
        return;
    }
    let time = msg
        .server_time()
        .filter(|_| s.cap_enabled("server-time"))
        .unwrap_or_else(Utc::now);

    if ctcp::is_ctcp(text)
        && let Some(query) = ctcp::parse(text)
    {
        if query.command == ctcp::Command::Action {
            let body = query.params.unwrap_or_default();
            emit_chat(s, msg, from, target, body, MessageKind::Action, time, false);
        } else if notice {
            let latency_ms = match query.command {
                ctcp::Command::Ping => query
                    .params
                    .as_deref()
                    .and_then(|p| ctcp::ping_latency(p, Utc::now().timestamp_millis())),
                _ => None,
            };
            s.emit(Event::CtcpReply {
                from,
                command: query.command.as_str().to_string(),
                args: query.params,
                latency_ms,
            });
        } else {
            if !s.is_me(&from)
                && let Some(reply) = ctcp::auto_reply(&query)
            {
                s.send(format!("NOTICE {from} :{reply}"));
            }
            s.emit(Event::CtcpRequest {
                from,
                target: target.to_string(),
                command: query.command.as_str().to_string(),
                args: query.params,
            });
        }
        return;
    }

    if !notice && let Some(envelope) = Envelope::parse(text) {
        route_envelope(s, msg, from, target, envelope, time);
        return;
    }

    let kind = if notice { MessageKind::Notice } else { MessageKind::Privmsg };
    emit_chat(s, msg, from, target, text.to_string(), kind, time, false);
}

fn route_envelope(
    s: &mut Session,
    msg: &Message,
    from: String,
    target: &str,
    envelope: Envelope,
    time: DateTime<Utc>,
) {
    let me = s.is_me(&from);
    match envelope {
        Envelope::KeyOffer(payload) if !me => {
            let text = if s.encryption.receive_offer(&from, &payload) {
                format!("{from} offered an encrypted session (/keyaccept {from} or /keyreject {from})")
            } else {
                format!("{from} offered an encrypted session, but encryption is not available")
            };
            s.encryption_notice(&from, text);
        }
        Envelope::KeyAccept(payload) if !me => {
            let text = if s.encryption.complete_exchange(&from, &payload) {
                format!("Encrypted session with {from} established")
            } else {
                format!("Key exchange with {from} failed")
            };
            s.encryption_notice(&from, text);
        }
        Envelope::KeyReject if !me => {
            s.encryption.peer_rejected(&from);
            s.encryption_notice(&from, format!("{from} rejected the key exchange"));
        }
        Envelope::KeyRequest if !me => {
            s.encryption_notice(&from, format!("{from} asked for a key exchange (/keyoffer {from})"));
        }
        Envelope::ChannelKey(payload) if !me => {
            let text = match s.encryption.import_channel_key(&from, &payload) {
                Some(channel) => format!("{from} shared the key for {channel}"),
                None => format!("Could not import a channel key from {from}"),
            };
            s.encryption_notice(&from, text);
        }
        Envelope::DmEncrypted(payload) => {
            let peer = if me { target.to_string() } else { from.clone() };
            match s.encryption.decrypt_dm(&peer, &payload) {
                Some(plain) => {
                    let (body, kind) = unwrap_action(plain);
                    emit_chat(s, msg, from, target, body, kind, time, true);
                }
                None => s.encryption_notice(&peer, format!("Could not decrypt a message from {from}")),
            }
        }
        Envelope::ChannelEncrypted(payload) => match s.encryption.decrypt_channel(target, &from, &payload) {
            Some(plain) => {
                let (body, kind) = unwrap_action(plain);
                emit_chat(s, msg, from, target, body, kind, time, true);
            }
            None => s.encryption_notice(target, format!("Could not decrypt a message from {from} in {target}")),
        },
        // Our own key-exchange lines echoed back.
        _ => {}
    }
}

fn unwrap_action(text: String) -> (String, MessageKind) {
    match ctcp::parse(&text) {
        Some(q) if q.command == ctcp::Command::Action => (q.params.unwrap_or_default(), MessageKind::Action),
        _ => (text, MessageKind::Privmsg),
    }
}

fn emit_chat(
    s: &mut Session,
    msg: &Message,
    from: String,
    target: &str,
    text: String,
    kind: MessageKind,
    time: DateTime<Utc>,
    encrypted: bool,
) {
    s.emit(Event::Message(ChatMessage {
        from,
        target: target.to_string(),
        text,
        kind,
        tags: msg.tags.clone(),
        time,
        encrypted,
    }));
}

fn on_join(s: &mut Session, msg: &Message) {
    let Some(channel) = msg.param(0) else { return };
    let Some(source) = msg.source() else { return };
    let account = if s.cap_enabled("extended-join") {
        msg.param(1).filter(|a| *a != "*").map(str::to_string)
    } else {
        None
    };
    if s.is_me(source.nick) {
        s.channels.open(channel);
        s.set_active_target(Some(channel.to_string()));
        s.emit(Event::JoinedChannel {
            channel: channel.to_string(),
        });
    }
    let mut user = ChannelUser::new(source.nick);
    user.account = account.clone();
    user.username = source.user.map(str::to_string);
    user.host = source.host.map(str::to_string);
    s.channels.add_user(channel, user);
    s.emit(Event::Join {
        channel: channel.to_string(),
        nick: source.nick.to_string(),
        account,
    });
    s.emit_users(channel);
}

/// Our membership of `channel` ended.
fn leave_channel(s: &mut Session, channel: &str) {
    let name = s.channels.close(channel).unwrap_or_else(|| channel.to_string());
    s.encryption.forget_channel(&name);
    if s
        .active_target()
        .is_some_and(|t| s.channels.fold(t) == s.channels.fold(&name))
    {
        s.set_active_target(None);
    }
    s.emit(Event::ClearChannel { channel: name });
}

fn on_part(s: &mut Session, msg: &Message) {
    let Some(channel) = msg.param(0) else { return };
    let nick = msg.source_nick().to_string();
    let reason = msg.param(1).filter(|r| !r.is_empty()).map(str::to_string);
    let me = s.is_me(&nick);
    if !me {
        s.channels.remove_user(channel, &nick);
    }
    s.emit(Event::Part {
        channel: channel.to_string(),
        nick,
        reason,
    });
    if me {
        leave_channel(s, channel);
    } else {
        s.emit_users(channel);
    }
}

fn on_kick(s: &mut Session, msg: &Message) {
    let (Some(channel), Some(victim)) = (msg.param(0), msg.param(1)) else { return };
    let reason = msg.param(2).filter(|r| !r.is_empty()).map(str::to_string);
    let me = s.is_me(victim);
    if !me {
        s.channels.remove_user(channel, victim);
    }
    s.emit(Event::Kick {
        channel: channel.to_string(),
        nick: victim.to_string(),
        by: msg.source_nick().to_string(),
        reason,
    });
    if me {
        leave_channel(s, channel);
    } else {
        s.emit_users(channel);
    }
}

fn on_quit(s: &mut Session, msg: &Message) {
    let nick = msg.source_nick().to_string();
    let reason = msg.param(0).filter(|r| !r.is_empty()).map(str::to_string);
    let channels = s.channels.remove_everywhere(&nick);
    s.emit(Event::Quit {
        nick,
        reason,
        channels: channels.clone(),
    });
    for channel in channels {
        s.emit_users(&channel);
    }
}

fn on_nick(s: &mut Session, msg: &Message) {
    let Some(new_nick) = msg.param(0) else { return };
    let old_nick = msg.source_nick().to_string();
    if s.is_me(&old_nick) {
        s.nick.renamed(new_nick);
    }
    let channels = s.channels.rename(&old_nick, new_nick);
    s.emit(Event::NickChanged {
        old_nick,
        new_nick: new_nick.to_string(),
    });
    for channel in channels {
        s.emit_users(&channel);
    }
}

fn on_mode(s: &mut Session, msg: &Message) {
    let (Some(target), Some(modes)) = (msg.param(0), msg.param(1)) else { return };
    let args = msg.params.get(2..).unwrap_or(&[]);
    if is_channel(target) {
        let changes = parse_mode_changes(modes, args, &s.server.chanmodes, |m| {
            s.channels.is_prefix_mode(m)
        });
        let mut members_changed = false;
        for change in changes {
            if let Some(nick) = change.arg.as_deref()
                && s.channels.is_prefix_mode(change.mode)
            {
                members_changed |= s
                    .channels
                    .apply_member_mode(target, nick, change.mode, change.adding);
            }
        }
        s.emit(Event::ModeChanged {
            target: target.to_string(),
            modes: modes.to_string(),
            args: args.to_vec(),
            set_by: msg.source_nick().to_string(),
        });
        if members_changed {
            s.emit_users(target);
        }
    } else {
        s.emit(Event::ModeChanged {
            target: target.to_string(),
            modes: modes.to_string(),
            args: args.to_vec(),
            set_by: msg.source_nick().to_string(),
        });
    }
}

fn on_topic(s: &mut Session, msg: &Message) {
    let Some(channel) = msg.param(0) else { return };
    let topic = msg.param(1).filter(|t| !t.is_empty()).map(str::to_string);
    let set_by = Some(msg.source_nick().to_string());
    let set_at = Some(msg.server_time().unwrap_or_else(Utc::now));
    let info = match s.channels.topic_mut(channel) {
        Some(info) => {
            info.topic = topic;
            info.set_by = set_by;
            info.set_at = set_at;
            info.clone()
        }
        None => crate::channel::ChannelTopicInfo {
            topic,
            set_by,
            set_at,
            modes: None,
        },
    };
    s.emit(Event::Topic {
        channel: channel.to_string(),
        info,
    });
}

fn on_account(s: &mut Session, msg: &Message) {
    let nick = msg.source_nick().to_string();
    let account = msg.param(0).filter(|a| *a != "*" && !a.is_empty()).map(str::to_string);
    let channels = s.channels.update_user(&nick, |u| u.account = account.clone());
    s.emit(Event::Account { nick, account });
    for channel in channels {
        s.emit_users(&channel);
    }
}

fn on_away(s: &mut Session, msg: &Message) {
    let nick = msg.source_nick().to_string();
    let message = msg.param(0).filter(|m| !m.is_empty()).map(str::to_string);
    let away = message.is_some();
    let channels = s.channels.update_user(&nick, |u| u.away = away);
    s.emit(Event::Away { nick, message });
    for channel in channels {
        s.emit_users(&channel);
    }
}

fn on_chghost(s: &mut Session, msg: &Message) {
    let (Some(username), Some(host)) = (msg.param(0), msg.param(1)) else { return };
    let nick = msg.source_nick().to_string();
    let channels = s.channels.update_user(&nick, |u| {
        u.username = Some(username.to_string());
        u.host = Some(host.to_string());
    });
    s.emit(Event::Chghost {
        nick,
        username: username.to_string(),
        host: host.to_string(),
    });
    for channel in channels {
        s.emit_users(&channel);
    }
}

fn on_batch(s: &mut Session, msg: &Message) {
    let Some(reference) = msg.param(0) else { return };
    if let Some(id) = reference.strip_prefix('+') {
        s.emit(Event::BatchStart {
            id: id.to_string(),
            batch_type: msg.param(1).unwrap_or("").to_string(),
            target: msg.param(2).map(str::to_string),
        });
    } else if let Some(id) = reference.strip_prefix('-') {
        s.emit(Event::BatchEnd { id: id.to_string() });
    }
}
