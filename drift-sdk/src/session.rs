//! Sans-IO protocol session.
//!
//! A [`Session`] holds everything one connection knows: phase, nick,
//! capabilities, channel state and the event bus. It never touches a
//! socket. The connection task feeds it inbound lines, timer ticks and
//! commands, then writes whatever [`Session::take_outgoing`] returns.

use std::collections::VecDeque;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::cap::{CapNegotiator, CapStep};
use crate::channel::ChannelStore;
use crate::config::ConnectionConfig;
use crate::ctcp;
use crate::dispatch;
use crate::envelope::{EncryptionService, Envelope, NoEncryption};
use crate::error::{Error, ErrorKind};
use crate::event::{DeliveryStatus, Event, EventBus, MessageKind};
use crate::isupport::ServerInfo;
use crate::message::{Message, is_channel};
use crate::outbound::{self, Action, Outbox};
use crate::registration::{self, NickNegotiator};
use crate::sasl::{SaslAuthenticator, SaslMechanism};

/// Prefix of the tokens used for keepalive PINGs.
pub const KEEPALIVE_PREFIX: &str = "drift-";

/// Echoes awaiting the server copy; older entries are given up on.
const MAX_PENDING_ECHOES: usize = 256;

/// Named connection phases, in the order a healthy connection visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Connecting,
    ProxyTunnel,
    TlsHandshake,
    CapNegotiation,
    Authenticating,
    Registering,
    Registered,
    Disconnected,
}

#[derive(Debug)]
struct PendingEcho {
    id: u64,
    /// Casefolded target.
    target: String,
    /// Body exactly as written to the wire.
    body: String,
}

pub struct Session {
    pub(crate) config: ConnectionConfig,
    pub(crate) network: String,
    pub(crate) phase: Phase,
    pub(crate) nick: NickNegotiator,
    pub(crate) cap: CapNegotiator,
    pub(crate) sasl: Option<SaslAuthenticator>,
    pub(crate) channels: ChannelStore,
    pub(crate) server: ServerInfo,
    pub(crate) encryption: Box<dyn EncryptionService>,
    pub(crate) awaiting_pong: Option<String>,
    bus: EventBus,
    outbox: Outbox,
    /// Actions issued before 001, replayed in order once registered.
    pending: Vec<Action>,
    active_target: Option<String>,
    echoes: VecDeque<PendingEcho>,
    next_echo_id: u64,
    close_requested: Option<String>,
}

impl Session {
    pub fn new(config: ConnectionConfig, network: impl Into<String>) -> Self {
        let nick = NickNegotiator::new(&config);
        Self {
            network: network.into(),
            phase: Phase::Connecting,
            nick,
            cap: CapNegotiator::new(),
            sasl: None,
            channels: ChannelStore::new(),
            server: ServerInfo::default(),
            encryption: Box::new(NoEncryption),
            awaiting_pong: None,
            bus: EventBus::new(),
            outbox: Outbox::new(),
            pending: Vec::new(),
            active_target: None,
            echoes: VecDeque::new(),
            next_echo_id: 1,
            close_requested: None,
            config,
        }
    }

    pub fn with_encryption(mut self, service: impl EncryptionService) -> Self {
        self.encryption = Box::new(service);
        self
    }

    pub fn set_encryption(&mut self, service: Box<dyn EncryptionService>) {
        self.encryption = service;
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_registered(&self) -> bool {
        self.phase == Phase::Registered
    }

    pub fn current_nick(&self) -> &str {
        self.nick.current()
    }

    pub fn channels(&self) -> &ChannelStore {
        &self.channels
    }

    pub fn capabilities(&self) -> &CapNegotiator {
        &self.cap
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server
    }

    pub fn active_target(&self) -> Option<&str> {
        self.active_target.as_deref()
    }

    /// Set when the session wants the transport closed: a QUIT was sent,
    /// or the server ended the session.
    pub fn close_requested(&self) -> Option<&str> {
        self.close_requested.as_deref()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Event> {
        self.bus.subscribe()
    }

    pub fn attach(&mut self, tx: mpsc::UnboundedSender<Event>) {
        self.bus.attach(tx);
    }

    /// Lines queued for the wire, CRLF-terminated, in order.
    pub fn take_outgoing(&mut self) -> Vec<String> {
        self.outbox.drain()
    }

    pub fn set_phase(&mut self, phase: Phase, detail: Option<String>) {
        if self.phase == phase && detail.is_none() {
            return;
        }
        tracing::info!(network = %self.network, ?phase, "Connection phase");
        self.phase = phase;
        self.emit(Event::ConnectionState { phase, detail });
    }

    pub(crate) fn emit(&mut self, event: Event) {
        self.bus.emit(event);
    }

    /// The single path to the wire.
    pub(crate) fn send(&mut self, line: impl AsRef<str>) {
        let line = self.outbox.push(line.as_ref());
        tracing::debug!(network = %self.network, "-> {line}");
        self.bus.emit(Event::SendRaw { line });
    }

    pub(crate) fn display(&mut self, text: impl Into<String>) {
        self.emit(Event::Display { text: text.into() });
    }

    pub(crate) fn report(&mut self, err: &Error) {
        tracing::warn!(network = %self.network, error = %err, "Connection error");
        self.emit(Event::Error {
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    pub(crate) fn request_close(&mut self, reason: impl Into<String>) {
        if self.close_requested.is_none() {
            self.close_requested = Some(reason.into());
        }
    }

    pub(crate) fn is_me(&self, nick: &str) -> bool {
        self.channels.fold(nick) == self.channels.fold(self.nick.current())
    }

    pub(crate) fn cap_enabled(&self, cap: &str) -> bool {
        self.cap.is_enabled(cap)
    }

    /// Full member list for `channel`, as a notification.
    pub(crate) fn emit_users(&mut self, channel: &str) {
        let Some(name) = self.channels.get(channel).map(|c| c.name.clone()) else {
            return;
        };
        let users = self.channels.users(&name);
        self.emit(Event::UsersChanged { channel: name, users });
    }

    // ── Lifecycle ──

    /// Begin capability negotiation on a fresh transport. Capability sets
    /// and channel state from any earlier attempt are discarded.
    pub fn start(&mut self) {
        let want_sasl = self.config.sasl.is_some() || self.config.client_cert.is_some();
        self.cap.reset(want_sasl);
        self.channels.clear();
        self.nick = NickNegotiator::new(&self.config);
        self.sasl = None;
        self.close_requested = None;
        self.awaiting_pong = None;
        self.set_phase(Phase::CapNegotiation, None);
        let line = self.cap.start();
        self.send(line);
    }

    /// Negotiation is still open and the watchdog should be armed.
    pub fn cap_pending(&self) -> bool {
        !self.cap.is_done() && matches!(self.phase, Phase::CapNegotiation | Phase::Authenticating)
    }

    /// The CAP watchdog fired.
    pub fn on_cap_timeout(&mut self) {
        if !self.cap_pending() {
            return;
        }
        tracing::warn!(network = %self.network, state = ?self.cap.state(), "CAP negotiation timed out");
        if self.sasl.is_some() {
            self.report(&Error::Sasl {
                code: 0,
                message: "authentication timed out".into(),
            });
        }
        self.end_cap();
    }

    /// Send CAP END and identify. Idempotent.
    pub(crate) fn end_cap(&mut self) {
        if !self.cap.finish() {
            return;
        }
        self.sasl = None;
        self.send("CAP END");
        self.set_phase(Phase::Registering, None);
        for line in registration::registration_lines(&self.config) {
            self.send(line);
        }
    }

    pub(crate) fn apply_cap_step(&mut self, step: CapStep) {
        match step {
            CapStep::Wait => {}
            CapStep::Request(caps) => self.send(format!("CAP REQ :{}", caps.join(" "))),
            CapStep::StartSasl => {
                self.emit_capabilities();
                self.start_sasl();
            }
            CapStep::End => {
                self.emit_capabilities();
                self.end_cap();
            }
            CapStep::Changed => self.emit_capabilities(),
        }
    }

    fn emit_capabilities(&mut self) {
        let enabled = self.cap.enabled_list();
        tracing::info!(network = %self.network, caps = %enabled.join(" "), "Capabilities enabled");
        self.emit(Event::Capabilities { enabled });
    }

    fn start_sasl(&mut self) {
        let offered = self.cap.sasl_mechanisms();
        let Some(mechanism) = SaslMechanism::choose(&self.config, offered.as_deref()) else {
            self.display("No SASL mechanism in common with the server, continuing without login");
            self.end_cap();
            return;
        };
        let (account, password) = self
            .config
            .sasl
            .as_ref()
            .map(|s| (s.account.clone(), s.password.clone()))
            .unwrap_or_default();
        let auth = SaslAuthenticator::new(mechanism, account, password);
        self.set_phase(Phase::Authenticating, Some(mechanism.name().to_string()));
        let line = auth.start();
        self.sasl = Some(auth);
        self.send(line);
    }

    /// RPL_WELCOME. Adopts the server's nick and replays queued actions.
    pub(crate) fn on_welcome(&mut self, nick: &str) {
        self.nick.welcome(nick);
        self.cap.finish();
        self.sasl = None;
        if self.phase == Phase::Registered {
            return;
        }
        let nick = self.nick.current().to_string();
        tracing::info!(network = %self.network, %nick, "Registered");
        self.set_phase(Phase::Registered, None);
        self.emit(Event::Registered { nick });
        for action in std::mem::take(&mut self.pending) {
            self.perform(action);
        }
    }

    /// Feed one line read off the wire.
    pub fn handle_line(&mut self, line: &str) {
        match Message::parse(line) {
            Some(msg) => {
                tracing::trace!(network = %self.network, "<- {line}");
                dispatch::dispatch(self, &msg);
            }
            None => {
                let err = Error::Protocol(line.to_string());
                tracing::warn!(network = %self.network, error = %err, "Unparseable line");
                self.display(line);
            }
        }
    }

    pub fn handle_message(&mut self, msg: &Message) {
        dispatch::dispatch(self, msg);
    }

    /// Send a keepalive PING carrying a millisecond timestamp.
    pub fn send_keepalive(&mut self, now_millis: i64) {
        let token = format!("{KEEPALIVE_PREFIX}{now_millis}");
        self.send(format!("PING :{token}"));
        self.awaiting_pong = Some(token);
    }

    /// The transport is gone. `error` is reported unless the close was
    /// requested.
    pub fn on_transport_closed(&mut self, reason: &str, error: Option<&Error>) {
        if self.phase == Phase::Disconnected {
            return;
        }
        if let Some(err) = error
            && self.close_requested.is_none()
        {
            self.report(err);
        }
        for channel in self.channels.channel_names() {
            self.emit(Event::ClearChannel { channel });
        }
        self.channels.clear();
        self.pending.clear();
        self.echoes.clear();
        self.set_phase(Phase::Disconnected, Some(reason.to_string()));
    }

    // ── Operations ──

    pub fn join_channel(&mut self, channel: &str, key: Option<&str>) {
        let line = match key.filter(|k| !k.is_empty()) {
            Some(key) => format!("JOIN {channel} {key}"),
            None => format!("JOIN {channel}"),
        };
        self.perform(Action::Raw(line));
    }

    pub fn part_channel(&mut self, channel: &str, reason: Option<&str>) {
        let line = match reason.filter(|r| !r.is_empty()) {
            Some(reason) => format!("PART {channel} :{reason}"),
            None => format!("PART {channel}"),
        };
        self.perform(Action::Raw(line));
    }

    /// Plain text to a target, with a local echo.
    pub fn send_message(&mut self, target: &str, text: &str) {
        self.perform(Action::Say {
            target: target.to_string(),
            text: text.to_string(),
            kind: MessageKind::Privmsg,
        });
    }

    /// User input: a `/command` or plain text for `target` (the active
    /// target when `None`).
    pub fn send_command(&mut self, input: &str, target: Option<&str>) {
        let active = target
            .map(str::to_string)
            .or_else(|| self.active_target.clone());
        for action in outbound::parse_input(input, active.as_deref()) {
            self.perform(action);
        }
    }

    pub fn send_ctcp_request(&mut self, target: &str, command: &str, args: Option<&str>) {
        self.perform(Action::Ctcp {
            target: target.to_string(),
            command: command.to_ascii_uppercase(),
            args: args.map(str::to_string),
        });
    }

    pub fn monitor_nick(&mut self, nick: &str) {
        self.perform(Action::Monitor {
            add: true,
            nicks: vec![nick.to_string()],
        });
    }

    pub fn unmonitor_nick(&mut self, nick: &str) {
        self.perform(Action::Monitor {
            add: false,
            nicks: vec![nick.to_string()],
        });
    }

    pub fn request_channel_users(&mut self, channel: &str) {
        self.perform(Action::Raw(format!("NAMES {channel}")));
    }

    pub fn set_active_target(&mut self, target: Option<String>) {
        self.active_target = target;
    }

    pub fn send_raw(&mut self, line: &str) {
        self.perform(Action::Raw(line.to_string()));
    }

    /// Send QUIT if the transport is up and ask for it to be closed.
    pub fn quit(&mut self, reason: Option<&str>) {
        if self.phase == Phase::Disconnected {
            return;
        }
        let reason = reason.filter(|r| !r.is_empty());
        match reason {
            Some(reason) => self.send(format!("QUIT :{reason}")),
            None => self.send("QUIT"),
        }
        self.request_close(reason.unwrap_or("Quit"));
    }

    pub(crate) fn perform(&mut self, action: Action) {
        if self.phase == Phase::Disconnected {
            match action {
                Action::Say { target, text, .. } => self.emit(Event::QueueMessage { target, text }),
                Action::SetActive(target) => self.active_target = Some(target),
                Action::Usage(text) => self.display(text),
                Action::Quit(_) => {}
                _ => self.emit(Event::Error {
                    kind: ErrorKind::Transport,
                    message: Error::Closed.to_string(),
                }),
            }
            return;
        }
        let needs_registration = !matches!(action, Action::Quit(_) | Action::SetActive(_) | Action::Usage(_));
        if needs_registration && !self.is_registered() {
            tracing::debug!(network = %self.network, ?action, "Queued until registered");
            self.pending.push(action);
            return;
        }

        match action {
            Action::Raw(line) => self.send(line),
            Action::Say { target, text, kind } => self.say(&target, &text, kind),
            Action::Ctcp { target, command, args } => {
                let args = match args {
                    None if command == "PING" => Some(Utc::now().timestamp_millis().to_string()),
                    other => other,
                };
                let body = ctcp::encode(&command, args.as_deref());
                self.send(format!("PRIVMSG {target} :{body}"));
            }
            Action::SetActive(target) => self.active_target = Some(target),
            Action::Quit(reason) => self.quit(reason.as_deref()),
            Action::Monitor { add, nicks } => {
                let sign = if add { '+' } else { '-' };
                self.send(format!("MONITOR {sign} {}", nicks.join(",")));
            }
            Action::KeyOffer(peer) => match self.encryption.create_offer(&peer) {
                Some(payload) => {
                    self.send_envelope(&peer, Envelope::KeyOffer(payload));
                    self.encryption_notice(&peer, format!("Key exchange offered to {peer}"));
                }
                None => self.encryption_notice(&peer, "Encryption is not available".into()),
            },
            Action::KeyAccept(peer) => match self.encryption.accept_offer(&peer) {
                Some(payload) => {
                    self.send_envelope(&peer, Envelope::KeyAccept(payload));
                    self.encryption_notice(&peer, format!("Accepted key exchange with {peer}"));
                }
                None => self.encryption_notice(&peer, format!("No pending key offer from {peer}")),
            },
            Action::KeyReject(peer) => {
                self.encryption.reject_offer(&peer);
                self.send_envelope(&peer, Envelope::KeyReject);
                self.encryption_notice(&peer, format!("Rejected key exchange with {peer}"));
            }
            Action::KeyRequest(peer) => {
                self.send_envelope(&peer, Envelope::KeyRequest);
                self.encryption_notice(&peer, format!("Asked {peer} for a key exchange"));
            }
            Action::ShareKey { channel, nick } => match self.encryption.export_channel_key(&channel, &nick) {
                Some(payload) => {
                    self.send_envelope(&nick, Envelope::ChannelKey(payload));
                    self.encryption_notice(&nick, format!("Shared the key for {channel} with {nick}"));
                }
                None => self.encryption_notice(&nick, format!("No key for {channel}")),
            },
            Action::Usage(text) => self.display(text),
        }
    }

    fn send_envelope(&mut self, peer: &str, envelope: Envelope) {
        self.send(format!("PRIVMSG {peer} :{}", envelope.to_wire()));
    }

    pub(crate) fn encryption_notice(&mut self, peer: &str, text: String) {
        self.emit(Event::Encryption {
            peer: peer.to_string(),
            text,
        });
    }

    fn say(&mut self, target: &str, text: &str, kind: MessageKind) {
        let command = if kind == MessageKind::Notice { "NOTICE" } else { "PRIVMSG" };
        for chunk in outbound::split_text(text) {
            let mut body = match kind {
                MessageKind::Action => ctcp::encode("ACTION", Some(&chunk)),
                _ => chunk.clone(),
            };
            if kind != MessageKind::Notice {
                let sealed = if is_channel(target) {
                    self.encryption
                        .encrypt_channel(target, &body)
                        .map(Envelope::ChannelEncrypted)
                } else {
                    self.encryption.encrypt_dm(target, &body).map(Envelope::DmEncrypted)
                };
                if let Some(envelope) = sealed {
                    body = envelope.to_wire();
                }
            }
            self.send(format!("{command} {target} :{body}"));

            let id = self.next_echo_id;
            self.next_echo_id += 1;
            let status = if self.cap_enabled("echo-message") {
                if self.echoes.len() == MAX_PENDING_ECHOES {
                    self.echoes.pop_front();
                }
                self.echoes.push_back(PendingEcho {
                    id,
                    target: self.channels.fold(target),
                    body,
                });
                DeliveryStatus::Pending
            } else {
                DeliveryStatus::Sent
            };
            self.emit(Event::LocalEcho {
                id,
                target: target.to_string(),
                text: chunk,
                kind,
                status,
            });
        }
    }

    /// Match a server echo of our own message. Returns true if it was one
    /// of ours and has been marked sent.
    pub(crate) fn confirm_echo(&mut self, target: &str, body: &str) -> bool {
        let target = self.channels.fold(target);
        let Some(pos) = self
            .echoes
            .iter()
            .position(|e| e.target == target && e.body == body)
        else {
            return false;
        };
        if let Some(echo) = self.echoes.remove(pos) {
            self.emit(Event::MessageStatus {
                id: echo.id,
                status: DeliveryStatus::Sent,
            });
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(ConnectionConfig::new("irc.example.net", 6667, "alice"), "test")
    }

    fn registered() -> Session {
        let mut s = session();
        s.start();
        s.handle_line(":srv CAP * LS :multi-prefix");
        s.handle_line(":srv CAP * ACK :multi-prefix");
        s.handle_line(":srv 001 alice :Welcome");
        s.take_outgoing();
        s
    }

    #[test]
    fn start_sends_cap_ls() {
        let mut s = session();
        s.start();
        assert_eq!(s.take_outgoing(), vec!["CAP LS 302\r\n"]);
        assert_eq!(s.phase(), Phase::CapNegotiation);
        assert!(s.cap_pending());
    }

    #[test]
    fn watchdog_forces_registration_once() {
        let mut s = session();
        s.start();
        s.take_outgoing();
        s.on_cap_timeout();
        assert_eq!(
            s.take_outgoing(),
            vec!["CAP END\r\n", "NICK alice\r\n", "USER alice 0 * :drift IRC client\r\n"]
        );
        s.on_cap_timeout();
        s.handle_line(":srv CAP * ACK :multi-prefix");
        assert!(s.take_outgoing().is_empty());
    }

    #[test]
    fn commands_before_registration_are_replayed() {
        let mut s = session();
        s.start();
        s.join_channel("#rust", None);
        s.send_message("#rust", "hi");
        assert_eq!(s.take_outgoing(), vec!["CAP LS 302\r\n"]);
        s.handle_line(":srv 001 alice :Welcome");
        assert_eq!(s.take_outgoing(), vec!["JOIN #rust\r\n", "PRIVMSG #rust :hi\r\n"]);
    }

    #[test]
    fn offline_sends_become_queue_events() {
        let mut s = registered();
        s.on_transport_closed("EOF", None);
        let mut rx = s.subscribe();
        while rx.try_recv().is_ok() {}
        s.send_message("#rust", "later");
        match rx.try_recv().unwrap() {
            Event::QueueMessage { target, text } => {
                assert_eq!(target, "#rust");
                assert_eq!(text, "later");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(s.take_outgoing().is_empty());
    }

    #[test]
    fn action_is_ctcp_encoded() {
        let mut s = registered();
        s.send_command("/me waves", Some("#rust"));
        assert_eq!(s.take_outgoing(), vec!["PRIVMSG #rust :\u{1}ACTION waves\u{1}\r\n"]);
    }

    #[test]
    fn quit_requests_close() {
        let mut s = registered();
        s.send_command("/quit bye", None);
        assert_eq!(s.take_outgoing(), vec!["QUIT :bye\r\n"]);
        assert_eq!(s.close_requested(), Some("bye"));
    }

    #[test]
    fn quit_after_loss_is_silent() {
        let mut s = registered();
        s.on_transport_closed("EOF", None);
        let mut rx = s.subscribe();
        while rx.try_recv().is_ok() {}
        s.send_command("/quit bye", None);
        assert!(rx.try_recv().is_err());
        assert!(s.take_outgoing().is_empty());

        s.send_command("/raw WHO #rust", None);
        assert!(matches!(
            rx.try_recv(),
            Ok(Event::Error { kind: ErrorKind::Transport, .. })
        ));
    }

    #[test]
    fn unparseable_lines_are_displayed() {
        let mut s = registered();
        let mut rx = s.subscribe();
        while rx.try_recv().is_ok() {}
        s.handle_line(":prefix-only");
        match rx.try_recv() {
            Ok(Event::Display { text }) => assert_eq!(text, ":prefix-only"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn keepalive_token_carries_millis() {
        let mut s = registered();
        s.send_keepalive(1234);
        assert_eq!(s.take_outgoing(), vec!["PING :drift-1234\r\n"]);
        assert_eq!(s.awaiting_pong.as_deref(), Some("drift-1234"));
    }

    struct Rot13;

    impl EncryptionService for Rot13 {
        fn encrypt_channel(&mut self, _channel: &str, plaintext: &str) -> Option<String> {
            Some(rot13(plaintext))
        }

        fn decrypt_channel(&mut self, _channel: &str, _from: &str, payload: &str) -> Option<String> {
            Some(rot13(payload))
        }
    }

    fn rot13(s: &str) -> String {
        s.chars()
            .map(|c| match c {
                'a'..='z' => (((c as u8 - b'a') + 13) % 26 + b'a') as char,
                _ => c,
            })
            .collect()
    }

    #[test]
    fn encryption_service_seals_channel_text() {
        let mut s = registered().with_encryption(Rot13);
        s.send_message("#secret", "hello");
        assert_eq!(s.take_outgoing(), vec!["PRIVMSG #secret :+CHAN-ENC uryyb\r\n"]);
    }
}
