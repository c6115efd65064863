//! Events emitted by a connection for the UI/feature layer to consume.
//!
//! Events are delivered to subscribers in the exact order lines were parsed
//! off the wire. Until the first subscriber attaches, events are kept in a
//! ring buffer of [`BACKLOG_CAPACITY`] entries: when full, the oldest event is
//! evicted (most recent wins). The first subscriber receives the backlog in
//! original order before anything newer.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::channel::{ChannelTopicInfo, ChannelUser};
use crate::error::ErrorKind;
use crate::session::Phase;

pub const BACKLOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Privmsg,
    Notice,
    Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Written to the wire; waiting for the server's echo-message copy.
    Pending,
    Sent,
}

/// A PRIVMSG/NOTICE/ACTION after CTCP and envelope unwrapping.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub from: String,
    pub target: String,
    pub text: String,
    pub kind: MessageKind,
    /// IRCv3 message tags (empty if none).
    pub tags: HashMap<String, String>,
    /// Server time when `server-time` is enabled, else local receipt time.
    pub time: DateTime<Utc>,
    /// Text was recovered from an encrypted envelope.
    pub encrypted: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    ConnectionState {
        phase: Phase,
        detail: Option<String>,
    },
    /// Registration complete. `nick` is the server-confirmed nick.
    Registered {
        nick: String,
    },
    /// Capabilities enabled after ACK (full current set).
    Capabilities {
        enabled: Vec<String>,
    },
    /// SASL succeeded (900/903).
    Authenticated {
        account: String,
    },
    Message(ChatMessage),
    /// Optimistic copy of a message we sent.
    LocalEcho {
        id: u64,
        target: String,
        text: String,
        kind: MessageKind,
        status: DeliveryStatus,
    },
    MessageStatus {
        id: u64,
        status: DeliveryStatus,
    },
    /// Every numeric reply, before numeric-specific handling.
    Numeric {
        code: u16,
        params: Vec<String>,
    },
    /// We joined a channel.
    JoinedChannel {
        channel: String,
    },
    Join {
        channel: String,
        nick: String,
        account: Option<String>,
    },
    Part {
        channel: String,
        nick: String,
        reason: Option<String>,
    },
    Kick {
        channel: String,
        nick: String,
        by: String,
        reason: Option<String>,
    },
    Quit {
        nick: String,
        reason: Option<String>,
        channels: Vec<String>,
    },
    NickChanged {
        old_nick: String,
        new_nick: String,
    },
    /// account-notify; `None` when the user logged out.
    Account {
        nick: String,
        account: Option<String>,
    },
    Chghost {
        nick: String,
        username: String,
        host: String,
    },
    /// away-notify; `message` is `None` when the user came back.
    Away {
        nick: String,
        message: Option<String>,
    },
    Topic {
        channel: String,
        info: ChannelTopicInfo,
    },
    Invite {
        channel: String,
        by: String,
    },
    ModeChanged {
        target: String,
        modes: String,
        args: Vec<String>,
        set_by: String,
    },
    /// Full member list after any structural change.
    UsersChanged {
        channel: String,
        users: Vec<ChannelUser>,
    },
    /// Our membership ended; collaborators drop per-channel state.
    ClearChannel {
        channel: String,
    },
    Pong {
        token: String,
        latency_ms: Option<u64>,
    },
    CtcpRequest {
        from: String,
        target: String,
        command: String,
        args: Option<String>,
    },
    CtcpReply {
        from: String,
        command: String,
        args: Option<String>,
        latency_ms: Option<u64>,
    },
    StsPolicy {
        port: Option<u16>,
        duration: Option<u64>,
        preload: bool,
    },
    MonitorStatus {
        online: Vec<String>,
        offline: Vec<String>,
    },
    BatchStart {
        id: String,
        batch_type: String,
        target: Option<String>,
    },
    BatchEnd {
        id: String,
    },
    /// Human-readable outcome of an encryption envelope (offer/accept/reject).
    Encryption {
        peer: String,
        text: String,
    },
    /// Anything worth showing that has no dedicated event: server notices,
    /// MOTD, WHOIS lines, unrecognized commands (reconstructed line).
    Display {
        text: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    /// A line written to the wire (without CRLF).
    SendRaw {
        line: String,
    },
    /// A send attempted while the transport is down, for an offline queue.
    QueueMessage {
        target: String,
        text: String,
    },
}

/// Fan-out of events to subscribers, with a bounded pre-subscription backlog.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Vec<mpsc::UnboundedSender<Event>>,
    backlog: VecDeque<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, event: Event) {
        if !self.subscribers.is_empty() {
            self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
            if !self.subscribers.is_empty() {
                return;
            }
        }
        if self.backlog.len() == BACKLOG_CAPACITY {
            self.backlog.pop_front();
        }
        self.backlog.push_back(event);
    }

    /// Attach a subscriber. If the backlog holds anything, it is flushed to
    /// this subscriber first, in original order.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.attach(tx);
        rx
    }

    pub fn attach(&mut self, tx: mpsc::UnboundedSender<Event>) {
        for event in self.backlog.drain(..) {
            if tx.send(event).is_err() {
                break;
            }
        }
        self.subscribers.push(tx);
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
