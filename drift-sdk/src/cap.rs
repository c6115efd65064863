//! IRCv3 capability negotiation.
//!
//! Idle → LsSent → Accumulating (while LS lines carry the `*` continuation
//! marker) → ReqSent → (Sasl) → Done. The negotiator only computes what to
//! do next; the session writes the lines.

use std::collections::{BTreeMap, BTreeSet};

/// Capabilities requested when the server advertises them.
pub const DESIRED_CAPS: &[&str] = &[
    "server-time",
    "account-notify",
    "extended-join",
    "userhost-in-names",
    "away-notify",
    "chghost",
    "message-tags",
    "batch",
    "labeled-response",
    "echo-message",
    "multi-prefix",
    "invite-notify",
    "monitor",
    "sts",
    "sasl",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapState {
    #[default]
    Idle,
    LsSent,
    Accumulating,
    ReqSent,
    Sasl,
    Done,
}

/// What the session should do after feeding a CAP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapStep {
    Wait,
    Request(Vec<String>),
    StartSasl,
    /// Negotiation is over: send CAP END, then register.
    End,
    /// The enabled set changed after negotiation (CAP NEW/DEL/ACK).
    Changed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StsPolicy {
    pub port: Option<u16>,
    pub duration: Option<u64>,
    pub preload: bool,
}

#[derive(Debug, Default)]
pub struct CapabilitySet {
    /// Server-advertised caps with their optional values.
    pub available: BTreeMap<String, Option<String>>,
    pub requested: BTreeSet<String>,
    pub enabled: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct CapNegotiator {
    state: CapState,
    caps: CapabilitySet,
    /// Requested caps without an ACK or NAK yet.
    awaiting: BTreeSet<String>,
    want_sasl: bool,
}

impl CapNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all capability sets for a fresh connect attempt.
    pub fn reset(&mut self, want_sasl: bool) {
        *self = Self {
            want_sasl,
            ..Self::default()
        };
    }

    pub fn state(&self) -> CapState {
        self.state
    }

    pub fn caps(&self) -> &CapabilitySet {
        &self.caps
    }

    pub fn is_enabled(&self, cap: &str) -> bool {
        self.caps.enabled.contains(cap)
    }

    pub fn enabled_list(&self) -> Vec<String> {
        self.caps.enabled.iter().cloned().collect()
    }

    pub fn is_done(&self) -> bool {
        self.state == CapState::Done
    }

    /// Returns the line that opens negotiation.
    pub fn start(&mut self) -> &'static str {
        self.state = CapState::LsSent;
        "CAP LS 302"
    }

    /// Feed `CAP <nick> LS [*] :<caps>`; `args` are the params after `LS`.
    pub fn on_ls(&mut self, args: &[String]) -> CapStep {
        let (more, list) = split_continuation(args);
        for token in list.split_whitespace() {
            let (name, value) = match token.split_once('=') {
                Some((n, v)) => (n, Some(v.to_string())),
                None => (token, None),
            };
            self.caps.available.insert(name.to_ascii_lowercase(), value);
        }

        if !matches!(self.state, CapState::LsSent | CapState::Accumulating) {
            return CapStep::Wait;
        }
        if more {
            self.state = CapState::Accumulating;
            return CapStep::Wait;
        }

        let wanted = self.wanted_from(self.caps.available.keys());
        if wanted.is_empty() {
            return CapStep::End;
        }
        self.caps.requested.extend(wanted.iter().cloned());
        self.awaiting.extend(wanted.iter().cloned());
        self.state = CapState::ReqSent;
        CapStep::Request(wanted)
    }

    pub fn on_ack(&mut self, args: &[String]) -> CapStep {
        let (_, list) = split_continuation(args);
        for token in list.split_whitespace() {
            let token = token.to_ascii_lowercase();
            if let Some(name) = token.strip_prefix('-') {
                self.caps.enabled.remove(name);
                self.awaiting.remove(name);
            } else {
                self.awaiting.remove(&token);
                self.caps.enabled.insert(token);
            }
        }
        self.after_reply()
    }

    /// A NAK drops the caps from the requested set but does not abort.
    pub fn on_nak(&mut self, args: &[String]) -> CapStep {
        let (_, list) = split_continuation(args);
        for token in list.split_whitespace() {
            let token = token.to_ascii_lowercase();
            self.caps.requested.remove(&token);
            self.awaiting.remove(&token);
        }
        self.after_reply()
    }

    /// cap-notify `NEW`: request newly offered caps we want.
    pub fn on_new(&mut self, args: &[String]) -> CapStep {
        let (_, list) = split_continuation(args);
        let mut fresh = Vec::new();
        for token in list.split_whitespace() {
            let (name, value) = match token.split_once('=') {
                Some((n, v)) => (n.to_ascii_lowercase(), Some(v.to_string())),
                None => (token.to_ascii_lowercase(), None),
            };
            self.caps.available.insert(name.clone(), value);
            fresh.push(name);
        }
        let wanted: Vec<String> = self
            .wanted_from(fresh.iter())
            .into_iter()
            .filter(|c| c != "sasl" && !self.caps.enabled.contains(c))
            .collect();
        if wanted.is_empty() || !self.is_done() {
            return CapStep::Wait;
        }
        self.caps.requested.extend(wanted.iter().cloned());
        CapStep::Request(wanted)
    }

    /// cap-notify `DEL`.
    pub fn on_del(&mut self, args: &[String]) -> CapStep {
        let (_, list) = split_continuation(args);
        let mut changed = false;
        for token in list.split_whitespace() {
            let token = token.to_ascii_lowercase();
            self.caps.available.remove(&token);
            self.caps.requested.remove(&token);
            changed |= self.caps.enabled.remove(&token);
        }
        if changed { CapStep::Changed } else { CapStep::Wait }
    }

    /// Mark negotiation finished. Returns false if it already was, so
    /// CAP END is written exactly once.
    pub fn finish(&mut self) -> bool {
        if self.state == CapState::Done {
            return false;
        }
        self.state = CapState::Done;
        self.awaiting.clear();
        true
    }

    /// Mechanisms from `sasl=PLAIN,EXTERNAL`; `None` if no list was given.
    pub fn sasl_mechanisms(&self) -> Option<Vec<String>> {
        self.caps
            .available
            .get("sasl")?
            .as_ref()
            .map(|v| v.split(',').map(|m| m.to_ascii_uppercase()).collect())
    }

    /// Parsed `sts` value, if the server advertised one.
    pub fn sts_policy(&self) -> Option<StsPolicy> {
        let value = self.caps.available.get("sts")?.as_deref().unwrap_or("");
        let mut policy = StsPolicy {
            port: None,
            duration: None,
            preload: false,
        };
        for key in value.split(',') {
            match key.split_once('=') {
                Some(("port", v)) => policy.port = v.parse().ok(),
                Some(("duration", v)) => policy.duration = v.parse().ok(),
                None if key == "preload" => policy.preload = true,
                _ => {}
            }
        }
        Some(policy)
    }

    fn wanted_from<'a>(&self, offered: impl Iterator<Item = &'a String>) -> Vec<String> {
        let offered: BTreeSet<&str> = offered.map(String::as_str).collect();
        DESIRED_CAPS
            .iter()
            .filter(|cap| offered.contains(**cap))
            .filter(|cap| **cap != "sasl" || self.want_sasl)
            .map(|cap| cap.to_string())
            .collect()
    }

    fn after_reply(&mut self) -> CapStep {
        match self.state {
            CapState::ReqSent if self.awaiting.is_empty() => {
                if self.want_sasl && self.caps.enabled.contains("sasl") {
                    self.state = CapState::Sasl;
                    CapStep::StartSasl
                } else {
                    CapStep::End
                }
            }
            CapState::Done => CapStep::Changed,
            _ => CapStep::Wait,
        }
    }
}

/// `[*, list]` → (true, list); `[list]` → (false, list).
fn split_continuation(args: &[String]) -> (bool, &str) {
    match args {
        [marker, list, ..] if marker == "*" => (true, list.as_str()),
        [list, ..] => (false, list.as_str()),
        [] => (false, ""),
    }
}
