//! Registration: PASS/NICK/USER and nick-collision retry.

use rand::Rng;

use crate::config::ConnectionConfig;

/// Collisions tolerated before falling back to a randomized nick.
pub const MAX_NICK_ATTEMPTS: u8 = 3;

/// Lines that identify us to the server, in order.
pub fn registration_lines(config: &ConnectionConfig) -> Vec<String> {
    let mut lines = Vec::with_capacity(3);
    if let Some(pass) = config.password.as_deref().filter(|p| !p.is_empty()) {
        lines.push(format!("PASS {pass}"));
    }
    lines.push(format!("NICK {}", config.nick));
    lines.push(format!("USER {} 0 * :{}", config.username, config.realname));
    lines
}

/// Tracks the nick we are asking for while unregistered.
#[derive(Debug, Clone)]
pub struct NickNegotiator {
    original: String,
    alt: String,
    current: String,
    attempts: u8,
}

impl NickNegotiator {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            original: config.nick.clone(),
            alt: config.alt_nick(),
            current: config.nick.clone(),
            attempts: 0,
        }
    }

    pub fn current(&self) -> &str {
        &self.current
    }

    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    /// ERR_NICKNAMEINUSE before registration. Returns the nick to try next,
    /// which also becomes the current nick.
    pub fn on_collision(&mut self) -> String {
        self.attempts = (self.attempts + 1).min(MAX_NICK_ATTEMPTS);
        let next = if self.attempts < MAX_NICK_ATTEMPTS {
            self.alt.clone()
        } else {
            let suffix: u16 = rand::thread_rng().gen_range(100..10_000);
            format!("{}{suffix}", self.original)
        };
        tracing::debug!(attempt = self.attempts, nick = %next, "Nick in use, retrying");
        self.current = next.clone();
        next
    }

    /// RPL_WELCOME: the server's first param is the nick it registered.
    pub fn welcome(&mut self, nick: &str) {
        if !nick.is_empty() && nick != "*" {
            self.current = nick.to_string();
        }
        self.attempts = 0;
    }

    /// Our own NICK change was confirmed.
    pub fn renamed(&mut self, nick: &str) {
        self.current = nick.to_string();
    }
}
