//! Per-channel membership, user modes and topic metadata.
//!
//! Channel names and nicks are keyed case-insensitively using the server's
//! casemapping (RFC 1459 until ISUPPORT says otherwise). A user's mode list
//! is always sorted owner > admin > op > halfop > voice.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::message::split_source;

/// Canonical rank order for member modes.
pub const MODE_PRIORITY: [char; 5] = ['q', 'a', 'o', 'h', 'v'];

/// Default `PREFIX` mapping, `(mode, symbol)`.
const DEFAULT_PREFIXES: [(char, char); 5] = [('q', '~'), ('a', '&'), ('o', '@'), ('h', '%'), ('v', '+')];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Casemapping {
    Ascii,
    #[default]
    Rfc1459,
}

impl Casemapping {
    pub fn from_isupport(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "ascii" => Casemapping::Ascii,
            _ => Casemapping::Rfc1459,
        }
    }

    pub fn fold(self, s: &str) -> String {
        s.chars()
            .map(|c| match (self, c) {
                (Casemapping::Rfc1459, '[') => '{',
                (Casemapping::Rfc1459, ']') => '}',
                (Casemapping::Rfc1459, '\\') => '|',
                (Casemapping::Rfc1459, '~') => '^',
                _ => c.to_ascii_lowercase(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelUser {
    /// Display-case nick.
    pub nick: String,
    /// Member modes, sorted by [`MODE_PRIORITY`].
    pub modes: Vec<char>,
    pub account: Option<String>,
    pub username: Option<String>,
    pub host: Option<String>,
    pub away: bool,
}

impl ChannelUser {
    pub fn new(nick: impl Into<String>) -> Self {
        Self {
            nick: nick.into(),
            modes: Vec::new(),
            account: None,
            username: None,
            host: None,
            away: false,
        }
    }

    pub fn add_mode(&mut self, mode: char) {
        if !self.modes.contains(&mode) {
            self.modes.push(mode);
            sort_modes(&mut self.modes);
        }
    }

    pub fn remove_mode(&mut self, mode: char) {
        self.modes.retain(|&m| m != mode);
    }

    pub fn has_mode(&self, mode: char) -> bool {
        self.modes.contains(&mode)
    }

    fn rank(&self) -> usize {
        self.modes.first().map(|&m| mode_rank(m)).unwrap_or(usize::MAX)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelTopicInfo {
    pub topic: Option<String>,
    pub set_by: Option<String>,
    pub set_at: Option<DateTime<Utc>>,
    /// Channel mode string from RPL_CHANNELMODEIS, e.g. `+nt`.
    pub modes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Channel {
    /// Display-case channel name.
    pub name: String,
    users: HashMap<String, ChannelUser>,
    pub topic: ChannelTopicInfo,
    /// Raw NAMES tokens collected until RPL_ENDOFNAMES.
    pending_names: Vec<String>,
}

impl Channel {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            users: HashMap::new(),
            topic: ChannelTopicInfo::default(),
            pending_names: Vec::new(),
        }
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

fn mode_rank(mode: char) -> usize {
    MODE_PRIORITY
        .iter()
        .position(|&m| m == mode)
        .unwrap_or(MODE_PRIORITY.len())
}

fn sort_modes(modes: &mut [char]) {
    modes.sort_by_key(|&m| mode_rank(m));
}

#[derive(Debug)]
pub struct ChannelStore {
    channels: HashMap<String, Channel>,
    casemapping: Casemapping,
    prefixes: Vec<(char, char)>,
}

impl Default for ChannelStore {
    fn default() -> Self {
        Self {
            channels: HashMap::new(),
            casemapping: Casemapping::default(),
            prefixes: DEFAULT_PREFIXES.to_vec(),
        }
    }
}

impl ChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn casemapping(&self) -> Casemapping {
        self.casemapping
    }

    pub fn set_casemapping(&mut self, casemapping: Casemapping) {
        self.casemapping = casemapping;
    }

    pub fn fold(&self, s: &str) -> String {
        self.casemapping.fold(s)
    }

    /// Apply an ISUPPORT `PREFIX=(qaohv)~&@%+` value.
    pub fn set_prefixes(&mut self, value: &str) {
        let Some(rest) = value.strip_prefix('(') else { return };
        let Some((modes, symbols)) = rest.split_once(')') else { return };
        let pairs: Vec<(char, char)> = modes.chars().zip(symbols.chars()).collect();
        if !pairs.is_empty() {
            self.prefixes = pairs;
        }
    }

    pub fn is_prefix_mode(&self, mode: char) -> bool {
        self.prefixes.iter().any(|&(m, _)| m == mode)
    }

    pub fn symbol_for(&self, mode: char) -> Option<char> {
        self.prefixes.iter().find(|&&(m, _)| m == mode).map(|&(_, s)| s)
    }

    /// Parse one NAMES token: strip mode symbols (several with multi-prefix),
    /// then split off `!user@host` when `userhost` is set.
    pub fn parse_names_token(&self, token: &str, userhost: bool) -> ChannelUser {
        let mut modes = Vec::new();
        let mut rest = token;
        while let Some(c) = rest.chars().next() {
            match self.prefixes.iter().find(|&&(_, s)| s == c) {
                Some(&(mode, _)) => {
                    if !modes.contains(&mode) {
                        modes.push(mode);
                    }
                    rest = &rest[c.len_utf8()..];
                }
                None => break,
            }
        }
        sort_modes(&mut modes);

        let mut user = if userhost && rest.contains('!') {
            let src = split_source(rest);
            let mut u = ChannelUser::new(src.nick);
            u.username = src.user.map(str::to_string);
            u.host = src.host.map(str::to_string);
            u
        } else {
            ChannelUser::new(rest)
        };
        user.modes = modes;
        user
    }

    pub fn get(&self, channel: &str) -> Option<&Channel> {
        self.channels.get(&self.fold(channel))
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.channels.contains_key(&self.fold(channel))
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.values().map(|c| c.name.clone()).collect();
        names.sort();
        names
    }

    pub fn user(&self, channel: &str, nick: &str) -> Option<&ChannelUser> {
        self.get(channel)?.users.get(&self.fold(nick))
    }

    /// Members sorted by rank, then nick.
    pub fn users(&self, channel: &str) -> Vec<ChannelUser> {
        let Some(ch) = self.get(channel) else { return Vec::new() };
        let mut users: Vec<ChannelUser> = ch.users.values().cloned().collect();
        users.sort_by(|a, b| {
            a.rank()
                .cmp(&b.rank())
                .then_with(|| self.fold(&a.nick).cmp(&self.fold(&b.nick)))
        });
        users
    }

    /// Channels (display names) where `nick` is present.
    pub fn channels_of(&self, nick: &str) -> Vec<String> {
        let key = self.fold(nick);
        let mut names: Vec<String> = self
            .channels
            .values()
            .filter(|c| c.users.contains_key(&key))
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Start tracking a channel we joined. Resets any stale state.
    pub fn open(&mut self, channel: &str) {
        self.channels.insert(self.fold(channel), Channel::new(channel));
    }

    /// Stop tracking a channel (we left it). Returns the display name.
    pub fn close(&mut self, channel: &str) -> Option<String> {
        self.channels.remove(&self.fold(channel)).map(|c| c.name)
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }

    /// Insert or refresh a member. Returns false for untracked channels.
    pub fn add_user(&mut self, channel: &str, user: ChannelUser) -> bool {
        let key = self.fold(&user.nick);
        let Some(ch) = self.channels.get_mut(&self.casemapping.fold(channel)) else {
            return false;
        };
        match ch.users.get_mut(&key) {
            Some(existing) => {
                existing.nick = user.nick;
                if user.account.is_some() {
                    existing.account = user.account;
                }
                if user.username.is_some() {
                    existing.username = user.username;
                }
                if user.host.is_some() {
                    existing.host = user.host;
                }
            }
            None => {
                ch.users.insert(key, user);
            }
        }
        true
    }

    /// Remove a member from one channel.
    pub fn remove_user(&mut self, channel: &str, nick: &str) -> bool {
        let key = self.fold(nick);
        match self.channels.get_mut(&self.casemapping.fold(channel)) {
            Some(ch) => ch.users.remove(&key).is_some(),
            None => false,
        }
    }

    /// Remove a member from every channel. Returns the channels touched.
    pub fn remove_everywhere(&mut self, nick: &str) -> Vec<String> {
        let key = self.fold(nick);
        let mut touched: Vec<String> = self
            .channels
            .values_mut()
            .filter_map(|ch| ch.users.remove(&key).map(|_| ch.name.clone()))
            .collect();
        touched.sort();
        touched
    }

    /// Re-key a member in every channel. Returns the channels touched.
    pub fn rename(&mut self, old: &str, new: &str) -> Vec<String> {
        let old_key = self.fold(old);
        let new_key = self.fold(new);
        let mut touched = Vec::new();
        for ch in self.channels.values_mut() {
            if let Some(mut user) = ch.users.remove(&old_key) {
                user.nick = new.to_string();
                ch.users.insert(new_key.clone(), user);
                touched.push(ch.name.clone());
            }
        }
        touched.sort();
        touched
    }

    /// Apply `update` to the member in every channel it appears in.
    pub fn update_user(&mut self, nick: &str, mut update: impl FnMut(&mut ChannelUser)) -> Vec<String> {
        let key = self.fold(nick);
        let mut touched = Vec::new();
        for ch in self.channels.values_mut() {
            if let Some(user) = ch.users.get_mut(&key) {
                update(user);
                touched.push(ch.name.clone());
            }
        }
        touched.sort();
        touched
    }

    /// Grant or revoke a member mode. Returns true if the list changed.
    pub fn apply_member_mode(&mut self, channel: &str, nick: &str, mode: char, adding: bool) -> bool {
        let key = self.fold(nick);
        let Some(user) = self
            .channels
            .get_mut(&self.casemapping.fold(channel))
            .and_then(|ch| ch.users.get_mut(&key))
        else {
            return false;
        };
        let had = user.has_mode(mode);
        if adding {
            user.add_mode(mode);
        } else {
            user.remove_mode(mode);
        }
        had != adding
    }

    /// Accumulate one RPL_NAMREPLY line.
    pub fn names_chunk(&mut self, channel: &str, names: &str) {
        if let Some(ch) = self.channels.get_mut(&self.casemapping.fold(channel)) {
            ch.pending_names
                .extend(names.split_whitespace().map(str::to_string));
        }
    }

    /// RPL_ENDOFNAMES: replace the member map with the accumulated set.
    /// Returns false when the channel is not tracked.
    pub fn names_end(&mut self, channel: &str, userhost: bool) -> bool {
        let key = self.fold(channel);
        let Some(tokens) = self
            .channels
            .get_mut(&key)
            .map(|ch| std::mem::take(&mut ch.pending_names))
        else {
            return false;
        };
        let mut users = HashMap::with_capacity(tokens.len());
        for token in &tokens {
            let mut user = self.parse_names_token(token, userhost);
            if user.nick.is_empty() {
                continue;
            }
            let user_key = self.fold(&user.nick);
            let previous = self.channels.get(&key).and_then(|ch| ch.users.get(&user_key));
            if let Some(prev) = previous {
                user.account = prev.account.clone();
                user.away = prev.away;
                if user.host.is_none() {
                    user.username = prev.username.clone();
                    user.host = prev.host.clone();
                }
            }
            users.insert(user_key, user);
        }
        if let Some(ch) = self.channels.get_mut(&key) {
            ch.users = users;
        }
        true
    }

    pub fn topic_mut(&mut self, channel: &str) -> Option<&mut ChannelTopicInfo> {
        self.channels
            .get_mut(&self.casemapping.fold(channel))
            .map(|ch| &mut ch.topic)
    }
}
