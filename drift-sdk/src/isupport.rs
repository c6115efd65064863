//! RPL_ISUPPORT (005) state and MODE string parsing.

use std::collections::BTreeMap;

/// `CHANMODES=A,B,C,D`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChanModes {
    /// Type A: list modes, always take an argument.
    pub list: String,
    /// Type B: always take an argument.
    pub always: String,
    /// Type C: take an argument only when set.
    pub on_set: String,
    /// Type D: never take an argument.
    pub flags: String,
}

impl Default for ChanModes {
    fn default() -> Self {
        Self::from_isupport("beI,k,l,imnpst")
    }
}

impl ChanModes {
    pub fn from_isupport(value: &str) -> Self {
        let mut groups = value.split(',').map(str::to_string);
        Self {
            list: groups.next().unwrap_or_default(),
            always: groups.next().unwrap_or_default(),
            on_set: groups.next().unwrap_or_default(),
            flags: groups.next().unwrap_or_default(),
        }
    }

    /// Whether `mode` consumes an argument. Unknown modes are assumed not to.
    pub fn takes_arg(&self, mode: char, adding: bool) -> bool {
        self.list.contains(mode) || self.always.contains(mode) || (adding && self.on_set.contains(mode))
    }
}

/// What the server told us about itself.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub network: Option<String>,
    pub chanmodes: ChanModes,
    /// Every token seen, for collaborators that need more.
    pub tokens: BTreeMap<String, Option<String>>,
}

impl ServerInfo {
    /// Record one `KEY[=VALUE]` or `-KEY` token. Returns the key and the
    /// current value so the caller can react to keys it cares about.
    pub fn apply(&mut self, token: &str) -> Option<(String, Option<String>)> {
        if let Some(key) = token.strip_prefix('-') {
            self.tokens.remove(key);
            return None;
        }
        let (key, value) = match token.split_once('=') {
            Some((k, v)) => (k.to_ascii_uppercase(), Some(v.to_string())),
            None => (token.to_ascii_uppercase(), None),
        };
        if key.is_empty() {
            return None;
        }
        match (key.as_str(), value.as_deref()) {
            ("NETWORK", Some(v)) => self.network = Some(v.to_string()),
            ("CHANMODES", Some(v)) => self.chanmodes = ChanModes::from_isupport(v),
            _ => {}
        }
        self.tokens.insert(key.clone(), value.clone());
        Some((key, value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeChange {
    pub adding: bool,
    pub mode: char,
    pub arg: Option<String>,
}

/// Expand `+ov-k alice bob key` into single changes. `is_member_mode` marks
/// PREFIX modes, which always take a nick argument.
pub fn parse_mode_changes(
    modes: &str,
    args: &[String],
    chanmodes: &ChanModes,
    is_member_mode: impl Fn(char) -> bool,
) -> Vec<ModeChange> {
    let mut changes = Vec::new();
    let mut args = args.iter();
    let mut adding = true;
    for c in modes.chars() {
        match c {
            '+' => adding = true,
            '-' => adding = false,
            mode => {
                let arg = if is_member_mode(mode) || chanmodes.takes_arg(mode, adding) {
                    args.next().cloned()
                } else {
                    None
                };
                changes.push(ModeChange { adding, mode, arg });
            }
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn mixed_mode_string() {
        let cm = ChanModes::default();
        let changes = parse_mode_changes(
            "+ol-k+b",
            &strings(&["alice", "50", "key", "*!*@spam"]),
            &cm,
            |m| "qaohv".contains(m),
        );
        assert_eq!(changes.len(), 4);
        assert_eq!(changes[0], ModeChange { adding: true, mode: 'o', arg: Some("alice".into()) });
        assert_eq!(changes[1].arg.as_deref(), Some("50"));
        assert_eq!(changes[2], ModeChange { adding: false, mode: 'k', arg: Some("key".into()) });
        assert_eq!(changes[3].arg.as_deref(), Some("*!*@spam"));
    }

    #[test]
    fn limit_removal_takes_no_argument() {
        let cm = ChanModes::default();
        let changes = parse_mode_changes("-lv", &strings(&["bob"]), &cm, |m| m == 'v');
        assert_eq!(changes[0].arg, None);
        assert_eq!(changes[1].arg.as_deref(), Some("bob"));
    }

    #[test]
    fn isupport_tokens() {
        let mut info = ServerInfo::default();
        info.apply("NETWORK=Libera.Chat");
        info.apply("CHANMODES=eIbq,k,flj,CFLMPQScgimnprstuz");
        info.apply("WHOX");
        assert_eq!(info.network.as_deref(), Some("Libera.Chat"));
        assert!(info.chanmodes.takes_arg('q', false));
        assert!(info.tokens.contains_key("WHOX"));
        info.apply("-WHOX");
        assert!(!info.tokens.contains_key("WHOX"));
    }
}
