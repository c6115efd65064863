//! SASL over `AUTHENTICATE`: PLAIN and EXTERNAL.

use base64::Engine;

use crate::config::ConnectionConfig;

/// Maximum payload characters per `AUTHENTICATE` line.
pub const CHUNK_LEN: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    /// Relies on the TLS client certificate already presented.
    External,
}

impl SaslMechanism {
    pub fn name(self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::External => "EXTERNAL",
        }
    }

    /// Pick a mechanism for `config`. A client certificate selects EXTERNAL,
    /// credentials select PLAIN. `offered` is the server's `sasl=` list when
    /// it sent one; a mechanism it does not list is not attempted.
    pub fn choose(config: &ConnectionConfig, offered: Option<&[String]>) -> Option<Self> {
        let supported = |m: SaslMechanism| {
            offered.is_none_or(|list| list.iter().any(|o| o.eq_ignore_ascii_case(m.name())))
        };
        if config.client_cert.is_some() && supported(SaslMechanism::External) {
            return Some(SaslMechanism::External);
        }
        if config.sasl.as_ref().is_some_and(|s| !s.account.is_empty())
            && supported(SaslMechanism::Plain)
        {
            return Some(SaslMechanism::Plain);
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    MechanismSent,
    ResponseSent,
}

/// One SASL exchange. Created when `sasl` is acknowledged.
#[derive(Debug)]
pub struct SaslAuthenticator {
    mechanism: SaslMechanism,
    account: String,
    password: String,
    stage: Stage,
}

impl SaslAuthenticator {
    pub fn new(mechanism: SaslMechanism, account: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            mechanism,
            account: account.into(),
            password: password.into(),
            stage: Stage::MechanismSent,
        }
    }

    pub fn mechanism(&self) -> SaslMechanism {
        self.mechanism
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// The opening `AUTHENTICATE <mechanism>` line.
    pub fn start(&self) -> String {
        format!("AUTHENTICATE {}", self.mechanism.name())
    }

    /// React to a server `AUTHENTICATE <param>`. Only the `+` continuation
    /// after the mechanism line produces output; anything else is ignored.
    pub fn on_challenge(&mut self, param: &str) -> Vec<String> {
        if param != "+" || self.stage != Stage::MechanismSent {
            return Vec::new();
        }
        self.stage = Stage::ResponseSent;
        match self.mechanism {
            SaslMechanism::Plain => chunk_payload(&encode_plain(&self.account, &self.password)),
            SaslMechanism::External => vec!["AUTHENTICATE +".to_string()],
        }
    }
}

/// base64(`authzid \0 authcid \0 password`) with authzid = authcid = account.
pub fn encode_plain(account: &str, password: &str) -> String {
    let raw = format!("{account}\0{account}\0{password}");
    base64::engine::general_purpose::STANDARD.encode(raw.as_bytes())
}

/// Split an encoded payload into `AUTHENTICATE` lines of at most
/// [`CHUNK_LEN`] characters. A payload whose length is a multiple of
/// [`CHUNK_LEN`] (including zero) is terminated by `AUTHENTICATE +`.
pub fn chunk_payload(encoded: &str) -> Vec<String> {
    let mut lines: Vec<String> = encoded
        .as_bytes()
        .chunks(CHUNK_LEN)
        .map(|c| format!("AUTHENTICATE {}", String::from_utf8_lossy(c)))
        .collect();
    if encoded.len() % CHUNK_LEN == 0 {
        lines.push("AUTHENTICATE +".to_string());
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientCertificate, SaslCredentials};

    #[test]
    fn plain_payload_encoding() {
        assert_eq!(encode_plain("jilles", "sesame"), "amlsbGVzAGppbGxlcwBzZXNhbWU=");
    }

    #[test]
    fn plain_flow_waits_for_continuation() {
        let mut auth = SaslAuthenticator::new(SaslMechanism::Plain, "alice", "pw");
        assert_eq!(auth.start(), "AUTHENTICATE PLAIN");
        let lines = auth.on_challenge("+");
        assert_eq!(lines, vec![format!("AUTHENTICATE {}", encode_plain("alice", "pw"))]);
        assert!(auth.on_challenge("+").is_empty());
    }

    #[test]
    fn external_answers_with_plus() {
        let mut auth = SaslAuthenticator::new(SaslMechanism::External, "", "");
        assert_eq!(auth.start(), "AUTHENTICATE EXTERNAL");
        assert_eq!(auth.on_challenge("+"), vec!["AUTHENTICATE +"]);
    }

    #[test]
    fn chunking_at_boundaries() {
        assert_eq!(chunk_payload(""), vec!["AUTHENTICATE +"]);

        let exact = "A".repeat(CHUNK_LEN);
        let lines = chunk_payload(&exact);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "AUTHENTICATE +");

        let long = "B".repeat(CHUNK_LEN + 10);
        let lines = chunk_payload(&long);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), "AUTHENTICATE ".len() + CHUNK_LEN);
        assert_eq!(lines[1], format!("AUTHENTICATE {}", "B".repeat(10)));
    }

    #[test]
    fn mechanism_choice() {
        let mut cfg = ConnectionConfig::new("h", 6697, "alice");
        assert_eq!(SaslMechanism::choose(&cfg, None), None);

        cfg.sasl = Some(SaslCredentials {
            account: "alice".into(),
            password: "pw".into(),
        });
        assert_eq!(SaslMechanism::choose(&cfg, None), Some(SaslMechanism::Plain));

        cfg.client_cert = Some(ClientCertificate::default());
        assert_eq!(SaslMechanism::choose(&cfg, None), Some(SaslMechanism::External));

        let offered = vec!["PLAIN".to_string()];
        assert_eq!(
            SaslMechanism::choose(&cfg, Some(&offered)),
            Some(SaslMechanism::Plain)
        );
        let offered = vec!["SCRAM-SHA-256".to_string()];
        assert_eq!(SaslMechanism::choose(&cfg, Some(&offered)), None);
    }
}
