//! Error taxonomy for the protocol engine.
//!
//! Every variant renders a human-readable message so the presentation layer
//! can show it without knowing the taxonomy. [`ErrorKind`] is the fieldless
//! mirror carried inside [`crate::event::Event::Error`].

use serde::Serialize;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket-level failure (connect refused, reset, write on a dead socket).
    #[error("Connection to {addr} failed: {source}")]
    Transport {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to {addr} timed out after {secs}s")]
    ConnectTimeout { addr: String, secs: u64 },

    #[error("TLS handshake with {host} failed: {reason}")]
    Tls { host: String, reason: String },

    /// SOCKS or HTTP CONNECT tunnel refused. `code` is what the proxy reported.
    #[error("Proxy {proxy} refused the tunnel (status {code}): {message}")]
    ProxyHandshake {
        proxy: String,
        code: u16,
        message: String,
    },

    /// Malformed line. Tolerated by the dispatcher, never fatal.
    #[error("Malformed line: {0}")]
    Protocol(String),

    /// Nick-collision retries ran out. Registration continues with the
    /// randomized fallback.
    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("SASL authentication failed ({code}): {message}")]
    Sasl { code: u16, message: String },

    /// `ERROR` from the server, or a connection-blocking numeric.
    #[error("Server closed the session: {0}")]
    Server(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Connection is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    ProxyHandshake,
    Protocol,
    Registration,
    Sasl,
    Server,
    Config,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport { .. } | Error::ConnectTimeout { .. } | Error::Tls { .. } | Error::Closed => {
                ErrorKind::Transport
            }
            Error::ProxyHandshake { .. } => ErrorKind::ProxyHandshake,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Registration(_) => ErrorKind::Registration,
            Error::Sasl { .. } => ErrorKind::Sasl,
            Error::Server(_) => ErrorKind::Server,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    pub(crate) fn transport(addr: impl Into<String>, source: std::io::Error) -> Self {
        Error::Transport {
            addr: addr.into(),
            source,
        }
    }

    pub(crate) fn proxy(proxy: impl Into<String>, code: u16, message: impl Into<String>) -> Self {
        Error::ProxyHandshake {
            proxy: proxy.into(),
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_human_readable() {
        let e = Error::proxy("127.0.0.1:1080", 5, "connection refused");
        assert_eq!(
            e.to_string(),
            "Proxy 127.0.0.1:1080 refused the tunnel (status 5): connection refused"
        );
        assert_eq!(e.kind(), ErrorKind::ProxyHandshake);
    }

    #[test]
    fn timeout_is_a_transport_error() {
        let e = Error::ConnectTimeout {
            addr: "irc.example.net:6697".into(),
            secs: 10,
        };
        assert_eq!(e.kind(), ErrorKind::Transport);
        assert!(e.to_string().contains("timed out after 10s"));
    }

    #[test]
    fn protocol_and_registration_kinds() {
        let e = Error::Protocol(":prefix-only".into());
        assert_eq!(e.kind(), ErrorKind::Protocol);
        assert_eq!(e.to_string(), "Malformed line: :prefix-only");
        let e = Error::Registration("nick retries exhausted, falling back to me123".into());
        assert_eq!(e.kind(), ErrorKind::Registration);
        assert!(e.to_string().starts_with("Registration failed: "));
    }
}
