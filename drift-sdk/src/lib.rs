//! drift: IRC client protocol engine.
//!
//! Opens the transport (optionally through a SOCKS/HTTP proxy and TLS),
//! negotiates IRCv3 capabilities and SASL, registers, and turns the wire
//! protocol into typed [`Event`]s while tracking channel membership.
//!
//! The protocol state lives in a sans-IO [`Session`]; [`client::connect`]
//! drives one per network from a tokio task and hands back a
//! [`ClientHandle`]. [`ConnectionRegistry`] keeps one handle per network.

pub mod cap;
pub mod channel;
pub mod client;
pub mod config;
pub mod ctcp;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod event;
pub mod framer;
pub mod isupport;
pub mod message;
pub mod numeric;
pub mod outbound;
pub mod proxy;
pub mod registration;
pub mod registry;
pub mod sasl;
pub mod session;
pub mod transport;

pub use channel::{ChannelStore, ChannelTopicInfo, ChannelUser};
pub use client::{ClientHandle, DisconnectToken, connect};
pub use config::{ClientCertificate, ConnectionConfig, ProxyConfig, ProxyKind, SaslCredentials};
pub use envelope::EncryptionService;
pub use error::{Error, ErrorKind, Result};
pub use event::{ChatMessage, DeliveryStatus, Event, MessageKind};
pub use message::Message;
pub use registry::ConnectionRegistry;
pub use session::{Phase, Session};
