//! Encrypted-envelope routing.
//!
//! Certain PRIVMSG bodies carry key-exchange or ciphertext payloads for an
//! external [`EncryptionService`]. This module recognizes and re-wraps the
//! envelopes; it never looks inside a payload.

pub const KEX_OFFER: &str = "+KEX-OFFER ";
pub const KEX_ACCEPT: &str = "+KEX-ACCEPT ";
pub const KEX_REJECT: &str = "+KEX-REJECT";
pub const KEX_REQUEST: &str = "+KEX-REQUEST";
pub const DM_ENC: &str = "+DM-ENC ";
pub const CHAN_KEY: &str = "+CHAN-KEY ";
pub const CHAN_ENC: &str = "+CHAN-ENC ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    KeyOffer(String),
    KeyAccept(String),
    KeyReject,
    KeyRequest,
    DmEncrypted(String),
    ChannelKey(String),
    ChannelEncrypted(String),
}

impl Envelope {
    /// Recognize an envelope in a PRIVMSG body.
    pub fn parse(text: &str) -> Option<Self> {
        let payload = |prefix: &str| {
            text.strip_prefix(prefix)
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
        };
        if let Some(p) = payload(KEX_OFFER) {
            Some(Envelope::KeyOffer(p))
        } else if let Some(p) = payload(KEX_ACCEPT) {
            Some(Envelope::KeyAccept(p))
        } else if let Some(p) = payload(DM_ENC) {
            Some(Envelope::DmEncrypted(p))
        } else if let Some(p) = payload(CHAN_KEY) {
            Some(Envelope::ChannelKey(p))
        } else if let Some(p) = payload(CHAN_ENC) {
            Some(Envelope::ChannelEncrypted(p))
        } else if text.trim_end() == KEX_REJECT {
            Some(Envelope::KeyReject)
        } else if text.trim_end() == KEX_REQUEST {
            Some(Envelope::KeyRequest)
        } else {
            None
        }
    }

    /// The PRIVMSG body carrying this envelope.
    pub fn to_wire(&self) -> String {
        match self {
            Envelope::KeyOffer(p) => format!("{KEX_OFFER}{p}"),
            Envelope::KeyAccept(p) => format!("{KEX_ACCEPT}{p}"),
            Envelope::KeyReject => KEX_REJECT.to_string(),
            Envelope::KeyRequest => KEX_REQUEST.to_string(),
            Envelope::DmEncrypted(p) => format!("{DM_ENC}{p}"),
            Envelope::ChannelKey(p) => format!("{CHAN_KEY}{p}"),
            Envelope::ChannelEncrypted(p) => format!("{CHAN_ENC}{p}"),
        }
    }
}

/// The cryptographic collaborator. Payloads are opaque text. Every method
/// defaults to "not available", so a client without encryption can use
/// [`NoEncryption`].
pub trait EncryptionService: Send + 'static {
    /// Payload for a `+KEX-OFFER` to `peer`.
    fn create_offer(&mut self, _peer: &str) -> Option<String> {
        None
    }

    /// Remember an offer from `peer` until the user accepts or rejects it.
    /// Returns false if the offer is unusable.
    fn receive_offer(&mut self, _peer: &str, _payload: &str) -> bool {
        false
    }

    /// Accept a pending offer; returns the `+KEX-ACCEPT` payload.
    fn accept_offer(&mut self, _peer: &str) -> Option<String> {
        None
    }

    fn reject_offer(&mut self, _peer: &str) {}

    /// `peer` accepted our offer. Returns true once a session exists.
    fn complete_exchange(&mut self, _peer: &str, _payload: &str) -> bool {
        false
    }

    fn peer_rejected(&mut self, _peer: &str) {}

    fn encrypt_dm(&mut self, _peer: &str, _plaintext: &str) -> Option<String> {
        None
    }

    fn decrypt_dm(&mut self, _peer: &str, _payload: &str) -> Option<String> {
        None
    }

    /// Wrap the key of `channel` for `peer` (a `+CHAN-KEY` payload).
    fn export_channel_key(&mut self, _channel: &str, _peer: &str) -> Option<String> {
        None
    }

    /// Store a channel key sent by `from`; returns the channel it unlocks.
    fn import_channel_key(&mut self, _from: &str, _payload: &str) -> Option<String> {
        None
    }

    fn encrypt_channel(&mut self, _channel: &str, _plaintext: &str) -> Option<String> {
        None
    }

    fn decrypt_channel(&mut self, _channel: &str, _from: &str, _payload: &str) -> Option<String> {
        None
    }

    /// Drop per-channel keys after our membership ends.
    fn forget_channel(&mut self, _channel: &str) {}
}

/// Service used when no encryption collaborator is attached.
#[derive(Debug, Default)]
pub struct NoEncryption;

impl EncryptionService for NoEncryption {}
