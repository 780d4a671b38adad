//! KVS key namespace.
//!
//! Every value the circle publishes lives under a deterministic key built
//! from the circle name and peer ids, joined with [`DELIMITER`]:
//!
//! | Type | Key |
//! |---|---|
//! | Circle | `circle-<circle>` |
//! | Message | `message-<circle>-<from>-<to>` |
//! | Parameters | `parameters-<circle>` |
//! | InitialSync | `initialsync-<circle>-<peer>` |
//! | Retirement | `retirement-<circle>-<peer>` |
//! | AccountChanged | `account-changed` |
//!
//! Fields are never escaped. [`KeyField`] rejects the delimiter up front, so
//! [`parse_key`] always recovers exactly what [`KvsKey::to_key`] was given.

use std::fmt;

use serde::{Deserialize, Serialize};

use sos_core::PeerId;

use crate::error::{EngineError, Result};

/// Separator between key fields.
pub const DELIMITER: char = '-';

/// The literal account-changed key.
pub const ACCOUNT_CHANGED_KEY: &str = "account-changed";

/// A validated key component: non-empty and free of [`DELIMITER`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyField(String);

impl KeyField {
    /// Validate a field.
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if s.is_empty() || s.contains(DELIMITER) {
            return Err(EngineError::InvalidKeyField(s));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&PeerId> for KeyField {
    /// Peer ids are lowercase hex and never contain the delimiter.
    fn from(peer: &PeerId) -> Self {
        Self(peer.as_str().to_string())
    }
}

impl TryFrom<String> for KeyField {
    type Error = EngineError;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<KeyField> for String {
    fn from(field: KeyField) -> String {
        field.0
    }
}

/// Key classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KvsKeyType {
    Circle,
    Message,
    Parameters,
    InitialSync,
    Retirement,
    AccountChanged,
    Unknown,
}

/// A parsed KVS key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KvsKey {
    Circle { circle: KeyField },
    Message { circle: KeyField, from: KeyField, to: KeyField },
    Parameters { circle: KeyField },
    InitialSync { circle: KeyField, peer: KeyField },
    Retirement { circle: KeyField, peer: KeyField },
    AccountChanged,
    /// Anything this namespace does not recognise, kept verbatim.
    Unknown(String),
}

impl KvsKey {
    /// The circle key for `circle`.
    pub fn circle(circle: &KeyField) -> Self {
        KvsKey::Circle { circle: circle.clone() }
    }

    /// The message key carrying traffic from `from` to `to`.
    pub fn message(circle: &KeyField, from: &PeerId, to: &PeerId) -> Self {
        KvsKey::Message {
            circle: circle.clone(),
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn parameters(circle: &KeyField) -> Self {
        KvsKey::Parameters { circle: circle.clone() }
    }

    pub fn initial_sync(circle: &KeyField, peer: &PeerId) -> Self {
        KvsKey::InitialSync {
            circle: circle.clone(),
            peer: peer.into(),
        }
    }

    pub fn retirement(circle: &KeyField, peer: &PeerId) -> Self {
        KvsKey::Retirement {
            circle: circle.clone(),
            peer: peer.into(),
        }
    }

    pub fn key_type(&self) -> KvsKeyType {
        match self {
            KvsKey::Circle { .. } => KvsKeyType::Circle,
            KvsKey::Message { .. } => KvsKeyType::Message,
            KvsKey::Parameters { .. } => KvsKeyType::Parameters,
            KvsKey::InitialSync { .. } => KvsKeyType::InitialSync,
            KvsKey::Retirement { .. } => KvsKeyType::Retirement,
            KvsKey::AccountChanged => KvsKeyType::AccountChanged,
            KvsKey::Unknown(_) => KvsKeyType::Unknown,
        }
    }

    /// The circle this key belongs to, if it names one.
    pub fn circle_name(&self) -> Option<&KeyField> {
        match self {
            KvsKey::Circle { circle }
            | KvsKey::Message { circle, .. }
            | KvsKey::Parameters { circle }
            | KvsKey::InitialSync { circle, .. }
            | KvsKey::Retirement { circle, .. } => Some(circle),
            KvsKey::AccountChanged | KvsKey::Unknown(_) => None,
        }
    }

    /// Render the key string.
    pub fn to_key(&self) -> String {
        let d = DELIMITER;
        match self {
            KvsKey::Circle { circle } => format!("circle{d}{circle}"),
            KvsKey::Message { circle, from, to } => format!("message{d}{circle}{d}{from}{d}{to}"),
            KvsKey::Parameters { circle } => format!("parameters{d}{circle}"),
            KvsKey::InitialSync { circle, peer } => format!("initialsync{d}{circle}{d}{peer}"),
            KvsKey::Retirement { circle, peer } => format!("retirement{d}{circle}{d}{peer}"),
            KvsKey::AccountChanged => ACCOUNT_CHANGED_KEY.to_string(),
            KvsKey::Unknown(raw) => raw.clone(),
        }
    }
}

impl fmt::Display for KvsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_key())
    }
}

/// Parse a key string. Never fails; unrecognised keys are [`KvsKey::Unknown`].
pub fn parse_key(key: &str) -> KvsKey {
    if key == ACCOUNT_CHANGED_KEY {
        return KvsKey::AccountChanged;
    }

    let parts: Vec<&str> = key.split(DELIMITER).collect();
    if parts.iter().any(|p| p.is_empty()) {
        return KvsKey::Unknown(key.to_string());
    }
    let field = |s: &str| KeyField(s.to_string());

    match parts.as_slice() {
        ["circle", circle] => KvsKey::Circle { circle: field(circle) },
        ["message", circle, from, to] => KvsKey::Message {
            circle: field(circle),
            from: field(from),
            to: field(to),
        },
        ["parameters", circle] => KvsKey::Parameters { circle: field(circle) },
        ["initialsync", circle, peer] => KvsKey::InitialSync {
            circle: field(circle),
            peer: field(peer),
        },
        ["retirement", circle, peer] => KvsKey::Retirement {
            circle: field(circle),
            peer: field(peer),
        },
        _ => KvsKey::Unknown(key.to_string()),
    }
}

/// Classify a key string.
pub fn key_type(key: &str) -> KvsKeyType {
    parse_key(key).key_type()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn f(s: &str) -> KeyField {
        KeyField::new(s).unwrap()
    }

    #[test]
    fn test_key_formats() {
        let c = f("keychain");
        assert_eq!(KvsKey::circle(&c).to_key(), "circle-keychain");
        assert_eq!(KvsKey::parameters(&c).to_key(), "parameters-keychain");
        assert_eq!(KvsKey::AccountChanged.to_key(), "account-changed");
        let m = KvsKey::Message { circle: c, from: f("a1"), to: f("b2") };
        assert_eq!(m.to_key(), "message-keychain-a1-b2");
    }

    #[test]
    fn test_field_rejects_delimiter() {
        assert!(KeyField::new("has-dash").is_err());
        assert!(KeyField::new("").is_err());
        assert!(KeyField::new("plain").is_ok());
    }

    #[test]
    fn test_classification() {
        assert_eq!(key_type("circle-keychain"), KvsKeyType::Circle);
        assert_eq!(key_type("message-k-a-b"), KvsKeyType::Message);
        assert_eq!(key_type("retirement-k-a"), KvsKeyType::Retirement);
        assert_eq!(key_type("initialsync-k-a"), KvsKeyType::InitialSync);
        assert_eq!(key_type("account-changed"), KvsKeyType::AccountChanged);
        assert_eq!(key_type("message-k-a"), KvsKeyType::Unknown);
        assert_eq!(key_type("circle--x"), KvsKeyType::Unknown);
        assert_eq!(key_type("something"), KvsKeyType::Unknown);
    }

    #[test]
    fn test_peer_ids_are_fields() {
        let peer = sos_core::DeviceIdentity::from_seed(&[3; 32]).peer_id();
        let key = KvsKey::retirement(&f("keychain"), &peer);
        match parse_key(&key.to_key()) {
            KvsKey::Retirement { peer: parsed, .. } => assert_eq!(parsed.as_str(), peer.as_str()),
            other => panic!("unexpected {:?}", other),
        }
    }

    fn field() -> impl Strategy<Value = KeyField> {
        "[a-zA-Z0-9_.]{1,24}".prop_map(|s| KeyField::new(s).unwrap())
    }

    proptest! {
        #[test]
        fn prop_message_roundtrip(c in field(), from in field(), to in field()) {
            let key = KvsKey::Message { circle: c, from, to };
            prop_assert_eq!(parse_key(&key.to_key()), key);
        }

        #[test]
        fn prop_single_field_roundtrip(c in field(), p in field()) {
            for key in [
                KvsKey::Circle { circle: c.clone() },
                KvsKey::Parameters { circle: c.clone() },
                KvsKey::InitialSync { circle: c.clone(), peer: p.clone() },
                KvsKey::Retirement { circle: c.clone(), peer: p.clone() },
            ] {
                prop_assert_eq!(parse_key(&key.to_key()), key);
            }
        }
    }
}
