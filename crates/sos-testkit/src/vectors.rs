//! Known KVS keys and item digests.
//!
//! Devices running different builds share one relay, so key strings and
//! item digests must never drift. Each vector pins one of them.

use sos_core::{Digest, Item, PeerId};
use sos_engine::{parse_key, KeyField, KvsKey, KvsKeyType};

const ALICE: &str = "a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1";
const BOB: &str = "b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2";

/// One pinned key.
#[derive(Debug, Clone)]
pub struct KeyVector {
    pub name: &'static str,
    pub key: KvsKey,
    pub expected: String,
    pub key_type: KvsKeyType,
}

fn peer(hex: &str) -> PeerId {
    PeerId::parse(hex).expect("vector peer ids are valid")
}

/// Every key shape the relay carries.
pub fn all_key_vectors() -> Vec<KeyVector> {
    let circle = KeyField::new("keychain").expect("valid field");
    let (alice, bob) = (peer(ALICE), peer(BOB));
    vec![
        KeyVector {
            name: "circle",
            key: KvsKey::circle(&circle),
            expected: "circle-keychain".into(),
            key_type: KvsKeyType::Circle,
        },
        KeyVector {
            name: "message",
            key: KvsKey::message(&circle, &alice, &bob),
            expected: format!("message-keychain-{ALICE}-{BOB}"),
            key_type: KvsKeyType::Message,
        },
        KeyVector {
            name: "parameters",
            key: KvsKey::parameters(&circle),
            expected: "parameters-keychain".into(),
            key_type: KvsKeyType::Parameters,
        },
        KeyVector {
            name: "initial sync",
            key: KvsKey::initial_sync(&circle, &bob),
            expected: format!("initialsync-keychain-{BOB}"),
            key_type: KvsKeyType::InitialSync,
        },
        KeyVector {
            name: "retirement",
            key: KvsKey::retirement(&circle, &alice),
            expected: format!("retirement-keychain-{ALICE}"),
            key_type: KvsKeyType::Retirement,
        },
        KeyVector {
            name: "account changed",
            key: KvsKey::AccountChanged,
            expected: "account-changed".into(),
            key_type: KvsKeyType::AccountChanged,
        },
    ]
}

/// Render and re-parse every vector. Returns `(name, ok, rendered)`.
pub fn verify_key_vectors() -> Vec<(&'static str, bool, String)> {
    all_key_vectors()
        .into_iter()
        .map(|v| {
            let rendered = v.key.to_key();
            let parsed = parse_key(&rendered);
            let ok = rendered == v.expected && parsed == v.key && parsed.key_type() == v.key_type;
            (v.name, ok, rendered)
        })
        .collect()
}

/// Item contents and their expected digests (BLAKE3, no domain prefix).
pub fn item_digest_vectors() -> Vec<(&'static [u8], &'static str)> {
    vec![
        (b"", "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"),
        (b"abc", "6437b3ac38465133ffb63b75273a8db548c558465d79db03fd359c6cd5bd9d85"),
    ]
}

/// Hash every item vector. Returns `(content, ok, digest)`.
pub fn verify_item_digests() -> Vec<(&'static [u8], bool, Digest)> {
    item_digest_vectors()
        .into_iter()
        .map(|(content, expected)| {
            let digest = Item::from(content.to_vec()).digest();
            let ok = hex::decode(expected).map(|b| b == digest.0).unwrap_or(false);
            (content, ok, digest)
        })
        .collect()
}
