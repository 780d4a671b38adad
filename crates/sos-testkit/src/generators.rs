//! Proptest generators for property-based testing.

use std::collections::BTreeSet;

use proptest::prelude::*;

use sos_core::{DeviceIdentity, Digest, Item, Manifest, PeerId};
use sos_engine::KeyField;

/// A random digest. Not the hash of anything.
pub fn digest() -> impl Strategy<Value = Digest> {
    any::<[u8; 32]>().prop_map(Digest)
}

/// Payload bytes up to `max_len`.
pub fn payload(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

pub fn item() -> impl Strategy<Value = Item> {
    payload(256).prop_map(Item::from)
}

/// Up to `max` distinct items.
pub fn items(max: usize) -> impl Strategy<Value = Vec<Item>> {
    prop::collection::btree_set(payload(64), 0..=max)
        .prop_map(|set| set.into_iter().map(Item::from).collect())
}

pub fn manifest(max: usize) -> impl Strategy<Value = Manifest> {
    prop::collection::vec(digest(), 0..=max).prop_map(Manifest::new)
}

/// Two manifests drawn from a shared pool, so they usually overlap.
pub fn manifest_pair(max: usize) -> impl Strategy<Value = (Manifest, Manifest)> {
    prop::collection::btree_set(digest(), 0..=max).prop_flat_map(|pool| {
        let pool: Vec<Digest> = pool.into_iter().collect();
        let n = pool.len();
        (
            Just(pool),
            prop::collection::vec(any::<bool>(), n),
            prop::collection::vec(any::<bool>(), n),
        )
            .prop_map(|(pool, in_a, in_b)| {
                let pick = |mask: &[bool]| {
                    pool.iter()
                        .zip(mask)
                        .filter(|(_, keep)| **keep)
                        .map(|(d, _)| *d)
                        .collect::<BTreeSet<Digest>>()
                };
                (Manifest::new(pick(&in_a)), Manifest::new(pick(&in_b)))
            })
    })
}

pub fn identity() -> impl Strategy<Value = DeviceIdentity> {
    any::<[u8; 32]>().prop_map(|seed| DeviceIdentity::from_seed(&seed))
}

pub fn peer_id() -> impl Strategy<Value = PeerId> {
    identity().prop_map(|id| id.peer_id())
}

/// A circle or view name that is valid as a key field.
pub fn key_field() -> impl Strategy<Value = KeyField> {
    "[a-z][a-z0-9_.]{0,23}".prop_map(|s| KeyField::new(s).expect("pattern has no delimiter"))
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn test_items_are_distinct(items in items(32)) {
            let digests: BTreeSet<Digest> = items.iter().map(Item::digest).collect();
            prop_assert_eq!(digests.len(), items.len());
        }

        #[test]
        fn test_manifest_pair_shares_pool((a, b) in manifest_pair(24)) {
            let delta = Manifest::diff(&a, &b);
            prop_assert_eq!(delta.added.len() + a.len(), b.len() + delta.removed.len());
        }

        #[test]
        fn test_peer_id_parses(id in peer_id()) {
            prop_assert_eq!(PeerId::parse(id.as_str()).unwrap(), id);
        }
    }
}
