//! Property tests over manifests, keys, and circles.

use proptest::prelude::*;

use sos_core::{apply_circle_update, Circle, CircleDecision, DeviceIdentity, Manifest, PeerInfo};
use sos_engine::{parse_key, KvsKey};
use sos_testkit::generators::{digest, key_field, manifest, manifest_pair, peer_id};

proptest! {
    #[test]
    fn test_diff_then_apply_reaches_target((a, b) in manifest_pair(48)) {
        let delta = Manifest::diff(&a, &b);
        prop_assert_eq!(a.apply(&delta), b.clone());
        for d in &delta.added {
            prop_assert!(!a.contains(d) && b.contains(d));
        }
        for d in &delta.removed {
            prop_assert!(a.contains(d) && !b.contains(d));
        }
    }

    #[test]
    fn test_diff_with_self_is_empty(m in manifest(48)) {
        prop_assert!(Manifest::diff(&m, &m).is_empty());
    }

    #[test]
    fn test_digest_ignores_insertion_order(mut digests in prop::collection::vec(digest(), 0..32)) {
        let forward = Manifest::new(digests.clone());
        digests.reverse();
        let backward = Manifest::new(digests);
        prop_assert_eq!(forward.digest(), backward.digest());
        prop_assert_eq!(forward, backward);
    }

    #[test]
    fn test_manifest_bytes_reparse(m in manifest(32)) {
        let parsed = Manifest::from_bytes(&m.to_bytes().unwrap()).unwrap();
        prop_assert_eq!(parsed.digest(), m.digest());
    }

    #[test]
    fn test_message_key_round_trip(circle in key_field(), from in peer_id(), to in peer_id()) {
        let key = KvsKey::message(&circle, &from, &to);
        prop_assert_eq!(parse_key(&key.to_key()), key);
    }

    #[test]
    fn test_retirement_key_round_trip(circle in key_field(), peer in peer_id()) {
        let key = KvsKey::retirement(&circle, &peer);
        prop_assert_eq!(parse_key(&key.to_key()), key);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn test_generation_never_decreases(seeds in prop::collection::btree_set(2u8..=250, 1..5)) {
        let owner = DeviceIdentity::from_seed(&[1; 32]);
        let info = PeerInfo::new(&owner, "owner").unwrap();
        let mut history = vec![Circle::new("keychain").reset_to_offering(&owner, &info).unwrap()];

        for seed in seeds {
            let applicant = DeviceIdentity::from_seed(&[seed; 32]);
            let info = PeerInfo::new(&applicant, format!("device {seed}")).unwrap();
            let last = history.last().unwrap().clone();
            let applied = last.request_to_join(&applicant, &info).unwrap();
            let accepted = applied.accept_applicant(&owner, &applicant.peer_id()).unwrap();
            history.push(applied);
            history.push(accepted);
        }

        for pair in history.windows(2) {
            prop_assert_eq!(pair[1].generation(), pair[0].generation() + 1);
        }

        let latest = history.last().unwrap();
        for older in &history[..history.len() - 1] {
            let (kept, decision) = apply_circle_update(latest, older).unwrap();
            prop_assert_eq!(decision, CircleDecision::Stale);
            prop_assert_eq!(&kept, latest);

            let (adopted, decision) = apply_circle_update(older, latest).unwrap();
            prop_assert_eq!(decision, CircleDecision::Adopted);
            prop_assert_eq!(adopted.generation(), latest.generation());
        }
    }
}
