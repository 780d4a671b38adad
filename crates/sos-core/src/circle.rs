//! Circle: the membership and generation-counter state machine.
//!
//! A circle is an immutable, signed snapshot of who belongs to the trusted
//! group. Every mutation derives a new circle at exactly `generation + 1`
//! from the circle it was based on and is signed by the peer performing it.
//! Conflicting snapshots from the relay are resolved by [`apply_circle_update`].
//!
//! ## Peer lifecycle
//!
//! ```text
//! Applicant ──accept──► Member ──leave / retire──► Retired
//!     │
//!     └──reject──► (gone)
//! ```
//!
//! `Retired` is terminal: a retired id can never apply again, which stops a
//! stale membership from being replayed.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use ciborium::value::Value;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::canonical::{encode_canonical, int_map};
use crate::crypto::{DeviceIdentity, PeerKeys, Signature};
use crate::error::{CircleError, CoreError};
use crate::peer::PeerInfo;
use crate::types::{Digest, PeerId};

/// Result type for circle operations.
pub type Result<T> = std::result::Result<T, CircleError>;

mod keys {
    pub const NAME: u64 = 0;
    pub const GENERATION: u64 = 1;
    pub const MEMBERS: u64 = 2;
    pub const APPLICANTS: u64 = 3;
    pub const RETIRED: u64 = 4;
    pub const SIGNER: u64 = 5;
    pub const SIGNATURE: u64 = 6;
}

/// Where a peer stands relative to a circle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    Applicant,
    Member,
    Retired,
}

/// A signed membership snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circle {
    name: String,
    generation: u64,
    members: BTreeMap<PeerId, PeerInfo>,
    applicants: BTreeMap<PeerId, PeerInfo>,
    retired: BTreeSet<PeerId>,
    signer: Option<PeerId>,
    signature: Option<Signature>,
}

impl Circle {
    /// An empty, unsigned circle at generation 0.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            generation: 0,
            members: BTreeMap::new(),
            applicants: BTreeMap::new(),
            retired: BTreeSet::new(),
            signer: None,
            signature: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn members(&self) -> &BTreeMap<PeerId, PeerInfo> {
        &self.members
    }

    pub fn applicants(&self) -> &BTreeMap<PeerId, PeerInfo> {
        &self.applicants
    }

    pub fn retired(&self) -> &BTreeSet<PeerId> {
        &self.retired
    }

    pub fn signer(&self) -> Option<&PeerId> {
        self.signer.as_ref()
    }

    pub fn is_member(&self, peer: &PeerId) -> bool {
        self.members.contains_key(peer)
    }

    /// Status of a peer, or `None` if the circle has never heard of it.
    pub fn status_of(&self, peer: &PeerId) -> Option<PeerStatus> {
        if self.members.contains_key(peer) {
            Some(PeerStatus::Member)
        } else if self.applicants.contains_key(peer) {
            Some(PeerStatus::Applicant)
        } else if self.retired.contains(peer) {
            Some(PeerStatus::Retired)
        } else {
            None
        }
    }

    /// Members other than `local`, with their keys.
    pub fn peers_excluding(&self, local: &PeerId) -> BTreeMap<PeerId, PeerKeys> {
        self.members
            .iter()
            .filter(|(id, _)| *id != local)
            .map(|(id, info)| (id.clone(), info.keys))
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Encoding
    // ─────────────────────────────────────────────────────────────────────────

    fn unsigned_value(&self) -> Value {
        int_map(vec![
            (keys::NAME, Value::Text(self.name.clone())),
            (keys::GENERATION, Value::Integer(self.generation.into())),
            (
                keys::MEMBERS,
                Value::Array(self.members.values().map(PeerInfo::to_value).collect()),
            ),
            (
                keys::APPLICANTS,
                Value::Array(self.applicants.values().map(PeerInfo::to_value).collect()),
            ),
            (
                keys::RETIRED,
                Value::Array(
                    self.retired
                        .iter()
                        .map(|id| Value::Text(id.as_str().to_owned()))
                        .collect(),
                ),
            ),
            (
                keys::SIGNER,
                match &self.signer {
                    Some(id) => Value::Text(id.as_str().to_owned()),
                    None => Value::Null,
                },
            ),
        ])
    }

    /// The bytes covered by the circle signature.
    pub fn signed_bytes(&self) -> std::result::Result<Vec<u8>, CoreError> {
        let mut buf = b"sos-circle-v0:".to_vec();
        buf.extend(encode_canonical(&self.unsigned_value())?);
        Ok(buf)
    }

    /// Canonical bytes of the whole circle, signature included.
    pub fn canonical_bytes(&self) -> std::result::Result<Vec<u8>, CoreError> {
        let mut value = self.unsigned_value();
        if let Value::Map(entries) = &mut value {
            entries.push((
                Value::Integer(keys::SIGNATURE.into()),
                match &self.signature {
                    Some(sig) => Value::Bytes(sig.0.to_vec()),
                    None => Value::Null,
                },
            ));
        }
        encode_canonical(&value)
    }

    /// Content identity of the circle; the equal-generation tie-break key.
    pub fn fingerprint(&self) -> std::result::Result<Digest, CoreError> {
        Ok(Digest::of(&self.canonical_bytes()?))
    }

    /// Serialize to CBOR bytes for the KVS.
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, CoreError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| CoreError::EncodingError(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize from CBOR bytes. The result is not yet trusted.
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, CoreError> {
        ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mutations
    // ─────────────────────────────────────────────────────────────────────────

    fn next(&self) -> Result<Circle> {
        let mut next = self.clone();
        next.generation = self
            .generation
            .checked_add(1)
            .ok_or(CircleError::GenerationOverflow)?;
        next.signer = None;
        next.signature = None;
        Ok(next)
    }

    fn sign(mut self, identity: &DeviceIdentity) -> Result<Circle> {
        self.signer = Some(identity.peer_id());
        let message = self.signed_bytes()?;
        self.signature = Some(identity.sign(&message));
        Ok(self)
    }

    fn require_member(&self, peer: &PeerId) -> Result<()> {
        if self.members.contains_key(peer) {
            Ok(())
        } else {
            Err(CircleError::NotAMember(peer.clone()))
        }
    }

    /// Add the local device as an applicant.
    pub fn request_to_join(&self, identity: &DeviceIdentity, info: &PeerInfo) -> Result<Circle> {
        info.verify()?;
        let id = identity.peer_id();
        if info.peer_id != id {
            return Err(CircleError::Unauthorized(info.peer_id.clone()));
        }
        match self.status_of(&id) {
            Some(PeerStatus::Retired) => return Err(CircleError::Retired(id)),
            Some(PeerStatus::Member) => return Err(CircleError::AlreadyMember(id)),
            Some(PeerStatus::Applicant) => return Err(CircleError::AlreadyApplied(id)),
            None => {}
        }

        let mut next = self.next()?;
        next.applicants.insert(id, info.clone());
        next.sign(identity)
    }

    /// Promote an applicant to member. The approver must be a member.
    pub fn accept_applicant(&self, approver: &DeviceIdentity, applicant: &PeerId) -> Result<Circle> {
        self.require_member(&approver.peer_id())?;
        if self.retired.contains(applicant) {
            return Err(CircleError::Retired(applicant.clone()));
        }

        let mut next = self.next()?;
        let info = next
            .applicants
            .remove(applicant)
            .ok_or_else(|| CircleError::NotAnApplicant(applicant.clone()))?;
        next.members.insert(applicant.clone(), info);
        next.sign(approver)
    }

    /// Drop an applicant. The approver must be a member.
    pub fn reject_applicant(&self, approver: &DeviceIdentity, applicant: &PeerId) -> Result<Circle> {
        self.require_member(&approver.peer_id())?;

        let mut next = self.next()?;
        next.applicants
            .remove(applicant)
            .ok_or_else(|| CircleError::NotAnApplicant(applicant.clone()))?;
        next.sign(approver)
    }

    /// Remove the local device. Self-removal needs no approval.
    pub fn leave(&self, identity: &DeviceIdentity) -> Result<Circle> {
        let id = identity.peer_id();
        self.require_member(&id)?;

        let mut next = self.next()?;
        next.members.remove(&id);
        next.retired.insert(id);
        next.sign(identity)
    }

    /// Evict another member. The approver must be a member.
    pub fn retire_peer(&self, approver: &DeviceIdentity, peer: &PeerId) -> Result<Circle> {
        self.require_member(&approver.peer_id())?;
        self.require_member(peer)?;

        let mut next = self.next()?;
        next.members.remove(peer);
        next.retired.insert(peer.clone());
        next.sign(approver)
    }

    /// Destructive recovery: wipe membership and restart with the caller as
    /// the sole member. The retired set survives so old peers stay out.
    pub fn reset_to_offering(&self, identity: &DeviceIdentity, info: &PeerInfo) -> Result<Circle> {
        info.verify()?;
        let id = identity.peer_id();
        if info.peer_id != id {
            return Err(CircleError::Unauthorized(info.peer_id.clone()));
        }
        if self.retired.contains(&id) {
            return Err(CircleError::Retired(id));
        }

        let mut next = self.next()?;
        next.members.clear();
        next.applicants.clear();
        next.members.insert(id, info.clone());
        next.sign(identity)
    }

    /// Derive circle-bound key material from published key parameters.
    pub fn derive_key_material(&self, params: &KeyParameters) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_derive_key("sos-circle-key-v0");
        hasher.update(self.name.as_bytes());
        hasher.update(&self.generation.to_be_bytes());
        for info in self.members.values() {
            hasher.update(&info.keys.signing.0);
        }
        hasher.update(&params.salt);
        hasher.update(&params.iterations.to_be_bytes());
        *hasher.finalize().as_bytes()
    }
}

/// Outcome of reconciling a local circle with one from the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircleDecision {
    /// The incoming circle replaces the local one.
    Adopted,
    /// The incoming circle is bit-identical to the local one.
    NoOp,
    /// The incoming circle has a lower generation and was discarded.
    Stale,
    /// Same generation, different content, and the local circle won.
    LostTieBreak,
}

/// Reconcile `incoming` against `local`.
///
/// Adopts `incoming` iff its generation is higher, or the generations are
/// equal and `incoming` wins the tie-break (larger fingerprint). The
/// returned circle's generation is never lower than `local`'s.
pub fn apply_circle_update(local: &Circle, incoming: &Circle) -> Result<(Circle, CircleDecision)> {
    if local.name != incoming.name {
        return Err(CircleError::NameMismatch {
            local: local.name.clone(),
            incoming: incoming.name.clone(),
        });
    }

    match incoming.generation.cmp(&local.generation) {
        Ordering::Less => {
            debug!(
                circle = %local.name,
                local = local.generation,
                incoming = incoming.generation,
                "discarding stale circle update"
            );
            return Ok((local.clone(), CircleDecision::Stale));
        }
        Ordering::Equal if incoming == local => {
            return Ok((local.clone(), CircleDecision::NoOp));
        }
        _ => {}
    }

    verify_update(local, incoming)?;

    if incoming.generation > local.generation {
        info!(
            circle = %incoming.name,
            generation = incoming.generation,
            members = incoming.members.len(),
            "adopting circle update"
        );
        return Ok((incoming.clone(), CircleDecision::Adopted));
    }

    let ours = local.fingerprint()?;
    let theirs = incoming.fingerprint()?;
    if theirs > ours {
        info!(
            circle = %incoming.name,
            generation = incoming.generation,
            "adopting concurrent circle update by tie-break"
        );
        Ok((incoming.clone(), CircleDecision::Adopted))
    } else {
        debug!(
            circle = %local.name,
            generation = local.generation,
            "local circle wins tie-break"
        );
        Ok((local.clone(), CircleDecision::LostTieBreak))
    }
}

/// Signature and authorization checks for a circle we might adopt.
fn verify_update(local: &Circle, incoming: &Circle) -> Result<()> {
    let signer = incoming.signer.as_ref().ok_or(CircleError::Unsigned)?;
    let signature = incoming.signature.as_ref().ok_or(CircleError::Unsigned)?;

    for id in &local.retired {
        if incoming.members.contains_key(id) || incoming.applicants.contains_key(id) {
            warn!(peer = %id, "circle update revives a retired peer");
            return Err(CircleError::RevivesRetired(id.clone()));
        }
    }

    let key = if local.members.is_empty() {
        // Nothing trusted yet: accept any self-consistent circle.
        incoming
            .members
            .get(signer)
            .or_else(|| incoming.applicants.get(signer))
            .map(|info| info.keys.signing)
            .ok_or_else(|| CircleError::UnknownSigner(signer.clone()))?
    } else if let Some(info) = local.members.get(signer) {
        info.keys.signing
    } else if let Some(info) = incoming.applicants.get(signer) {
        // An applicant may only add itself, one generation on from `local`.
        let mut expected = local.next()?;
        expected.applicants.insert(signer.clone(), info.clone());
        let mut unsigned = incoming.clone();
        unsigned.signer = None;
        unsigned.signature = None;
        if unsigned != expected {
            warn!(peer = %signer, "applicant-signed circle changes more than its own entry");
            return Err(CircleError::Unauthorized(signer.clone()));
        }
        info.keys.signing
    } else if incoming.members.contains_key(signer) {
        warn!(peer = %signer, "circle signed by a member we never admitted");
        return Err(CircleError::Unauthorized(signer.clone()));
    } else {
        return Err(CircleError::UnknownSigner(signer.clone()));
    };

    key.verify(&incoming.signed_bytes()?, signature)?;

    for info in incoming.members.values().chain(incoming.applicants.values()) {
        info.verify()?;
    }
    Ok(())
}

/// Parameters published under the circle's parameters key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyParameters {
    pub salt: Vec<u8>,
    pub iterations: u32,
}

impl KeyParameters {
    /// Default iteration count for freshly generated parameters.
    pub const DEFAULT_ITERATIONS: u32 = 10_000;

    /// Fresh parameters with a random salt.
    pub fn generate() -> Self {
        let mut salt = vec![0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        Self {
            salt,
            iterations: Self::DEFAULT_ITERATIONS,
        }
    }

    /// Serialize to CBOR bytes.
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, CoreError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| CoreError::EncodingError(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize from CBOR bytes.
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, CoreError> {
        ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))
    }
}

/// A peer's signed statement that it has left a circle.
///
/// Published under the retirement key so other members can drop the peer
/// even if they missed the circle update that retired it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetirementTicket {
    pub circle: String,
    pub peer_id: PeerId,
    pub generation: u64,
    pub signature: Signature,
}

impl RetirementTicket {
    /// Sign a ticket for the local device.
    pub fn new(identity: &DeviceIdentity, circle: &str, generation: u64) -> std::result::Result<Self, CoreError> {
        let peer_id = identity.peer_id();
        let message = ticket_bytes(circle, &peer_id, generation)?;
        Ok(Self {
            circle: circle.to_owned(),
            peer_id,
            generation,
            signature: identity.sign(&message),
        })
    }

    /// Verify the ticket against the retiring peer's keys.
    pub fn verify(&self, keys: &PeerKeys) -> std::result::Result<(), CoreError> {
        if keys.peer_id() != self.peer_id {
            return Err(CoreError::PeerIdMismatch {
                claimed: self.peer_id.clone(),
                derived: keys.peer_id(),
            });
        }
        let message = ticket_bytes(&self.circle, &self.peer_id, self.generation)?;
        keys.signing.verify(&message, &self.signature)
    }

    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, CoreError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| CoreError::EncodingError(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, CoreError> {
        ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))
    }
}

fn ticket_bytes(circle: &str, peer: &PeerId, generation: u64) -> std::result::Result<Vec<u8>, CoreError> {
    let mut buf = b"sos-retirement-v0:".to_vec();
    buf.extend(encode_canonical(&int_map(vec![
        (0, Value::Text(circle.to_owned())),
        (1, Value::Text(peer.as_str().to_owned())),
        (2, Value::Integer(generation.into())),
    ]))?);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Device {
        identity: DeviceIdentity,
        info: PeerInfo,
    }

    fn device(seed: u8) -> Device {
        let identity = DeviceIdentity::from_seed(&[seed; 32]);
        let info = PeerInfo::new(&identity, format!("device-{}", seed)).unwrap();
        Device { identity, info }
    }

    fn offered(owner: &Device) -> Circle {
        Circle::new("keychain")
            .reset_to_offering(&owner.identity, &owner.info)
            .unwrap()
    }

    fn two_member(a: &Device, b: &Device) -> Circle {
        let c = offered(a);
        let c = c.request_to_join(&b.identity, &b.info).unwrap();
        c.accept_applicant(&a.identity, &b.info.peer_id).unwrap()
    }

    #[test]
    fn test_reset_creates_generation_one() {
        let a = device(1);
        let c = offered(&a);
        assert_eq!(c.generation(), 1);
        assert_eq!(c.members().len(), 1);
        assert!(c.is_member(&a.info.peer_id));
        assert_eq!(c.signer(), Some(&a.info.peer_id));
    }

    #[test]
    fn test_join_accept_flow() {
        let (a, b) = (device(1), device(2));
        let c1 = offered(&a);
        let c2 = c1.request_to_join(&b.identity, &b.info).unwrap();
        assert_eq!(c2.generation(), 2);
        assert_eq!(c2.status_of(&b.info.peer_id), Some(PeerStatus::Applicant));

        let c3 = c2.accept_applicant(&a.identity, &b.info.peer_id).unwrap();
        assert_eq!(c3.generation(), 3);
        assert_eq!(c3.status_of(&b.info.peer_id), Some(PeerStatus::Member));
        assert!(c3.applicants().is_empty());
    }

    #[test]
    fn test_non_member_cannot_accept() {
        let (a, b, c) = (device(1), device(2), device(3));
        let circle = offered(&a).request_to_join(&b.identity, &b.info).unwrap();
        assert!(matches!(
            circle.accept_applicant(&c.identity, &b.info.peer_id),
            Err(CircleError::NotAMember(_))
        ));
    }

    #[test]
    fn test_reject_applicant() {
        let (a, b) = (device(1), device(2));
        let circle = offered(&a).request_to_join(&b.identity, &b.info).unwrap();
        let rejected = circle.reject_applicant(&a.identity, &b.info.peer_id).unwrap();
        assert_eq!(rejected.status_of(&b.info.peer_id), None);
        assert_eq!(rejected.generation(), circle.generation() + 1);
    }

    #[test]
    fn test_leave_retires_and_blocks_rejoin() {
        let (a, b) = (device(1), device(2));
        let circle = two_member(&a, &b);
        let left = circle.leave(&b.identity).unwrap();
        assert_eq!(left.status_of(&b.info.peer_id), Some(PeerStatus::Retired));
        assert_eq!(left.generation(), circle.generation() + 1);

        assert!(matches!(
            left.request_to_join(&b.identity, &b.info),
            Err(CircleError::Retired(_))
        ));
    }

    #[test]
    fn test_reset_keeps_retired() {
        let (a, b) = (device(1), device(2));
        let circle = two_member(&a, &b).retire_peer(&a.identity, &b.info.peer_id).unwrap();
        let reset = circle.reset_to_offering(&a.identity, &a.info).unwrap();
        assert_eq!(reset.members().len(), 1);
        assert!(reset.retired().contains(&b.info.peer_id));
        assert_eq!(reset.generation(), circle.generation() + 1);
    }

    #[test]
    fn test_apply_higher_generation_adopted() {
        let (a, b) = (device(1), device(2));
        let local = offered(&a);
        let incoming = local.request_to_join(&b.identity, &b.info).unwrap();

        let (result, decision) = apply_circle_update(&local, &incoming).unwrap();
        assert_eq!(decision, CircleDecision::Adopted);
        assert_eq!(result, incoming);
    }

    #[test]
    fn test_apply_identical_is_noop() {
        let a = device(1);
        let local = offered(&a);
        let (_, decision) = apply_circle_update(&local, &local.clone()).unwrap();
        assert_eq!(decision, CircleDecision::NoOp);
    }

    #[test]
    fn test_apply_lower_generation_is_stale() {
        let (a, b) = (device(1), device(2));
        let old = offered(&a);
        let newer = two_member(&a, &b);

        let (result, decision) = apply_circle_update(&newer, &old).unwrap();
        assert_eq!(decision, CircleDecision::Stale);
        assert_eq!(result.generation(), newer.generation());
    }

    #[test]
    fn test_equal_generation_tie_break_is_symmetric() {
        let (a, b, c) = (device(1), device(2), device(3));
        let base = two_member(&a, &b).request_to_join(&c.identity, &c.info).unwrap();

        // Concurrent mutations from the same base.
        let x = base.accept_applicant(&a.identity, &c.info.peer_id).unwrap();
        let y = base.reject_applicant(&b.identity, &c.info.peer_id).unwrap();
        assert_eq!(x.generation(), y.generation());

        let (from_x, _) = apply_circle_update(&x, &y).unwrap();
        let (from_y, _) = apply_circle_update(&y, &x).unwrap();
        assert_eq!(from_x, from_y);
    }

    #[test]
    fn test_forged_signature_rejected() {
        let (a, b) = (device(1), device(2));
        let local = two_member(&a, &b);
        let mut forged = local.retire_peer(&a.identity, &b.info.peer_id).unwrap();
        forged.generation += 1;

        assert!(matches!(
            apply_circle_update(&local, &forged),
            Err(CircleError::Core(CoreError::InvalidSignature))
        ));
    }

    #[test]
    fn test_outsider_cannot_take_over() {
        let (a, b, mallory) = (device(1), device(2), device(9));
        let local = two_member(&a, &b);

        // An outsider jumps ahead several generations and resets.
        let mut hijack = local.clone();
        for _ in 0..5 {
            hijack = hijack.next().unwrap();
        }
        let hijack = hijack
            .reset_to_offering(&mallory.identity, &mallory.info)
            .unwrap();

        assert!(matches!(
            apply_circle_update(&local, &hijack),
            Err(CircleError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_applicant_cannot_change_members() {
        let (a, b, c) = (device(1), device(2), device(3));
        let local = two_member(&a, &b);

        let mut sneaky = local.request_to_join(&c.identity, &c.info).unwrap();
        sneaky.members.remove(&a.info.peer_id);
        let sneaky = sneaky.sign(&c.identity).unwrap();

        assert!(matches!(
            apply_circle_update(&local, &sneaky),
            Err(CircleError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_applicant_cannot_clear_retired_set() {
        let (a, b, c) = (device(1), device(2), device(3));
        let local = two_member(&a, &b).leave(&b.identity).unwrap();

        let mut wiped = local.request_to_join(&c.identity, &c.info).unwrap();
        wiped.retired.clear();
        let wiped = wiped.sign(&c.identity).unwrap();

        assert!(matches!(
            apply_circle_update(&local, &wiped),
            Err(CircleError::Unauthorized(_))
        ));
        assert!(matches!(
            local.request_to_join(&b.identity, &b.info),
            Err(CircleError::Retired(_))
        ));
    }

    #[test]
    fn test_applicant_cannot_add_others_or_skip_generations() {
        let (a, b, c, d) = (device(1), device(2), device(3), device(4));
        let local = offered(&a);

        let mut crowd = local.request_to_join(&c.identity, &c.info).unwrap();
        crowd.applicants.insert(d.info.peer_id.clone(), d.info.clone());
        let crowd = crowd.sign(&c.identity).unwrap();
        assert!(matches!(
            apply_circle_update(&local, &crowd),
            Err(CircleError::Unauthorized(_))
        ));

        let mut renamed = local.request_to_join(&c.identity, &c.info).unwrap();
        let owner = renamed.members.get_mut(&a.info.peer_id).unwrap();
        *owner = PeerInfo::new(&b.identity, "impostor").unwrap();
        let renamed = renamed.sign(&c.identity).unwrap();
        assert!(apply_circle_update(&local, &renamed).is_err());

        let mut jumped = local.request_to_join(&c.identity, &c.info).unwrap();
        jumped.generation += 5;
        let jumped = jumped.sign(&c.identity).unwrap();
        assert!(matches!(
            apply_circle_update(&local, &jumped),
            Err(CircleError::Unauthorized(_))
        ));

        let honest = local.request_to_join(&c.identity, &c.info).unwrap();
        let (adopted, decision) = apply_circle_update(&local, &honest).unwrap();
        assert_eq!(decision, CircleDecision::Adopted);
        assert!(adopted.applicants().contains_key(&c.info.peer_id));
    }

    #[test]
    fn test_retired_peer_cannot_be_revived() {
        let (a, b) = (device(1), device(2));
        let local = two_member(&a, &b).leave(&b.identity).unwrap();

        let mut revived = local.next().unwrap();
        revived.retired.remove(&b.info.peer_id);
        revived.members.insert(b.info.peer_id.clone(), b.info.clone());
        let revived = revived.sign(&a.identity).unwrap();

        assert!(matches!(
            apply_circle_update(&local, &revived),
            Err(CircleError::RevivesRetired(_))
        ));
    }

    #[test]
    fn test_circle_cbor_roundtrip() {
        let (a, b) = (device(1), device(2));
        let circle = two_member(&a, &b);
        let decoded = Circle::from_bytes(&circle.to_bytes().unwrap()).unwrap();
        assert_eq!(circle, decoded);
        assert_eq!(circle.fingerprint().unwrap(), decoded.fingerprint().unwrap());
    }

    #[test]
    fn test_retirement_ticket() {
        let (a, b) = (device(1), device(2));
        let ticket = RetirementTicket::new(&b.identity, "keychain", 4).unwrap();
        ticket.verify(&b.info.keys).unwrap();
        assert!(ticket.verify(&a.info.keys).is_err());

        let decoded = RetirementTicket::from_bytes(&ticket.to_bytes().unwrap()).unwrap();
        assert_eq!(ticket, decoded);
    }

    #[test]
    fn test_key_material_binds_membership() {
        let (a, b) = (device(1), device(2));
        let params = KeyParameters { salt: vec![1; 16], iterations: 10 };
        let one = offered(&a);
        let two = two_member(&a, &b);
        assert_eq!(one.derive_key_material(&params), one.derive_key_material(&params));
        assert_ne!(one.derive_key_material(&params), two.derive_key_material(&params));
    }
}
