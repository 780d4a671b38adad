//! Error types for SOS core.

use thiserror::Error;

use crate::types::PeerId;

/// Core errors that can occur while building or decoding primitives.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("peer id {claimed} does not match its signing key (expected {derived})")]
    PeerIdMismatch { claimed: PeerId, derived: PeerId },

    #[error("manifest entries are not strictly ordered at index {0}")]
    UnsortedManifest(usize),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Errors raised by circle mutations and circle update validation.
#[derive(Debug, Error)]
pub enum CircleError {
    #[error("peer {0} is not a member of the circle")]
    NotAMember(PeerId),

    #[error("peer {0} is already a member of the circle")]
    AlreadyMember(PeerId),

    #[error("peer {0} has already applied")]
    AlreadyApplied(PeerId),

    #[error("peer {0} is not an applicant")]
    NotAnApplicant(PeerId),

    #[error("peer {0} was retired and cannot rejoin")]
    Retired(PeerId),

    #[error("circle name mismatch: local {local}, incoming {incoming}")]
    NameMismatch { local: String, incoming: String },

    #[error("circle is not signed")]
    Unsigned,

    #[error("signer {0} is unknown to both circles")]
    UnknownSigner(PeerId),

    #[error("signer {0} is not authorized for this change")]
    Unauthorized(PeerId),

    #[error("circle revives retired peer {0}")]
    RevivesRetired(PeerId),

    #[error("generation counter overflow")]
    GenerationOverflow,

    #[error(transparent)]
    Core(#[from] CoreError),
}
