//! The per-peer coder state machine.
//!
//! ```text
//!                 send / recv hello
//! Uninitialized ───────────────────► Negotiating ──ack / first data──► Established
//!       ▲                                 ▲                               │
//!       └────────── reset ────────────────┴──────── new hello ◄───────────┘
//!                                                                         │
//!                  bad signature / bad ciphertext (from any state) ──► Faulted
//! ```
//!
//! The coder never touches the transport. It turns plaintext into
//! [`WireMessage`]s and back, and tracks sequence numbers so replays are
//! dropped and gaps are reported to the engine.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use sos_core::{AgreementPublicKey, DeviceIdentity, PeerId, PeerKeys};

use crate::crypto::{HandshakeSecret, Nonce, Role, SessionId, SessionKeys};
use crate::error::{CoderError, Result};
use crate::message::{ack_transcript, data_aad, hello_transcript, WireMessage};

/// Coarse coder state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoderState {
    Uninitialized,
    Negotiating,
    Established,
    Faulted,
}

/// What happened to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoderOutcome {
    /// A payload for the engine. `gap` means earlier messages were skipped.
    Decoded { plaintext: Vec<u8>, seq: u64, gap: bool },
    /// A protocol-internal message was consumed; send `reply` if present.
    Handled { reply: Option<WireMessage> },
    /// Already seen; nothing changed.
    Duplicate,
}

/// A message ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub message: WireMessage,
    /// Sequence number for data messages, `None` for handshake messages.
    pub seq: Option<u64>,
}

#[derive(Clone)]
struct Handshake {
    secret: HandshakeSecret,
    /// Acceptor only: the reply to re-send for a duplicate hello.
    reply: Option<WireMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Session {
    id: SessionId,
    keys: SessionKeys,
    initiator_ephemeral: AgreementPublicKey,
}

/// Per-peer encrypt/decrypt and sequence-tracking state.
pub struct PeerCoder {
    local: PeerId,
    peer: PeerId,
    peer_keys: PeerKeys,
    state: CoderState,
    role: Option<Role>,
    handshake: Option<Handshake>,
    session: Option<Session>,
    /// Highest sequence number sent.
    seq_hi: u64,
    /// Lowest sequence number not yet acknowledged by the peer.
    seq_lo: u64,
    /// Highest sequence number accepted from the peer.
    last_accepted: u64,
    /// Counter carried by our most recent hello.
    hello_counter: u64,
    /// Counter of the last hello we accepted from the peer.
    peer_hello_counter: u64,
}

impl PeerCoder {
    /// Create an uninitialized coder for `peer`.
    pub fn new(local: PeerId, peer: PeerId, peer_keys: PeerKeys) -> Self {
        Self {
            local,
            peer,
            peer_keys,
            state: CoderState::Uninitialized,
            role: None,
            handshake: None,
            session: None,
            seq_hi: 0,
            seq_lo: 1,
            last_accepted: 0,
            hello_counter: 0,
            peer_hello_counter: 0,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn state(&self) -> CoderState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn is_established(&self) -> bool {
        self.state == CoderState::Established
    }

    /// Identifier of the current (possibly pending) session.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn seq_hi(&self) -> u64 {
        self.seq_hi
    }

    pub fn seq_lo(&self) -> u64 {
        self.seq_lo
    }

    pub fn last_accepted(&self) -> u64 {
        self.last_accepted
    }

    /// Discard all session state; the next send starts a new handshake.
    /// Hello counters are kept.
    pub fn reset(&mut self) {
        debug!(peer = %self.peer, from = ?self.state, "resetting coder");
        self.state = CoderState::Uninitialized;
        self.role = None;
        self.handshake = None;
        self.session = None;
        self.reset_sequences();
    }

    fn reset_sequences(&mut self) {
        self.seq_hi = 0;
        self.seq_lo = 1;
        self.last_accepted = 0;
    }

    fn fault(&mut self, error: CoderError) -> CoderError {
        warn!(peer = %self.peer, %error, "coder faulted");
        self.state = CoderState::Faulted;
        error
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sending
    // ─────────────────────────────────────────────────────────────────────────

    /// Produce the next wire message for `plaintext`, if any.
    ///
    /// `Ok(None)` is the normal "nothing to send" outcome: either there is no
    /// payload, or the coder is an acceptor waiting for the first data
    /// message. While negotiating as initiator the same hello is returned on
    /// every call. A faulted coder discards its session and starts over.
    pub fn send_message_if_needed(
        &mut self,
        identity: &DeviceIdentity,
        plaintext: Option<&[u8]>,
    ) -> Result<Option<OutgoingMessage>> {
        let Some(plaintext) = plaintext else {
            return Ok(None);
        };

        match self.state {
            CoderState::Uninitialized | CoderState::Faulted => {
                if self.state == CoderState::Faulted {
                    warn!(peer = %self.peer, "re-negotiating faulted session");
                }
                self.role = Some(Role::Initiator);
                self.handshake = Some(Handshake {
                    secret: HandshakeSecret::generate(),
                    reply: None,
                });
                self.session = None;
                self.reset_sequences();
                // Clock floor so a peer that outlived our persisted state still
                // sees the counter move forward.
                self.hello_counter = self.hello_counter.saturating_add(1).max(now_ms());
                self.state = CoderState::Negotiating;
                debug!(peer = %self.peer, counter = self.hello_counter, "starting handshake as initiator");
                self.hello(identity).map(Some)
            }
            CoderState::Negotiating => match self.role {
                Some(Role::Initiator) => self.hello(identity).map(Some),
                _ => Ok(None),
            },
            CoderState::Established => self.encrypt(plaintext).map(Some),
        }
    }

    fn hello(&self, identity: &DeviceIdentity) -> Result<OutgoingMessage> {
        let handshake = self.handshake.as_ref().ok_or(CoderError::Faulted)?;
        let ephemeral = handshake.secret.public_key();
        let counter = self.hello_counter;
        let signature = identity.sign(&hello_transcript(&self.local, &self.peer, counter, &ephemeral));
        Ok(OutgoingMessage {
            message: WireMessage::Hello {
                from: self.local.clone(),
                to: self.peer.clone(),
                counter,
                ephemeral,
                signature,
            },
            seq: None,
        })
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<OutgoingMessage> {
        let session = self.session.as_ref().ok_or(CoderError::UnknownSession)?;
        let seq = self.seq_hi.checked_add(1).ok_or(CoderError::SequenceOverflow)?;
        let ack = self.last_accepted;
        let nonce = Nonce::generate();
        let aad = data_aad(&self.local, &self.peer, &session.id, seq, ack);
        let ciphertext = session.keys.send.encrypt(plaintext, &nonce, &aad)?;

        let message = WireMessage::Data {
            from: self.local.clone(),
            to: self.peer.clone(),
            session: session.id,
            seq,
            ack,
            nonce,
            ciphertext: ciphertext.into(),
        };
        self.seq_hi = seq;
        Ok(OutgoingMessage {
            message,
            seq: Some(seq),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Receiving
    // ─────────────────────────────────────────────────────────────────────────

    /// Process an inbound message from the peer.
    ///
    /// Authentication failures fault the coder and return an error; nothing
    /// is changed by a message that fails to decode.
    pub fn handle_message(
        &mut self,
        identity: &DeviceIdentity,
        message: &WireMessage,
    ) -> Result<CoderOutcome> {
        if message.from() != &self.peer || message.to() != &self.local {
            return Err(CoderError::Misaddressed {
                from: message.from().clone(),
                to: message.to().clone(),
            });
        }

        match message {
            WireMessage::Hello {
                counter,
                ephemeral,
                signature,
                ..
            } => {
                let transcript = hello_transcript(&self.peer, &self.local, *counter, ephemeral);
                if self.peer_keys.signing.verify(&transcript, signature).is_err() {
                    return Err(self.fault(CoderError::BadSignature(self.peer.clone())));
                }
                self.handle_hello(identity, *counter, ephemeral)
            }
            WireMessage::HelloAck {
                initiator_ephemeral,
                ephemeral,
                signature,
                ..
            } => self.handle_ack(identity, initiator_ephemeral, ephemeral, signature),
            WireMessage::Data {
                session,
                seq,
                ack,
                nonce,
                ciphertext,
                ..
            } => self.handle_data(session, *seq, *ack, nonce, ciphertext),
        }
    }

    fn handle_hello(
        &mut self,
        identity: &DeviceIdentity,
        counter: u64,
        ephemeral: &AgreementPublicKey,
    ) -> Result<CoderOutcome> {
        // Same hello we already answered.
        if self.role == Some(Role::Acceptor) {
            if let Some(session) = &self.session {
                if &session.initiator_ephemeral == ephemeral {
                    return match (self.state, &self.handshake) {
                        (CoderState::Negotiating, Some(handshake)) => Ok(CoderOutcome::Handled {
                            reply: handshake.reply.clone(),
                        }),
                        _ => Ok(CoderOutcome::Duplicate),
                    };
                }
            }
        }

        // A replayed older hello must not replace the current session.
        if counter <= self.peer_hello_counter {
            debug!(peer = %self.peer, counter, last = self.peer_hello_counter, "refusing stale hello");
            return Err(CoderError::StaleHello {
                counter,
                last: self.peer_hello_counter,
            });
        }

        // Both sides opened at once: the smaller id stays initiator.
        if self.state == CoderState::Negotiating
            && self.role == Some(Role::Initiator)
            && self.local < self.peer
        {
            debug!(peer = %self.peer, "simultaneous open, keeping initiator role");
            return Ok(CoderOutcome::Handled { reply: None });
        }

        let secret = HandshakeSecret::generate();
        let own = secret.public_key();
        let id = SessionId::derive(ephemeral, &own);
        let ikm = input_keying_material(&secret, ephemeral, identity, &self.peer_keys);
        let signature = identity.sign(&ack_transcript(&self.local, &self.peer, ephemeral, &own));
        let reply = WireMessage::HelloAck {
            from: self.local.clone(),
            to: self.peer.clone(),
            initiator_ephemeral: *ephemeral,
            ephemeral: own,
            signature,
        };

        debug!(peer = %self.peer, from = ?self.state, session = ?id, "accepting handshake");
        self.session = Some(Session {
            id,
            keys: SessionKeys::derive(Role::Acceptor, &ikm, &id),
            initiator_ephemeral: *ephemeral,
        });
        self.handshake = Some(Handshake {
            secret,
            reply: Some(reply.clone()),
        });
        self.role = Some(Role::Acceptor);
        self.state = CoderState::Negotiating;
        self.peer_hello_counter = counter;
        self.reset_sequences();
        Ok(CoderOutcome::Handled { reply: Some(reply) })
    }

    fn handle_ack(
        &mut self,
        identity: &DeviceIdentity,
        initiator_ephemeral: &AgreementPublicKey,
        ephemeral: &AgreementPublicKey,
        signature: &sos_core::Signature,
    ) -> Result<CoderOutcome> {
        if self.state == CoderState::Faulted {
            return Err(CoderError::Faulted);
        }

        let id = SessionId::derive(initiator_ephemeral, ephemeral);
        if self.state == CoderState::Established && self.session_id() == Some(id) {
            return Ok(CoderOutcome::Duplicate);
        }

        let secret = match (&self.state, self.role, &self.handshake) {
            (CoderState::Negotiating, Some(Role::Initiator), Some(handshake))
                if &handshake.secret.public_key() == initiator_ephemeral =>
            {
                handshake.secret.clone()
            }
            _ => return Err(CoderError::HandshakeMismatch),
        };

        let transcript = ack_transcript(&self.peer, &self.local, initiator_ephemeral, ephemeral);
        if self.peer_keys.signing.verify(&transcript, signature).is_err() {
            return Err(self.fault(CoderError::BadSignature(self.peer.clone())));
        }

        let ikm = input_keying_material(&secret, ephemeral, identity, &self.peer_keys);
        debug!(peer = %self.peer, session = ?id, "handshake complete as initiator");
        self.session = Some(Session {
            id,
            keys: SessionKeys::derive(Role::Initiator, &ikm, &id),
            initiator_ephemeral: *initiator_ephemeral,
        });
        self.handshake = None;
        self.state = CoderState::Established;
        self.reset_sequences();
        Ok(CoderOutcome::Handled { reply: None })
    }

    fn handle_data(
        &mut self,
        session_id: &SessionId,
        seq: u64,
        ack: u64,
        nonce: &Nonce,
        ciphertext: &[u8],
    ) -> Result<CoderOutcome> {
        if self.state == CoderState::Faulted {
            return Err(CoderError::Faulted);
        }
        let session = match &self.session {
            Some(session) if &session.id == session_id => session,
            _ => return Err(CoderError::UnknownSession),
        };
        if seq <= self.last_accepted {
            debug!(peer = %self.peer, seq, last = self.last_accepted, "dropping duplicate");
            return Ok(CoderOutcome::Duplicate);
        }

        let aad = data_aad(&self.peer, &self.local, session_id, seq, ack);
        let plaintext = match session.keys.recv.decrypt(ciphertext, nonce, &aad) {
            Ok(plaintext) => plaintext,
            Err(e) => return Err(self.fault(e)),
        };

        let gap = seq > self.last_accepted + 1;
        if gap {
            debug!(peer = %self.peer, seq, last = self.last_accepted, "sequence gap");
        }
        self.last_accepted = seq;
        if ack < self.seq_hi.saturating_add(1) {
            self.seq_lo = self.seq_lo.max(ack + 1);
        }
        if self.state == CoderState::Negotiating {
            debug!(peer = %self.peer, "handshake complete as acceptor");
            self.state = CoderState::Established;
            self.handshake = None;
        }
        Ok(CoderOutcome::Decoded { plaintext, seq, gap })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────────

    /// Capture everything needed to resume after a restart.
    pub fn snapshot(&self) -> CoderSnapshot {
        CoderSnapshot {
            state: self.state,
            role: self.role,
            handshake_secret: self.handshake.as_ref().map(|h| h.secret.to_bytes()),
            handshake_reply: self.handshake.as_ref().and_then(|h| h.reply.clone()),
            session: self.session.clone().map(|s| SessionSnapshot {
                id: s.id,
                keys: s.keys,
                initiator_ephemeral: s.initiator_ephemeral,
            }),
            seq_hi: self.seq_hi,
            seq_lo: self.seq_lo,
            last_accepted: self.last_accepted,
            hello_counter: self.hello_counter,
            peer_hello_counter: self.peer_hello_counter,
        }
    }

    /// Rebuild a coder from a snapshot.
    pub fn from_snapshot(local: PeerId, peer: PeerId, peer_keys: PeerKeys, snapshot: CoderSnapshot) -> Self {
        Self {
            local,
            peer,
            peer_keys,
            state: snapshot.state,
            role: snapshot.role,
            handshake: snapshot.handshake_secret.map(|bytes| Handshake {
                secret: HandshakeSecret::from_bytes(bytes),
                reply: snapshot.handshake_reply,
            }),
            session: snapshot.session.map(|s| Session {
                id: s.id,
                keys: s.keys,
                initiator_ephemeral: s.initiator_ephemeral,
            }),
            seq_hi: snapshot.seq_hi,
            seq_lo: snapshot.seq_lo,
            last_accepted: snapshot.last_accepted,
            hello_counter: snapshot.hello_counter,
            peer_hello_counter: snapshot.peer_hello_counter,
        }
    }
}

impl std::fmt::Debug for PeerCoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerCoder")
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("role", &self.role)
            .field("session", &self.session_id())
            .field("seq_hi", &self.seq_hi)
            .field("seq_lo", &self.seq_lo)
            .field("last_accepted", &self.last_accepted)
            .finish()
    }
}

/// `DH(eph, peer_eph) || DH(static, peer_static)`.
fn input_keying_material(
    secret: &HandshakeSecret,
    peer_ephemeral: &AgreementPublicKey,
    identity: &DeviceIdentity,
    peer_keys: &PeerKeys,
) -> [u8; 64] {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(&secret.diffie_hellman(peer_ephemeral));
    ikm[32..].copy_from_slice(&identity.agree(&peer_keys.agreement));
    ikm
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Persisted session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub keys: SessionKeys,
    pub initiator_ephemeral: AgreementPublicKey,
}

/// Persisted coder state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoderSnapshot {
    pub state: CoderState,
    pub role: Option<Role>,
    pub handshake_secret: Option<[u8; 32]>,
    pub handshake_reply: Option<WireMessage>,
    pub session: Option<SessionSnapshot>,
    pub seq_hi: u64,
    pub seq_lo: u64,
    pub last_accepted: u64,
    #[serde(default)]
    pub hello_counter: u64,
    #[serde(default)]
    pub peer_hello_counter: u64,
}
