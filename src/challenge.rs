//! Challenge Protocol Engine
//!
//! This module drives the residency challenge lifecycle: issue a nonce
//! challenge against one replica assignment, verify the peer's signed
//! response, and append evidence for every verified proof. The engine is
//! deliberately clock-injected: every operation has an `_at` variant taking
//! an explicit timestamp, with wall-clock wrappers on top, so expiry
//! behavior is testable without sleeping.
//!
//! Verification outcomes are recorded, not thrown: a wrong response hash or
//! a bad signature resolves the challenge to `failed` and returns a normal
//! outcome value. Errors are reserved for protocol misuse such as responding
//! to an unknown or already-resolved challenge.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::Cid;
use crate::registry::{
    ChallengeRecord, ChallengeStatus, EvidenceRecord, RegistryError, ResidencyRegistry,
};

/// Random challenge payload length in bytes
pub const CHALLENGE_PAYLOAD_LEN: usize = 32;

/// Nonce length for challenges
pub const NONCE_LEN: usize = 16;

/// Default response deadline
pub const DEFAULT_CHALLENGE_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors that can occur during challenge operations
#[derive(Error, Debug)]
pub enum ChallengeError {
    #[error("Challenge not found: {challenge_id}")]
    NotFound { challenge_id: Uuid },

    #[error("Challenge expired: {challenge_id}")]
    Expired { challenge_id: Uuid },

    #[error("Challenge already resolved: {challenge_id} is {status}")]
    AlreadyResolved {
        challenge_id: Uuid,
        status: ChallengeStatus,
    },

    #[error("No assignment for object {object_cid} shard {shard_index} on peer {peer_id}")]
    AssignmentMissing {
        object_cid: Cid,
        shard_index: u32,
        peer_id: String,
    },

    #[error("Challenge payload does not match assigned shard {expected}")]
    PayloadMismatch { expected: Cid },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Result type for challenge operations
pub type ChallengeResult<T> = Result<T, ChallengeError>;

/// A peer's answer to one challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeResponse {
    /// Hash the peer computed over the challenge round and its stored shard
    pub response_hash: Vec<u8>,
    /// Ed25519 signature over the response hash
    pub signature: Vec<u8>,
    /// Key the peer claims to have signed with
    pub public_key: Vec<u8>,
    /// Peer-observed time of proof computation
    pub proof_timestamp: SystemTime,
}

/// Terminal outcome of a submitted response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeOutcome {
    /// Response checked out; evidence appended
    Verified(EvidenceRecord),
    /// Response was invalid; the failure is on the ledger
    Failed { reason: String },
}

/// Challenge engine tuning
#[derive(Debug, Clone)]
pub struct ChallengeConfig {
    /// How long a peer has to answer before the challenge expires
    pub timeout: Duration,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CHALLENGE_TIMEOUT,
        }
    }
}

/// The hash a peer must produce to prove shard possession
///
/// Binds the round's fresh challenge bytes and nonce to the full shard bytes
/// and the shard CID. The random inputs differ every round, so a captured old
/// response cannot satisfy a later challenge, and a peer holding only the CID
/// cannot answer.
pub fn expected_response_hash(
    challenge_bytes: &[u8],
    nonce: &[u8],
    shard_bytes: &[u8],
    shard_cid: &Cid,
) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(challenge_bytes);
    hasher.update(nonce);
    hasher.update(shard_bytes);
    hasher.update(shard_cid.as_bytes());
    hasher.finalize().to_vec()
}

/// Anything that can answer a challenge on behalf of a peer
pub trait ChallengeResponder {
    /// Produce a response, or None when the shard is not held
    fn respond(&self, challenge: &ChallengeRecord, now: SystemTime) -> Option<ChallengeResponse>;
}

/// In-process responder holding shards in memory
///
/// Answers from its own stored bytes, so a response is only correct when the
/// bytes are physically present and intact. Used by peer simulations and
/// tests.
pub struct MemoryResponder {
    shards: HashMap<Cid, Vec<u8>>,
    signing_key: SigningKey,
}

impl MemoryResponder {
    pub fn new(signing_key: SigningKey) -> Self {
        Self {
            shards: HashMap::new(),
            signing_key,
        }
    }

    /// Generate a responder with a fresh signing key
    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut OsRng))
    }

    /// Hex encoding of the responder's verifying key, for node registration
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Store a shard; returns its CID
    pub fn store(&mut self, bytes: Vec<u8>) -> Cid {
        let cid = Cid::of(&bytes);
        self.shards.insert(cid, bytes);
        cid
    }

    /// Drop a shard (simulates data loss)
    pub fn evict(&mut self, cid: &Cid) -> bool {
        self.shards.remove(cid).is_some()
    }
}

impl ChallengeResponder for MemoryResponder {
    fn respond(&self, challenge: &ChallengeRecord, now: SystemTime) -> Option<ChallengeResponse> {
        let bytes = self.shards.get(&challenge.shard_cid)?;

        // Recompute the CID from the bytes actually held rather than echoing
        // the challenge, so corrupted storage produces a wrong answer.
        let held_cid = Cid::of(bytes);
        let response_hash =
            expected_response_hash(&challenge.payload, &challenge.nonce, bytes, &held_cid);
        let signature = self.signing_key.sign(&response_hash);

        Some(ChallengeResponse {
            response_hash,
            signature: signature.to_bytes().to_vec(),
            public_key: self.signing_key.verifying_key().to_bytes().to_vec(),
            proof_timestamp: now,
        })
    }
}

/// Issues challenges, verifies responses, and appends evidence
pub struct ChallengeEngine<'a> {
    registry: &'a ResidencyRegistry,
    config: ChallengeConfig,
}

impl<'a> ChallengeEngine<'a> {
    pub fn new(registry: &'a ResidencyRegistry, config: ChallengeConfig) -> Self {
        Self { registry, config }
    }

    /// Issue a challenge against one replica assignment at wall-clock time
    pub fn issue(
        &self,
        object_cid: &Cid,
        shard_index: u32,
        peer_id: &str,
        shard_bytes: &[u8],
    ) -> ChallengeResult<ChallengeRecord> {
        self.issue_at(object_cid, shard_index, peer_id, shard_bytes, SystemTime::now())
    }

    /// Issue a challenge at an explicit timestamp
    ///
    /// Idempotent per assignment: while an unexpired pending challenge exists
    /// for the same (object, shard, peer) key, that challenge is returned
    /// instead of a new one. A stale pending challenge is expired first.
    pub fn issue_at(
        &self,
        object_cid: &Cid,
        shard_index: u32,
        peer_id: &str,
        shard_bytes: &[u8],
        now: SystemTime,
    ) -> ChallengeResult<ChallengeRecord> {
        let assignment = self
            .registry
            .get_assignment(object_cid, shard_index, peer_id)?
            .ok_or_else(|| ChallengeError::AssignmentMissing {
                object_cid: *object_cid,
                shard_index,
                peer_id: peer_id.to_string(),
            })?;

        if Cid::of(shard_bytes) != assignment.shard_cid {
            return Err(ChallengeError::PayloadMismatch {
                expected: assignment.shard_cid,
            });
        }

        if let Some(pending) = self
            .registry
            .pending_challenge(object_cid, shard_index, peer_id)?
        {
            if pending.expires_at > now {
                debug!(
                    "Reusing pending challenge {} for object {} shard {} peer {}",
                    pending.challenge_id, object_cid, shard_index, peer_id
                );
                return Ok(pending);
            }
            // Stale pending row: retire it before issuing a replacement
            self.registry.expire_challenge(pending.challenge_id)?;
        }

        let mut payload = vec![0u8; CHALLENGE_PAYLOAD_LEN];
        OsRng.fill_bytes(&mut payload);
        let mut nonce = vec![0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let expected_hash =
            expected_response_hash(&payload, &nonce, shard_bytes, &assignment.shard_cid);

        let challenge = ChallengeRecord {
            challenge_id: Uuid::new_v4(),
            object_cid: *object_cid,
            shard_index,
            peer_id: peer_id.to_string(),
            shard_cid: assignment.shard_cid,
            country_code: assignment.country_code.clone(),
            payload,
            nonce,
            expected_hash,
            status: ChallengeStatus::Pending,
            issued_at: now,
            expires_at: now + self.config.timeout,
            response_hash: None,
            signature: None,
            public_key: None,
            verified_at: None,
            failure_reason: None,
        };

        match self.registry.insert_challenge(&challenge) {
            Ok(()) => {}
            Err(RegistryError::DuplicatePending { .. }) => {
                // A concurrent issuer (possibly on another connection) won
                // the insert; its challenge is the one in flight
                if let Some(pending) = self
                    .registry
                    .pending_challenge(object_cid, shard_index, peer_id)?
                {
                    debug!(
                        "Lost issuance race for object {} shard {} peer {}; reusing challenge {}",
                        object_cid, shard_index, peer_id, pending.challenge_id
                    );
                    return Ok(pending);
                }
                // The winner resolved already; surface the collision
                return Err(ChallengeError::Registry(RegistryError::DuplicatePending {
                    object_cid: *object_cid,
                    shard_index,
                    peer_id: peer_id.to_string(),
                }));
            }
            Err(err) => return Err(err.into()),
        }
        info!(
            "Issued challenge {} for object {} shard {} peer {}",
            challenge.challenge_id, object_cid, shard_index, peer_id
        );
        Ok(challenge)
    }

    /// Submit a peer's response at wall-clock time
    pub fn submit(
        &self,
        challenge_id: Uuid,
        response: &ChallengeResponse,
    ) -> ChallengeResult<ChallengeOutcome> {
        self.submit_at(challenge_id, response, SystemTime::now())
    }

    /// Submit a peer's response at an explicit timestamp
    ///
    /// A late response never verifies: past the deadline the challenge is
    /// expired and the submission rejected, even when the hash is correct.
    pub fn submit_at(
        &self,
        challenge_id: Uuid,
        response: &ChallengeResponse,
        now: SystemTime,
    ) -> ChallengeResult<ChallengeOutcome> {
        let challenge = self
            .registry
            .find_challenge(challenge_id)?
            .ok_or(ChallengeError::NotFound { challenge_id })?;

        match challenge.status {
            ChallengeStatus::Pending => {}
            ChallengeStatus::Expired => return Err(ChallengeError::Expired { challenge_id }),
            status => {
                return Err(ChallengeError::AlreadyResolved {
                    challenge_id,
                    status,
                })
            }
        }

        if now >= challenge.expires_at {
            self.registry.expire_challenge(challenge_id)?;
            return Err(ChallengeError::Expired { challenge_id });
        }

        if let Some(reason) = self.check_response(&challenge, response)? {
            let recorded = self.registry.resolve_challenge(
                challenge_id,
                ChallengeStatus::Failed,
                &response.response_hash,
                &response.signature,
                &response.public_key,
                now,
                Some(&reason),
            )?;
            if !recorded {
                return self.lost_transition(challenge_id);
            }
            warn!(
                "Challenge {} failed for peer {}: {}",
                challenge_id, challenge.peer_id, reason
            );
            return Ok(ChallengeOutcome::Failed { reason });
        }

        let recorded = self.registry.resolve_challenge(
            challenge_id,
            ChallengeStatus::Verified,
            &response.response_hash,
            &response.signature,
            &response.public_key,
            now,
            None,
        )?;
        if !recorded {
            return self.lost_transition(challenge_id);
        }

        let evidence = EvidenceRecord {
            challenge_id,
            response_hash: response.response_hash.clone(),
            signature: response.signature.clone(),
            public_key: response.public_key.clone(),
            proof_timestamp: response.proof_timestamp,
            recorded_at: now,
        };
        self.registry.insert_evidence(&evidence)?;
        self.registry.mark_verified(challenge_id, now)?;

        info!(
            "Challenge {} verified for peer {} (object {} shard {})",
            challenge_id, challenge.peer_id, challenge.object_cid, challenge.shard_index
        );
        Ok(ChallengeOutcome::Verified(evidence))
    }

    /// Expire every overdue pending challenge at wall-clock time
    pub fn sweep(&self) -> ChallengeResult<usize> {
        self.sweep_at(SystemTime::now())
    }

    /// Expire every overdue pending challenge at an explicit timestamp
    pub fn sweep_at(&self, now: SystemTime) -> ChallengeResult<usize> {
        Ok(self.registry.sweep_expired(now)?)
    }

    /// Validate a response; Some(reason) means the response is wrong
    fn check_response(
        &self,
        challenge: &ChallengeRecord,
        response: &ChallengeResponse,
    ) -> ChallengeResult<Option<String>> {
        let hash_ok: bool = challenge
            .expected_hash
            .as_slice()
            .ct_eq(response.response_hash.as_slice())
            .into();
        if !hash_ok {
            return Ok(Some("response hash mismatch".to_string()));
        }

        // The signature must verify against the key registered for this
        // peer, not the key the response claims; the claimed key is still
        // recorded on the ledger for audit.
        let node = match self.registry.get_node(&challenge.peer_id) {
            Ok(node) => node,
            Err(RegistryError::NodeNotFound { .. }) => {
                return Ok(Some("responding peer is not registered".to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let registered_hex = match node.public_key {
            Some(hex) => hex,
            None => return Ok(Some("peer has no registered signing key".to_string())),
        };

        let key_bytes: [u8; 32] = match hex::decode(&registered_hex)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
        {
            Some(bytes) => bytes,
            None => return Ok(Some("registered signing key is malformed".to_string())),
        };
        let verifying_key = match VerifyingKey::from_bytes(&key_bytes) {
            Ok(key) => key,
            Err(_) => return Ok(Some("registered signing key is invalid".to_string())),
        };

        let sig_bytes: [u8; 64] = match response.signature.as_slice().try_into() {
            Ok(bytes) => bytes,
            Err(_) => return Ok(Some("signature is malformed".to_string())),
        };
        let signature = Signature::from_bytes(&sig_bytes);

        if verifying_key
            .verify(&response.response_hash, &signature)
            .is_err()
        {
            return Ok(Some("signature does not verify".to_string()));
        }

        Ok(None)
    }

    /// Map a lost compare-and-set to the state that beat us
    fn lost_transition(&self, challenge_id: Uuid) -> ChallengeResult<ChallengeOutcome> {
        let current = self
            .registry
            .find_challenge(challenge_id)?
            .ok_or(ChallengeError::NotFound { challenge_id })?;
        match current.status {
            ChallengeStatus::Expired => Err(ChallengeError::Expired { challenge_id }),
            status => Err(ChallengeError::AlreadyResolved {
                challenge_id,
                status,
            }),
        }
    }
}
