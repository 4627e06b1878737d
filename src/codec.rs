//! Codec Engine Module
//!
//! This module seals plaintext objects into encrypted, erasure-coded shard
//! groups and recovers plaintext from any `k` surviving shards per chunk.
//! It has no knowledge of peers or the network: all placement and bookkeeping
//! happens in other modules on top of the `SealedObject` it produces.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use reed_solomon_erasure::galois_8::ReedSolomon;
use reed_solomon_erasure::Error as ReedSolomonError;
use serde::de::Error as SerdeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of the per-bundle key-derivation salt in bytes
pub const SALT_LEN: usize = 16;

/// Length of the per-chunk AES-GCM nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of the AES-GCM authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Length of the derived symmetric key in bytes (AES-256)
pub const KEY_LEN: usize = 32;

/// Default PBKDF2-HMAC-SHA256 iteration count for passphrase key derivation
pub const DEFAULT_KDF_ITERATIONS: u32 = 600_000;

/// Errors that can occur during sealing and unsealing operations
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid seal profile: {reason}")]
    InvalidProfile { reason: String },

    #[error("Malformed encoding: {reason}")]
    Format { reason: String },

    #[error("Authentication failed: wrong passphrase or tampered ciphertext")]
    Authentication,

    #[error("Insufficient shards for recovery: need {needed}, have {available}")]
    Integrity { needed: usize, available: usize },

    #[error("Reed-Solomon error: {0}")]
    ReedSolomon(#[from] ReedSolomonError),
}

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Content identifier: SHA-256 over sealed bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid([u8; 32]);

impl Cid {
    /// Compute the CID of a byte payload
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Cid(hasher.finalize().into())
    }

    /// Wrap a precomputed digest
    pub fn from_raw(digest: [u8; 32]) -> Self {
        Cid(digest)
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Cid {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|_| CodecError::Format {
            reason: format!("invalid cid encoding: {}", s),
        })?;
        let digest: [u8; 32] = raw.try_into().map_err(|_| CodecError::Format {
            reason: "cid must be 32 bytes".to_string(),
        })?;
        Ok(Cid(digest))
    }
}

impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Profile selecting chunk size and erasure ratios for a sealing operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealProfile {
    /// Plaintext bytes per chunk before sealing
    pub chunk_size: usize,
    /// Number of data shards per chunk (k)
    pub data_shards: usize,
    /// Number of parity shards per chunk (m)
    pub parity_shards: usize,
    /// PBKDF2 iteration count; recorded in the sealed output so recovery
    /// uses the same work factor
    pub kdf_iterations: u32,
}

impl SealProfile {
    /// Create a new seal profile
    ///
    /// A parity-less profile (`m = 0`) is the degenerate single-shard mode
    /// and is only valid with `k = 1`; it flows through the same seal and
    /// recovery paths as the general case.
    pub fn new(chunk_size: usize, data_shards: usize, parity_shards: usize) -> CodecResult<Self> {
        if data_shards == 0 {
            return Err(CodecError::InvalidProfile {
                reason: "data_shards must be greater than 0".to_string(),
            });
        }

        if parity_shards == 0 && data_shards != 1 {
            return Err(CodecError::InvalidProfile {
                reason: "parity-less mode requires exactly one data shard".to_string(),
            });
        }

        if data_shards + parity_shards > 255 {
            return Err(CodecError::InvalidProfile {
                reason: format!(
                    "total shards ({}) cannot exceed 255",
                    data_shards + parity_shards
                ),
            });
        }

        if chunk_size == 0 {
            return Err(CodecError::InvalidProfile {
                reason: "chunk_size must be greater than 0".to_string(),
            });
        }

        Ok(SealProfile {
            chunk_size,
            data_shards,
            parity_shards,
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
        })
    }

    /// Override the key-derivation work factor
    pub fn with_kdf_iterations(mut self, iterations: u32) -> CodecResult<Self> {
        if iterations == 0 {
            return Err(CodecError::InvalidProfile {
                reason: "kdf_iterations must be greater than 0".to_string(),
            });
        }
        self.kdf_iterations = iterations;
        Ok(self)
    }

    /// Get total number of shards per chunk (data + parity)
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Shard size for a sealed payload of the given length
    pub fn shard_size(&self, sealed_len: usize) -> usize {
        sealed_len.div_ceil(self.data_shards)
    }

    /// Common profile presets
    pub fn preset_4_2() -> CodecResult<Self> {
        Self::new(1024 * 1024, 4, 2) // 1MB chunks, 4+2 encoding
    }

    pub fn preset_10_5() -> CodecResult<Self> {
        Self::new(4 * 1024 * 1024, 10, 5) // 4MB chunks, 10+5 encoding
    }

    /// Single-shard profile: one data shard holding the entire sealed chunk
    pub fn single(chunk_size: usize) -> CodecResult<Self> {
        Self::new(chunk_size, 1, 0)
    }
}

/// One sealed, erasure-coded shard of a chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedShard {
    /// Index of the chunk this shard belongs to
    pub chunk_index: u64,
    /// Index of this shard within the chunk's erasure group (0..k+m)
    pub shard_index: u8,
    /// Hash of this shard's own sealed bytes
    pub cid: Cid,
    /// Length of the chunk's sealed payload before erasure padding
    pub payload_len: u64,
    /// Data shard count of the erasure group
    pub data_shards: u8,
    /// Parity shard count of the erasure group
    pub parity_shards: u8,
    /// Sealed shard bytes
    pub bytes: Vec<u8>,
}

/// Output of a sealing operation: the full shard group for one object
#[derive(Debug, Clone)]
pub struct SealedObject {
    /// Content fingerprint over the ordered sealed chunk payloads
    pub object_cid: Cid,
    /// Key-derivation salt, reused for every chunk of this object
    pub salt: [u8; SALT_LEN],
    /// PBKDF2 iteration count used for this object's key
    pub kdf_iterations: u32,
    /// Logical plaintext size in bytes
    pub total_bytes: u64,
    /// Number of chunks (always at least 1, even for an empty object)
    pub chunk_count: u64,
    /// All shards, ordered by chunk index then shard index
    pub shards: Vec<SealedShard>,
}

/// Derive a 256-bit key from a passphrase and salt
pub fn derive_key(passphrase: &str, salt: &[u8], iterations: u32) -> CodecResult<[u8; KEY_LEN]> {
    if salt.len() != SALT_LEN {
        return Err(CodecError::Format {
            reason: format!("salt must be {} bytes, got {}", SALT_LEN, salt.len()),
        });
    }

    if iterations == 0 {
        return Err(CodecError::Format {
            reason: "kdf iteration count must be greater than 0".to_string(),
        });
    }

    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut key);
    Ok(key)
}

/// Seal one chunk with a caller-supplied nonce
///
/// Deterministic: the same key, nonce, and plaintext always produce the same
/// sealed bytes. Callers outside of reproducibility checks should prefer
/// [`seal_chunk`], which draws a fresh random nonce.
pub fn seal_chunk_with_nonce(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> CodecResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CodecError::Format {
        reason: "invalid key length".to_string(),
    })?;

    let ciphertext = cipher
        .encrypt(&Nonce::from(*nonce), plaintext)
        .map_err(|_| CodecError::Format {
            reason: "encryption failed".to_string(),
        })?;

    // Sealed payload layout: nonce || ciphertext (tag included by AES-GCM)
    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Seal one chunk with a fresh random nonce
pub fn seal_chunk(key: &[u8; KEY_LEN], plaintext: &[u8]) -> CodecResult<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    seal_chunk_with_nonce(key, &nonce, plaintext)
}

/// Authenticate and decrypt one sealed chunk payload
pub fn open_chunk(key: &[u8; KEY_LEN], sealed: &[u8]) -> CodecResult<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CodecError::Format {
            reason: format!(
                "sealed payload too short: {} bytes, need at least {}",
                sealed.len(),
                NONCE_LEN + TAG_LEN
            ),
        });
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CodecError::Format {
        reason: "invalid key length".to_string(),
    })?;

    let nonce_bytes: [u8; NONCE_LEN] = sealed[..NONCE_LEN]
        .try_into()
        .expect("slice length checked above");

    cipher
        .decrypt(&Nonce::from(nonce_bytes), &sealed[NONCE_LEN..])
        .map_err(|_| CodecError::Authentication)
}

/// Split a sealed chunk payload into k data shards plus m parity shards
pub fn split_shards(sealed: &[u8], profile: &SealProfile) -> CodecResult<Vec<Vec<u8>>> {
    if profile.parity_shards == 0 {
        // Degenerate 1/0 group: the single shard is the sealed payload itself
        return Ok(vec![sealed.to_vec()]);
    }

    let shard_size = profile.shard_size(sealed.len());
    let padded_size = shard_size * profile.data_shards;

    let rs = ReedSolomon::new(profile.data_shards, profile.parity_shards)?;

    let mut padded = sealed.to_vec();
    padded.resize(padded_size, 0);

    let mut shards: Vec<Vec<u8>> = Vec::with_capacity(profile.total_shards());
    for i in 0..profile.data_shards {
        let start = i * shard_size;
        shards.push(padded[start..start + shard_size].to_vec());
    }
    for _ in 0..profile.parity_shards {
        shards.push(vec![0u8; shard_size]);
    }

    rs.encode(&mut shards)?;
    Ok(shards)
}

/// Reconstruct a sealed chunk payload from any k available shards
///
/// `slots` must have one entry per shard index (missing shards as `None`);
/// `sealed_len` is the chunk's sealed payload length before erasure padding.
pub fn join_shards(
    slots: &[Option<Vec<u8>>],
    profile: &SealProfile,
    sealed_len: usize,
) -> CodecResult<Vec<u8>> {
    if slots.len() != profile.total_shards() {
        return Err(CodecError::Format {
            reason: format!(
                "shard slots ({}) don't match erasure group size ({})",
                slots.len(),
                profile.total_shards()
            ),
        });
    }

    let available = slots.iter().filter(|slot| slot.is_some()).count();
    if available < profile.data_shards {
        return Err(CodecError::Integrity {
            needed: profile.data_shards,
            available,
        });
    }

    if profile.parity_shards == 0 {
        // Single-shard group: the one slot is the whole sealed payload
        let shard = slots[0].as_ref().expect("availability checked above");
        if shard.len() < sealed_len {
            return Err(CodecError::Format {
                reason: format!(
                    "shard length ({}) shorter than sealed payload ({})",
                    shard.len(),
                    sealed_len
                ),
            });
        }
        return Ok(shard[..sealed_len].to_vec());
    }

    let shard_size = profile.shard_size(sealed_len);
    for shard in slots.iter().flatten() {
        if shard.len() != shard_size {
            return Err(CodecError::Format {
                reason: format!(
                    "shard size mismatch: expected {}, got {}",
                    shard_size,
                    shard.len()
                ),
            });
        }
    }

    let rs = ReedSolomon::new(profile.data_shards, profile.parity_shards)?;
    let mut shards: Vec<Option<Vec<u8>>> = slots.to_vec();
    rs.reconstruct(&mut shards)?;

    let mut sealed = Vec::with_capacity(shard_size * profile.data_shards);
    for shard in shards.iter().take(profile.data_shards) {
        match shard {
            Some(bytes) => sealed.extend_from_slice(bytes),
            None => {
                return Err(CodecError::Format {
                    reason: "reconstruction left a data shard empty".to_string(),
                })
            }
        }
    }

    if sealed_len > sealed.len() {
        return Err(CodecError::Format {
            reason: format!(
                "sealed length ({}) exceeds reconstructed data ({})",
                sealed_len,
                sealed.len()
            ),
        });
    }

    sealed.truncate(sealed_len);
    Ok(sealed)
}

/// Seal an object into its full shard group
///
/// An empty input produces exactly one zero-length chunk so the object always
/// has at least one addressable shard.
pub fn seal_object(
    plaintext: &[u8],
    passphrase: &str,
    profile: &SealProfile,
) -> CodecResult<SealedObject> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let key = derive_key(passphrase, &salt, profile.kdf_iterations)?;

    let chunk_count = if plaintext.is_empty() {
        1
    } else {
        plaintext.len().div_ceil(profile.chunk_size)
    };

    let mut object_hasher = Sha256::new();
    let mut shards = Vec::with_capacity(chunk_count * profile.total_shards());

    for chunk_index in 0..chunk_count {
        let start = chunk_index * profile.chunk_size;
        let end = (start + profile.chunk_size).min(plaintext.len());
        let chunk = &plaintext[start..end];

        let sealed = seal_chunk(&key, chunk)?;
        object_hasher.update(&sealed);

        let sealed_len = sealed.len() as u64;
        for (shard_index, bytes) in split_shards(&sealed, profile)?.into_iter().enumerate() {
            shards.push(SealedShard {
                chunk_index: chunk_index as u64,
                shard_index: shard_index as u8,
                cid: Cid::of(&bytes),
                payload_len: sealed_len,
                data_shards: profile.data_shards as u8,
                parity_shards: profile.parity_shards as u8,
                bytes,
            });
        }
    }

    Ok(SealedObject {
        object_cid: Cid::from_raw(object_hasher.finalize().into()),
        salt,
        kdf_iterations: profile.kdf_iterations,
        total_bytes: plaintext.len() as u64,
        chunk_count: chunk_count as u64,
        shards,
    })
}

/// Recover plaintext from any k shards per chunk
///
/// Shards are grouped by chunk index and sorted by shard index; when the same
/// shard index appears more than once, the first occurrence wins.
pub fn open_shards(
    salt: &[u8],
    kdf_iterations: u32,
    shards: &[SealedShard],
    passphrase: &str,
    chunk_count: u64,
) -> CodecResult<Vec<u8>> {
    let key = derive_key(passphrase, salt, kdf_iterations)?;

    let mut by_chunk: BTreeMap<u64, Vec<&SealedShard>> = BTreeMap::new();
    for shard in shards {
        by_chunk.entry(shard.chunk_index).or_default().push(shard);
    }

    let mut plaintext = Vec::new();
    for chunk_index in 0..chunk_count {
        let mut chunk_shards = by_chunk.remove(&chunk_index).unwrap_or_default();
        chunk_shards.sort_by_key(|shard| shard.shard_index);

        let first = chunk_shards.first().ok_or(CodecError::Integrity {
            needed: 1,
            available: 0,
        })?;

        let profile = SealProfile::new(
            1, // chunk size is irrelevant for recovery
            first.data_shards as usize,
            first.parity_shards as usize,
        )?;
        let sealed_len = first.payload_len as usize;

        let mut slots: Vec<Option<Vec<u8>>> = vec![None; profile.total_shards()];
        for shard in &chunk_shards {
            if shard.data_shards != first.data_shards
                || shard.parity_shards != first.parity_shards
                || shard.payload_len != first.payload_len
            {
                return Err(CodecError::Format {
                    reason: format!(
                        "inconsistent erasure group parameters in chunk {}",
                        chunk_index
                    ),
                });
            }
            let index = shard.shard_index as usize;
            if index >= slots.len() {
                return Err(CodecError::Format {
                    reason: format!(
                        "shard index {} out of range for group of {}",
                        index,
                        slots.len()
                    ),
                });
            }
            // First-available-wins on duplicate shard indexes
            if slots[index].is_none() {
                slots[index] = Some(shard.bytes.clone());
            }
        }

        let sealed = join_shards(&slots, &profile, sealed_len)?;
        plaintext.extend_from_slice(&open_chunk(&key, &sealed)?);
    }

    Ok(plaintext)
}
