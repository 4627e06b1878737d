//! Bundle Assembler Module
//!
//! This module combines Codec Engine shard output with a Placement Engine
//! assignment per shard into the self-describing manifest handed to the
//! storage network. The manifest root binds the ordered shard CID list, so
//! any reordering or substitution of shards is detectable before they ever
//! reach a peer. Assembly is a pure transform: all randomness originates
//! upstream in the Codec Engine.

use crate::codec::{self, Cid, CodecError, SealProfile, SealedObject, SealedShard};
use crate::placement::{self, PeerCandidate, PlacementError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors that can occur during bundle assembly and verification
#[derive(Error, Debug)]
pub enum BundleError {
    #[error("Malformed bundle: {reason}")]
    Format { reason: String },

    #[error("Manifest root mismatch: expected {expected}, computed {computed}")]
    ManifestMismatch { expected: Cid, computed: Cid },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Placement error: {0}")]
    Placement(#[from] PlacementError),
}

/// Result type for bundle operations
pub type BundleResult<T> = Result<T, BundleError>;

/// One shard entry in a bundle manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRecord {
    /// Index of the chunk this shard belongs to
    pub chunk_index: u64,
    /// Index of this shard within the chunk's erasure group
    pub shard_index: u8,
    /// Hash of this shard's sealed bytes
    pub cid: Cid,
    /// Length of the chunk's sealed payload before erasure padding
    pub payload_len: u64,
    /// Data shard count of the erasure group
    pub data_shards: u8,
    /// Parity shard count of the erasure group
    pub parity_shards: u8,
    /// Peers assigned to host this shard, ordered by placement rank
    pub peers: Vec<String>,
    /// Sealed shard bytes
    pub sealed_bytes: Vec<u8>,
}

impl ShardRecord {
    fn from_sealed(shard: SealedShard, peers: Vec<String>) -> Self {
        Self {
            chunk_index: shard.chunk_index,
            shard_index: shard.shard_index,
            cid: shard.cid,
            payload_len: shard.payload_len,
            data_shards: shard.data_shards,
            parity_shards: shard.parity_shards,
            peers,
            sealed_bytes: shard.bytes,
        }
    }

    fn to_sealed(&self) -> SealedShard {
        SealedShard {
            chunk_index: self.chunk_index,
            shard_index: self.shard_index,
            cid: self.cid,
            payload_len: self.payload_len,
            data_shards: self.data_shards,
            parity_shards: self.parity_shards,
            bytes: self.sealed_bytes.clone(),
        }
    }
}

/// The prepared bundle: the upload contract handed to the storage network
///
/// Created once per upload and immutable thereafter; referenced by its
/// object CID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    /// Content fingerprint of the sealed object
    pub object_cid: Cid,
    /// Key-derivation salt, recorded once at the bundle level
    pub salt: Vec<u8>,
    /// Key-derivation work factor used when sealing
    pub kdf_iterations: u32,
    /// Binding hash over the ordered shard CID list
    pub manifest_root: Cid,
    /// Logical plaintext size in bytes
    pub total_bytes: u64,
    /// Number of chunks in the object
    pub chunk_count: u64,
    /// Ordered shard list (chunk index, then shard index)
    pub shards: Vec<ShardRecord>,
}

/// Compute the manifest root: hash over the ordered concatenation of all
/// shard CIDs
pub fn manifest_root(shards: &[ShardRecord]) -> Cid {
    let mut hasher = Sha256::new();
    for shard in shards {
        hasher.update(shard.cid.as_bytes());
    }
    Cid::from_raw(hasher.finalize().into())
}

/// Assemble a sealed object and a peer assignment per shard into a bundle
pub fn assemble(
    sealed: SealedObject,
    candidates: &[PeerCandidate],
    replica_factor: usize,
) -> BundleResult<Bundle> {
    let object_cid = sealed.object_cid;
    let salt = sealed.salt.to_vec();
    let kdf_iterations = sealed.kdf_iterations;
    let total_bytes = sealed.total_bytes;
    let chunk_count = sealed.chunk_count;

    let mut shards = Vec::with_capacity(sealed.shards.len());
    for shard in sealed.shards {
        let peers = placement::place(&shard.cid, candidates, replica_factor)?;
        shards.push(ShardRecord::from_sealed(shard, peers));
    }

    let root = manifest_root(&shards);

    Ok(Bundle {
        object_cid,
        salt,
        kdf_iterations,
        manifest_root: root,
        total_bytes,
        chunk_count,
        shards,
    })
}

/// Verify a bundle's internal consistency
///
/// Checks that every shard CID matches its sealed bytes and that the manifest
/// root binds the shard list as ordered. Detects reordering, substitution,
/// and truncation of the shard list.
pub fn verify_manifest(bundle: &Bundle) -> BundleResult<()> {
    if bundle.shards.is_empty() {
        return Err(BundleError::Format {
            reason: "bundle has no shards".to_string(),
        });
    }

    if bundle.salt.len() != codec::SALT_LEN {
        return Err(BundleError::Format {
            reason: format!(
                "salt must be {} bytes, got {}",
                codec::SALT_LEN,
                bundle.salt.len()
            ),
        });
    }

    for shard in &bundle.shards {
        let computed = Cid::of(&shard.sealed_bytes);
        if computed != shard.cid {
            return Err(BundleError::Format {
                reason: format!(
                    "shard {}/{} cid does not match its sealed bytes",
                    shard.chunk_index, shard.shard_index
                ),
            });
        }
    }

    let computed = manifest_root(&bundle.shards);
    if computed != bundle.manifest_root {
        return Err(BundleError::ManifestMismatch {
            expected: bundle.manifest_root,
            computed,
        });
    }

    Ok(())
}

/// Client-side pipeline: seal, place, and assemble in one call
pub fn prepare_bundle(
    plaintext: &[u8],
    passphrase: &str,
    profile: &SealProfile,
    candidates: &[PeerCandidate],
    replica_factor: usize,
) -> BundleResult<Bundle> {
    let sealed = codec::seal_object(plaintext, passphrase, profile)?;
    assemble(sealed, candidates, replica_factor)
}

/// Recover the plaintext from a bundle, using any k shards per chunk
pub fn open_bundle(bundle: &Bundle, passphrase: &str) -> BundleResult<Vec<u8>> {
    let shards: Vec<SealedShard> = bundle.shards.iter().map(ShardRecord::to_sealed).collect();
    let plaintext = codec::open_shards(
        &bundle.salt,
        bundle.kdf_iterations,
        &shards,
        passphrase,
        bundle.chunk_count,
    )?;
    Ok(plaintext)
}
