//! Placement Engine Module
//!
//! This module selects which peers host which shard replica. Selection is a
//! pure function of the shard CID and the candidate peer set: peers are ranked
//! by a combined hash of (shard CID, peer id) and the highest-ranked replicas
//! win, so re-running placement for the same shard and peer list always yields
//! the same assignment.

use crate::codec::Cid;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

/// A candidate storage peer, as supplied by the external peer directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCandidate {
    /// Stable peer identifier
    pub peer_id: String,
    /// Network address of the peer
    pub address: String,
    /// Jurisdiction/country code for data-residency reporting
    pub country_code: String,
    /// Whether the peer is currently accepting placements
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl PeerCandidate {
    /// Create a new active candidate
    pub fn new(peer_id: &str, address: &str, country_code: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            address: address.to_string(),
            country_code: country_code.to_string(),
            active: true,
        }
    }
}

/// Errors that can occur during replica placement
#[derive(Error, Debug)]
pub enum PlacementError {
    #[error("Invalid replica factor: requested {requested}, have {candidates} eligible peers")]
    InvalidReplicaFactor {
        requested: usize,
        candidates: usize,
    },
}

/// Result type for placement operations
pub type PlacementResult<T> = Result<T, PlacementError>;

/// Ranking score for one (shard, peer) pair
///
/// Pure function of its inputs with no hidden state.
pub fn placement_rank(shard_cid: &Cid, peer_id: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shard_cid.as_bytes());
    hasher.update(peer_id.as_bytes());
    hasher.finalize().into()
}

/// Deterministically select `replica_factor` distinct peers for a shard
///
/// Inactive candidates and duplicate peer ids are filtered before ranking.
/// The returned list is ordered by descending rank, so the result for a
/// smaller replica factor is always a prefix of the result for a larger one.
pub fn place(
    shard_cid: &Cid,
    candidates: &[PeerCandidate],
    replica_factor: usize,
) -> PlacementResult<Vec<String>> {
    let mut seen = HashSet::new();
    let eligible: Vec<&PeerCandidate> = candidates
        .iter()
        .filter(|peer| peer.active && seen.insert(peer.peer_id.as_str()))
        .collect();

    if replica_factor < 1 || replica_factor > eligible.len() {
        return Err(PlacementError::InvalidReplicaFactor {
            requested: replica_factor,
            candidates: eligible.len(),
        });
    }

    let mut ranked: Vec<([u8; 32], &str)> = eligible
        .iter()
        .map(|peer| (placement_rank(shard_cid, &peer.peer_id), peer.peer_id.as_str()))
        .collect();

    // Highest rank first; peer id breaks ties
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

    let selected: Vec<String> = ranked
        .into_iter()
        .take(replica_factor)
        .map(|(_, peer_id)| peer_id.to_string())
        .collect();

    debug!(
        "Placed shard {} on {} of {} eligible peers",
        shard_cid,
        selected.len(),
        eligible.len()
    );

    Ok(selected)
}
