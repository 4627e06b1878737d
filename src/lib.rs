//! Library entrypoint for shardkeep.
//!
//! Client-side sealing (encrypt-then-erasure-code), deterministic replica
//! placement, and proof-of-residency verification for shard storage on
//! untrusted peers. The binary and other crates consume the pipeline via
//! `use shardkeep::...`.

pub mod bundle;
pub mod challenge;
pub mod codec;
pub mod gateway;
pub mod placement;
pub mod registry;

pub use bundle::{open_bundle, prepare_bundle, verify_manifest, Bundle, ShardRecord};
pub use challenge::{
    ChallengeConfig, ChallengeEngine, ChallengeOutcome, ChallengeResponder, ChallengeResponse,
    MemoryResponder,
};
pub use codec::{Cid, SealProfile, SealedObject, SealedShard};
pub use gateway::{Gateway, GatewayConfig};
pub use placement::{place, PeerCandidate};
pub use registry::{
    AssignmentRecord, ChallengeRecord, ChallengeStatus, EvidenceRecord, NodeRecord,
    ResidencyRegistry,
};
