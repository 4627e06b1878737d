//! Gateway Module
//!
//! The gateway is the server-side orchestrator: it accepts prepared bundles,
//! verifies their manifests, records the authoritative shard-to-peer
//! assignments, and runs the re-verification loop that keeps residency
//! evidence fresh. It owns the residency registry and drives the challenge
//! engine against it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bundle::{self, Bundle, BundleError};
use crate::challenge::{
    ChallengeConfig, ChallengeEngine, ChallengeError, ChallengeOutcome, ChallengeResponse,
};
use crate::codec::Cid;
use crate::registry::{
    AssignmentRecord, ChallengeRecord, EvidenceRecord, NodeRecord, RegistryError, RegistryStats,
    ResidencyRegistry,
};

/// Errors that can occur during gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    #[error("Bundle of {size} bytes exceeds the {max} byte limit")]
    BundleTooLarge { size: u64, max: u64 },

    #[error("Bundle error: {0}")]
    Bundle(#[from] BundleError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Challenge error: {0}")]
    Challenge(#[from] ChallengeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway configuration, loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Identifier this gateway reports in logs and stats
    pub node_id: String,
    /// Path of the SQLite residency registry
    pub registry_db_path: PathBuf,
    /// Replicas recorded per shard at ingest
    pub replica_factor: usize,
    /// Seconds a peer has to answer a challenge
    pub challenge_timeout_secs: u64,
    /// Seconds after which a verified assignment is due again
    pub reverify_interval_secs: u64,
    /// Upper bound on accepted bundle size (sealed bytes)
    pub max_bundle_bytes: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            node_id: "gateway-1".to_string(),
            registry_db_path: PathBuf::from("shardkeep-registry.db"),
            replica_factor: 3,
            challenge_timeout_secs: 300,
            reverify_interval_secs: 24 * 60 * 60,
            max_bundle_bytes: 16 * 1024 * 1024 * 1024,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> GatewayResult<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> GatewayResult<()> {
        if self.node_id.is_empty() {
            return Err(GatewayError::Config {
                reason: "node_id must not be empty".to_string(),
            });
        }
        if self.replica_factor < 1 {
            return Err(GatewayError::Config {
                reason: "replica_factor must be at least 1".to_string(),
            });
        }
        if self.challenge_timeout_secs == 0 {
            return Err(GatewayError::Config {
                reason: "challenge_timeout_secs must be positive".to_string(),
            });
        }
        if self.reverify_interval_secs == 0 {
            return Err(GatewayError::Config {
                reason: "reverify_interval_secs must be positive".to_string(),
            });
        }
        if self.max_bundle_bytes == 0 {
            return Err(GatewayError::Config {
                reason: "max_bundle_bytes must be positive".to_string(),
            });
        }
        Ok(())
    }

    fn challenge_config(&self) -> ChallengeConfig {
        ChallengeConfig {
            timeout: Duration::from_secs(self.challenge_timeout_secs),
        }
    }
}

/// Server-side orchestrator over the residency registry
pub struct Gateway {
    config: GatewayConfig,
    registry: ResidencyRegistry,
}

impl Gateway {
    /// Open a gateway, creating its registry database if needed
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        config.validate()?;
        let registry = ResidencyRegistry::new(&config.registry_db_path)?;
        info!(
            "Gateway {} opened registry at {}",
            config.node_id,
            config.registry_db_path.display()
        );
        Ok(Self { config, registry })
    }

    /// Gateway with an in-memory registry (tests and tooling)
    pub fn in_memory(config: GatewayConfig) -> GatewayResult<Self> {
        config.validate()?;
        let registry = ResidencyRegistry::in_memory()?;
        Ok(Self { config, registry })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &ResidencyRegistry {
        &self.registry
    }

    fn engine(&self) -> ChallengeEngine<'_> {
        ChallengeEngine::new(&self.registry, self.config.challenge_config())
    }

    /// Register or refresh a storage node
    pub fn register_node(&self, node: &NodeRecord) -> GatewayResult<()> {
        self.registry.upsert_node(node)?;
        debug!("Registered node {}", node.peer_id);
        Ok(())
    }

    /// Accept a prepared bundle and record its residency assignments
    ///
    /// The manifest is fully re-verified before anything is recorded, so a
    /// tampered bundle leaves no trace in the registry. Shard indexes are the
    /// shard's position in the bundle's ordered manifest.
    pub fn ingest_bundle(&self, bundle: &Bundle, now: SystemTime) -> GatewayResult<()> {
        let sealed_size: u64 = bundle
            .shards
            .iter()
            .map(|shard| shard.sealed_bytes.len() as u64)
            .sum();
        if sealed_size > self.config.max_bundle_bytes {
            return Err(GatewayError::BundleTooLarge {
                size: sealed_size,
                max: self.config.max_bundle_bytes,
            });
        }

        bundle::verify_manifest(bundle)?;
        self.registry.record_bundle(bundle, now)?;

        let mut replicas = 0usize;
        for (index, shard) in bundle.shards.iter().enumerate() {
            for peer_id in &shard.peers {
                let country_code = match self.registry.get_node(peer_id) {
                    Ok(node) => node.country_code,
                    Err(RegistryError::NodeNotFound { .. }) => {
                        // Jurisdiction queries key on this column; an empty
                        // value quietly drops the row from compliance reports
                        warn!(
                            "Assigned peer {} is not registered; recording shard {} of object {} without a jurisdiction",
                            peer_id, index, bundle.object_cid
                        );
                        String::new()
                    }
                    Err(err) => return Err(err.into()),
                };
                self.registry.record_assignment(
                    &bundle.object_cid,
                    index as u32,
                    &shard.cid,
                    peer_id,
                    &country_code,
                    now,
                )?;
                replicas += 1;
            }
        }

        info!(
            "Ingested bundle {}: {} shards, {} replica assignments, {} sealed bytes",
            bundle.object_cid,
            bundle.shards.len(),
            replicas,
            sealed_size
        );
        Ok(())
    }

    /// Assignments whose last verification is older than the re-verify
    /// interval, most stale first
    pub fn due_assignments(
        &self,
        now: SystemTime,
        country_code: Option<&str>,
        limit: usize,
    ) -> GatewayResult<Vec<AssignmentRecord>> {
        let stale_before = now - Duration::from_secs(self.config.reverify_interval_secs);
        Ok(self
            .registry
            .due_assignments(stale_before, country_code, limit)?)
    }

    /// Issue a residency challenge against one replica assignment
    pub fn issue_challenge(
        &self,
        object_cid: &Cid,
        shard_index: u32,
        peer_id: &str,
        shard_bytes: &[u8],
        now: SystemTime,
    ) -> GatewayResult<ChallengeRecord> {
        Ok(self
            .engine()
            .issue_at(object_cid, shard_index, peer_id, shard_bytes, now)?)
    }

    /// Verify a peer's challenge response
    pub fn submit_response(
        &self,
        challenge_id: Uuid,
        response: &ChallengeResponse,
        now: SystemTime,
    ) -> GatewayResult<ChallengeOutcome> {
        Ok(self.engine().submit_at(challenge_id, response, now)?)
    }

    /// Expire overdue challenges; returns how many transitioned
    pub fn sweep_expired(&self, now: SystemTime) -> GatewayResult<usize> {
        Ok(self.engine().sweep_at(now)?)
    }

    /// Evidence feed for the settlement consumer, oldest first
    pub fn evidence_feed(&self, limit: usize) -> GatewayResult<Vec<EvidenceRecord>> {
        Ok(self.registry.evidence_feed(limit)?)
    }

    /// Registry statistics
    pub fn stats(&self) -> GatewayResult<RegistryStats> {
        Ok(self.registry.stats()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::prepare_bundle;
    use crate::codec::SealProfile;
    use crate::placement::PeerCandidate;
    use tempfile::TempDir;

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            node_id: "gw-test".to_string(),
            registry_db_path: PathBuf::from(":memory:"),
            replica_factor: 2,
            challenge_timeout_secs: 60,
            reverify_interval_secs: 3600,
            max_bundle_bytes: 1024 * 1024,
        }
    }

    fn test_bundle(replica_factor: usize) -> Bundle {
        let profile = SealProfile::new(256, 2, 1)
            .unwrap()
            .with_kdf_iterations(1_000)
            .unwrap();
        let candidates: Vec<PeerCandidate> = (0..4)
            .map(|i| {
                PeerCandidate::new(
                    &format!("peer-{}", i),
                    &format!("10.0.0.{}:9000", i + 1),
                    "US",
                )
            })
            .collect();
        prepare_bundle(&vec![7u8; 600], "pw", &profile, &candidates, replica_factor).unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(GatewayConfig::default().validate().is_ok());

        let mut config = test_config();
        config.replica_factor = 0;
        assert!(matches!(
            config.validate(),
            Err(GatewayError::Config { .. })
        ));
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gateway.yaml");

        let config = test_config();
        config.save_to_file(&path).unwrap();
        let loaded = GatewayConfig::from_file(&path).unwrap();
        assert_eq!(loaded.node_id, config.node_id);
        assert_eq!(loaded.replica_factor, config.replica_factor);
    }

    #[test]
    fn test_ingest_records_assignments() {
        let gateway = Gateway::in_memory(test_config()).unwrap();
        let bundle = test_bundle(2);
        let now = SystemTime::now();

        gateway.ingest_bundle(&bundle, now).unwrap();

        let assignments = gateway
            .registry()
            .assignments_for_object(&bundle.object_cid)
            .unwrap();
        // 3 chunks x 3 shards x 2 replicas
        assert_eq!(assignments.len(), 18);

        // Everything is immediately due: nothing has been verified yet
        let due = gateway.due_assignments(now, None, 100).unwrap();
        assert_eq!(due.len(), 18);
    }

    #[test]
    fn test_ingest_keeps_jurisdiction_for_registered_peers() {
        let gateway = Gateway::in_memory(test_config()).unwrap();
        let now = SystemTime::now();

        // Register only peer-0 and peer-1; peer-2 and peer-3 stay unknown
        for i in 0..2 {
            gateway
                .register_node(&NodeRecord::new(
                    &format!("peer-{}", i),
                    &format!("10.0.0.{}:9000", i + 1),
                    "FR",
                ))
                .unwrap();
        }

        let bundle = test_bundle(2);
        gateway.ingest_bundle(&bundle, now).unwrap();

        let assignments = gateway
            .registry()
            .assignments_for_object(&bundle.object_cid)
            .unwrap();
        for assignment in &assignments {
            if assignment.peer_id == "peer-0" || assignment.peer_id == "peer-1" {
                assert_eq!(assignment.country_code, "FR");
            } else {
                assert!(assignment.country_code.is_empty());
            }
        }
    }

    #[test]
    fn test_ingest_rejects_tampered_bundle() {
        let gateway = Gateway::in_memory(test_config()).unwrap();
        let mut bundle = test_bundle(1);
        bundle.shards.swap(0, 1);

        let result = gateway.ingest_bundle(&bundle, SystemTime::now());
        assert!(matches!(result, Err(GatewayError::Bundle(_))));

        // A rejected bundle leaves no registry rows behind
        let stats = gateway.stats().unwrap();
        assert_eq!(stats.object_count, 0);
        assert_eq!(stats.assignment_count, 0);
    }

    #[test]
    fn test_ingest_enforces_size_limit() {
        let mut config = test_config();
        config.max_bundle_bytes = 16;
        let gateway = Gateway::in_memory(config).unwrap();

        let result = gateway.ingest_bundle(&test_bundle(1), SystemTime::now());
        assert!(matches!(result, Err(GatewayError::BundleTooLarge { .. })));
    }
}
