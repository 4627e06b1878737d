//! Integration tests for the challenge lifecycle
//!
//! These tests drive the gateway end to end against an on-disk registry:
//! issuance idempotence, timeout sweeps, and persistence across reopen.

use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use uuid::Uuid;

use shardkeep::challenge::ChallengeResponder;
use shardkeep::{
    prepare_bundle, Bundle, ChallengeOutcome, ChallengeStatus, Gateway, GatewayConfig,
    MemoryResponder, NodeRecord, PeerCandidate, SealProfile,
};

struct Harness {
    _dir: TempDir,
    gateway: Gateway,
    responders: Vec<(String, MemoryResponder)>,
    bundle: Bundle,
}

fn gateway_config(dir: &TempDir) -> GatewayConfig {
    GatewayConfig {
        node_id: "gw-test".to_string(),
        registry_db_path: dir.path().join("registry.db"),
        replica_factor: 2,
        challenge_timeout_secs: 60,
        reverify_interval_secs: 3600,
        max_bundle_bytes: 8 * 1024 * 1024,
    }
}

/// Build a gateway with four registered peers, an ingested bundle, and a
/// responder per peer holding exactly the shards assigned to it
fn setup(now: SystemTime) -> Harness {
    let dir = TempDir::new().unwrap();
    let gateway = Gateway::new(gateway_config(&dir)).unwrap();

    let mut responders = Vec::new();
    let mut candidates = Vec::new();
    for i in 0..4 {
        let peer_id = format!("peer-{}", i);
        let responder = MemoryResponder::generate();
        let node = NodeRecord::new(&peer_id, &format!("10.0.0.{}:9000", i + 1), "US")
            .with_public_key(&responder.public_key_hex());
        gateway.register_node(&node).unwrap();
        candidates.push(PeerCandidate::new(&peer_id, &node.address, "US"));
        responders.push((peer_id, responder));
    }

    let profile = SealProfile::new(512, 2, 1)
        .unwrap()
        .with_kdf_iterations(1_000)
        .unwrap();
    let bundle = prepare_bundle(&vec![0xC3; 1000], "pw", &profile, &candidates, 2).unwrap();
    gateway.ingest_bundle(&bundle, now).unwrap();

    // Hand each responder the shard bytes it was assigned
    for shard in &bundle.shards {
        for peer_id in &shard.peers {
            let responder = responders
                .iter_mut()
                .find(|(id, _)| id == peer_id)
                .map(|(_, responder)| responder)
                .unwrap();
            responder.store(shard.sealed_bytes.clone());
        }
    }

    Harness {
        _dir: dir,
        gateway,
        responders,
        bundle,
    }
}

fn responder<'a>(harness: &'a Harness, peer_id: &str) -> &'a MemoryResponder {
    harness
        .responders
        .iter()
        .find(|(id, _)| id == peer_id)
        .map(|(_, responder)| responder)
        .unwrap()
}

#[test]
fn test_full_verification_cycle() {
    let now = SystemTime::now();
    let harness = setup(now);
    let shard = &harness.bundle.shards[0];
    let peer_id = shard.peers[0].clone();

    let challenge = harness
        .gateway
        .issue_challenge(&harness.bundle.object_cid, 0, &peer_id, &shard.sealed_bytes, now)
        .unwrap();
    assert_eq!(challenge.status, ChallengeStatus::Pending);

    let response = responder(&harness, &peer_id).respond(&challenge, now).unwrap();
    let outcome = harness
        .gateway
        .submit_response(challenge.challenge_id, &response, now + Duration::from_secs(5))
        .unwrap();
    assert!(matches!(outcome, ChallengeOutcome::Verified(_)));

    // Evidence is queryable through the settlement feed
    let feed = harness.gateway.evidence_feed(10).unwrap();
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].challenge_id, challenge.challenge_id);

    // The verified assignment is no longer due
    let due = harness.gateway.due_assignments(now, None, 100).unwrap();
    let total = harness
        .gateway
        .registry()
        .assignments_for_object(&harness.bundle.object_cid)
        .unwrap()
        .len();
    assert_eq!(due.len(), total - 1);
}

#[test]
fn test_issuance_is_idempotent_per_assignment() {
    let now = SystemTime::now();
    let harness = setup(now);
    let shard = &harness.bundle.shards[0];
    let peer_id = &shard.peers[0];

    let first = harness
        .gateway
        .issue_challenge(&harness.bundle.object_cid, 0, peer_id, &shard.sealed_bytes, now)
        .unwrap();
    let second = harness
        .gateway
        .issue_challenge(
            &harness.bundle.object_cid,
            0,
            peer_id,
            &shard.sealed_bytes,
            now + Duration::from_secs(30),
        )
        .unwrap();
    assert_eq!(first.challenge_id, second.challenge_id);

    // Distinct assignments get distinct challenges
    let other_peer = &shard.peers[1];
    let third = harness
        .gateway
        .issue_challenge(&harness.bundle.object_cid, 0, other_peer, &shard.sealed_bytes, now)
        .unwrap();
    assert_ne!(first.challenge_id, third.challenge_id);
}

#[test]
fn test_sweep_expires_overdue_challenges_exactly_once() {
    let now = SystemTime::now();
    let harness = setup(now);

    // Issue challenges against three replica assignments
    for index in 0..3usize {
        let shard = &harness.bundle.shards[index];
        harness
            .gateway
            .issue_challenge(
                &harness.bundle.object_cid,
                index as u32,
                &shard.peers[0],
                &shard.sealed_bytes,
                now,
            )
            .unwrap();
    }

    let before = harness.gateway.stats().unwrap();
    assert_eq!(before.pending_challenges, 3);

    let later = now + Duration::from_secs(120);
    assert_eq!(harness.gateway.sweep_expired(later).unwrap(), 3);
    assert_eq!(harness.gateway.sweep_expired(later).unwrap(), 0);

    let after = harness.gateway.stats().unwrap();
    assert_eq!(after.pending_challenges, 0);
    assert_eq!(after.verified_challenges, 0);
}

#[test]
fn test_late_response_never_verifies() {
    let now = SystemTime::now();
    let harness = setup(now);
    let shard = &harness.bundle.shards[0];
    let peer_id = shard.peers[0].clone();

    let challenge = harness
        .gateway
        .issue_challenge(&harness.bundle.object_cid, 0, &peer_id, &shard.sealed_bytes, now)
        .unwrap();
    let response = responder(&harness, &peer_id).respond(&challenge, now).unwrap();

    let result = harness.gateway.submit_response(
        challenge.challenge_id,
        &response,
        now + Duration::from_secs(120),
    );
    assert!(result.is_err());

    // No evidence, no verification stamp
    assert!(harness.gateway.evidence_feed(10).unwrap().is_empty());
    let assignment = harness
        .gateway
        .registry()
        .get_assignment(&harness.bundle.object_cid, 0, &peer_id)
        .unwrap()
        .unwrap();
    assert!(assignment.last_verified_at.is_none());
}

#[test]
fn test_pending_challenge_unique_across_connections() {
    let now = SystemTime::now();
    let dir = TempDir::new().unwrap();
    let config = gateway_config(&dir);

    let responder = MemoryResponder::generate();
    let first_gateway = Gateway::new(config.clone()).unwrap();
    let node = NodeRecord::new("peer-0", "10.0.0.1:9000", "US")
        .with_public_key(&responder.public_key_hex());
    first_gateway.register_node(&node).unwrap();

    let profile = SealProfile::new(512, 2, 1)
        .unwrap()
        .with_kdf_iterations(1_000)
        .unwrap();
    let candidates = vec![
        PeerCandidate::new("peer-0", "10.0.0.1:9000", "US"),
        PeerCandidate::new("peer-1", "10.0.0.2:9000", "US"),
    ];
    let bundle = prepare_bundle(b"shared database payload", "pw", &profile, &candidates, 2).unwrap();
    first_gateway.ingest_bundle(&bundle, now).unwrap();

    // Two gateways over the same database file, issuing for the same key
    let second_gateway = Gateway::new(config).unwrap();
    let shard = &bundle.shards[0];
    let first = first_gateway
        .issue_challenge(&bundle.object_cid, 0, "peer-0", &shard.sealed_bytes, now)
        .unwrap();
    let second = second_gateway
        .issue_challenge(&bundle.object_cid, 0, "peer-0", &shard.sealed_bytes, now)
        .unwrap();
    assert_eq!(first.challenge_id, second.challenge_id);

    // The database itself refuses a second pending row for the key, so a
    // racing issuer that never saw the first challenge cannot create one
    let mut duplicate = first.clone();
    duplicate.challenge_id = Uuid::new_v4();
    assert!(second_gateway
        .registry()
        .insert_challenge(&duplicate)
        .is_err());

    let stats = first_gateway.stats().unwrap();
    assert_eq!(stats.pending_challenges, 1);
}

#[test]
fn test_registry_survives_reopen() {
    let now = SystemTime::now();
    let dir = TempDir::new().unwrap();
    let config = gateway_config(&dir);

    let responder = MemoryResponder::generate();
    let challenge_id;
    let object_cid;
    {
        let gateway = Gateway::new(config.clone()).unwrap();
        let node = NodeRecord::new("peer-0", "10.0.0.1:9000", "US")
            .with_public_key(&responder.public_key_hex());
        gateway.register_node(&node).unwrap();

        let profile = SealProfile::new(512, 2, 1)
            .unwrap()
            .with_kdf_iterations(1_000)
            .unwrap();
        let candidates = vec![
            PeerCandidate::new("peer-0", "10.0.0.1:9000", "US"),
            PeerCandidate::new("peer-1", "10.0.0.2:9000", "US"),
        ];
        let bundle = prepare_bundle(b"persistent payload", "pw", &profile, &candidates, 2).unwrap();
        gateway.ingest_bundle(&bundle, now).unwrap();
        object_cid = bundle.object_cid;

        let shard = &bundle.shards[0];
        let challenge = gateway
            .issue_challenge(&object_cid, 0, "peer-0", &shard.sealed_bytes, now)
            .unwrap();
        challenge_id = challenge.challenge_id;
    }

    // Reopen the same database and observe the same state
    let gateway = Gateway::new(config).unwrap();
    let challenge = gateway
        .registry()
        .find_challenge(challenge_id)
        .unwrap()
        .unwrap();
    assert_eq!(challenge.status, ChallengeStatus::Pending);
    assert_eq!(challenge.object_cid, object_cid);

    let stats = gateway.stats().unwrap();
    assert_eq!(stats.object_count, 1);
    assert_eq!(stats.pending_challenges, 1);
}

#[test]
fn test_unknown_challenge_submission_is_rejected() {
    let now = SystemTime::now();
    let harness = setup(now);

    let response = shardkeep::ChallengeResponse {
        response_hash: vec![0; 32],
        signature: vec![0; 64],
        public_key: vec![0; 32],
        proof_timestamp: now,
    };
    let result = harness
        .gateway
        .submit_response(Uuid::new_v4(), &response, now);
    assert!(result.is_err());
}
