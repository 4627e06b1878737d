//! Residency Registry Module
//!
//! This module provides the SQLite-backed authoritative store for shard
//! residency: the node registry, bundle/object bookkeeping, shard-to-peer
//! assignments, the challenge ledger, and the append-only evidence ledger.
//! Assignments are keyed (object CID, shard index, peer id) so replica
//! fan-out is tracked per peer. Challenge status transitions use
//! compare-and-set updates: only the party observing `pending` may move a
//! challenge forward, and terminal states are never overwritten.

use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, Row};
use std::fmt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bundle::Bundle;
use crate::codec::Cid;

/// Current database schema version
const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Errors that can occur during registry operations
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Node not found: {peer_id}")]
    NodeNotFound { peer_id: String },

    #[error("Object not found: {object_cid}")]
    ObjectNotFound { object_cid: Cid },

    #[error("A pending challenge already exists for object {object_cid} shard {shard_index} on peer {peer_id}")]
    DuplicatePending {
        object_cid: Cid,
        shard_index: u32,
        peer_id: String,
    },

    #[error("Invalid record: {reason}")]
    InvalidRecord { reason: String },

    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: u32, found: u32 },
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Lifecycle state of a challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeStatus {
    /// Issued, waiting for the peer's response
    Pending,
    /// Response checked out; evidence recorded
    Verified,
    /// Response arrived but was invalid
    Failed,
    /// No valid response before the deadline
    Expired,
}

impl ChallengeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeStatus::Pending => "pending",
            ChallengeStatus::Verified => "verified",
            ChallengeStatus::Failed => "failed",
            ChallengeStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ChallengeStatus::Pending),
            "verified" => Some(ChallengeStatus::Verified),
            "failed" => Some(ChallengeStatus::Failed),
            "expired" => Some(ChallengeStatus::Expired),
            _ => None,
        }
    }

    /// Whether this state is final
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChallengeStatus::Pending)
    }
}

impl fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A registered storage peer
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    /// Stable peer identifier
    pub peer_id: String,
    /// Network address
    pub address: String,
    /// Jurisdiction/country code
    pub country_code: String,
    /// Declared bandwidth capacity in Mbps
    pub bandwidth_mbps: u32,
    /// Rolling uptime percentage
    pub uptime_pct: f64,
    /// Super-node eligibility flag
    pub super_node: bool,
    /// Wallet/settlement identity
    pub wallet: String,
    /// Registered Ed25519 public key, hex encoded
    pub public_key: Option<String>,
    /// Declared storage capacity in bytes
    pub capacity_bytes: u64,
    /// Whether the node is currently active
    pub active: bool,
    /// Last heartbeat timestamp
    pub last_seen: SystemTime,
}

impl NodeRecord {
    /// Create a new active node record
    pub fn new(peer_id: &str, address: &str, country_code: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            address: address.to_string(),
            country_code: country_code.to_string(),
            bandwidth_mbps: 0,
            uptime_pct: 100.0,
            super_node: false,
            wallet: String::new(),
            public_key: None,
            capacity_bytes: 0,
            active: true,
            last_seen: SystemTime::now(),
        }
    }

    /// Set the registered response-signing key
    pub fn with_public_key(mut self, public_key_hex: &str) -> Self {
        self.public_key = Some(public_key_hex.to_string());
        self
    }
}

/// Stored bundle/object bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    pub object_cid: Cid,
    pub salt: Vec<u8>,
    pub kdf_iterations: u32,
    pub manifest_root: Cid,
    pub total_bytes: u64,
    pub chunk_count: u64,
    pub created_at: SystemTime,
}

/// One authoritative shard-to-peer mapping
///
/// `shard_index` is the shard's position in the bundle's ordered manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentRecord {
    pub object_cid: Cid,
    pub shard_index: u32,
    pub peer_id: String,
    pub shard_cid: Cid,
    pub country_code: String,
    pub assigned_at: SystemTime,
    pub last_verified_at: Option<SystemTime>,
    pub last_challenge_id: Option<Uuid>,
}

/// One challenge ledger row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRecord {
    pub challenge_id: Uuid,
    pub object_cid: Cid,
    pub shard_index: u32,
    pub peer_id: String,
    pub shard_cid: Cid,
    pub country_code: String,
    pub payload: Vec<u8>,
    pub nonce: Vec<u8>,
    /// Hash a correct response must reproduce, fixed at issue time
    pub expected_hash: Vec<u8>,
    pub status: ChallengeStatus,
    pub issued_at: SystemTime,
    pub expires_at: SystemTime,
    pub response_hash: Option<Vec<u8>>,
    pub signature: Option<Vec<u8>>,
    pub public_key: Option<Vec<u8>>,
    pub verified_at: Option<SystemTime>,
    pub failure_reason: Option<String>,
}

/// One append-only residency evidence row
///
/// Created only when a challenge reaches `verified`; never mutated, and
/// removed only by cascade if its parent challenge is purged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceRecord {
    pub challenge_id: Uuid,
    pub response_hash: Vec<u8>,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
    /// Client-observed proof timestamp
    pub proof_timestamp: SystemTime,
    /// Server receipt timestamp
    pub recorded_at: SystemTime,
}

/// Registry-wide statistics
#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub node_count: u64,
    pub object_count: u64,
    pub assignment_count: u64,
    pub pending_challenges: u64,
    pub verified_challenges: u64,
    pub evidence_count: u64,
}

/// Helper functions for time conversion
fn system_time_to_timestamp(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn timestamp_to_system_time(timestamp: i64) -> SystemTime {
    UNIX_EPOCH + std::time::Duration::from_secs(timestamp as u64)
}

fn column_error(name: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(0, name.to_string(), rusqlite::types::Type::Text)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::ConstraintViolation,
                ..
            },
            _,
        )
    )
}

fn parse_cid_column(row: &Row, name: &'static str) -> SqliteResult<Cid> {
    row.get::<_, String>(name)?
        .parse()
        .map_err(|_| column_error(name))
}

fn parse_uuid_column(row: &Row, name: &'static str) -> SqliteResult<Option<Uuid>> {
    match row.get::<_, Option<String>>(name)? {
        Some(raw) => Uuid::parse_str(&raw)
            .map(Some)
            .map_err(|_| column_error(name)),
        None => Ok(None),
    }
}

/// Helper function to parse a node record from a database row
fn parse_node(row: &Row) -> SqliteResult<NodeRecord> {
    Ok(NodeRecord {
        peer_id: row.get("peer_id")?,
        address: row.get("address")?,
        country_code: row.get("country_code")?,
        bandwidth_mbps: row.get::<_, i64>("bandwidth_mbps")? as u32,
        uptime_pct: row.get("uptime_pct")?,
        super_node: row.get::<_, i64>("super_node")? != 0,
        wallet: row.get("wallet")?,
        public_key: row.get("public_key")?,
        capacity_bytes: row.get::<_, i64>("capacity_bytes")? as u64,
        active: row.get::<_, i64>("active")? != 0,
        last_seen: timestamp_to_system_time(row.get("last_seen")?),
    })
}

/// Helper function to parse an object record from a database row
fn parse_object(row: &Row) -> SqliteResult<ObjectRecord> {
    Ok(ObjectRecord {
        object_cid: parse_cid_column(row, "object_cid")?,
        salt: row.get("salt")?,
        kdf_iterations: row.get::<_, i64>("kdf_iterations")? as u32,
        manifest_root: parse_cid_column(row, "manifest_root")?,
        total_bytes: row.get::<_, i64>("total_bytes")? as u64,
        chunk_count: row.get::<_, i64>("chunk_count")? as u64,
        created_at: timestamp_to_system_time(row.get("created_at")?),
    })
}

/// Helper function to parse an assignment record from a database row
fn parse_assignment(row: &Row) -> SqliteResult<AssignmentRecord> {
    Ok(AssignmentRecord {
        object_cid: parse_cid_column(row, "object_cid")?,
        shard_index: row.get::<_, i64>("shard_index")? as u32,
        peer_id: row.get("peer_id")?,
        shard_cid: parse_cid_column(row, "shard_cid")?,
        country_code: row.get("country_code")?,
        assigned_at: timestamp_to_system_time(row.get("assigned_at")?),
        last_verified_at: row
            .get::<_, Option<i64>>("last_verified_at")?
            .map(timestamp_to_system_time),
        last_challenge_id: parse_uuid_column(row, "last_challenge_id")?,
    })
}

/// Helper function to parse a challenge record from a database row
fn parse_challenge(row: &Row) -> SqliteResult<ChallengeRecord> {
    let status_raw: String = row.get("status")?;
    let status = ChallengeStatus::parse(&status_raw).ok_or_else(|| column_error("status"))?;

    Ok(ChallengeRecord {
        challenge_id: parse_uuid_column(row, "challenge_id")?.ok_or_else(|| column_error("challenge_id"))?,
        object_cid: parse_cid_column(row, "object_cid")?,
        shard_index: row.get::<_, i64>("shard_index")? as u32,
        peer_id: row.get("peer_id")?,
        shard_cid: parse_cid_column(row, "shard_cid")?,
        country_code: row.get("country_code")?,
        payload: row.get("payload")?,
        nonce: row.get("nonce")?,
        expected_hash: row.get("expected_hash")?,
        status,
        issued_at: timestamp_to_system_time(row.get("issued_at")?),
        expires_at: timestamp_to_system_time(row.get("expires_at")?),
        response_hash: row.get("response_hash")?,
        signature: row.get("signature")?,
        public_key: row.get("public_key")?,
        verified_at: row
            .get::<_, Option<i64>>("verified_at")?
            .map(timestamp_to_system_time),
        failure_reason: row.get("failure_reason")?,
    })
}

/// Helper function to parse an evidence record from a database row
fn parse_evidence(row: &Row) -> SqliteResult<EvidenceRecord> {
    Ok(EvidenceRecord {
        challenge_id: parse_uuid_column(row, "challenge_id")?.ok_or_else(|| column_error("challenge_id"))?,
        response_hash: row.get("response_hash")?,
        signature: row.get("signature")?,
        public_key: row.get("public_key")?,
        proof_timestamp: timestamp_to_system_time(row.get("proof_timestamp")?),
        recorded_at: timestamp_to_system_time(row.get("recorded_at")?),
    })
}

/// SQLite-backed residency registry
pub struct ResidencyRegistry {
    conn: Connection,
}

impl ResidencyRegistry {
    /// Create or open a registry at the specified path
    pub fn new<P: AsRef<Path>>(db_path: P) -> RegistryResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let registry = Self { conn };
        registry.initialize_schema()?;
        Ok(registry)
    }

    /// Open an in-memory registry (tests and tooling)
    pub fn in_memory() -> RegistryResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let registry = Self { conn };
        registry.initialize_schema()?;
        Ok(registry)
    }

    /// Initialize database schema and check version
    fn initialize_schema(&self) -> RegistryResult<()> {
        self.conn.execute_batch(
            r#"
            -- Storage peer registry
            CREATE TABLE IF NOT EXISTS nodes (
                peer_id TEXT PRIMARY KEY,
                address TEXT NOT NULL,
                country_code TEXT NOT NULL,
                bandwidth_mbps INTEGER NOT NULL DEFAULT 0,
                uptime_pct REAL NOT NULL DEFAULT 100.0,
                super_node INTEGER NOT NULL DEFAULT 0,
                wallet TEXT NOT NULL DEFAULT '',
                public_key TEXT,
                capacity_bytes INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL DEFAULT 1,
                last_seen INTEGER NOT NULL
            );

            -- Bundle/object bookkeeping
            CREATE TABLE IF NOT EXISTS objects (
                object_cid TEXT PRIMARY KEY,
                salt BLOB NOT NULL,
                kdf_iterations INTEGER NOT NULL,
                manifest_root TEXT NOT NULL,
                total_bytes INTEGER NOT NULL,
                chunk_count INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            -- Shard-to-peer assignments, one row per replica
            CREATE TABLE IF NOT EXISTS assignments (
                object_cid TEXT NOT NULL,
                shard_index INTEGER NOT NULL,
                peer_id TEXT NOT NULL,
                shard_cid TEXT NOT NULL,
                country_code TEXT NOT NULL,
                assigned_at INTEGER NOT NULL,
                last_verified_at INTEGER,
                last_challenge_id TEXT,
                PRIMARY KEY (object_cid, shard_index, peer_id)
            );

            -- Challenge ledger; rows are never deleted by the engine
            CREATE TABLE IF NOT EXISTS challenges (
                challenge_id TEXT PRIMARY KEY,
                object_cid TEXT NOT NULL,
                shard_index INTEGER NOT NULL,
                peer_id TEXT NOT NULL,
                shard_cid TEXT NOT NULL,
                country_code TEXT NOT NULL,
                payload BLOB NOT NULL,
                nonce BLOB NOT NULL,
                expected_hash BLOB NOT NULL,
                status TEXT NOT NULL,
                issued_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                response_hash BLOB,
                signature BLOB,
                public_key BLOB,
                verified_at INTEGER,
                failure_reason TEXT
            );

            -- Append-only evidence ledger, cascade-removed with its challenge
            CREATE TABLE IF NOT EXISTS evidence (
                challenge_id TEXT PRIMARY KEY,
                response_hash BLOB NOT NULL,
                signature BLOB NOT NULL,
                public_key BLOB NOT NULL,
                proof_timestamp INTEGER NOT NULL,
                recorded_at INTEGER NOT NULL,
                FOREIGN KEY (challenge_id) REFERENCES challenges(challenge_id) ON DELETE CASCADE
            );

            -- Schema version tracking
            CREATE TABLE IF NOT EXISTS schema_info (
                version INTEGER PRIMARY KEY
            );

            -- Secondary indexes for compliance queries and sweep scheduling
            CREATE INDEX IF NOT EXISTS idx_assignments_peer ON assignments(peer_id);
            CREATE INDEX IF NOT EXISTS idx_assignments_country ON assignments(country_code);
            CREATE INDEX IF NOT EXISTS idx_assignments_staleness ON assignments(last_verified_at);
            CREATE INDEX IF NOT EXISTS idx_challenges_sweep ON challenges(status, expires_at);
            CREATE INDEX IF NOT EXISTS idx_challenges_peer ON challenges(peer_id);

            -- At most one pending challenge per replica assignment, enforced
            -- even across separate connections to the same database
            CREATE UNIQUE INDEX IF NOT EXISTS idx_challenges_one_pending
                ON challenges(object_cid, shard_index, peer_id)
                WHERE status = 'pending';
            CREATE INDEX IF NOT EXISTS idx_evidence_recorded ON evidence(recorded_at);
            "#,
        )?;

        let existing_version: Option<u32> = self
            .conn
            .query_row("SELECT version FROM schema_info LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        match existing_version {
            Some(version) if version != CURRENT_SCHEMA_VERSION => {
                Err(RegistryError::SchemaVersionMismatch {
                    expected: CURRENT_SCHEMA_VERSION,
                    found: version,
                })
            }
            Some(_) => Ok(()),
            None => {
                self.conn.execute(
                    "INSERT INTO schema_info (version) VALUES (?1)",
                    [CURRENT_SCHEMA_VERSION],
                )?;
                Ok(())
            }
        }
    }

    // --- node registry ---

    /// Insert or update a node record
    pub fn upsert_node(&self, node: &NodeRecord) -> RegistryResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO nodes (
                peer_id, address, country_code, bandwidth_mbps, uptime_pct,
                super_node, wallet, public_key, capacity_bytes, active, last_seen
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(peer_id) DO UPDATE SET
                address = excluded.address,
                country_code = excluded.country_code,
                bandwidth_mbps = excluded.bandwidth_mbps,
                uptime_pct = excluded.uptime_pct,
                super_node = excluded.super_node,
                wallet = excluded.wallet,
                public_key = excluded.public_key,
                capacity_bytes = excluded.capacity_bytes,
                active = excluded.active,
                last_seen = excluded.last_seen
            "#,
            (
                &node.peer_id,
                &node.address,
                &node.country_code,
                node.bandwidth_mbps as i64,
                node.uptime_pct,
                node.super_node as i64,
                &node.wallet,
                &node.public_key,
                node.capacity_bytes as i64,
                node.active as i64,
                system_time_to_timestamp(node.last_seen),
            ),
        )?;
        Ok(())
    }

    /// Get a node by peer id
    pub fn get_node(&self, peer_id: &str) -> RegistryResult<NodeRecord> {
        let node = self
            .conn
            .query_row(
                r#"
                SELECT peer_id, address, country_code, bandwidth_mbps, uptime_pct,
                       super_node, wallet, public_key, capacity_bytes, active, last_seen
                FROM nodes WHERE peer_id = ?1
                "#,
                [peer_id],
                parse_node,
            )
            .optional()?;

        node.ok_or_else(|| RegistryError::NodeNotFound {
            peer_id: peer_id.to_string(),
        })
    }

    /// Record a heartbeat: refreshes uptime and last-seen
    pub fn record_heartbeat(
        &self,
        peer_id: &str,
        uptime_pct: f64,
        now: SystemTime,
    ) -> RegistryResult<()> {
        let rows = self.conn.execute(
            "UPDATE nodes SET uptime_pct = ?2, last_seen = ?3, active = 1 WHERE peer_id = ?1",
            (peer_id, uptime_pct, system_time_to_timestamp(now)),
        )?;

        if rows == 0 {
            return Err(RegistryError::NodeNotFound {
                peer_id: peer_id.to_string(),
            });
        }
        Ok(())
    }

    /// Policy hook: set or revoke super-node eligibility
    pub fn set_super_node(&self, peer_id: &str, eligible: bool) -> RegistryResult<()> {
        let rows = self.conn.execute(
            "UPDATE nodes SET super_node = ?2 WHERE peer_id = ?1",
            (peer_id, eligible as i64),
        )?;

        if rows == 0 {
            return Err(RegistryError::NodeNotFound {
                peer_id: peer_id.to_string(),
            });
        }
        Ok(())
    }

    /// Mark a node inactive (peer churn)
    pub fn deactivate_node(&self, peer_id: &str) -> RegistryResult<()> {
        let rows = self.conn.execute(
            "UPDATE nodes SET active = 0 WHERE peer_id = ?1",
            [peer_id],
        )?;

        if rows == 0 {
            return Err(RegistryError::NodeNotFound {
                peer_id: peer_id.to_string(),
            });
        }
        Ok(())
    }

    /// Count challenges for a peer in a given status (reputation input)
    pub fn count_challenges(&self, peer_id: &str, status: ChallengeStatus) -> RegistryResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM challenges WHERE peer_id = ?1 AND status = ?2",
            (peer_id, status.as_str()),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // --- bundle/object bookkeeping ---

    /// Record an ingested bundle's object-level bookkeeping
    pub fn record_bundle(&self, bundle: &Bundle, now: SystemTime) -> RegistryResult<()> {
        self.conn.execute(
            r#"
            INSERT OR IGNORE INTO objects (
                object_cid, salt, kdf_iterations, manifest_root,
                total_bytes, chunk_count, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            (
                bundle.object_cid.to_string(),
                &bundle.salt,
                bundle.kdf_iterations as i64,
                bundle.manifest_root.to_string(),
                bundle.total_bytes as i64,
                bundle.chunk_count as i64,
                system_time_to_timestamp(now),
            ),
        )?;
        Ok(())
    }

    /// Get object bookkeeping by CID
    pub fn get_object(&self, object_cid: &Cid) -> RegistryResult<ObjectRecord> {
        let object = self
            .conn
            .query_row(
                r#"
                SELECT object_cid, salt, kdf_iterations, manifest_root,
                       total_bytes, chunk_count, created_at
                FROM objects WHERE object_cid = ?1
                "#,
                [object_cid.to_string()],
                parse_object,
            )
            .optional()?;

        object.ok_or(RegistryError::ObjectNotFound {
            object_cid: *object_cid,
        })
    }

    // --- assignments ---

    /// Upsert the authoritative shard-to-peer mapping for one replica
    pub fn record_assignment(
        &self,
        object_cid: &Cid,
        shard_index: u32,
        shard_cid: &Cid,
        peer_id: &str,
        country_code: &str,
        now: SystemTime,
    ) -> RegistryResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO assignments (
                object_cid, shard_index, peer_id, shard_cid, country_code, assigned_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(object_cid, shard_index, peer_id) DO UPDATE SET
                shard_cid = excluded.shard_cid,
                country_code = excluded.country_code,
                assigned_at = excluded.assigned_at
            "#,
            (
                object_cid.to_string(),
                shard_index as i64,
                peer_id,
                shard_cid.to_string(),
                country_code,
                system_time_to_timestamp(now),
            ),
        )?;
        Ok(())
    }

    /// Look up one replica assignment
    pub fn get_assignment(
        &self,
        object_cid: &Cid,
        shard_index: u32,
        peer_id: &str,
    ) -> RegistryResult<Option<AssignmentRecord>> {
        let assignment = self
            .conn
            .query_row(
                r#"
                SELECT object_cid, shard_index, peer_id, shard_cid, country_code,
                       assigned_at, last_verified_at, last_challenge_id
                FROM assignments
                WHERE object_cid = ?1 AND shard_index = ?2 AND peer_id = ?3
                "#,
                (object_cid.to_string(), shard_index as i64, peer_id),
                parse_assignment,
            )
            .optional()?;
        Ok(assignment)
    }

    /// All replica assignments for an object, ordered by shard then peer
    pub fn assignments_for_object(
        &self,
        object_cid: &Cid,
    ) -> RegistryResult<Vec<AssignmentRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT object_cid, shard_index, peer_id, shard_cid, country_code,
                   assigned_at, last_verified_at, last_challenge_id
            FROM assignments WHERE object_cid = ?1
            ORDER BY shard_index, peer_id
            "#,
        )?;

        let rows = stmt.query_map([object_cid.to_string()], parse_assignment)?;
        let mut assignments = Vec::new();
        for row in rows {
            assignments.push(row?);
        }
        Ok(assignments)
    }

    /// Remove a replica assignment (peer churn, repair re-placement)
    pub fn remove_assignment(
        &self,
        object_cid: &Cid,
        shard_index: u32,
        peer_id: &str,
    ) -> RegistryResult<bool> {
        let rows = self.conn.execute(
            "DELETE FROM assignments WHERE object_cid = ?1 AND shard_index = ?2 AND peer_id = ?3",
            (object_cid.to_string(), shard_index as i64, peer_id),
        )?;
        Ok(rows > 0)
    }

    /// Assignments due for re-verification, most stale first
    ///
    /// An assignment is due when it has never been verified or when its last
    /// verification predates `stale_before`. Optionally filtered by
    /// jurisdiction for data-residency compliance reporting.
    pub fn due_assignments(
        &self,
        stale_before: SystemTime,
        country_code: Option<&str>,
        limit: usize,
    ) -> RegistryResult<Vec<AssignmentRecord>> {
        let threshold = system_time_to_timestamp(stale_before);

        let mut sql = String::from(
            r#"
            SELECT object_cid, shard_index, peer_id, shard_cid, country_code,
                   assigned_at, last_verified_at, last_challenge_id
            FROM assignments
            WHERE (last_verified_at IS NULL OR last_verified_at <= ?1)
            "#,
        );
        if country_code.is_some() {
            sql.push_str(" AND country_code = ?3");
        }
        sql.push_str(" ORDER BY last_verified_at IS NOT NULL, last_verified_at ASC LIMIT ?2");

        let mut stmt = self.conn.prepare(&sql)?;
        let mut assignments = Vec::new();

        if let Some(country) = country_code {
            let rows = stmt.query_map((threshold, limit as i64, country), parse_assignment)?;
            for row in rows {
                assignments.push(row?);
            }
        } else {
            let rows = stmt.query_map((threshold, limit as i64), parse_assignment)?;
            for row in rows {
                assignments.push(row?);
            }
        }

        Ok(assignments)
    }

    /// Stamp an assignment as verified via its challenge
    ///
    /// No-op (logged) when the assignment no longer exists: peer churn may
    /// remove an assignment while its challenge is still in flight.
    pub fn mark_verified(&self, challenge_id: Uuid, verified_at: SystemTime) -> RegistryResult<()> {
        let challenge = match self.find_challenge(challenge_id)? {
            Some(challenge) => challenge,
            None => {
                warn!("mark_verified: challenge {} not found", challenge_id);
                return Ok(());
            }
        };

        let rows = self.conn.execute(
            r#"
            UPDATE assignments SET last_verified_at = ?4, last_challenge_id = ?5
            WHERE object_cid = ?1 AND shard_index = ?2 AND peer_id = ?3
            "#,
            (
                challenge.object_cid.to_string(),
                challenge.shard_index as i64,
                &challenge.peer_id,
                system_time_to_timestamp(verified_at),
                challenge_id.to_string(),
            ),
        )?;

        if rows == 0 {
            warn!(
                "mark_verified: assignment missing for object {} shard {} peer {} (peer churn?)",
                challenge.object_cid, challenge.shard_index, challenge.peer_id
            );
        } else {
            debug!(
                "Assignment verified: object {} shard {} peer {}",
                challenge.object_cid, challenge.shard_index, challenge.peer_id
            );
        }
        Ok(())
    }

    // --- challenge ledger ---

    /// Persist a freshly issued challenge
    ///
    /// Returns `DuplicatePending` when another pending challenge already
    /// exists for the same (object, shard, peer) key; the unique index makes
    /// this safe against racing issuers on separate connections.
    pub fn insert_challenge(&self, challenge: &ChallengeRecord) -> RegistryResult<()> {
        let result = self.conn.execute(
            r#"
            INSERT INTO challenges (
                challenge_id, object_cid, shard_index, peer_id, shard_cid,
                country_code, payload, nonce, expected_hash, status,
                issued_at, expires_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            (
                challenge.challenge_id.to_string(),
                challenge.object_cid.to_string(),
                challenge.shard_index as i64,
                &challenge.peer_id,
                challenge.shard_cid.to_string(),
                &challenge.country_code,
                &challenge.payload,
                &challenge.nonce,
                &challenge.expected_hash,
                challenge.status.as_str(),
                system_time_to_timestamp(challenge.issued_at),
                system_time_to_timestamp(challenge.expires_at),
            ),
        );

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(RegistryError::DuplicatePending {
                object_cid: challenge.object_cid,
                shard_index: challenge.shard_index,
                peer_id: challenge.peer_id.clone(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Find a challenge by id
    pub fn find_challenge(&self, challenge_id: Uuid) -> RegistryResult<Option<ChallengeRecord>> {
        let challenge = self
            .conn
            .query_row(
                r#"
                SELECT challenge_id, object_cid, shard_index, peer_id, shard_cid,
                       country_code, payload, nonce, expected_hash, status, issued_at,
                       expires_at, response_hash, signature, public_key,
                       verified_at, failure_reason
                FROM challenges WHERE challenge_id = ?1
                "#,
                [challenge_id.to_string()],
                parse_challenge,
            )
            .optional()?;
        Ok(challenge)
    }

    /// Find the pending challenge for one (object, shard, peer) key, if any
    pub fn pending_challenge(
        &self,
        object_cid: &Cid,
        shard_index: u32,
        peer_id: &str,
    ) -> RegistryResult<Option<ChallengeRecord>> {
        let challenge = self
            .conn
            .query_row(
                r#"
                SELECT challenge_id, object_cid, shard_index, peer_id, shard_cid,
                       country_code, payload, nonce, expected_hash, status, issued_at,
                       expires_at, response_hash, signature, public_key,
                       verified_at, failure_reason
                FROM challenges
                WHERE object_cid = ?1 AND shard_index = ?2 AND peer_id = ?3
                  AND status = 'pending'
                ORDER BY issued_at DESC LIMIT 1
                "#,
                (object_cid.to_string(), shard_index as i64, peer_id),
                parse_challenge,
            )
            .optional()?;
        Ok(challenge)
    }

    /// Compare-and-set transition from `pending` to `verified` or `failed`
    ///
    /// Returns false when the row was not pending anymore (another party won
    /// the transition); the caller must not treat its outcome as recorded.
    #[allow(clippy::too_many_arguments)]
    pub fn resolve_challenge(
        &self,
        challenge_id: Uuid,
        status: ChallengeStatus,
        response_hash: &[u8],
        signature: &[u8],
        public_key: &[u8],
        verified_at: SystemTime,
        failure_reason: Option<&str>,
    ) -> RegistryResult<bool> {
        if !status.is_terminal() || status == ChallengeStatus::Expired {
            return Err(RegistryError::InvalidRecord {
                reason: format!("resolve_challenge cannot set status {}", status),
            });
        }

        let rows = self.conn.execute(
            r#"
            UPDATE challenges SET
                status = ?2, response_hash = ?3, signature = ?4, public_key = ?5,
                verified_at = ?6, failure_reason = ?7
            WHERE challenge_id = ?1 AND status = 'pending'
            "#,
            (
                challenge_id.to_string(),
                status.as_str(),
                response_hash,
                signature,
                public_key,
                system_time_to_timestamp(verified_at),
                failure_reason,
            ),
        )?;
        Ok(rows == 1)
    }

    /// Compare-and-set transition from `pending` to `expired` for one row
    pub fn expire_challenge(&self, challenge_id: Uuid) -> RegistryResult<bool> {
        let rows = self.conn.execute(
            "UPDATE challenges SET status = 'expired' WHERE challenge_id = ?1 AND status = 'pending'",
            [challenge_id.to_string()],
        )?;
        Ok(rows == 1)
    }

    /// Expire every overdue pending challenge; returns how many transitioned
    ///
    /// Safe to run concurrently with issuance and verification: the same
    /// compare-and-set rule applies, so each row transitions exactly once.
    pub fn sweep_expired(&self, now: SystemTime) -> RegistryResult<usize> {
        let rows = self.conn.execute(
            "UPDATE challenges SET status = 'expired' WHERE status = 'pending' AND expires_at <= ?1",
            [system_time_to_timestamp(now)],
        )?;

        if rows > 0 {
            info!("Expired {} overdue challenges", rows);
        }
        Ok(rows)
    }

    // --- evidence ledger ---

    /// Append a residency evidence row
    pub fn insert_evidence(&self, evidence: &EvidenceRecord) -> RegistryResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO evidence (
                challenge_id, response_hash, signature, public_key,
                proof_timestamp, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            (
                evidence.challenge_id.to_string(),
                &evidence.response_hash,
                &evidence.signature,
                &evidence.public_key,
                system_time_to_timestamp(evidence.proof_timestamp),
                system_time_to_timestamp(evidence.recorded_at),
            ),
        )?;
        Ok(())
    }

    /// Get the evidence row for a challenge, if recorded
    pub fn get_evidence(&self, challenge_id: Uuid) -> RegistryResult<Option<EvidenceRecord>> {
        let evidence = self
            .conn
            .query_row(
                r#"
                SELECT challenge_id, response_hash, signature, public_key,
                       proof_timestamp, recorded_at
                FROM evidence WHERE challenge_id = ?1
                "#,
                [challenge_id.to_string()],
                parse_evidence,
            )
            .optional()?;
        Ok(evidence)
    }

    /// Append-only feed for the settlement consumer, oldest first
    pub fn evidence_feed(&self, limit: usize) -> RegistryResult<Vec<EvidenceRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT challenge_id, response_hash, signature, public_key,
                   proof_timestamp, recorded_at
            FROM evidence ORDER BY recorded_at ASC LIMIT ?1
            "#,
        )?;

        let rows = stmt.query_map([limit as i64], parse_evidence)?;
        let mut feed = Vec::new();
        for row in rows {
            feed.push(row?);
        }
        Ok(feed)
    }

    // --- stats ---

    /// Get registry statistics
    pub fn stats(&self) -> RegistryResult<RegistryStats> {
        let count = |sql: &str| -> RegistryResult<u64> {
            let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as u64)
        };

        Ok(RegistryStats {
            node_count: count("SELECT COUNT(*) FROM nodes")?,
            object_count: count("SELECT COUNT(*) FROM objects")?,
            assignment_count: count("SELECT COUNT(*) FROM assignments")?,
            pending_challenges: count(
                "SELECT COUNT(*) FROM challenges WHERE status = 'pending'",
            )?,
            verified_challenges: count(
                "SELECT COUNT(*) FROM challenges WHERE status = 'verified'",
            )?,
            evidence_count: count("SELECT COUNT(*) FROM evidence")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_cid(tag: &[u8]) -> Cid {
        Cid::of(tag)
    }

    // Timestamps persist at second resolution, so fixtures that round-trip
    // through the database must start second-aligned
    fn second_aligned_now() -> SystemTime {
        timestamp_to_system_time(system_time_to_timestamp(SystemTime::now()))
    }

    fn test_challenge(object_cid: Cid, peer_id: &str, now: SystemTime) -> ChallengeRecord {
        ChallengeRecord {
            challenge_id: Uuid::new_v4(),
            object_cid,
            shard_index: 0,
            peer_id: peer_id.to_string(),
            shard_cid: test_cid(b"shard"),
            country_code: "US".to_string(),
            payload: vec![1; 32],
            nonce: vec![2; 16],
            expected_hash: vec![3; 32],
            status: ChallengeStatus::Pending,
            issued_at: now,
            expires_at: now + Duration::from_secs(60),
            response_hash: None,
            signature: None,
            public_key: None,
            verified_at: None,
            failure_reason: None,
        }
    }

    #[test]
    fn test_node_roundtrip() {
        let registry = ResidencyRegistry::in_memory().unwrap();
        let node = NodeRecord::new("peer-a", "10.0.0.1:9000", "US").with_public_key("ab" .repeat(32).as_str());

        registry.upsert_node(&node).unwrap();
        let loaded = registry.get_node("peer-a").unwrap();
        assert_eq!(loaded.peer_id, "peer-a");
        assert_eq!(loaded.public_key, node.public_key);
        assert!(loaded.active);

        registry.deactivate_node("peer-a").unwrap();
        assert!(!registry.get_node("peer-a").unwrap().active);

        assert!(matches!(
            registry.get_node("peer-missing"),
            Err(RegistryError::NodeNotFound { .. })
        ));
    }

    #[test]
    fn test_assignment_upsert_and_due_query() {
        let registry = ResidencyRegistry::in_memory().unwrap();
        let object = test_cid(b"object");
        let shard = test_cid(b"shard-0");
        let now = SystemTime::now();

        registry
            .record_assignment(&object, 0, &shard, "peer-a", "US", now)
            .unwrap();
        registry
            .record_assignment(&object, 0, &shard, "peer-b", "DE", now)
            .unwrap();

        // Replica fan-out: two rows for the same shard slot
        let assignments = registry.assignments_for_object(&object).unwrap();
        assert_eq!(assignments.len(), 2);

        // Never-verified assignments are due immediately
        let due = registry.due_assignments(now, None, 10).unwrap();
        assert_eq!(due.len(), 2);

        // Jurisdiction filter
        let due_de = registry.due_assignments(now, Some("DE"), 10).unwrap();
        assert_eq!(due_de.len(), 1);
        assert_eq!(due_de[0].peer_id, "peer-b");
    }

    #[test]
    fn test_challenge_cas_transitions() {
        let registry = ResidencyRegistry::in_memory().unwrap();
        let now = SystemTime::now();
        let challenge = test_challenge(test_cid(b"object"), "peer-a", now);
        let id = challenge.challenge_id;

        registry.insert_challenge(&challenge).unwrap();

        // First resolve wins
        assert!(registry
            .resolve_challenge(id, ChallengeStatus::Verified, &[9; 32], &[8; 64], &[7; 32], now, None)
            .unwrap());

        // Second transition of any kind loses
        assert!(!registry
            .resolve_challenge(id, ChallengeStatus::Failed, &[0; 32], &[0; 64], &[0; 32], now, Some("x"))
            .unwrap());
        assert!(!registry.expire_challenge(id).unwrap());

        let loaded = registry.find_challenge(id).unwrap().unwrap();
        assert_eq!(loaded.status, ChallengeStatus::Verified);
    }

    #[test]
    fn test_timestamps_round_trip_at_second_resolution() {
        let registry = ResidencyRegistry::in_memory().unwrap();
        let precise = UNIX_EPOCH + Duration::new(1_700_000_000, 202_111_764);
        let challenge = test_challenge(test_cid(b"object"), "peer-a", precise);

        registry.insert_challenge(&challenge).unwrap();
        let loaded = registry
            .find_challenge(challenge.challenge_id)
            .unwrap()
            .unwrap();

        // Sub-second precision is dropped on write; whole seconds survive
        assert_eq!(loaded.issued_at, UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        assert_eq!(
            loaded.expires_at,
            UNIX_EPOCH + Duration::from_secs(1_700_000_060)
        );
    }

    #[test]
    fn test_second_pending_challenge_rejected_by_schema() {
        let registry = ResidencyRegistry::in_memory().unwrap();
        let now = SystemTime::now();
        let object = test_cid(b"object");

        let first = test_challenge(object, "peer-a", now);
        registry.insert_challenge(&first).unwrap();

        // A racing issuer that also observed "no pending" hits the unique
        // index instead of creating a second pending row
        let racer = test_challenge(object, "peer-a", now);
        assert!(matches!(
            registry.insert_challenge(&racer),
            Err(RegistryError::DuplicatePending { .. })
        ));

        // A different peer is a different assignment and is unaffected
        let other = test_challenge(object, "peer-b", now);
        registry.insert_challenge(&other).unwrap();

        // Once the first challenge is terminal, a fresh pending row is fine
        assert!(registry
            .resolve_challenge(
                first.challenge_id,
                ChallengeStatus::Failed,
                &[0; 32],
                &[0; 64],
                &[0; 32],
                now,
                Some("bad response"),
            )
            .unwrap());
        let replacement = test_challenge(object, "peer-a", now);
        registry.insert_challenge(&replacement).unwrap();
    }

    #[test]
    fn test_sweep_expires_exactly_once() {
        let registry = ResidencyRegistry::in_memory().unwrap();
        let now = SystemTime::now();
        let challenge = test_challenge(test_cid(b"object"), "peer-a", now);

        registry.insert_challenge(&challenge).unwrap();

        let later = now + Duration::from_secs(61);
        assert_eq!(registry.sweep_expired(later).unwrap(), 1);
        assert_eq!(registry.sweep_expired(later).unwrap(), 0);

        let loaded = registry
            .find_challenge(challenge.challenge_id)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, ChallengeStatus::Expired);
    }

    #[test]
    fn test_mark_verified_missing_assignment_is_noop() {
        let registry = ResidencyRegistry::in_memory().unwrap();
        let now = SystemTime::now();
        let challenge = test_challenge(test_cid(b"object"), "peer-a", now);

        registry.insert_challenge(&challenge).unwrap();

        // No assignment row exists; must not error
        registry
            .mark_verified(challenge.challenge_id, now)
            .unwrap();
    }

    #[test]
    fn test_evidence_append_and_feed() {
        let registry = ResidencyRegistry::in_memory().unwrap();
        let now = second_aligned_now();
        let challenge = test_challenge(test_cid(b"object"), "peer-a", now);
        registry.insert_challenge(&challenge).unwrap();

        let evidence = EvidenceRecord {
            challenge_id: challenge.challenge_id,
            response_hash: vec![1; 32],
            signature: vec![2; 64],
            public_key: vec![3; 32],
            proof_timestamp: now,
            recorded_at: now,
        };
        registry.insert_evidence(&evidence).unwrap();

        let loaded = registry.get_evidence(challenge.challenge_id).unwrap();
        assert_eq!(loaded, Some(evidence.clone()));

        let feed = registry.evidence_feed(10).unwrap();
        assert_eq!(feed.len(), 1);

        // Evidence requires a parent challenge (FK)
        let orphan = EvidenceRecord {
            challenge_id: Uuid::new_v4(),
            ..evidence
        };
        assert!(registry.insert_evidence(&orphan).is_err());
    }

    #[test]
    fn test_stats() {
        let registry = ResidencyRegistry::in_memory().unwrap();
        let stats = registry.stats().unwrap();
        assert_eq!(stats.node_count, 0);
        assert_eq!(stats.pending_challenges, 0);

        registry
            .upsert_node(&NodeRecord::new("peer-a", "addr", "US"))
            .unwrap();
        let stats = registry.stats().unwrap();
        assert_eq!(stats.node_count, 1);
    }
}
