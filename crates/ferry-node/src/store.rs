use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ferry_codec::bundle::{decode_bundle_cbor, encode_bundle_cbor};
use ferry_codec::{Bundle, CodecError};
use ferry_core::{BundleId, Priority, PublicKey, Timestamp};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS bundles (
  id BLOB PRIMARY KEY,
  created_at INTEGER NOT NULL,
  expires_at INTEGER NOT NULL,
  priority INTEGER NOT NULL,
  audience TEXT NOT NULL,
  topic TEXT NOT NULL,
  tags TEXT NOT NULL,
  payload_type TEXT NOT NULL,
  payload_len INTEGER NOT NULL,
  author BLOB NOT NULL,
  envelope BLOB NOT NULL,
  size INTEGER NOT NULL,
  access_count INTEGER NOT NULL DEFAULT 0,
  stored_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS bundles_by_priority ON bundles(priority, expires_at, created_at);
CREATE INDEX IF NOT EXISTS bundles_by_expiry ON bundles(expires_at);
CREATE INDEX IF NOT EXISTS bundles_by_age ON bundles(created_at, id);
CREATE INDEX IF NOT EXISTS bundles_by_topic ON bundles(topic);
CREATE INDEX IF NOT EXISTS bundles_by_payload_type ON bundles(payload_type);

CREATE TABLE IF NOT EXISTS store_stats (
  singleton INTEGER PRIMARY KEY CHECK (singleton = 0),
  bundle_count INTEGER NOT NULL,
  total_bytes INTEGER NOT NULL
);
INSERT OR IGNORE INTO store_stats (singleton, bundle_count, total_bytes) VALUES (0, 0, 0);
CREATE TRIGGER IF NOT EXISTS bundles_stats_insert AFTER INSERT ON bundles BEGIN
  UPDATE store_stats
  SET bundle_count = bundle_count + 1, total_bytes = total_bytes + NEW.size
  WHERE singleton = 0;
END;
CREATE TRIGGER IF NOT EXISTS bundles_stats_delete AFTER DELETE ON bundles BEGIN
  UPDATE store_stats
  SET bundle_count = bundle_count - 1, total_bytes = total_bytes - OLD.size
  WHERE singleton = 0;
END;

CREATE TABLE IF NOT EXISTS peers (
  peer TEXT PRIMARY KEY,
  first_contact INTEGER NOT NULL,
  last_contact INTEGER NOT NULL,
  sessions INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS peer_known (
  peer TEXT NOT NULL,
  bundle_id BLOB NOT NULL REFERENCES bundles(id) ON DELETE CASCADE,
  PRIMARY KEY (peer, bundle_id)
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS peer_known_by_bundle ON peer_known(bundle_id);

CREATE TABLE IF NOT EXISTS node_config (
  singleton INTEGER PRIMARY KEY CHECK (singleton = 0),
  record TEXT NOT NULL,
  updated_at INTEGER NOT NULL
);
";

const SUMMARY_COLUMNS: &str = "id, created_at, expires_at, priority, audience, topic, tags, \
     payload_type, payload_len, author, size, access_count";

/// Errors returned by [`BundleStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored envelope: {0}")]
    Codec(#[from] CodecError),
    #[error("config record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of an atomic insert-if-absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    DuplicateSkipped,
}

/// Payload-free view of a stored bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSummary {
    pub id: BundleId,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub priority: Priority,
    pub audience: String,
    pub topic: String,
    pub tags: Vec<String>,
    pub payload_type: String,
    pub payload_len: u64,
    pub author: PublicKey,
    /// Stored envelope size in bytes; what the cache budget counts.
    pub size: u64,
    pub access_count: u64,
}

impl BundleSummary {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at < now
    }
}

/// Row ordering for [`BundleStore::list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListOrder {
    /// Priority class first, perishable by soonest expiry, then oldest.
    /// `hot_first` puts most-accessed bundles first within a class.
    Transmission { hot_first: bool },
    #[default]
    OldestFirst,
    NewestFirst,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleFilter {
    pub priority: Option<Priority>,
    pub topic: Option<String>,
    pub payload_type: Option<String>,
    /// Only bundles with `expires_at` strictly before this instant.
    pub expires_before: Option<Timestamp>,
    /// Only bundles still alive at this instant.
    pub unexpired_at: Option<Timestamp>,
    /// Only bundles not yet recorded as known to this peer.
    pub unknown_to_peer: Option<String>,
    pub order: ListOrder,
    pub limit: Option<usize>,
}

impl BundleFilter {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_payload_type(mut self, payload_type: impl Into<String>) -> Self {
        self.payload_type = Some(payload_type.into());
        self
    }

    pub fn expiring_before(mut self, at: Timestamp) -> Self {
        self.expires_before = Some(at);
        self
    }

    pub fn alive_at(mut self, now: Timestamp) -> Self {
        self.unexpired_at = Some(now);
        self
    }

    pub fn unknown_to(mut self, peer: impl Into<String>) -> Self {
        self.unknown_to_peer = Some(peer.into());
        self
    }

    pub fn ordered(mut self, order: ListOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Trigger-maintained totals; reading them never scans the bundle table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub bundle_count: u64,
    pub total_bytes: u64,
}

/// Eviction tiers, lowest retention value first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RetentionTier {
    Expired,
    Ordinary,
    Hot,
    PerishableSoon,
    /// Unexpired emergency bundles; never selected for eviction.
    Protected,
}

impl RetentionTier {
    /// Tiers eviction may draw from, in the order it draws from them.
    pub const EVICTABLE: [RetentionTier; 4] = [
        RetentionTier::Expired,
        RetentionTier::Ordinary,
        RetentionTier::Hot,
        RetentionTier::PerishableSoon,
    ];
}

/// Per-peer contact record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCursor {
    pub peer: String,
    pub first_contact: Timestamp,
    pub last_contact: Timestamp,
    pub sessions: u64,
    pub known_bundles: u64,
}

/// SQLite-backed bundle store.
///
/// Every public method is one short critical section on the connection, so
/// concurrent sessions interleave at operation granularity and never hold the
/// store across peer I/O.
#[derive(Debug)]
pub struct BundleStore {
    conn: Mutex<Connection>,
}

fn ts(t: Timestamp) -> i64 {
    i64::try_from(t.as_secs()).unwrap_or(i64::MAX)
}

fn from_sql_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn conversion_error(
    idx: usize,
    ty: Type,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, err.into())
}

fn id_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<BundleId> {
    let raw: Vec<u8> = row.get(idx)?;
    let bytes: [u8; 32] = raw
        .as_slice()
        .try_into()
        .map_err(|_| conversion_error(idx, Type::Blob, "bundle id must be 32 bytes"))?;
    Ok(BundleId(bytes))
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<BundleSummary> {
    let rank: i64 = row.get(3)?;
    let priority = u8::try_from(rank)
        .ok()
        .and_then(Priority::from_rank)
        .ok_or_else(|| conversion_error(3, Type::Integer, "unknown priority rank"))?;
    let tags_json: String = row.get(6)?;
    let tags: Vec<String> =
        serde_json::from_str(&tags_json).map_err(|e| conversion_error(6, Type::Text, e))?;
    let author_raw: Vec<u8> = row.get(9)?;
    let author: PublicKey = author_raw
        .as_slice()
        .try_into()
        .map_err(|_| conversion_error(9, Type::Blob, "author must be 32 bytes"))?;
    Ok(BundleSummary {
        id: id_column(row, 0)?,
        created_at: Timestamp(from_sql_u64(row.get(1)?)),
        expires_at: Timestamp(from_sql_u64(row.get(2)?)),
        priority,
        audience: row.get(4)?,
        topic: row.get(5)?,
        tags,
        payload_type: row.get(7)?,
        payload_len: from_sql_u64(row.get(8)?),
        author,
        size: from_sql_u64(row.get(10)?),
        access_count: from_sql_u64(row.get(11)?),
    })
}

impl BundleStore {
    /// Opens (or creates) a store file, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;",
        )?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomic insert-if-absent keyed by bundle id. Never overwrites.
    pub fn put(&self, bundle: &Bundle, now: Timestamp) -> Result<PutOutcome, StoreError> {
        let envelope = encode_bundle_cbor(bundle)?;
        let tags = serde_json::to_string(&bundle.tags)?;
        let size = envelope.len() as i64;
        let changed = self.conn().execute(
            "INSERT OR IGNORE INTO bundles (
               id, created_at, expires_at, priority, audience, topic, tags,
               payload_type, payload_len, author, envelope, size, stored_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                &bundle.id.0[..],
                ts(bundle.created_at),
                ts(bundle.expires_at),
                i64::from(bundle.priority.rank()),
                bundle.audience,
                bundle.topic,
                tags,
                bundle.payload_type,
                bundle.payload.len() as i64,
                &bundle.author[..],
                envelope,
                size,
                ts(now),
            ],
        )?;
        if changed == 1 {
            debug!(bundle_id = %bundle.id.short(), bytes = size, "bundle stored");
            Ok(PutOutcome::Inserted)
        } else {
            Ok(PutOutcome::DuplicateSkipped)
        }
    }

    pub fn get(&self, id: &BundleId) -> Result<Option<Bundle>, StoreError> {
        match self.get_envelope(id)? {
            Some(bytes) => Ok(Some(decode_bundle_cbor(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Stored wire envelope, exactly as it will be sent to peers.
    pub fn get_envelope(&self, id: &BundleId) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .conn()
            .query_row(
                "SELECT envelope FROM bundles WHERE id = ?1",
                [&id.0[..]],
                |r| r.get(0),
            )
            .optional()?)
    }

    pub fn summary(&self, id: &BundleId) -> Result<Option<BundleSummary>, StoreError> {
        let sql = format!("SELECT {SUMMARY_COLUMNS} FROM bundles WHERE id = ?1");
        Ok(self
            .conn()
            .query_row(&sql, [&id.0[..]], summary_from_row)
            .optional()?)
    }

    pub fn contains(&self, id: &BundleId) -> Result<bool, StoreError> {
        Ok(self
            .conn()
            .query_row("SELECT 1 FROM bundles WHERE id = ?1", [&id.0[..]], |_| Ok(()))
            .optional()?
            .is_some())
    }

    /// Removes one bundle. Returns its stored size when it was present.
    pub fn delete(&self, id: &BundleId) -> Result<Option<u64>, StoreError> {
        Ok(self
            .conn()
            .query_row(
                "DELETE FROM bundles WHERE id = ?1 RETURNING size",
                [&id.0[..]],
                |r| r.get::<_, i64>(0),
            )
            .optional()?
            .map(from_sql_u64))
    }

    pub fn list(&self, filter: &BundleFilter) -> Result<Vec<BundleSummary>, StoreError> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(priority) = filter.priority {
            clauses.push("priority = ?");
            values.push(Value::Integer(i64::from(priority.rank())));
        }
        if let Some(topic) = &filter.topic {
            clauses.push("topic = ?");
            values.push(Value::Text(topic.clone()));
        }
        if let Some(payload_type) = &filter.payload_type {
            clauses.push("payload_type = ?");
            values.push(Value::Text(payload_type.clone()));
        }
        if let Some(before) = filter.expires_before {
            clauses.push("expires_at < ?");
            values.push(Value::Integer(ts(before)));
        }
        if let Some(now) = filter.unexpired_at {
            clauses.push("expires_at >= ?");
            values.push(Value::Integer(ts(now)));
        }
        if let Some(peer) = &filter.unknown_to_peer {
            clauses.push(
                "NOT EXISTS (SELECT 1 FROM peer_known k WHERE k.peer = ? AND k.bundle_id = bundles.id)",
            );
            values.push(Value::Text(peer.clone()));
        }

        let mut sql = format!("SELECT {SUMMARY_COLUMNS} FROM bundles");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(match filter.order {
            ListOrder::Transmission { hot_first: false } => {
                " ORDER BY priority ASC, CASE WHEN priority = 1 THEN expires_at ELSE 0 END ASC, \
                 created_at ASC, id ASC"
            }
            ListOrder::Transmission { hot_first: true } => {
                " ORDER BY priority ASC, CASE WHEN priority = 1 THEN expires_at ELSE 0 END ASC, \
                 access_count DESC, created_at ASC, id ASC"
            }
            ListOrder::OldestFirst => " ORDER BY created_at ASC, id ASC",
            ListOrder::NewestFirst => " ORDER BY created_at DESC, id ASC",
        });
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        }

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), summary_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Every stored id, expired or not.
    pub fn ids(&self) -> Result<Vec<BundleId>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id FROM bundles ORDER BY id")?;
        let rows = stmt.query_map([], |r| id_column(r, 0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(self.conn().query_row(
            "SELECT bundle_count, total_bytes FROM store_stats WHERE singleton = 0",
            [],
            |r| {
                Ok(StoreStats {
                    bundle_count: from_sql_u64(r.get(0)?),
                    total_bytes: from_sql_u64(r.get(1)?),
                })
            },
        )?)
    }

    /// Deletes every bundle with `expires_at < now`, whatever its priority.
    /// Returns the removed ids with their stored sizes.
    pub fn delete_expired(&self, now: Timestamp) -> Result<Vec<(BundleId, u64)>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("DELETE FROM bundles WHERE expires_at < ?1 RETURNING id, size")?;
        let rows = stmt.query_map([ts(now)], |r| {
            Ok((id_column(r, 0)?, from_sql_u64(r.get(1)?)))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Next bundle eviction would take from `tier`: oldest `created_at`
    /// first, id as tiebreak, so repeated runs pick the same victim.
    pub fn eviction_candidate(
        &self,
        tier: RetentionTier,
        now: Timestamp,
        perishable_window: Duration,
        hot_threshold: u64,
    ) -> Result<Option<(BundleId, u64)>, StoreError> {
        let perishable_soon = "(priority = 1 AND expires_at < ?2)";
        let sql = match tier {
            RetentionTier::Expired => {
                "SELECT id, size FROM bundles WHERE expires_at < ?1 \
                 ORDER BY expires_at ASC, id ASC LIMIT 1"
                    .to_string()
            }
            RetentionTier::Ordinary => format!(
                "SELECT id, size FROM bundles WHERE expires_at >= ?1 AND priority != 0 \
                 AND NOT {perishable_soon} AND access_count < ?3 \
                 ORDER BY created_at ASC, id ASC LIMIT 1"
            ),
            RetentionTier::Hot => format!(
                "SELECT id, size FROM bundles WHERE expires_at >= ?1 AND priority != 0 \
                 AND NOT {perishable_soon} AND access_count >= ?3 \
                 ORDER BY created_at ASC, id ASC LIMIT 1"
            ),
            RetentionTier::PerishableSoon => format!(
                "SELECT id, size FROM bundles WHERE expires_at >= ?1 AND {perishable_soon} \
                 ORDER BY created_at ASC, id ASC LIMIT 1"
            ),
            RetentionTier::Protected => return Ok(None),
        };
        let horizon = now.saturating_add(perishable_window);
        let hot = i64::try_from(hot_threshold).unwrap_or(i64::MAX);
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let bound: Vec<Value> = match tier {
            RetentionTier::Expired => vec![Value::Integer(ts(now))],
            RetentionTier::PerishableSoon => {
                vec![Value::Integer(ts(now)), Value::Integer(ts(horizon))]
            }
            _ => vec![
                Value::Integer(ts(now)),
                Value::Integer(ts(horizon)),
                Value::Integer(hot),
            ],
        };
        Ok(stmt
            .query_row(params_from_iter(bound.iter()), |r| {
                Ok((id_column(r, 0)?, from_sql_u64(r.get(1)?)))
            })
            .optional()?)
    }

    /// Bumps access counters; unknown ids are ignored.
    pub fn note_access(&self, ids: &[BundleId]) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("UPDATE bundles SET access_count = access_count + 1 WHERE id = ?1")?;
            for id in ids {
                stmt.execute([&id.0[..]])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn record_peer_contact(&self, peer: &str, now: Timestamp) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO peers (peer, first_contact, last_contact, sessions)
             VALUES (?1, ?2, ?2, 1)
             ON CONFLICT(peer) DO UPDATE
             SET last_contact = excluded.last_contact, sessions = sessions + 1",
            params![peer, ts(now)],
        )?;
        Ok(())
    }

    /// Records that `peer` holds `ids`. Ids not in the store are skipped, so
    /// the cursor never references a bundle this node cannot serve.
    pub fn record_known(&self, peer: &str, ids: &[BundleId]) -> Result<usize, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut added = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO peer_known (peer, bundle_id)
                 SELECT ?1, id FROM bundles WHERE id = ?2",
            )?;
            for id in ids {
                added += stmt.execute(params![peer, &id.0[..]])?;
            }
        }
        tx.commit()?;
        Ok(added)
    }

    pub fn known_ids(&self, peer: &str) -> Result<HashSet<BundleId>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT bundle_id FROM peer_known WHERE peer = ?1")?;
        let rows = stmt.query_map([peer], |r| id_column(r, 0))?;
        let mut out = HashSet::new();
        for row in rows {
            out.insert(row?);
        }
        Ok(out)
    }

    pub fn peer_cursor(&self, peer: &str) -> Result<Option<PeerCursor>, StoreError> {
        Ok(self
            .conn()
            .query_row(
                "SELECT p.peer, p.first_contact, p.last_contact, p.sessions,
                        (SELECT COUNT(*) FROM peer_known k WHERE k.peer = p.peer)
                 FROM peers p WHERE p.peer = ?1",
                [peer],
                |r| {
                    Ok(PeerCursor {
                        peer: r.get(0)?,
                        first_contact: Timestamp(from_sql_u64(r.get(1)?)),
                        last_contact: Timestamp(from_sql_u64(r.get(2)?)),
                        sessions: from_sql_u64(r.get(3)?),
                        known_bundles: from_sql_u64(r.get(4)?),
                    })
                },
            )
            .optional()?)
    }

    pub fn save_config_record<T: Serialize>(
        &self,
        record: &T,
        now: Timestamp,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        self.conn().execute(
            "INSERT INTO node_config (singleton, record, updated_at) VALUES (0, ?1, ?2)
             ON CONFLICT(singleton) DO UPDATE
             SET record = excluded.record, updated_at = excluded.updated_at",
            params![json, ts(now)],
        )?;
        Ok(())
    }

    pub fn load_config_record<T: DeserializeOwned>(&self) -> Result<Option<T>, StoreError> {
        let json: Option<String> = self
            .conn()
            .query_row(
                "SELECT record FROM node_config WHERE singleton = 0",
                [],
                |r| r.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}
