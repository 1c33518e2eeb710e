//! Append-only event store over SQLite.
//!
//! The store is the single durable surface of the system. It never invokes
//! business logic; every other component folds its own state from the
//! ordered event sequence.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

use crate::events::{Event, EventKind};

/// Raised when an append carries an id that already exists with a different
/// payload. This is a corruption signal, never silently resolved.
#[derive(Debug, Clone)]
pub struct DuplicateEventError {
    pub id: String,
    pub stored_payload: String,
    pub incoming_payload: String,
}

impl std::fmt::Display for DuplicateEventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "event {} already stored with different payload (stored {} bytes, incoming {} bytes)",
            self.id,
            self.stored_payload.len(),
            self.incoming_payload.len()
        )
    }
}

impl std::error::Error for DuplicateEventError {}

pub struct EventStore {
    conn: Connection,
}

impl EventStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                stream_id TEXT NOT NULL,
                ts TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                config_hash TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_stream_ts ON events(stream_id, ts);
            CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
            COMMIT;",
        )?;
        Ok(())
    }

    /// Idempotent append. Re-inserting an identical event returns its id
    /// without writing a second row; an id collision with a differing
    /// payload fails with `DuplicateEventError`.
    pub fn append(&mut self, event: &Event) -> Result<String> {
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM events WHERE id = ?1",
                params![event.id],
                |row| row.get(0),
            )
            .optional()?;

        let incoming = event.payload.to_string();
        if let Some(stored) = stored {
            if stored == incoming {
                return Ok(event.id.clone());
            }
            return Err(DuplicateEventError {
                id: event.id.clone(),
                stored_payload: stored,
                incoming_payload: incoming,
            }
            .into());
        }

        self.conn.execute(
            "INSERT INTO events (id, stream_id, ts, kind, payload, config_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id,
                event.stream_id,
                event.ts,
                event.kind.as_str(),
                incoming,
                event.config_hash
            ],
        )?;
        Ok(event.id.clone())
    }

    /// Ordered query over a stream, optionally filtered by kind and by an
    /// inclusive RFC3339 time range. Total order is `(ts, insertion rowid)`.
    pub fn query(
        &self,
        stream_id: &str,
        kind: Option<EventKind>,
        time_range: Option<(&str, &str)>,
    ) -> Result<Vec<Event>> {
        let mut sql = String::from(
            "SELECT id, stream_id, ts, kind, payload, config_hash FROM events WHERE stream_id = ?1",
        );
        if kind.is_some() {
            sql.push_str(" AND kind = ?2");
        }
        if time_range.is_some() {
            // Placeholder indexes shift when the kind filter is absent, so
            // bind positionally below instead of formatting here.
            sql.push_str(if kind.is_some() {
                " AND ts >= ?3 AND ts <= ?4"
            } else {
                " AND ts >= ?2 AND ts <= ?3"
            });
        }
        sql.push_str(" ORDER BY ts ASC, rowid ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<Event> {
            let kind_raw: String = row.get(3)?;
            let payload_raw: String = row.get(4)?;
            Ok(Event {
                id: row.get(0)?,
                stream_id: row.get(1)?,
                ts: row.get(2)?,
                kind: EventKind::parse(&kind_raw).unwrap_or(EventKind::Halt),
                payload: serde_json::from_str(&payload_raw)
                    .unwrap_or(serde_json::Value::Null),
                config_hash: row.get(5)?,
            })
        };

        let rows = match (kind, time_range) {
            (Some(k), Some((from, to))) => stmt
                .query_map(params![stream_id, k.as_str(), from, to], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            (Some(k), None) => stmt
                .query_map(params![stream_id, k.as_str()], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            (None, Some((from, to))) => stmt
                .query_map(params![stream_id, from, to], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            (None, None) => stmt
                .query_map(params![stream_id], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows)
    }

    /// Restartable batched cursor over a stream. Each call resumes after the
    /// last row returned, so callers can stop and pick up later.
    pub fn cursor(&self, stream_id: &str, batch_size: usize) -> StreamCursor<'_> {
        StreamCursor {
            store: self,
            stream_id: stream_id.to_string(),
            batch_size,
            last_ts: String::new(),
            last_rowid: 0,
        }
    }

    fn next_batch(
        &self,
        stream_id: &str,
        after_ts: &str,
        after_rowid: i64,
        limit: usize,
    ) -> Result<Vec<(i64, Event)>> {
        // Keyset pagination on (ts, rowid) so the cursor walks the same
        // total order as `query` regardless of insertion order.
        let mut stmt = self.conn.prepare(
            "SELECT rowid, id, stream_id, ts, kind, payload, config_hash
             FROM events
             WHERE stream_id = ?1 AND (ts > ?2 OR (ts = ?2 AND rowid > ?3))
             ORDER BY ts ASC, rowid ASC LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(params![stream_id, after_ts, after_rowid, limit as i64], |row| {
                let kind_raw: String = row.get(4)?;
                let payload_raw: String = row.get(5)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    Event {
                        id: row.get(1)?,
                        stream_id: row.get(2)?,
                        ts: row.get(3)?,
                        kind: EventKind::parse(&kind_raw).unwrap_or(EventKind::Halt),
                        payload: serde_json::from_str(&payload_raw)
                            .unwrap_or(serde_json::Value::Null),
                        config_hash: row.get(6)?,
                    },
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn contains(&self, id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM events WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn count(&self, stream_id: &str) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM events WHERE stream_id = ?1",
            params![stream_id],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }
}

pub struct StreamCursor<'a> {
    store: &'a EventStore,
    stream_id: String,
    batch_size: usize,
    last_ts: String,
    last_rowid: i64,
}

impl<'a> StreamCursor<'a> {
    /// Returns the next batch in stream order; empty when exhausted.
    pub fn next_batch(&mut self) -> Result<Vec<Event>> {
        let rows = self.store.next_batch(
            &self.stream_id,
            &self.last_ts,
            self.last_rowid,
            self.batch_size,
        )?;
        if let Some((rowid, ev)) = rows.last() {
            self.last_rowid = *rowid;
            self.last_ts = ev.ts.clone();
        }
        Ok(rows.into_iter().map(|(_, ev)| ev).collect())
    }
}
