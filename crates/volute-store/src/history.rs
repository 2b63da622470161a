//! Mind history trail, delivery queue, and activity log.

use std::str::FromStr;

use crate::error::{Result, StoreError};
use crate::store::{now_rfc3339, StateStore};
use crate::types::{ActivityRow, DeliveryEntry, DeliveryStatus, HistoryEntry};

impl StateStore {
    /// Append one row to a mind's history trail.
    #[allow(clippy::too_many_arguments)]
    pub fn append_history(
        &self,
        mind: &str,
        channel: Option<&str>,
        session: Option<&str>,
        sender: Option<&str>,
        message_id: Option<i64>,
        kind: &str,
        content: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<i64> {
        let now = now_rfc3339();
        let metadata = metadata.map(|m| m.to_string());
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO mind_history
             (mind, channel, session, sender, message_id, type, content, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![mind, channel, session, sender, message_id, kind, content, metadata, now],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// Newest-last history for a mind, capped at `limit` rows.
    pub fn list_history(&self, mind: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, mind, channel, session, sender, message_id, type, content, metadata, created_at
             FROM mind_history WHERE mind = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let mut rows: Vec<HistoryEntry> = stmt
            .query_map(rusqlite::params![mind, limit as i64], |row| {
                Ok(HistoryEntry {
                    id: row.get(0)?,
                    mind: row.get(1)?,
                    channel: row.get(2)?,
                    session: row.get(3)?,
                    sender: row.get(4)?,
                    message_id: row.get(5)?,
                    kind: row.get(6)?,
                    content: row.get(7)?,
                    metadata: row
                        .get::<_, Option<String>>(8)?
                        .and_then(|raw| serde_json::from_str(&raw).ok()),
                    created_at: row.get(9)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        rows.reverse();
        Ok(rows)
    }

    /// Remove a retired mind's trail.
    pub fn clear_history(&self, mind: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM mind_history WHERE mind = ?1", [mind])?;
        Ok(())
    }

    // --- delivery queue ----------------------------------------------------

    /// Park a payload for an offline mind.
    pub fn queue_delivery(
        &self,
        mind: &str,
        session: Option<&str>,
        channel: Option<&str>,
        sender: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        let now = now_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO delivery_queue (mind, session, channel, sender, status, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6)",
            rusqlite::params![mind, session, channel, sender, payload.to_string(), now],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub fn pending_deliveries(&self, mind: &str) -> Result<Vec<DeliveryEntry>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, mind, session, channel, sender, status, payload, created_at
             FROM delivery_queue WHERE mind = ?1 AND status = 'pending' ORDER BY id",
        )?;
        let rows = stmt
            .query_map([mind], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .filter_map(
                |(id, mind, session, channel, sender, status, payload, created_at)| {
                    Some(DeliveryEntry {
                        id,
                        mind,
                        session,
                        channel,
                        sender,
                        status: DeliveryStatus::from_str(&status).ok()?,
                        payload: serde_json::from_str(&payload).ok()?,
                        created_at,
                    })
                },
            )
            .collect();
        Ok(rows)
    }

    pub fn mark_delivery(&self, id: i64, status: DeliveryStatus) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE delivery_queue SET status = ?1 WHERE id = ?2",
            rusqlite::params![status.to_string(), id],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found(format!("delivery {}", id)));
        }
        Ok(())
    }

    // --- activity ----------------------------------------------------------

    pub fn record_activity(
        &self,
        kind: &str,
        mind: &str,
        summary: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<ActivityRow> {
        let now = now_rfc3339();
        let encoded = metadata.map(|m| m.to_string());
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO activity (type, mind, summary, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![kind, mind, summary, encoded, now],
        )?;
        Ok(ActivityRow {
            id: db.last_insert_rowid(),
            kind: kind.to_string(),
            mind: mind.to_string(),
            summary: summary.map(String::from),
            metadata: metadata.cloned(),
            created_at: now,
        })
    }

    /// Most recent activity, newest first.
    pub fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, type, mind, summary, metadata, created_at
             FROM activity ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(ActivityRow {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    mind: row.get(2)?,
                    summary: row.get(3)?,
                    metadata: row
                        .get::<_, Option<String>>(4)?
                        .and_then(|raw| serde_json::from_str(&raw).ok()),
                    created_at: row.get(5)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}
