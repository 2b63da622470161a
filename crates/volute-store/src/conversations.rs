//! Conversations, participants, messages, and named channels.

use std::str::FromStr;
use tracing::{info, warn};
use volute_core::types::{ContentBlock, ConversationKind, MessageRole};

use crate::error::{Result, StoreError};
use crate::store::{now_rfc3339, StateStore};
use crate::types::{Conversation, Participant, ParticipantRole, StoredMessage};
use crate::users::{optional, row_to_user};

/// Longest auto-derived conversation title.
const TITLE_MAX_CHARS: usize = 80;

const CONV_SELECT: &str =
    "SELECT id, mind_name, channel, type, name, title, created_at, updated_at FROM conversations";

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        mind_name: row.get(1)?,
        channel: row.get(2)?,
        kind: ConversationKind::from_str(&row.get::<_, String>(3)?)
            .unwrap_or(ConversationKind::Group),
        name: row.get(4)?,
        title: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl StateStore {
    pub fn create_conversation(
        &self,
        mind_name: Option<&str>,
        channel: &str,
        kind: ConversationKind,
        name: Option<&str>,
    ) -> Result<Conversation> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO conversations (id, mind_name, channel, type, name, title, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?6)",
            rusqlite::params![id, mind_name, channel, kind.to_string(), name, now],
        )?;
        Ok(Conversation {
            id,
            mind_name: mind_name.map(String::from),
            channel: channel.to_string(),
            kind,
            name: name.map(String::from),
            title: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let db = self.db.lock().unwrap();
        optional(db.query_row(
            &format!("{} WHERE id = ?1", CONV_SELECT),
            [id],
            row_to_conversation,
        ))
    }

    /// Reuse the conversation keyed by (mind, channel, type), creating it on
    /// first contact. This is how DMs from one origin keep a single thread.
    pub fn get_or_create_conversation(
        &self,
        mind_name: &str,
        channel: &str,
        kind: ConversationKind,
    ) -> Result<Conversation> {
        {
            let db = self.db.lock().unwrap();
            let existing = optional(db.query_row(
                &format!(
                    "{} WHERE mind_name = ?1 AND channel = ?2 AND type = ?3",
                    CONV_SELECT
                ),
                rusqlite::params![mind_name, channel, kind.to_string()],
                row_to_conversation,
            ))?;
            if let Some(conversation) = existing {
                return Ok(conversation);
            }
        }
        self.create_conversation(Some(mind_name), channel, kind, None)
    }

    /// Scan the mind's DMs for one whose participant set is exactly the two
    /// given users.
    pub fn find_dm_conversation(
        &self,
        mind_name: &str,
        user_a: i64,
        user_b: i64,
    ) -> Result<Option<Conversation>> {
        let candidates: Vec<Conversation> = {
            let db = self.db.lock().unwrap();
            let mut stmt = db.prepare(&format!(
                "{} WHERE mind_name = ?1 AND type = 'dm'",
                CONV_SELECT
            ))?;
            let rows: Vec<Conversation> = stmt
                .query_map([mind_name], row_to_conversation)?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };

        for conversation in candidates {
            let mut ids: Vec<i64> = self
                .list_participants(&conversation.id)?
                .into_iter()
                .map(|p| p.user.id)
                .collect();
            ids.sort_unstable();
            let mut want = [user_a, user_b];
            want.sort_unstable();
            if ids == want {
                return Ok(Some(conversation));
            }
        }
        Ok(None)
    }

    pub fn list_conversations(&self, mind_name: Option<&str>) -> Result<Vec<Conversation>> {
        let db = self.db.lock().unwrap();
        let rows = match mind_name {
            Some(mind) => {
                let mut stmt = db.prepare(&format!(
                    "{} WHERE mind_name = ?1 ORDER BY updated_at DESC",
                    CONV_SELECT
                ))?;
                let rows: Vec<Conversation> = stmt
                    .query_map([mind], row_to_conversation)?
                    .filter_map(|r| r.ok())
                    .collect();
                rows
            }
            None => {
                let mut stmt =
                    db.prepare(&format!("{} ORDER BY updated_at DESC", CONV_SELECT))?;
                let rows: Vec<Conversation> = stmt
                    .query_map([], row_to_conversation)?
                    .filter_map(|r| r.ok())
                    .collect();
                rows
            }
        };
        Ok(rows)
    }

    // --- participants ------------------------------------------------------

    pub fn add_participant(
        &self,
        conversation_id: &str,
        user_id: i64,
        role: ParticipantRole,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO participants (conversation_id, user_id, role)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![conversation_id, user_id, role.to_string()],
        )?;
        Ok(())
    }

    pub fn remove_participant(&self, conversation_id: &str, user_id: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
            rusqlite::params![conversation_id, user_id],
        )?;
        Ok(())
    }

    pub fn list_participants(&self, conversation_id: &str) -> Result<Vec<Participant>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT u.id, u.username, u.password_hash, u.role, u.user_type, u.created_at, p.role
             FROM participants p JOIN users u ON u.id = p.user_id
             WHERE p.conversation_id = ?1
             ORDER BY u.id",
        )?;
        let rows = stmt
            .query_map([conversation_id], |row| {
                let user = row_to_user(row)?;
                let role = ParticipantRole::from_str(&row.get::<_, String>(6)?)
                    .unwrap_or(ParticipantRole::Member);
                Ok(Participant { user, role })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn is_participant(&self, conversation_id: &str, user_id: i64) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
            rusqlite::params![conversation_id, user_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // --- messages ----------------------------------------------------------

    /// Append a message, bump the conversation's `updated_at`, and derive the
    /// title from the first user text block when none is set yet.
    ///
    /// Returns the stored row so the caller can publish it on the event bus.
    pub fn add_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        sender_name: Option<&str>,
        content: &[ContentBlock],
    ) -> Result<StoredMessage> {
        let encoded = serde_json::to_string(content)?;
        let now = now_rfc3339();

        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        tx.execute(
            "INSERT INTO messages (conversation_id, role, sender_name, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![conversation_id, role.to_string(), sender_name, encoded, now],
        )?;
        let id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            rusqlite::params![now, conversation_id],
        )?;

        if role == MessageRole::User {
            if let Some(text) = content.iter().find_map(|b| b.as_text()) {
                let title: String = text.chars().take(TITLE_MAX_CHARS).collect();
                if !title.is_empty() {
                    tx.execute(
                        "UPDATE conversations SET title = ?1 WHERE id = ?2 AND title IS NULL",
                        rusqlite::params![title, conversation_id],
                    )?;
                }
            }
        }

        tx.commit()?;

        Ok(StoredMessage {
            id,
            conversation_id: conversation_id.to_string(),
            role,
            sender_name: sender_name.map(String::from),
            content: content.to_vec(),
            created_at: now,
        })
    }

    /// Messages in insertion order. Rows whose content no longer parses are
    /// skipped with a warning.
    pub fn list_messages(
        &self,
        conversation_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, conversation_id, role, sender_name, content, created_at
             FROM messages WHERE conversation_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let limit = limit.unwrap_or(usize::MAX).min(i64::MAX as usize) as i64;
        let mut rows: Vec<StoredMessage> = stmt
            .query_map(rusqlite::params![conversation_id, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(id, conversation_id, role, sender_name, raw, created_at)| {
                let content: Vec<ContentBlock> = match serde_json::from_str(&raw) {
                    Ok(blocks) => blocks,
                    Err(e) => {
                        warn!(message_id = id, error = %e, "skipping message with unparseable content");
                        return None;
                    }
                };
                let role = MessageRole::from_str(&role).ok()?;
                Some(StoredMessage {
                    id,
                    conversation_id,
                    role,
                    sender_name,
                    content,
                    created_at,
                })
            })
            .collect();
        rows.reverse();
        Ok(rows)
    }

    // --- channels ----------------------------------------------------------

    /// Create a named channel conversation owned by `owner`. The channel URI
    /// is `volute:<conversation id>`.
    pub fn create_channel(&self, name: &str, owner: i64) -> Result<Conversation> {
        let id = uuid::Uuid::new_v4().to_string();
        let channel = format!("volute:{}", id);
        let now = now_rfc3339();

        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let taken: i64 = tx.query_row(
            "SELECT COUNT(*) FROM conversations WHERE name = ?1",
            [name],
            |row| row.get(0),
        )?;
        if taken > 0 {
            return Err(StoreError::ChannelTaken(name.to_string()));
        }

        tx.execute(
            "INSERT INTO conversations (id, mind_name, channel, type, name, title, created_at, updated_at)
             VALUES (?1, NULL, ?2, 'channel', ?3, NULL, ?4, ?4)",
            rusqlite::params![id, channel, name, now],
        )?;
        tx.execute(
            "INSERT INTO participants (conversation_id, user_id, role) VALUES (?1, ?2, 'owner')",
            rusqlite::params![id, owner],
        )?;
        tx.commit()?;

        info!(channel = name, "channel created");
        Ok(Conversation {
            id,
            mind_name: None,
            channel,
            kind: ConversationKind::Channel,
            name: Some(name.to_string()),
            title: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get_channel_by_name(&self, name: &str) -> Result<Option<Conversation>> {
        let db = self.db.lock().unwrap();
        optional(db.query_row(
            &format!("{} WHERE name = ?1 AND type = 'channel'", CONV_SELECT),
            [name],
            row_to_conversation,
        ))
    }

    pub fn list_channels(&self) -> Result<Vec<Conversation>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "{} WHERE type = 'channel' ORDER BY name",
            CONV_SELECT
        ))?;
        let rows = stmt
            .query_map([], row_to_conversation)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn join_channel(&self, name: &str, user_id: i64) -> Result<Conversation> {
        let conversation = self
            .get_channel_by_name(name)?
            .ok_or_else(|| StoreError::not_found(format!("channel {}", name)))?;
        self.add_participant(&conversation.id, user_id, ParticipantRole::Member)?;
        Ok(conversation)
    }

    pub fn leave_channel(&self, name: &str, user_id: i64) -> Result<()> {
        let conversation = self
            .get_channel_by_name(name)?
            .ok_or_else(|| StoreError::not_found(format!("channel {}", name)))?;
        self.remove_participant(&conversation.id, user_id)
    }
}
