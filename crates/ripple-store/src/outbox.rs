//! Persisted outbox queue.
//!
//! Append-only from the send path, drained by the reconnect path; both
//! treat it as single-writer-at-a-time (the replayer holds a draining flag).

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use ripple_shared::types::{ChatId, MessageDraft, MessageId, ProvisionalId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{media_kind_from_str, media_kind_to_str, OutboxRecord};

impl Database {
    pub fn enqueue_outbox(&self, record: &OutboxRecord) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO outbox
                 (provisional_id, chat_id, sender_id, body, media_url, media_kind,
                  reply_to, forwarded, enqueued_at, attempts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.provisional_id.0.to_string(),
                record.chat_id.0.to_string(),
                record.sender_id.0.to_string(),
                record.draft.body,
                record.draft.media_url,
                record.draft.media_kind.map(media_kind_to_str),
                record.draft.reply_to.map(|id| id.0.to_string()),
                record.draft.forwarded as i32,
                record.enqueued_at.to_rfc3339(),
                record.attempts,
            ],
        )?;
        Ok(())
    }

    pub fn remove_outbox(&self, id: ProvisionalId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM outbox WHERE provisional_id = ?1",
            params![id.0.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Increment the attempt counter and return the new count.
    pub fn bump_outbox_attempts(&self, id: ProvisionalId) -> Result<u32> {
        let affected = self.conn().execute(
            "UPDATE outbox SET attempts = attempts + 1 WHERE provisional_id = ?1",
            params![id.0.to_string()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        let attempts: u32 = self.conn().query_row(
            "SELECT attempts FROM outbox WHERE provisional_id = ?1",
            params![id.0.to_string()],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    /// All pending sends in enqueue order.  Ordering matters within a chat;
    /// a global enqueue-order drain preserves it trivially.
    pub fn pending_outbox(&self) -> Result<Vec<OutboxRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT provisional_id, chat_id, sender_id, body, media_url, media_kind,
                    reply_to, forwarded, enqueued_at, attempts
             FROM outbox
             ORDER BY enqueued_at ASC, rowid ASC",
        )?;

        let rows = stmt.query_map([], row_to_outbox_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Pending sends for one chat, in enqueue order.
    pub fn pending_outbox_for_chat(&self, chat_id: ChatId) -> Result<Vec<OutboxRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT provisional_id, chat_id, sender_id, body, media_url, media_kind,
                    reply_to, forwarded, enqueued_at, attempts
             FROM outbox
             WHERE chat_id = ?1
             ORDER BY enqueued_at ASC, rowid ASC",
        )?;

        let rows = stmt.query_map(params![chat_id.0.to_string()], row_to_outbox_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn outbox_len(&self) -> Result<u32> {
        let count: u32 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn row_to_outbox_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxRecord> {
    let provisional_str: String = row.get(0)?;
    let chat_str: String = row.get(1)?;
    let sender_str: String = row.get(2)?;
    let body: Option<String> = row.get(3)?;
    let media_url: Option<String> = row.get(4)?;
    let media_kind_str: Option<String> = row.get(5)?;
    let reply_to_str: Option<String> = row.get(6)?;
    let forwarded: i32 = row.get(7)?;
    let enqueued_str: String = row.get(8)?;
    let attempts: u32 = row.get(9)?;

    let provisional_id = parse_uuid(&provisional_str, 0)?;
    let chat_id = parse_uuid(&chat_str, 1)?;
    let sender_id = parse_uuid(&sender_str, 2)?;
    let reply_to = match reply_to_str {
        Some(ref s) => Some(MessageId(parse_uuid(s, 6)?)),
        None => None,
    };

    let enqueued_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&enqueued_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(OutboxRecord {
        provisional_id: ProvisionalId(provisional_id),
        chat_id: ChatId(chat_id),
        sender_id: UserId(sender_id),
        draft: MessageDraft {
            body,
            media_url,
            media_kind: media_kind_str.as_deref().and_then(media_kind_from_str),
            reply_to,
            forwarded: forwarded != 0,
        },
        enqueued_at,
        attempts,
    })
}

fn parse_uuid(s: &str, column: usize) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}
