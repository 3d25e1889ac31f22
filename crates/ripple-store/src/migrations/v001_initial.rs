//! v001 -- Initial schema creation.
//!
//! Creates the two client-side tables: `outbox` (pending sends that survive
//! restart) and `message_status` (short-TTL provisional-id status bridge).

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Outbox: sends that could not reach the backend, replayed in
-- enqueue order per chat on reconnect.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS outbox (
    provisional_id TEXT PRIMARY KEY NOT NULL,  -- UUID v4, locally generated
    chat_id        TEXT NOT NULL,              -- UUID v4
    sender_id      TEXT NOT NULL,              -- UUID v4
    body           TEXT,
    media_url      TEXT,
    media_kind     TEXT,                       -- image|video|audio|file
    reply_to       TEXT,                       -- nullable durable message id
    forwarded      INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    enqueued_at    TEXT NOT NULL,              -- ISO-8601 / RFC-3339
    attempts       INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_outbox_chat_enqueued
    ON outbox(chat_id, enqueued_at);

-- ----------------------------------------------------------------
-- Last-known delivery status per provisional id.  Short TTL; only
-- bridges the UI across a reconnect race.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS message_status (
    provisional_id TEXT PRIMARY KEY NOT NULL,
    status         TEXT NOT NULL,              -- sending|sent|delivered|read|failed
    updated_at     TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
