//! Short-TTL map of last-known delivery status per provisional id.
//!
//! Bridges the UI across a reconnect race: if the process died between a
//! replayed send being acknowledged and the timeline catching up, the status
//! recorded here keeps the bubble from reverting to `sending` on reload.

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use uuid::Uuid;

use ripple_shared::types::{DeliveryStatus, ProvisionalId};

use crate::database::Database;
use crate::error::Result;
use crate::models::StatusRecord;

impl Database {
    pub fn upsert_status(&self, id: ProvisionalId, status: DeliveryStatus) -> Result<()> {
        self.conn().execute(
            "INSERT INTO message_status (provisional_id, status, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(provisional_id) DO UPDATE SET
                 status = excluded.status,
                 updated_at = excluded.updated_at",
            params![
                id.0.to_string(),
                status.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn get_status(&self, id: ProvisionalId) -> Result<Option<StatusRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT provisional_id, status, updated_at
             FROM message_status WHERE provisional_id = ?1",
        )?;

        let mut rows = stmt.query_map(params![id.0.to_string()], row_to_status_record)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Drop entries older than `ttl_secs`; returns how many were purged.
    pub fn purge_stale_statuses(&self, ttl_secs: i64) -> Result<usize> {
        let cutoff = Utc::now() - Duration::seconds(ttl_secs);
        let affected = self.conn().execute(
            "DELETE FROM message_status WHERE updated_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(affected)
    }
}

fn row_to_status_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<StatusRecord> {
    let id_str: String = row.get(0)?;
    let status_str: String = row.get(1)?;
    let updated_str: String = row.get(2)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let status = DeliveryStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown status '{status_str}'").into(),
        )
    })?;

    let updated_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&updated_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(StatusRecord {
        provisional_id: ProvisionalId(id),
        status,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_overwrites_previous_status() {
        let db = Database::open_in_memory().unwrap();
        let id = ProvisionalId::new();

        db.upsert_status(id, DeliveryStatus::Sending).unwrap();
        db.upsert_status(id, DeliveryStatus::Sent).unwrap();

        let rec = db.get_status(id).unwrap().unwrap();
        assert_eq!(rec.status, DeliveryStatus::Sent);
    }

    #[test]
    fn missing_status_is_none() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_status(ProvisionalId::new()).unwrap().is_none());
    }

    #[test]
    fn purge_drops_only_stale_rows() {
        let db = Database::open_in_memory().unwrap();
        let fresh = ProvisionalId::new();
        db.upsert_status(fresh, DeliveryStatus::Sent).unwrap();

        // Entries newer than the TTL survive.
        assert_eq!(db.purge_stale_statuses(60).unwrap(), 0);
        assert!(db.get_status(fresh).unwrap().is_some());

        // A zero TTL treats everything as stale.
        assert_eq!(db.purge_stale_statuses(-1).unwrap(), 1);
        assert!(db.get_status(fresh).unwrap().is_none());
    }
}
