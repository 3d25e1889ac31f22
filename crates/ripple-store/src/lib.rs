//! # ripple-store
//!
//! Client-side persisted state, backed by SQLite.  Only two things live
//! here: the offline outbox (pending sends that must survive a process
//! restart) and the short-TTL map of last-known delivery statuses keyed by
//! provisional id, used to bridge the UI across a reconnect race.
//!
//! The crate exposes a synchronous `Database` handle wrapping a
//! `rusqlite::Connection` with typed helpers; async callers keep it behind
//! a mutex.

pub mod database;
pub mod migrations;
pub mod models;
pub mod outbox;
pub mod status_map;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
