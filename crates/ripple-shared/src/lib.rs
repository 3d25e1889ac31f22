//! # ripple-shared
//!
//! Identifiers, domain types and the pub/sub wire protocol shared by every
//! crate in the workspace.  Nothing in here performs I/O.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
