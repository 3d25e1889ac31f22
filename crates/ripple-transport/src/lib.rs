//! # ripple-transport
//!
//! The transport abstraction every higher layer depends on: a topic-scoped
//! pub/sub bus ([`EventBus`]), a request/response data API ([`Backend`]) and
//! an opaque blob store ([`BlobStorage`]).
//!
//! The bus delivers at-least-once with no ordering guarantee across distinct
//! publishers; both properties are load-bearing for the delivery engine's
//! reconciliation logic.  The in-memory implementations in [`memory`] back
//! local mode and every test in the workspace.

pub mod backend;
pub mod bus;
pub mod error;
pub mod memory;

pub use backend::{Backend, BlobStorage, DeleteScope};
pub use bus::{Envelope, EventBus};
pub use error::{BackendError, TransportError};
pub use memory::{MemoryBackend, MemoryBlobs, MemoryBus};
