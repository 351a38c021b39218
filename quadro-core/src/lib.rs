//! # quadro-core — Domain model for the quadro task board
//!
//! Boards contain lists, lists contain cards. Sibling order is never an
//! array index: every list and card carries a [`PositionKey`], a densely
//! orderable string key, so any item can be dropped between two neighbors
//! without rewriting anyone else's record.
//!
//! ```text
//! Board ──┬── List (position "F")  ──┬── Card (position "8")
//!         │                          └── Card (position "V")
//!         └── List (position "V")  ──── Card (position "M")
//! ```
//!
//! ## Modules
//!
//! - [`model`] — Board / List / Card records with version counters
//! - [`position`] — position-key allocator (`PositionKey::between`)
//! - [`store`] — record store trait + in-memory implementation

pub mod model;
pub mod position;
pub mod store;

// Re-exports for convenience
pub use model::{Board, BoardId, Card, CardId, List, ListId, UserId};
pub use position::{OrderingViolation, PositionKey};
pub use store::{MemoryStore, RecordStore, StoreError};
