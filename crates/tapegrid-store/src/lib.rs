//! tapegrid-store — the transfer API.
//!
//! Callers hand a batch of [`Transfer`](tapegrid_layout::Transfer)s to an
//! [`ObjectStore`]; each one gets its own encoder, decoder or eraser, all
//! driven concurrently against one scheduler client. Object and layout
//! records are committed to the catalog only once a transfer's I/O has
//! completed.
//!
//! ```text
//!   put/get/delete ──▶ Batch ──step──▶ Encoder ──Request──▶ LrsClient
//!                        ▲                                     │
//!                        └────────────── Response ◀────────────┘
//! ```

mod batch;
pub mod error;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use store::ObjectStore;
