//! tapegrid-state — the catalog.
//!
//! Backed by [redb](https://docs.rs/redb), it holds every durable record the
//! scheduler and the transfer API share: devices, media, objects, layouts
//! with their extents, resource locks and the hardware audit log.
//!
//! # Architecture
//!
//! Records are JSON-serialized into redb's `&[u8]` value columns and keyed
//! by their natural identity (`{family}:{name}` for resources, the object
//! id for objects and layouts). Lock acquisition is a single write
//! transaction, so check-and-take is atomic across every scheduler sharing
//! the database.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`).

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
