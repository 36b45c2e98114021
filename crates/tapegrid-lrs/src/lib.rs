//! tapegrid-lrs — local resource scheduler.
//!
//! Arbitrates access to the drives and media attached to one host. Clients
//! submit asynchronous requests (write, read, format, release) and collect
//! correlated responses; the scheduler picks resources, takes locks in the
//! catalog and drives the hardware through a [`DeviceAdapter`].
//!
//! ```text
//!   LrsClient ──submit──▶ Dispatcher ──Prepare/Release──▶ DeviceWorker (one per drive)
//!       ▲                     │  ▲                              │
//!       └──── Response ───────┘  └────────── WorkerEvent ───────┘
//! ```
//!
//! # Components
//!
//! - **`device`** — Device records, the registry arena and lock guards
//! - **`dispatcher`** — Request queue, allocation and busy backoff
//! - **`worker`** — Per-drive state machine running adapter calls
//! - **`adapter`** — Hardware interface; **`sim`** is a directory-backed library
//! - **`audit`** — One catalog log entry per physical action

pub mod adapter;
pub mod audit;
pub mod backoff;
pub mod client;
pub mod device;
mod dispatcher;
pub mod error;
pub mod lrs;
pub mod sim;
mod worker;

pub use adapter::{AdapterError, AdapterResult, DeviceAdapter, DriveState, FsSpace};
pub use audit::AuditLog;
pub use backoff::{Backoff, retry_catalog};
pub use client::LrsClient;
pub use device::{Device, DeviceRegistry, ResourceGuard};
pub use error::{LrsError, LrsResult};
pub use lrs::Lrs;
pub use sim::{SimAction, SimLibrary};
