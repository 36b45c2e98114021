//! tapegrid-core — vocabulary shared by every TapeGrid crate.
//!
//! - [`types`]: resource identities, statuses, lock targets
//! - [`error`]: the [`ErrorKind`] taxonomy carried in responses and
//!   transfer status codes
//! - [`protocol`]: the request/response contract with the scheduler
//! - [`config`]: `tapegrid.toml` loading

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;

pub use config::TapegridConfig;
pub use error::ErrorKind;
pub use protocol::{CorrelationId, MountInfo, Outcome, Request, Response};
pub use types::*;
