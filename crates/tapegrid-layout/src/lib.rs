//! tapegrid-layout — object layouts and the transfer state machines.
//!
//! An object is stored as an ordered list of extents, each a file on some
//! medium. This crate turns a [`Transfer`] into a sequence of scheduler
//! requests and performs the extent I/O once media are granted.
//!
//! # Components
//!
//! - **`Transfer`** — what the caller asked for: object id, file, options.
//! - **`Encoder`** — encoder, decoder or eraser for one transfer. Pure state
//!   machine: requests out, responses in.
//! - **extent I/O** — writing, reading and removing extent files on a mount.
//! - **`locate`** — which host should serve a read.

pub mod encoder;
pub mod error;
pub mod extent;
pub mod locate;
pub mod transfer;

pub use encoder::{Encoder, EncoderKind, Phase, StepOutput, validate};
pub use error::{LayoutError, LayoutResult};
pub use extent::{extent_address, read_extent, remove_extent, write_extent};
pub use locate::locate;
pub use transfer::{LayoutOptions, Transfer, XferFlags, XferOp};
