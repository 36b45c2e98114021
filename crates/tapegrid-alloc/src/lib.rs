//! tapegrid-alloc — media allocation decisions.
//!
//! Pure decision logic: given a snapshot of the devices and media a
//! scheduler manages, pick the (device, medium) pair that serves a write,
//! read or format request, or explain why none can. Nothing here takes
//! locks or talks to hardware; the scheduler re-validates every decision
//! when it claims the chosen resources.
//!
//! # Components
//!
//! - **`views`** — Snapshots of devices and media as the allocator sees them
//! - **`allocator`** — Write, read and format policies
//! - **`convert`** — Building views from catalog records

pub mod allocator;
pub mod convert;
pub mod views;

pub use allocator::{AllocError, Allocation, WriteIntent, allocate_format, allocate_read, allocate_write};
pub use convert::{locked_keys, medium_view, medium_views};
pub use views::{DeviceView, MediumView};
