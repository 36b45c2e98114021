//! Client-visible transfer descriptors.

use std::collections::BTreeMap;
use std::fs::File;

use tapegrid_core::config::{IoConfig, StoreConfig};
use tapegrid_core::{ErrorKind, LayoutKind, ResourceFamily};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferOp {
    Put,
    Get,
    GetMetadata,
    Delete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XferFlags {
    /// Fail a get with `Remote` when another host is better placed.
    pub best_host: bool,
}

/// One object transfer requested by a caller.
#[derive(Debug)]
pub struct Transfer {
    pub oid: String,
    pub op: XferOp,
    /// Source of a put, destination of a get.
    pub file: Option<File>,
    /// Bytes to put; filled in from the catalog for get and getmd.
    pub size: u64,
    /// Layout for a put; `None` uses the configured default.
    pub layout: Option<LayoutKind>,
    /// Family for a put; `None` uses the configured default.
    pub family: Option<ResourceFamily>,
    pub attrs: BTreeMap<String, String>,
    /// Every medium used by a put must carry all of these tags.
    pub tags: Vec<String>,
    pub flags: XferFlags,
    /// Set once the transfer has completed or failed.
    pub status: Option<Result<(), ErrorKind>>,
}

impl Transfer {
    pub fn new(oid: impl Into<String>, op: XferOp) -> Self {
        Self {
            oid: oid.into(),
            op,
            file: None,
            size: 0,
            layout: None,
            family: None,
            attrs: BTreeMap::new(),
            tags: Vec::new(),
            flags: XferFlags::default(),
            status: None,
        }
    }

    pub fn put(oid: impl Into<String>, file: File, size: u64) -> Self {
        Self {
            file: Some(file),
            size,
            ..Self::new(oid, XferOp::Put)
        }
    }

    pub fn get(oid: impl Into<String>, file: File) -> Self {
        Self {
            file: Some(file),
            ..Self::new(oid, XferOp::Get)
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_some()
    }

    /// Status as a negative errno, 0 on success.
    pub fn rc(&self) -> Option<i32> {
        self.status.map(|s| match s {
            Ok(()) => 0,
            Err(kind) => kind.errno(),
        })
    }
}

/// Placement and I/O parameters resolved for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutOptions {
    pub layout: LayoutKind,
    pub family: ResourceFamily,
    pub block_size: usize,
}

impl LayoutOptions {
    /// The transfer's own choices, falling back to the configuration.
    pub fn resolve(xfer: &Transfer, store: &StoreConfig, io: &IoConfig) -> Self {
        let family = xfer.family.unwrap_or(store.default_family);
        Self {
            layout: xfer.layout.unwrap_or(store.default_layout),
            family,
            block_size: io.block_size(family),
        }
    }
}
