//! Extent I/O against a mounted medium.
//!
//! An extent is one file on the medium's filesystem, named after the
//! object, its position in the layout and a fresh uuid. Bytes are copied in
//! `block_size` chunks and hashed with SHA-256 on the way through.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};
use tapegrid_state::Extent;

use crate::error::{LayoutError, LayoutResult};

/// File name of an extent on its medium.
pub fn extent_address(oid: &str, layout_idx: u32, uuid: &str) -> String {
    let safe: String = oid
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}.{layout_idx}.{uuid}")
}

/// Copy exactly `size` bytes from `src` into a new extent file. Returns the
/// hex digest of what was written.
pub fn write_extent(
    src: &mut dyn Read,
    mount: &Path,
    address: &str,
    size: u64,
    block_size: usize,
) -> io::Result<String> {
    let path = mount.join(address);
    let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; block_size.max(1)];
    let mut remaining = size;

    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = src.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("source ended {remaining} bytes short"),
            ));
        }
        file.write_all(&buf[..n])?;
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    file.sync_all()?;
    Ok(hex::encode(hasher.finalize()))
}

/// Stream an extent into `sink`, checking its size and digest.
pub fn read_extent(
    oid: &str,
    extent: &Extent,
    mount: &Path,
    sink: &mut dyn Write,
    block_size: usize,
) -> LayoutResult<()> {
    let path = mount.join(&extent.address);
    let mut file = File::open(&path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => LayoutError::corrupt(
            oid,
            format!("extent {} missing from {}", extent.address, extent.medium),
        ),
        _ => LayoutError::io(path.display(), e),
    })?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; block_size.max(1)];
    let mut remaining = extent.size;

    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = file
            .read(&mut buf[..want])
            .map_err(|e| LayoutError::io(path.display(), e))?;
        if n == 0 {
            return Err(LayoutError::corrupt(
                oid,
                format!("extent {} is {remaining} bytes short", extent.address),
            ));
        }
        sink.write_all(&buf[..n])
            .map_err(|e| LayoutError::io("transfer destination", e))?;
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }

    let digest = hex::encode(hasher.finalize());
    if digest != extent.sha256 {
        return Err(LayoutError::corrupt(
            oid,
            format!("extent {} checksum mismatch", extent.address),
        ));
    }
    Ok(())
}

/// Remove an extent file. Returns `false` if it was already gone.
pub fn remove_extent(extent: &Extent, mount: &Path) -> io::Result<bool> {
    match fs::remove_file(mount.join(&extent.address)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapegrid_core::{MediumId, ResourceFamily};
    use tapegrid_state::ExtentState;

    fn extent(address: &str, size: u64, sha256: String) -> Extent {
        Extent {
            uuid: "u".into(),
            layout_idx: 0,
            medium: MediumId::new(ResourceFamily::Dir, "d1"),
            address: address.into(),
            offset: 0,
            size,
            sha256,
            state: ExtentState::Sync,
        }
    }

    #[test]
    fn address_is_filesystem_safe() {
        assert_eq!(extent_address("a/b c", 2, "u1"), "a_b_c.2.u1");
        assert_eq!(extent_address("obj-1_x", 0, "u2"), "obj-1_x.0.u2");
    }

    #[test]
    fn written_extent_reads_back_with_digest() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

        let mut src = &data[..];
        let sha = write_extent(&mut src, dir.path(), "x.0.u", 3000, 512).unwrap();
        assert_eq!(sha, hex::encode(Sha256::digest(&data[..3000])));
        assert_eq!(src.len(), 2000, "only the extent's bytes are consumed");

        let mut out = Vec::new();
        read_extent("x", &extent("x.0.u", 3000, sha), dir.path(), &mut out, 700).unwrap();
        assert_eq!(out, &data[..3000]);
    }

    #[test]
    fn short_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut src: &[u8] = &[1, 2, 3];
        let err = write_extent(&mut src, dir.path(), "short", 10, 4).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn tampered_extent_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mut src: &[u8] = b"hello world";
        let sha = write_extent(&mut src, dir.path(), "t", 11, 4).unwrap();
        fs::write(dir.path().join("t"), b"hello w0rld").unwrap();

        let err = read_extent("t", &extent("t", 11, sha), dir.path(), &mut Vec::new(), 4)
            .unwrap_err();
        assert_eq!(err.kind(), tapegrid_core::ErrorKind::CorruptLayout);
    }

    #[test]
    fn missing_extent_is_corrupt_and_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ext = extent("gone", 1, String::new());
        let err = read_extent("gone", &ext, dir.path(), &mut Vec::new(), 4).unwrap_err();
        assert_eq!(err.kind(), tapegrid_core::ErrorKind::CorruptLayout);
        assert!(!remove_extent(&ext, dir.path()).unwrap());
    }
}
