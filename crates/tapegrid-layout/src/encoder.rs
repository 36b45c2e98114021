//! Encoder, decoder and eraser state machines.
//!
//! One [`Encoder`] drives one transfer. It never touches devices or locks:
//! it only produces scheduler [`Request`]s and consumes their
//! [`Response`]s, doing the byte-level I/O itself against the mount path a
//! `Ready` response hands out. At most one request is outstanding at any
//! time, so responses are consumed in submission order.
//!
//! ```text
//! Initial ─▶ AwaitingAllocation ─▶ Writing|Reading|Erasing ─┬─▶ Finalizing ─▶ Done
//!                   ▲                                       │
//!                   └──────────── MoreExtentsNeeded ◀───────┘
//! ```
//!
//! Any error moves the machine to `Failed`. A medium granted at that point
//! stays granted until [`Encoder::destroy`] hands back its release.

use std::fs::File;
use std::io::{self, Cursor, Read, Write};

use tapegrid_core::{CorrelationId, ErrorKind, LayoutKind, MountInfo, Outcome, Request, Response};
use tapegrid_state::{ExtentState, LayoutInfo};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{LayoutError, LayoutResult};
use crate::extent::{extent_address, read_extent, remove_extent, write_extent};
use crate::transfer::{LayoutOptions, Transfer, XferOp};

/// zstd level for compressed layouts.
const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    Encoder,
    Decoder,
    Eraser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initial,
    AwaitingAllocation,
    Writing,
    Reading,
    Erasing,
    MoreExtentsNeeded,
    Finalizing,
    Done,
    Failed,
}

/// What one call to [`Encoder::step`] produced.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepOutput {
    pub requests: Vec<Request>,
    pub done: bool,
}

impl StepOutput {
    fn request(request: Request) -> Self {
        Self {
            requests: vec![request],
            done: false,
        }
    }

    fn done() -> Self {
        Self {
            requests: Vec::new(),
            done: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    Allocation,
    Release,
}

struct Grant {
    id: CorrelationId,
    mount: MountInfo,
}

/// Where a put's stored bytes come from.
enum Source {
    File,
    Buffer(Cursor<Vec<u8>>),
}

/// Where a get's stored bytes go before they reach the caller's file.
enum Sink {
    File,
    Buffer(Vec<u8>),
}

pub struct Encoder<'a> {
    kind: EncoderKind,
    xfer: &'a mut Transfer,
    options: LayoutOptions,
    layout: LayoutInfo,
    phase: Phase,
    source: Source,
    sink: Sink,
    /// Next extent to read or erase.
    next: usize,
    /// Stored bytes written so far.
    written: u64,
    awaiting: Option<Awaiting>,
    grant: Option<Grant>,
    last_response: Option<Response>,
    failure: Option<ErrorKind>,
    destroyed: bool,
}

impl<'a> Encoder<'a> {
    /// Start a put. The layout is built as extents are written.
    pub fn encode(
        xfer: &'a mut Transfer,
        object_uuid: &str,
        version: u32,
        options: LayoutOptions,
    ) -> LayoutResult<Self> {
        check_transfer(xfer, XferOp::Put)?;
        let oid = xfer.oid.clone();
        let size = xfer.size;
        let file = xfer
            .file
            .as_mut()
            .ok_or_else(|| LayoutError::InvalidArgument(format!("put {oid}: no source file")))?;

        let (source, stored_size) = match options.layout {
            LayoutKind::Simple => (Source::File, size),
            LayoutKind::Compressed => {
                let packed = compress(file, size, &oid)?;
                let stored = packed.len() as u64;
                (Source::Buffer(Cursor::new(packed)), stored)
            }
        };
        let layout = LayoutInfo {
            oid,
            object_uuid: object_uuid.to_string(),
            version,
            kind: options.layout,
            size,
            stored_size,
            extents: Vec::new(),
        };
        debug!(oid = %xfer.oid, size = xfer.size, stored_size, layout = %options.layout, "encoder created");
        Ok(Self::new(EncoderKind::Encoder, xfer, options, layout, source, Sink::File))
    }

    /// Start a get of an object stored with `layout`. `xfer.size` must hold
    /// the object's recorded size.
    pub fn decode(
        xfer: &'a mut Transfer,
        layout: Option<LayoutInfo>,
        options: LayoutOptions,
    ) -> LayoutResult<Self> {
        check_transfer(xfer, XferOp::Get)?;
        if xfer.file.is_none() {
            return Err(LayoutError::InvalidArgument(format!(
                "get {}: no destination file",
                xfer.oid
            )));
        }
        let layout = required_layout(xfer, layout)?;
        validate(&layout, xfer.size)?;
        if let Some(erased) = layout.extents.iter().find(|e| e.state == ExtentState::Orphan) {
            return Err(LayoutError::corrupt(
                &layout.oid,
                format!(
                    "extent {} on {} was erased by an interrupted delete",
                    erased.layout_idx, erased.medium
                ),
            ));
        }
        let sink = match layout.kind {
            LayoutKind::Simple => Sink::File,
            LayoutKind::Compressed => Sink::Buffer(Vec::new()),
        };
        debug!(oid = %xfer.oid, extents = layout.extents.len(), "decoder created");
        Ok(Self::new(EncoderKind::Decoder, xfer, options, layout, Source::File, sink))
    }

    /// Start removing the extents of `layout`.
    pub fn delete(
        xfer: &'a mut Transfer,
        layout: Option<LayoutInfo>,
        options: LayoutOptions,
    ) -> LayoutResult<Self> {
        check_transfer(xfer, XferOp::Delete)?;
        let layout = required_layout(xfer, layout)?;
        debug!(oid = %xfer.oid, extents = layout.extents.len(), "eraser created");
        Ok(Self::new(EncoderKind::Eraser, xfer, options, layout, Source::File, Sink::File))
    }

    fn new(
        kind: EncoderKind,
        xfer: &'a mut Transfer,
        options: LayoutOptions,
        layout: LayoutInfo,
        source: Source,
        sink: Sink,
    ) -> Self {
        Self {
            kind,
            xfer,
            options,
            layout,
            phase: Phase::Initial,
            source,
            sink,
            next: 0,
            written: 0,
            awaiting: None,
            grant: None,
            last_response: None,
            failure: None,
            destroyed: false,
        }
    }

    pub fn kind(&self) -> EncoderKind {
        self.kind
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// A request was emitted and its response has not been stepped in yet.
    pub fn is_awaiting_response(&self) -> bool {
        self.awaiting.is_some()
    }

    pub fn layout(&self) -> &LayoutInfo {
        &self.layout
    }

    pub fn transfer(&self) -> &Transfer {
        self.xfer
    }

    pub fn transfer_mut(&mut self) -> &mut Transfer {
        self.xfer
    }

    pub fn last_response(&self) -> Option<&Response> {
        self.last_response.as_ref()
    }

    /// Advance the machine. The first call passes `None`; every later call
    /// passes the response to the request emitted by the previous one.
    pub fn step(&mut self, response: Option<Response>) -> LayoutResult<StepOutput> {
        if self.destroyed {
            return Err(LayoutError::InvalidState(format!("{}: encoder destroyed", self.xfer.oid)));
        }
        if matches!(self.phase, Phase::Done | Phase::Failed) {
            return Err(LayoutError::InvalidState(format!(
                "{}: step after {:?}",
                self.xfer.oid, self.phase
            )));
        }
        let result = match response {
            None => self.start(),
            Some(response) => self.on_response(response),
        };
        match &result {
            Ok(output) if output.done => self.phase = Phase::Done,
            Ok(_) => {}
            Err(e) => {
                warn!(oid = %self.xfer.oid, kind = ?self.kind, error = %e, "transfer step failed");
                self.failure = Some(e.kind());
                self.phase = Phase::Failed;
            }
        }
        result
    }

    /// Release anything still granted and drop uncommitted state. Returns
    /// the release to submit, if a medium was still held. Idempotent.
    pub fn destroy(&mut self) -> Option<Request> {
        if self.destroyed {
            return None;
        }
        self.destroyed = true;
        if self.phase != Phase::Done {
            self.phase = Phase::Failed;
            // Extents of a put are uncommitted; the other kinds keep the
            // layout so the caller can see what was already erased.
            if self.kind == EncoderKind::Encoder {
                self.layout.extents.clear();
            }
        }
        self.source = Source::File;
        self.sink = Sink::File;
        let grant = self.grant.take()?;
        debug!(oid = %self.xfer.oid, grant = grant.id, medium = %grant.mount.medium, "releasing medium on destroy");
        Some(Request::Release {
            grant: grant.id,
            size_written: 0,
            status: Some(self.failure.unwrap_or(ErrorKind::Cancelled)),
        })
    }

    /// Cancel the transfer. Returns the release to submit, if any.
    pub fn abort(&mut self) -> Option<Request> {
        if !self.destroyed && self.phase != Phase::Done {
            self.failure.get_or_insert(ErrorKind::Cancelled);
            self.xfer.status = Some(Err(ErrorKind::Cancelled));
        }
        self.destroy()
    }

    // ── Transitions ────────────────────────────────────────────────

    fn start(&mut self) -> LayoutResult<StepOutput> {
        if self.phase != Phase::Initial {
            return Err(LayoutError::InvalidState(format!(
                "{}: step without a response while {:?}",
                self.xfer.oid, self.phase
            )));
        }
        self.skip_erased();
        match self.kind {
            EncoderKind::Encoder if self.layout.stored_size == 0 => self.finish(),
            EncoderKind::Encoder => Ok(self.request_write()),
            _ if self.next >= self.layout.extents.len() => self.finish(),
            _ => Ok(self.request_mount()),
        }
    }

    fn on_response(&mut self, response: Response) -> LayoutResult<StepOutput> {
        let Some(awaiting) = self.awaiting.take() else {
            return Err(LayoutError::InvalidState(format!(
                "{}: response {} without an outstanding request",
                self.xfer.oid, response.id
            )));
        };
        self.last_response = Some(response.clone());
        match (awaiting, response.outcome) {
            (_, Outcome::Error { kind }) => Err(LayoutError::Scheduler(kind)),
            (Awaiting::Allocation, Outcome::Ready(mount)) => {
                self.grant = Some(Grant {
                    id: response.id,
                    mount,
                });
                match self.kind {
                    EncoderKind::Encoder => self.write_granted(),
                    EncoderKind::Decoder => self.read_granted(),
                    EncoderKind::Eraser => self.erase_granted(),
                }
            }
            (Awaiting::Release, Outcome::Released { .. }) => self.released(),
            (awaiting, outcome) => Err(LayoutError::InvalidState(format!(
                "{}: unexpected {outcome:?} while awaiting {awaiting:?}",
                self.xfer.oid
            ))),
        }
    }

    fn request_write(&mut self) -> StepOutput {
        self.phase = Phase::AwaitingAllocation;
        self.awaiting = Some(Awaiting::Allocation);
        StepOutput::request(Request::Write {
            family: self.options.family,
            size: self.layout.stored_size - self.written,
            tags: self.xfer.tags.clone(),
        })
    }

    fn request_mount(&mut self) -> StepOutput {
        self.phase = Phase::AwaitingAllocation;
        self.awaiting = Some(Awaiting::Allocation);
        StepOutput::request(Request::Read {
            medium: self.layout.extents[self.next].medium.clone(),
        })
    }

    fn release(&mut self, size_written: u64) -> LayoutResult<StepOutput> {
        let grant = self
            .grant
            .take()
            .ok_or_else(|| LayoutError::InvalidState(format!("{}: nothing to release", self.xfer.oid)))?;
        self.awaiting = Some(Awaiting::Release);
        Ok(StepOutput::request(Request::Release {
            grant: grant.id,
            size_written,
            status: None,
        }))
    }

    /// Write the next extent, as much as fits on the granted medium.
    fn write_granted(&mut self) -> LayoutResult<StepOutput> {
        self.phase = Phase::Writing;
        let Some(grant) = self.grant.as_ref() else {
            return Err(LayoutError::InvalidState(format!("{}: no grant", self.xfer.oid)));
        };
        let remaining = self.layout.stored_size - self.written;
        let size = remaining.min(grant.mount.avail);
        if size == 0 {
            // Nothing fits; give it back and ask again.
            self.phase = Phase::MoreExtentsNeeded;
            return self.release(0);
        }

        let uuid = Uuid::new_v4().to_string();
        let idx = self.layout.extents.len() as u32;
        let address = extent_address(&self.xfer.oid, idx, &uuid);
        let src: &mut dyn Read = match (&mut self.source, self.xfer.file.as_mut()) {
            (Source::Buffer(cursor), _) => cursor,
            (Source::File, Some(file)) => file,
            (Source::File, None) => {
                return Err(LayoutError::InvalidArgument(format!("put {}: no source file", self.xfer.oid)));
            }
        };
        let mount_path = grant.mount.mount_path.clone();
        let sha256 = write_extent(src, &mount_path, &address, size, self.options.block_size).map_err(|e| {
            let _ = std::fs::remove_file(mount_path.join(&address));
            LayoutError::io(mount_path.join(&address).display(), e)
        })?;

        debug!(oid = %self.xfer.oid, medium = %grant.mount.medium, idx, size, "extent written");
        self.layout.extents.push(tapegrid_state::Extent {
            uuid,
            layout_idx: idx,
            medium: grant.mount.medium.clone(),
            address,
            offset: self.written,
            size,
            sha256,
            state: ExtentState::Pending,
        });
        self.written += size;
        self.release(size)
    }

    /// Read every consecutive extent that lives on the granted medium.
    fn read_granted(&mut self) -> LayoutResult<StepOutput> {
        self.phase = Phase::Reading;
        let Some(grant) = self.grant.as_ref() else {
            return Err(LayoutError::InvalidState(format!("{}: no grant", self.xfer.oid)));
        };
        let medium = grant.mount.medium.clone();
        let mount_path = grant.mount.mount_path.clone();
        while let Some(extent) = self.layout.extents.get(self.next) {
            if extent.medium != medium {
                break;
            }
            let sink: &mut dyn Write = match (&mut self.sink, self.xfer.file.as_mut()) {
                (Sink::Buffer(buf), _) => buf,
                (Sink::File, Some(file)) => file,
                (Sink::File, None) => {
                    return Err(LayoutError::InvalidArgument(format!(
                        "get {}: no destination file",
                        self.xfer.oid
                    )));
                }
            };
            read_extent(&self.xfer.oid, extent, &mount_path, sink, self.options.block_size)?;
            debug!(oid = %self.xfer.oid, %medium, idx = extent.layout_idx, size = extent.size, "extent read");
            self.next += 1;
        }
        self.release(0)
    }

    /// Remove every consecutive extent that lives on the granted medium.
    fn erase_granted(&mut self) -> LayoutResult<StepOutput> {
        self.phase = Phase::Erasing;
        let Some(grant) = self.grant.as_ref() else {
            return Err(LayoutError::InvalidState(format!("{}: no grant", self.xfer.oid)));
        };
        let medium = grant.mount.medium.clone();
        let mount_path = grant.mount.mount_path.clone();
        while let Some(extent) = self.layout.extents.get_mut(self.next) {
            if extent.medium != medium {
                break;
            }
            if extent.state == ExtentState::Orphan {
                self.next += 1;
                continue;
            }
            let removed = remove_extent(extent, &mount_path)
                .map_err(|e| LayoutError::io(mount_path.join(&extent.address).display(), e))?;
            if !removed {
                warn!(oid = %self.xfer.oid, %medium, address = %extent.address, "extent already absent");
            }
            extent.state = ExtentState::Orphan;
            self.next += 1;
        }
        self.release(0)
    }

    fn released(&mut self) -> LayoutResult<StepOutput> {
        match self.kind {
            EncoderKind::Encoder => {
                if let Some(last) = self.layout.extents.last_mut() {
                    last.state = ExtentState::Sync;
                }
                if self.written < self.layout.stored_size {
                    self.phase = Phase::MoreExtentsNeeded;
                    debug!(oid = %self.xfer.oid, remaining = self.layout.stored_size - self.written, "medium exhausted, requesting another");
                    Ok(self.request_write())
                } else {
                    self.finish()
                }
            }
            EncoderKind::Decoder | EncoderKind::Eraser => {
                self.skip_erased();
                if self.next < self.layout.extents.len() {
                    Ok(self.request_mount())
                } else {
                    self.finish()
                }
            }
        }
    }

    /// An eraser resuming an interrupted delete passes over extents that
    /// are already gone.
    fn skip_erased(&mut self) {
        if self.kind != EncoderKind::Eraser {
            return;
        }
        while self
            .layout
            .extents
            .get(self.next)
            .is_some_and(|e| e.state == ExtentState::Orphan)
        {
            self.next += 1;
        }
    }

    fn finish(&mut self) -> LayoutResult<StepOutput> {
        self.phase = Phase::Finalizing;
        if self.kind == EncoderKind::Decoder {
            let oid = self.xfer.oid.clone();
            let file = self.xfer.file.as_mut().ok_or_else(|| {
                LayoutError::InvalidArgument(format!("get {oid}: no destination file"))
            })?;
            if let Sink::Buffer(packed) = std::mem::replace(&mut self.sink, Sink::File) {
                let data = zstd::decode_all(packed.as_slice()).map_err(|e| {
                    LayoutError::corrupt(&oid, format!("decompression failed: {e}"))
                })?;
                if data.len() as u64 != self.layout.size {
                    return Err(LayoutError::corrupt(
                        &oid,
                        format!("decompressed {} bytes, expected {}", data.len(), self.layout.size),
                    ));
                }
                file.write_all(&data)
                    .map_err(|e| LayoutError::io("transfer destination", e))?;
            }
            file.flush()
                .map_err(|e| LayoutError::io("transfer destination", e))?;
        }
        debug!(oid = %self.xfer.oid, kind = ?self.kind, extents = self.layout.extents.len(), "transfer finished");
        Ok(StepOutput::done())
    }
}

impl Drop for Encoder<'_> {
    fn drop(&mut self) {
        if self.grant.is_some() {
            warn!(oid = %self.xfer.oid, "encoder dropped while holding a medium; destroy() was not called");
        }
    }
}

impl std::fmt::Debug for Encoder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("kind", &self.kind)
            .field("oid", &self.xfer.oid)
            .field("phase", &self.phase)
            .field("extents", &self.layout.extents.len())
            .finish()
    }
}

fn check_transfer(xfer: &Transfer, op: XferOp) -> LayoutResult<()> {
    if xfer.oid.is_empty() {
        return Err(LayoutError::InvalidArgument("empty object id".into()));
    }
    if xfer.op != op {
        return Err(LayoutError::InvalidArgument(format!(
            "{}: {:?} transfer given to a {op:?} encoder",
            xfer.oid, xfer.op
        )));
    }
    if xfer.is_finished() {
        return Err(LayoutError::InvalidArgument(format!(
            "{}: transfer already processed",
            xfer.oid
        )));
    }
    Ok(())
}

fn required_layout(xfer: &Transfer, layout: Option<LayoutInfo>) -> LayoutResult<LayoutInfo> {
    let layout = layout
        .ok_or_else(|| LayoutError::InvalidArgument(format!("{}: layout required", xfer.oid)))?;
    if layout.oid != xfer.oid {
        return Err(LayoutError::InvalidArgument(format!(
            "layout of {} given for {}",
            layout.oid, xfer.oid
        )));
    }
    Ok(layout)
}

/// Extents must tile the stored stream in creation order.
pub fn validate(layout: &LayoutInfo, object_size: u64) -> LayoutResult<()> {
    let oid = layout.oid.as_str();
    if layout.size != object_size {
        return Err(LayoutError::corrupt(
            oid,
            format!("layout size {} but object size {object_size}", layout.size),
        ));
    }
    if layout.kind == LayoutKind::Simple && layout.stored_size != layout.size {
        return Err(LayoutError::corrupt(
            oid,
            format!("simple layout stores {} of {} bytes", layout.stored_size, layout.size),
        ));
    }
    let mut offset = 0u64;
    for (i, extent) in layout.extents.iter().enumerate() {
        if extent.layout_idx as usize != i {
            return Err(LayoutError::corrupt(
                oid,
                format!("extent {i} has index {}", extent.layout_idx),
            ));
        }
        if extent.offset != offset {
            return Err(LayoutError::corrupt(
                oid,
                format!("extent {i} starts at {} instead of {offset}", extent.offset),
            ));
        }
        offset += extent.size;
    }
    if offset != layout.stored_size {
        return Err(LayoutError::corrupt(
            oid,
            format!("extents cover {offset} of {} stored bytes", layout.stored_size),
        ));
    }
    Ok(())
}

/// Compress exactly `size` bytes of `file`. Memory grows with the
/// compressed output only, never with the announced size.
fn compress(file: &mut File, size: u64, oid: &str) -> LayoutResult<Vec<u8>> {
    let mut encoder = zstd::stream::Encoder::new(Vec::new(), COMPRESSION_LEVEL)
        .map_err(|e| LayoutError::io(format!("put {oid} compression"), e))?;
    let read = io::copy(&mut file.take(size), &mut encoder)
        .map_err(|e| LayoutError::io(format!("put {oid} source"), e))?;
    if read != size {
        return Err(LayoutError::InvalidArgument(format!(
            "put {oid}: source holds {read} bytes, expected {size}"
        )));
    }
    encoder
        .finish()
        .map_err(|e| LayoutError::io(format!("put {oid} compression"), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};
    use std::path::Path;
    use tapegrid_core::{DeviceId, FsType, MediumId, ResourceFamily};

    fn options(layout: LayoutKind) -> LayoutOptions {
        LayoutOptions {
            layout,
            family: ResourceFamily::Dir,
            block_size: 256,
        }
    }

    fn source(data: &[u8]) -> File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(data).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file
    }

    fn contents(file: &mut File) -> Vec<u8> {
        let mut out = Vec::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_end(&mut out).unwrap();
        out
    }

    fn ready(id: CorrelationId, dir: &Path, medium: &str, avail: u64) -> Response {
        Response {
            id,
            outcome: Outcome::Ready(MountInfo {
                device: DeviceId::new(ResourceFamily::Dir, "d0"),
                medium: MediumId::new(ResourceFamily::Dir, medium),
                mount_path: dir.to_path_buf(),
                fs_type: FsType::Posix,
                avail,
            }),
        }
    }

    fn released(id: CorrelationId, medium: &str) -> Response {
        Response {
            id,
            outcome: Outcome::Released {
                medium: MediumId::new(ResourceFamily::Dir, medium),
            },
        }
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn single_request(output: StepOutput) -> Request {
        assert!(!output.done);
        assert_eq!(output.requests.len(), 1);
        output.requests.into_iter().next().unwrap()
    }

    /// Put `input` across media `a` (with `avail_a` free) and `b`.
    fn put_two_media(input: &[u8], avail_a: u64, a: &Path, b: &Path) -> LayoutInfo {
        let mut xfer = Transfer::put("obj/1", source(input), input.len() as u64);
        let mut enc = Encoder::encode(&mut xfer, "uuid-1", 1, options(LayoutKind::Simple)).unwrap();

        let req = single_request(enc.step(None).unwrap());
        assert!(matches!(req, Request::Write { size, .. } if size == input.len() as u64));
        let req = single_request(enc.step(Some(ready(1, a, "A", avail_a))).unwrap());
        assert_eq!(
            req,
            Request::Release {
                grant: 1,
                size_written: avail_a,
                status: None
            }
        );

        let req = single_request(enc.step(Some(released(2, "A"))).unwrap());
        let rest = input.len() as u64 - avail_a;
        assert!(matches!(req, Request::Write { size, .. } if size == rest));
        assert_eq!(enc.phase(), Phase::AwaitingAllocation);

        let req = single_request(enc.step(Some(ready(3, b, "B", 4096))).unwrap());
        assert!(matches!(req, Request::Release { grant: 3, size_written, .. } if size_written == rest));
        let out = enc.step(Some(released(4, "B"))).unwrap();
        assert!(out.done && out.requests.is_empty());
        assert!(enc.is_done());
        assert!(enc.destroy().is_none());
        enc.layout().clone()
    }

    #[test]
    fn put_overflowing_a_medium_spans_two_extents_and_reads_back() {
        let (a, b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let input = data(1000);
        let layout = put_two_media(&input, 600, a.path(), b.path());

        assert_eq!(layout.extents.len(), 2);
        assert_eq!(layout.extents[0].size, 600);
        assert_eq!(layout.extents[1].size, 400);
        assert_eq!(layout.extents[1].offset, 600);
        assert!(layout.extents.iter().all(|e| e.state == ExtentState::Sync));
        assert_eq!(layout.stored_size, 1000);

        let mut xfer = Transfer::get("obj/1", tempfile::tempfile().unwrap());
        xfer.size = 1000;
        let mut dec = Encoder::decode(&mut xfer, Some(layout), options(LayoutKind::Simple)).unwrap();
        let req = single_request(dec.step(None).unwrap());
        assert_eq!(
            req,
            Request::Read {
                medium: MediumId::new(ResourceFamily::Dir, "A")
            }
        );
        single_request(dec.step(Some(ready(5, a.path(), "A", 0))).unwrap());
        let req = single_request(dec.step(Some(released(6, "A"))).unwrap());
        assert_eq!(
            req,
            Request::Read {
                medium: MediumId::new(ResourceFamily::Dir, "B")
            }
        );
        single_request(dec.step(Some(ready(7, b.path(), "B", 0))).unwrap());
        assert!(dec.step(Some(released(8, "B"))).unwrap().done);
        drop(dec);

        assert_eq!(contents(xfer.file.as_mut().unwrap()), input);
    }

    #[test]
    fn compressed_layout_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let input = vec![b'z'; 20_000];
        let mut xfer = Transfer::put("zobj", source(&input), input.len() as u64);
        let mut enc = Encoder::encode(&mut xfer, "u", 1, options(LayoutKind::Compressed)).unwrap();
        assert!(enc.layout().stored_size < 20_000);

        single_request(enc.step(None).unwrap());
        single_request(enc.step(Some(ready(1, dir.path(), "A", 1 << 20))).unwrap());
        assert!(enc.step(Some(released(2, "A"))).unwrap().done);
        let layout = enc.layout().clone();
        drop(enc);
        assert_eq!(layout.size, 20_000);
        assert_eq!(layout.extents.len(), 1);

        let mut xfer = Transfer::get("zobj", tempfile::tempfile().unwrap());
        xfer.size = 20_000;
        let mut dec = Encoder::decode(&mut xfer, Some(layout), options(LayoutKind::Simple)).unwrap();
        single_request(dec.step(None).unwrap());
        single_request(dec.step(Some(ready(3, dir.path(), "A", 0))).unwrap());
        assert!(dec.step(Some(released(4, "A"))).unwrap().done);
        drop(dec);
        assert_eq!(contents(xfer.file.as_mut().unwrap()), input);
    }

    #[test]
    fn step_after_done_is_invalid_state() {
        let mut xfer = Transfer::put("empty", source(&[]), 0);
        let mut enc = Encoder::encode(&mut xfer, "u", 1, options(LayoutKind::Simple)).unwrap();
        assert!(enc.step(None).unwrap().done);
        let err = enc.step(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn destroy_releases_a_held_grant_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut xfer = Transfer::get("o", tempfile::tempfile().unwrap());
        xfer.size = 4;
        let mut layout = LayoutInfo {
            oid: "o".into(),
            object_uuid: "u".into(),
            version: 1,
            kind: LayoutKind::Simple,
            size: 4,
            stored_size: 4,
            extents: Vec::new(),
        };
        layout.extents.push(tapegrid_state::Extent {
            uuid: "e".into(),
            layout_idx: 0,
            medium: MediumId::new(ResourceFamily::Dir, "A"),
            address: "missing".into(),
            offset: 0,
            size: 4,
            sha256: String::new(),
            state: ExtentState::Sync,
        });
        let mut dec = Encoder::decode(&mut xfer, Some(layout), options(LayoutKind::Simple)).unwrap();
        single_request(dec.step(None).unwrap());

        // The extent file is missing, so the read fails with the medium held.
        let err = dec.step(Some(ready(9, dir.path(), "A", 0))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptLayout);
        assert_eq!(dec.phase(), Phase::Failed);

        let release = dec.destroy().unwrap();
        assert_eq!(
            release,
            Request::Release {
                grant: 9,
                size_written: 0,
                status: Some(ErrorKind::CorruptLayout)
            }
        );
        assert!(dec.destroy().is_none());
        assert!(dec.abort().is_none());
    }

    #[test]
    fn scheduler_error_fails_the_transfer() {
        let mut xfer = Transfer::put("o", source(b"abc"), 3);
        let mut enc = Encoder::encode(&mut xfer, "u", 1, options(LayoutKind::Simple)).unwrap();
        single_request(enc.step(None).unwrap());
        let err = enc
            .step(Some(Response::error(1, ErrorKind::NoMedium)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoMedium);
        assert_eq!(enc.last_response().map(|r| r.id), Some(1));
        assert_eq!(enc.step(None).unwrap_err().kind(), ErrorKind::InvalidState);
        assert!(enc.destroy().is_none());
    }

    #[test]
    fn abort_marks_transfer_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let mut xfer = Transfer::put("o", source(b"abc"), 3);
        {
            let mut enc = Encoder::encode(&mut xfer, "u", 1, options(LayoutKind::Simple)).unwrap();
            single_request(enc.step(None).unwrap());
            // Ready arrives after the caller gave up: the write happens,
            // then abort hands back nothing because the release is already
            // on its way.
            single_request(enc.step(Some(ready(1, dir.path(), "A", 10))).unwrap());
            assert!(enc.abort().is_none());
        }
        assert_eq!(xfer.status, Some(Err(ErrorKind::Cancelled)));
    }

    #[test]
    fn constructors_reject_bad_arguments() {
        let mut get = Transfer::get("o", tempfile::tempfile().unwrap());
        let err = Encoder::encode(&mut get, "u", 1, options(LayoutKind::Simple)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = Encoder::decode(&mut get, None, options(LayoutKind::Simple)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let mut no_file = Transfer::new("o", XferOp::Put);
        let err = Encoder::encode(&mut no_file, "u", 1, options(LayoutKind::Simple)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let mut done = Transfer::put("o", source(b"x"), 1);
        done.status = Some(Ok(()));
        let err = Encoder::encode(&mut done, "u", 1, options(LayoutKind::Simple)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn inconsistent_extents_are_corrupt() {
        let (a, b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let mut layout = put_two_media(&data(100), 60, a.path(), b.path());

        let mut wrong_size = layout.clone();
        wrong_size.extents[1].size = 50;
        assert_eq!(validate(&wrong_size, 100).unwrap_err().kind(), ErrorKind::CorruptLayout);

        layout.extents[1].offset = 50;
        let mut xfer = Transfer::get("obj/1", tempfile::tempfile().unwrap());
        xfer.size = 100;
        let err = Encoder::decode(&mut xfer, Some(layout.clone()), options(LayoutKind::Simple))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptLayout);

        layout.extents[1].offset = 60;
        assert_eq!(validate(&layout, 99).unwrap_err().kind(), ErrorKind::CorruptLayout);
        assert!(validate(&layout, 100).is_ok());
    }

    #[test]
    fn eraser_removes_extents_per_medium() {
        let (a, b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let layout = put_two_media(&data(300), 100, a.path(), b.path());
        assert_eq!(std::fs::read_dir(a.path()).unwrap().count(), 1);

        let mut xfer = Transfer::new("obj/1", XferOp::Delete);
        let mut eraser = Encoder::delete(&mut xfer, Some(layout), options(LayoutKind::Simple)).unwrap();
        single_request(eraser.step(None).unwrap());
        single_request(eraser.step(Some(ready(1, a.path(), "A", 0))).unwrap());
        single_request(eraser.step(Some(released(2, "A"))).unwrap());
        single_request(eraser.step(Some(ready(3, b.path(), "B", 0))).unwrap());
        assert!(eraser.step(Some(released(4, "B"))).unwrap().done);
        assert!(eraser.layout().extents.iter().all(|e| e.state == ExtentState::Orphan));

        assert_eq!(std::fs::read_dir(a.path()).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(b.path()).unwrap().count(), 0);
    }

    #[test]
    fn failed_eraser_keeps_erased_extents_marked_and_resumes() {
        let (a, b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let layout = put_two_media(&data(300), 100, a.path(), b.path());

        let mut xfer = Transfer::new("obj/1", XferOp::Delete);
        let partial = {
            let mut eraser =
                Encoder::delete(&mut xfer, Some(layout), options(LayoutKind::Simple)).unwrap();
            single_request(eraser.step(None).unwrap());
            single_request(eraser.step(Some(ready(1, a.path(), "A", 0))).unwrap());
            single_request(eraser.step(Some(released(2, "A"))).unwrap());
            let err = eraser
                .step(Some(Response::error(3, ErrorKind::DeviceFault)))
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::DeviceFault);
            assert!(eraser.destroy().is_none());
            eraser.layout().clone()
        };
        assert_eq!(partial.extents[0].state, ExtentState::Orphan);
        assert_eq!(partial.extents[1].state, ExtentState::Sync);

        let mut get = Transfer::get("obj/1", tempfile::tempfile().unwrap());
        get.size = 300;
        let err = Encoder::decode(&mut get, Some(partial.clone()), options(LayoutKind::Simple))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptLayout);

        // A second delete only mounts the medium still holding data.
        let mut xfer = Transfer::new("obj/1", XferOp::Delete);
        let mut eraser =
            Encoder::delete(&mut xfer, Some(partial), options(LayoutKind::Simple)).unwrap();
        let req = single_request(eraser.step(None).unwrap());
        assert_eq!(
            req,
            Request::Read {
                medium: MediumId::new(ResourceFamily::Dir, "B")
            }
        );
        single_request(eraser.step(Some(ready(4, b.path(), "B", 0))).unwrap());
        assert!(eraser.step(Some(released(5, "B"))).unwrap().done);
        assert_eq!(std::fs::read_dir(b.path()).unwrap().count(), 0);
    }

    #[test]
    fn compressed_put_with_oversized_length_is_invalid_argument() {
        for size in [u64::MAX, 1 << 40] {
            let mut xfer = Transfer::put("big", source(b"abc"), size);
            let err = Encoder::encode(&mut xfer, "u", 1, options(LayoutKind::Compressed)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
    }
}
