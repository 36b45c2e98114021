//! Object transfers: put, get, getmd, delete and locate.

use std::fs::File;
use std::path::Path;

use anyhow::Context as _;
use tapegrid_core::{LayoutKind, ResourceFamily};
use tapegrid_layout::{Transfer, XferOp};
use tracing::{error, info, warn};

use super::Context;

pub struct PutOptions {
    pub layout: Option<LayoutKind>,
    pub family: Option<ResourceFamily>,
    pub tags: Vec<String>,
    pub attrs: Vec<(String, String)>,
}

fn report(xfer: &Transfer, rc: i32) {
    if rc == 0 {
        info!(oid = %xfer.oid, op = ?xfer.op, size = xfer.size, "transfer done");
    } else {
        error!(oid = %xfer.oid, op = ?xfer.op, rc, "transfer failed");
    }
}

pub async fn put(ctx: &Context, oid: &str, path: &Path, options: PutOptions) -> anyhow::Result<()> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let size = file.metadata()?.len();

    let mut xfer = Transfer::put(oid, file, size);
    xfer.layout = options.layout;
    xfer.family = options.family;
    xfer.tags = options.tags;
    xfer.attrs = options.attrs.into_iter().collect();

    let session = ctx.session().await?;
    let mut xfers = [xfer];
    let result = session.store.put(&mut xfers, report).await;
    session.close().await;
    result.with_context(|| format!("storing {oid}"))?;
    Ok(())
}

pub async fn get(ctx: &Context, oid: &str, path: &Path, best_host: bool) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut xfer = Transfer::get(oid, file);
    xfer.flags.best_host = best_host;

    let session = ctx.session().await?;
    let mut xfers = [xfer];
    let result = session.store.get(&mut xfers, report).await;
    session.close().await;

    if let Err(e) = result {
        if let Err(rm) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %rm, "could not remove partial output");
        }
        return Err(e).with_context(|| format!("retrieving {oid}"));
    }
    Ok(())
}

pub async fn getmd(ctx: &Context, oid: &str) -> anyhow::Result<()> {
    let session = ctx.session().await?;
    let mut xfers = [Transfer::new(oid, XferOp::GetMetadata)];
    let result = session.store.get_metadata(&mut xfers, |_, _| {});
    session.close().await;
    result.with_context(|| format!("reading metadata of {oid}"))?;

    let [xfer] = &xfers;
    let output = serde_json::json!({
        "oid": xfer.oid,
        "size": xfer.size,
        "layout": xfer.layout.map(|kind| kind.as_str()),
        "attrs": xfer.attrs,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

pub async fn delete(ctx: &Context, oid: &str) -> anyhow::Result<()> {
    let session = ctx.session().await?;
    let mut xfers = [Transfer::new(oid, XferOp::Delete)];
    let result = session.store.delete(&mut xfers, report).await;
    session.close().await;
    result.with_context(|| format!("deleting {oid}"))?;
    Ok(())
}

pub async fn locate(ctx: &Context, oid: &str, focus_host: Option<&str>) -> anyhow::Result<()> {
    let session = ctx.session().await?;
    let result = session.store.locate(oid, focus_host);
    session.close().await;
    let host = result.with_context(|| format!("locating {oid}"))?;
    println!("{host}");
    Ok(())
}
