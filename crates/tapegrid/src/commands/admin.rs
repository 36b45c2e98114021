//! Drive, medium and audit log administration.

use anyhow::{Context as _, bail};
use tapegrid_core::{AdminStatus, DeviceId, FsType, MediumId, ResourceFamily};
use tapegrid_state::{DeviceInfo, MediumInfo, MediumLocation};
use tracing::info;

use super::Context;

pub fn device_add(
    ctx: &Context,
    name: &str,
    family: ResourceFamily,
    model: Option<String>,
) -> anyhow::Result<()> {
    let id = DeviceId::new(family, name);
    if ctx.catalog.get_device(&id)?.is_some() {
        bail!("device {id} is already registered");
    }
    ctx.library
        .add_drive(name)
        .with_context(|| format!("adding drive {name} to the library"))?;

    let host = ctx.config.lrs.hostname.clone();
    ctx.catalog.put_device(&DeviceInfo {
        id: id.clone(),
        path: name.to_string(),
        model,
        host: host.clone(),
        adm_status: AdminStatus::Unlocked,
    })?;
    info!(device = %id, %host, "device added");
    println!("{id}");
    Ok(())
}

pub fn device_list(ctx: &Context) -> anyhow::Result<()> {
    let devices = ctx.catalog.list_devices()?;
    if devices.is_empty() {
        println!("No devices registered.");
        return Ok(());
    }
    println!("{:<20} {:<12} {:<16} {:<10}", "ID", "PATH", "HOST", "ADMIN");
    for device in devices {
        println!(
            "{:<20} {:<12} {:<16} {:<10}",
            device.id.to_string(),
            device.path,
            device.host,
            device.adm_status.as_str()
        );
    }
    Ok(())
}

/// New media are registered locked; `format --unlock` opens them for
/// writing.
pub fn medium_add(
    ctx: &Context,
    name: &str,
    family: ResourceFamily,
    capacity: u64,
    fs: FsType,
    tags: Vec<String>,
) -> anyhow::Result<()> {
    let id = MediumId::new(family, name);
    if ctx.catalog.get_medium(&id)?.is_some() {
        bail!("medium {id} is already registered");
    }
    let slot = ctx.library.free_slot();
    ctx.library
        .add_medium(name, slot, capacity)
        .with_context(|| format!("adding medium {name} to the library"))?;

    let mut medium = MediumInfo::blank(id.clone(), fs, capacity, slot);
    medium.adm_status = AdminStatus::Locked;
    medium.tags = tags;
    ctx.catalog.put_medium(&medium)?;
    info!(medium = %id, slot, capacity, "medium added");
    println!("{id}");
    Ok(())
}

pub fn medium_list(ctx: &Context) -> anyhow::Result<()> {
    let media = ctx.catalog.list_media()?;
    if media.is_empty() {
        println!("No media registered.");
        return Ok(());
    }
    println!(
        "{:<20} {:<8} {:<8} {:<24} {:<12} TAGS",
        "ID", "FS", "ADMIN", "USED/CAPACITY", "LOCATION"
    );
    for medium in media {
        let location = match &medium.location {
            MediumLocation::Slot(slot) => format!("slot {slot}"),
            MediumLocation::Drive(drive) => format!("drive {drive}"),
        };
        println!(
            "{:<20} {:<8} {:<8} {:<24} {:<12} {}",
            medium.id.to_string(),
            medium.fs.status.as_str(),
            medium.adm_status.as_str(),
            format!("{}/{}", medium.used, medium.capacity),
            location,
            medium.tags.join(",")
        );
    }
    Ok(())
}

pub async fn format(
    ctx: &Context,
    name: &str,
    family: ResourceFamily,
    fs: FsType,
    unlock: bool,
) -> anyhow::Result<()> {
    let id = MediumId::new(family, name);
    let lrs = ctx.start_lrs().await?;
    let result = lrs.format(&id, fs, unlock).await;
    lrs.shutdown().await;

    let formatted = result.with_context(|| format!("formatting {id}"))?;
    println!("{formatted} formatted as {fs}");
    Ok(())
}

/// Print the audit log as JSON lines, oldest first.
pub fn logs(ctx: &Context, clear: bool) -> anyhow::Result<()> {
    for entry in ctx.catalog.list_logs()? {
        println!("{}", serde_json::to_string(&entry)?);
    }
    if clear {
        let removed = ctx.catalog.clear_logs()?;
        info!(removed, "audit log cleared");
    }
    Ok(())
}
