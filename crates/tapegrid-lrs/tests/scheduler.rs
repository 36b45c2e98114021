//! Scheduler behaviour against the simulated library: grants, contention,
//! load retries, device faults and cancellation.

use std::sync::Arc;
use std::time::Duration;

use tapegrid_core::config::LrsConfig;
use tapegrid_core::{
    AdminStatus, CorrelationId, DeviceId, DeviceStatus, ErrorKind, FsStatus, FsType, LockOwner,
    LockTarget, MediumId, MountInfo, Outcome, Request, ResourceFamily, Response,
};
use tapegrid_lrs::{DeviceAdapter, Lrs, LrsClient, SimAction, SimLibrary};
use tapegrid_state::{DeviceInfo, LogCause, MediumInfo, StateStore};
use tempfile::TempDir;

const HOST: &str = "node-1";

struct Harness {
    _dir: TempDir,
    sim: Arc<SimLibrary>,
    catalog: StateStore,
    lrs: Lrs,
}

fn tape(name: &str) -> MediumId {
    MediumId::new(ResourceFamily::Tape, name)
}

fn drive(name: &str) -> DeviceId {
    DeviceId::new(ResourceFamily::Tape, name)
}

fn config() -> LrsConfig {
    LrsConfig {
        hostname: HOST.into(),
        busy_backoff_min_ms: 5,
        busy_backoff_max_ms: 40,
        ..Default::default()
    }
}

/// Drives `st0..`, formatted media in slots `1..`, and `blank` media that
/// still need formatting.
async fn harness_with(
    drives: usize,
    media: &[(&str, u64)],
    blank: &[&str],
    config: LrsConfig,
    arm: impl FnOnce(&SimLibrary),
) -> Harness {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimLibrary::open(dir.path()).unwrap());
    let catalog = StateStore::open_in_memory().unwrap();

    for i in 0..drives {
        let name = format!("st{i}");
        sim.add_drive(&name).unwrap();
        catalog
            .put_device(&DeviceInfo {
                id: drive(&name),
                path: name.clone(),
                model: Some("LTO6".into()),
                host: HOST.into(),
                adm_status: AdminStatus::Unlocked,
            })
            .unwrap();
    }

    let mut slot = 1;
    for (name, capacity) in media {
        sim.add_medium(name, slot, *capacity).unwrap();
        sim.load("st0", name, slot).unwrap();
        sim.format("st0", FsType::Ltfs, name).unwrap();
        sim.unload("st0").unwrap();

        let mut medium = MediumInfo::blank(tape(name), FsType::Ltfs, *capacity, slot);
        medium.fs.status = FsStatus::Formatted;
        medium.fs.label = Some(name.to_string());
        catalog.put_medium(&medium).unwrap();
        slot += 1;
    }
    for name in blank {
        sim.add_medium(name, slot, 4096).unwrap();
        let mut medium = MediumInfo::blank(tape(name), FsType::Ltfs, 0, slot);
        medium.adm_status = AdminStatus::Locked;
        catalog.put_medium(&medium).unwrap();
        slot += 1;
    }

    arm(&sim);
    let adapter: Arc<dyn DeviceAdapter> = sim.clone();
    let lrs = Lrs::start(catalog.clone(), adapter, config).await.unwrap();
    Harness {
        _dir: dir,
        sim,
        catalog,
        lrs,
    }
}

async fn harness(drives: usize, media: &[(&str, u64)]) -> Harness {
    harness_with(drives, media, &[], config(), |_| {}).await
}

async fn wait(client: &LrsClient, id: CorrelationId) -> Response {
    tokio::time::timeout(Duration::from_secs(5), client.wait_for(id))
        .await
        .expect("no response within 5s")
}

fn ready(response: Response) -> MountInfo {
    match response.outcome {
        Outcome::Ready(mount) => mount,
        other => panic!("expected Ready, got {other:?}"),
    }
}

fn write(size: u64) -> Request {
    Request::Write {
        family: ResourceFamily::Tape,
        size,
        tags: Vec::new(),
    }
}

fn release(grant: CorrelationId, size_written: u64) -> Request {
    Request::Release {
        grant,
        size_written,
        status: None,
    }
}

// ── Grants ──────────────────────────────────────────────────────────

#[tokio::test]
async fn write_grant_mounts_medium_and_release_accounts_bytes() {
    let h = harness(1, &[("L1", 4096)]).await;
    let client = h.lrs.connect();

    let id = client.submit(write(1000)).unwrap();
    let mount = ready(wait(&client, id).await);
    assert_eq!(mount.medium, tape("L1"));
    assert_eq!(mount.device, drive("st0"));
    assert_eq!(mount.avail, 4096);
    assert_eq!(mount.mount_path, h.sim.medium_path("L1"));
    std::fs::write(mount.mount_path.join("obj"), vec![7u8; 1000]).unwrap();

    let device = h.lrs.device(&drive("st0")).unwrap();
    assert_eq!(device.status, DeviceStatus::Mounted);
    assert!(device.ongoing_io);

    let rel = client.submit(release(id, 1000)).unwrap();
    match wait(&client, rel).await.outcome {
        Outcome::Released { medium } => assert_eq!(medium, tape("L1")),
        other => panic!("expected Released, got {other:?}"),
    }

    let medium = h.catalog.get_medium(&tape("L1")).unwrap().unwrap();
    assert_eq!(medium.used, 1000);
    assert_eq!(medium.nb_obj, 1);
    assert!(medium.last_access > 0);
    assert!(h.catalog.list_locks().unwrap().is_empty());
    assert!(!h.lrs.device(&drive("st0")).unwrap().ongoing_io);
}

#[tokio::test]
async fn every_physical_action_is_logged_once() {
    let h = harness(1, &[("L1", 4096)]).await;
    let client = h.lrs.connect();

    let id = client.submit(write(10)).unwrap();
    ready(wait(&client, id).await);
    let rel = client.submit(release(id, 10)).unwrap();
    wait(&client, rel).await;

    let causes: Vec<LogCause> = h.catalog.list_logs().unwrap().iter().map(|l| l.cause).collect();
    // Initial query, then load, mount and the sync on release.
    assert_eq!(
        causes,
        vec![
            LogCause::Query,
            LogCause::DeviceLoad,
            LogCause::Mount,
            LogCause::Sync
        ]
    );
}

#[tokio::test]
async fn read_reuses_mounted_medium_without_second_mount() {
    let h = harness(2, &[("L1", 4096)]).await;
    let a = h.lrs.connect();
    let b = h.lrs.connect();

    let first = a.submit(Request::Read { medium: tape("L1") }).unwrap();
    let mount = ready(wait(&a, first).await);

    let second = b.submit(Request::Read { medium: tape("L1") }).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(b.poll_responses().is_empty(), "medium must not be granted twice");

    let rel = a.submit(release(first, 0)).unwrap();
    wait(&a, rel).await;
    let again = ready(wait(&b, second).await);
    assert_eq!(again.device, mount.device);

    let mounts = h
        .catalog
        .list_logs()
        .unwrap()
        .iter()
        .filter(|l| l.cause == LogCause::Mount)
        .count();
    assert_eq!(mounts, 1);
}

#[tokio::test]
async fn unknown_grant_release_is_invalid_argument() {
    let h = harness(1, &[("L1", 4096)]).await;
    let client = h.lrs.connect();
    let id = client.submit(release(999, 0)).unwrap();
    assert_eq!(
        wait(&client, id).await.error_kind(),
        Some(ErrorKind::InvalidArgument)
    );
}

#[tokio::test]
async fn read_of_unknown_medium_is_no_medium() {
    let h = harness(1, &[("L1", 4096)]).await;
    let client = h.lrs.connect();
    let id = client.submit(Request::Read { medium: tape("ghost") }).unwrap();
    assert_eq!(wait(&client, id).await.error_kind(), Some(ErrorKind::NoMedium));
}

#[tokio::test]
async fn write_for_unmanaged_family_is_no_device() {
    let h = harness(1, &[("L1", 4096)]).await;
    let client = h.lrs.connect();
    let id = client
        .submit(Request::Write {
            family: ResourceFamily::Dir,
            size: 1,
            tags: Vec::new(),
        })
        .unwrap();
    assert_eq!(wait(&client, id).await.error_kind(), Some(ErrorKind::NoDevice));
}

// ── Contention ──────────────────────────────────────────────────────

#[tokio::test]
async fn contended_write_waits_until_release() {
    let h = harness(1, &[("L1", 4096)]).await;
    let a = h.lrs.connect();
    let b = h.lrs.connect();

    let first = a.submit(write(100)).unwrap();
    ready(wait(&a, first).await);

    let second = b.submit(write(100)).unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(b.poll_responses().is_empty());

    let rel = a.submit(release(first, 100)).unwrap();
    wait(&a, rel).await;
    let mount = ready(wait(&b, second).await);
    assert_eq!(mount.medium, tape("L1"));
    assert_eq!(mount.avail, 4096 - 100);
}

#[tokio::test]
async fn contention_past_busy_timeout_fails_with_timeout() {
    let config = LrsConfig {
        busy_timeout_ms: 80,
        ..config()
    };
    let h = harness_with(1, &[("L1", 4096)], &[], config, |_| {}).await;
    let a = h.lrs.connect();
    let b = h.lrs.connect();

    let first = a.submit(write(100)).unwrap();
    ready(wait(&a, first).await);
    let second = b.submit(write(100)).unwrap();
    assert_eq!(wait(&b, second).await.error_kind(), Some(ErrorKind::Timeout));
}

#[tokio::test]
async fn cancel_pending_request_answers_cancelled() {
    let h = harness(1, &[("L1", 4096)]).await;
    let a = h.lrs.connect();
    let b = h.lrs.connect();

    let first = a.submit(write(100)).unwrap();
    ready(wait(&a, first).await);
    let second = b.submit(write(100)).unwrap();

    assert!(b.cancel(second).await);
    assert_eq!(wait(&b, second).await.error_kind(), Some(ErrorKind::Cancelled));
    assert!(!b.cancel(second).await);
    assert!(!a.cancel(first).await, "granted requests are released, not cancelled");
}

#[tokio::test]
async fn cancel_while_loading_releases_the_late_grant_silently() {
    let h = harness_with(1, &[("L1", 4096)], &[], config(), |sim| {
        sim.set_latency(SimAction::Load, Duration::from_millis(200))
    })
    .await;
    let client = h.lrs.connect();

    let id = client.submit(write(100)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.cancel(id).await);
    assert_eq!(wait(&client, id).await.error_kind(), Some(ErrorKind::Cancelled));

    // The Ready that follows the load is released by the scheduler.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !h.catalog.list_locks().unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "grant never released");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.poll_responses().is_empty());
    assert!(!h.lrs.device(&drive("st0")).unwrap().ongoing_io);

    let next = client.submit(write(100)).unwrap();
    assert_eq!(ready(wait(&client, next).await).medium, tape("L1"));
}

// ── Faults ──────────────────────────────────────────────────────────

#[tokio::test]
async fn unrecorded_release_keeps_the_grant_until_released_again() {
    let h = harness(1, &[("L1", 4096)]).await;
    let client = h.lrs.connect();
    let id = client.submit(write(100)).unwrap();
    ready(wait(&client, id).await);

    // Booking the write fails while the medium record is missing.
    let saved = h.catalog.get_medium(&tape("L1")).unwrap().unwrap();
    assert!(h.catalog.delete_medium(&tape("L1")).unwrap());
    let rel = client.submit(release(id, 100)).unwrap();
    assert_eq!(wait(&client, rel).await.error_kind(), Some(ErrorKind::NotFound));
    assert_eq!(h.catalog.list_locks().unwrap().len(), 2);
    assert!(h.lrs.device(&drive("st0")).unwrap().ongoing_io);

    h.catalog.put_medium(&saved).unwrap();
    let rel = client.submit(release(id, 100)).unwrap();
    match wait(&client, rel).await.outcome {
        Outcome::Released { medium } => assert_eq!(medium, tape("L1")),
        other => panic!("expected Released, got {other:?}"),
    }
    let medium = h.catalog.get_medium(&tape("L1")).unwrap().unwrap();
    assert_eq!(medium.used, 100);
    assert_eq!(medium.nb_obj, 1);
    assert!(h.catalog.list_locks().unwrap().is_empty());
}

#[tokio::test]
async fn read_of_medium_stuck_in_faulted_drive_fails_fast() {
    let h = harness(2, &[("L1", 4096)]).await;
    let client = h.lrs.connect();
    let id = client.submit(write(10)).unwrap();
    assert_eq!(ready(wait(&client, id).await).device, drive("st0"));

    h.sim.inject_fault("st0", SimAction::Sync, -libc::EIO, 1);
    let rel = client.submit(release(id, 10)).unwrap();
    assert_eq!(wait(&client, rel).await.error_kind(), Some(ErrorKind::DeviceFault));
    assert_eq!(
        h.lrs.device(&drive("st0")).unwrap().status,
        DeviceStatus::Error
    );

    // st1 is idle, but L1 is still in st0: no amount of waiting helps.
    let started = tokio::time::Instant::now();
    let read = client.submit(Request::Read { medium: tape("L1") }).unwrap();
    assert_eq!(wait(&client, read).await.error_kind(), Some(ErrorKind::DeviceFault));
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(
        h.lrs.reset_device(&drive("st0")).await.unwrap(),
        DeviceStatus::Mounted
    );
    let read = client.submit(Request::Read { medium: tape("L1") }).unwrap();
    assert_eq!(ready(wait(&client, read).await).device, drive("st0"));
}

#[tokio::test]
async fn transient_load_rejection_is_retried_once() {
    let h = harness_with(1, &[("L1", 4096)], &[], config(), |sim| {
        sim.inject_fault("st0", SimAction::Load, -libc::EINVAL, 1)
    })
    .await;
    let client = h.lrs.connect();

    let id = client.submit(write(10)).unwrap();
    ready(wait(&client, id).await);

    let loads: Vec<_> = h
        .catalog
        .list_logs()
        .unwrap()
        .into_iter()
        .filter(|l| l.cause == LogCause::DeviceLoad)
        .collect();
    assert_eq!(loads.len(), 2);
    assert_eq!(loads[0].errno, -libc::EINVAL);
    assert_eq!(loads[0].message["attempt"], 1);
    assert_eq!(loads[1].errno, 0);
    assert_eq!(loads[1].message["attempt"], 2);
}

#[tokio::test]
async fn exhausted_load_retries_fault_the_device() {
    let h = harness_with(1, &[("L1", 4096)], &[], config(), |sim| {
        sim.inject_fault("st0", SimAction::Load, -libc::EINVAL, 2)
    })
    .await;
    let client = h.lrs.connect();

    let id = client.submit(write(10)).unwrap();
    assert_eq!(wait(&client, id).await.error_kind(), Some(ErrorKind::DeviceFault));
    assert_eq!(
        h.lrs.device(&drive("st0")).unwrap().status,
        DeviceStatus::Error
    );
    let loads = h
        .catalog
        .list_logs()
        .unwrap()
        .into_iter()
        .filter(|l| l.cause == LogCause::DeviceLoad && l.errno != 0)
        .count();
    assert_eq!(loads, 2);
    assert!(h.catalog.list_locks().unwrap().is_empty());
}

#[tokio::test]
async fn load_fault_isolates_device_and_reset_recovers_it() {
    let h = harness_with(2, &[("L1", 4096), ("L2", 4096)], &[], config(), |sim| {
        sim.inject_fault("st0", SimAction::Load, -libc::EIO, 1)
    })
    .await;
    let client = h.lrs.connect();

    let failed = client.submit(write(10)).unwrap();
    assert_eq!(
        wait(&client, failed).await.error_kind(),
        Some(ErrorKind::DeviceFault)
    );
    assert_eq!(
        h.lrs.device(&drive("st0")).unwrap().status,
        DeviceStatus::Error
    );

    // The other drive keeps serving.
    let id = client.submit(write(10)).unwrap();
    let mount = ready(wait(&client, id).await);
    assert_eq!(mount.device, drive("st1"));
    assert_eq!(
        h.lrs.device(&drive("st0")).unwrap().status,
        DeviceStatus::Error
    );

    let status = h.lrs.reset_device(&drive("st0")).await.unwrap();
    assert_eq!(status, DeviceStatus::Empty);
    assert!(h.lrs.reset_device(&drive("st9")).await.is_err());
}

// ── Format ──────────────────────────────────────────────────────────

#[tokio::test]
async fn format_blank_medium_then_write_to_it() {
    let h = harness_with(1, &[], &["L9"], config(), |_| {}).await;

    let formatted = h.lrs.format(&tape("L9"), FsType::Ltfs, true).await.unwrap();
    assert_eq!(formatted, tape("L9"));

    let medium = h.catalog.get_medium(&tape("L9")).unwrap().unwrap();
    assert_eq!(medium.fs.status, FsStatus::Formatted);
    assert_eq!(medium.fs.label.as_deref(), Some("L9"));
    assert_eq!(medium.adm_status, AdminStatus::Unlocked);
    assert_eq!(medium.capacity, 4096);

    let err = h
        .lrs
        .format(&tape("L9"), FsType::Ltfs, true)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let client = h.lrs.connect();
    let id = client.submit(write(100)).unwrap();
    assert_eq!(ready(wait(&client, id).await).medium, tape("L9"));
}

#[tokio::test]
async fn shutdown_releases_grants_and_restart_clears_stale_locks() {
    let h = harness(1, &[("L1", 4096), ("L2", 4096)]).await;
    let client = h.lrs.connect();
    let id = client.submit(write(10)).unwrap();
    ready(wait(&client, id).await);
    assert_eq!(h.catalog.list_locks().unwrap().len(), 2);

    let Harness {
        _dir,
        sim,
        catalog,
        lrs,
    } = h;
    lrs.shutdown().await;
    assert!(catalog.list_locks().unwrap().is_empty());

    // Left behind by a crashed scheduler on this host, and one held by a
    // scheduler elsewhere.
    let ours = LockTarget::Medium(tape("L2"));
    let theirs = LockTarget::Device(drive("st7"));
    assert!(catalog.try_lock(&ours, &LockOwner::new(HOST, "req-77")).unwrap());
    assert!(catalog.try_lock(&theirs, &LockOwner::new("node-2", "req-3")).unwrap());

    let adapter: Arc<dyn DeviceAdapter> = sim.clone();
    let lrs = Lrs::start(catalog.clone(), adapter, config()).await.unwrap();
    assert!(catalog.lock_holder(&ours).unwrap().is_none());
    assert!(catalog.lock_holder(&theirs).unwrap().is_some());
    assert_eq!(
        lrs.device(&drive("st0")).unwrap().status,
        DeviceStatus::Mounted
    );
}
