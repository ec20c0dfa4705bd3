//! Mount lifecycle.
//!
//! Startup: verify the mount point, probe connectivity (warning
//! only), resolve the drive root (remote or cached), mount, serve.
//! On SIGINT/SIGTERM: unmount (the kernel stops sending operations),
//! flush pending uploads with a bounded wait, checkpoint the store,
//! and exit cleanly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fuser::MountOption;
use tokio::runtime::Handle;
use tokio::signal::unix::{signal, SignalKind};

use nimbus_core::NimbusError;
use nimbus_sync::SyncEngine;

use crate::filesystem::NimbusFs;

/// Filesystem name shown in /proc/mounts.
const FSNAME: &str = "nimbusfs";

/// Connectivity probe budget.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// How the filesystem is mounted.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Where to mount.
    pub mount_point: PathBuf,
    /// Bound on the upload drain at shutdown.
    pub drain_timeout: Duration,
    /// Allow other users to access the mount.
    pub allow_other: bool,
}

impl MountOptions {
    /// Options for `mount_point` with the default drain bound.
    #[must_use]
    pub fn new(mount_point: PathBuf) -> Self {
        Self {
            mount_point,
            drain_timeout: Duration::from_secs(30),
            allow_other: false,
        }
    }
}

/// Verify the mount point is a writable directory.
fn check_mount_point(path: &std::path::Path) -> Result<(), NimbusError> {
    let meta = std::fs::metadata(path).map_err(|e| {
        NimbusError::Io(std::io::Error::new(
            e.kind(),
            format!("mount point {}: {e}", path.display()),
        ))
    })?;
    if !meta.is_dir() {
        return Err(NimbusError::InvalidName(format!(
            "mount point {} is not a directory",
            path.display()
        )));
    }
    // Writability probe: the kernel needs to hand us a mountable dir,
    // and a read-only location is the most common misconfiguration.
    let probe = path.join(".nimbusfs-mount-probe");
    std::fs::write(&probe, b"").map_err(|e| {
        NimbusError::PermissionDenied(format!(
            "mount point {} is not writable: {e}",
            path.display()
        ))
    })?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

/// Mount and serve until SIGINT/SIGTERM, then drain and unmount.
///
/// Runs on the engine's runtime; the FUSE session itself serves from
/// its own background threads.
pub async fn mount(engine: Arc<SyncEngine>, options: MountOptions) -> Result<(), NimbusError> {
    check_mount_point(&options.mount_point)?;

    // Pre-mount connectivity probe: a warning, never a failure —
    // offline mounts serve cached state.
    match tokio::time::timeout(PROBE_TIMEOUT, engine.drive().quota()).await {
        Ok(Ok(quota)) => {
            tracing::info!(used = quota.used, total = quota.total, "Connectivity probe ok");
        }
        Ok(Err(e)) => tracing::warn!(error = %e, "Connectivity probe failed; starting offline"),
        Err(_) => tracing::warn!("Connectivity probe timed out; starting offline"),
    }

    // The root id must resolve — remotely, or from the cache when
    // this mount has synced before.
    let startup = Duration::from_secs(engine.config().mount_timeout);
    let root_id = tokio::time::timeout(startup, engine.ensure_root())
        .await
        .map_err(|_| {
            NimbusError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "mount startup timed out",
            ))
        })??;

    let fs = NimbusFs::new(Handle::current(), Arc::clone(&engine), root_id);

    let mut mount_options = vec![
        MountOption::FSName(FSNAME.to_string()),
        MountOption::DefaultPermissions,
        MountOption::AutoUnmount,
        MountOption::NoAtime,
    ];
    if options.allow_other {
        mount_options.push(MountOption::AllowOther);
    }

    let session = fuser::spawn_mount2(fs, &options.mount_point, &mount_options)
        .map_err(NimbusError::Io)?;
    tracing::info!(mount_point = %options.mount_point.display(), "Filesystem mounted");

    // Periodic diagnostics: queue depths, cache totals, link health.
    let stats_engine = Arc::clone(&engine);
    let stats_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(600));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let stats = stats_engine.stats().await;
            tracing::info!(
                hydration_active = stats.hydration_active,
                upload_pending = stats.upload_pending,
                upload_parked = stats.upload_parked,
                metadata_high = stats.metadata_high_depth,
                metadata_low = stats.metadata_low_depth,
                journal_entries = stats.journal_entries,
                cache_bytes = stats.cache_bytes,
                items = stats.item_count,
                realtime = %stats.realtime_health,
                offline = stats.offline,
                "Engine status"
            );
        }
    });

    // Serve until a termination signal arrives.
    let mut sigint = signal(SignalKind::interrupt()).map_err(NimbusError::Io)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(NimbusError::Io)?;
    tokio::select! {
        _ = sigint.recv() => tracing::info!("SIGINT received"),
        _ = sigterm.recv() => tracing::info!("SIGTERM received"),
    }

    // Unmount first: the kernel stops sending operations, in-flight
    // ones finish as the session joins.
    stats_task.abort();
    drop(session);
    tracing::info!("Unmounted; draining pipelines");

    engine.shutdown(options.drain_timeout).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_mount_point_accepts_writable_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_mount_point(dir.path()).is_ok());
    }

    #[test]
    fn test_check_mount_point_rejects_missing() {
        assert!(check_mount_point(std::path::Path::new("/nonexistent/mnt")).is_err());
    }

    #[test]
    fn test_check_mount_point_rejects_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(check_mount_point(&file).is_err());
    }

    #[test]
    fn test_default_options() {
        let options = MountOptions::new(PathBuf::from("/mnt/drive"));
        assert_eq!(options.drain_timeout, Duration::from_secs(30));
        assert!(!options.allow_other);
    }
}
