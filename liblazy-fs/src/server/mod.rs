//! Mount plumbing shared by the mount binaries and the layer store.

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::Path;
use std::time::Duration;

use rfuse3::MountOptions;
use rfuse3::raw::{Filesystem, MountHandle, Session};
use tokio::process::Command;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

/// Mount `fs` at `mountpoint` as an unprivileged FUSE session. The
/// returned handle resolves when the session ends and can unmount it on
/// demand.
pub async fn mount_lazyfs<F: Filesystem + Sync + Send + 'static>(
    fs: F,
    mountpoint: &OsStr,
) -> io::Result<MountHandle> {
    let mount_path: OsString = OsString::from(mountpoint);

    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };

    let mut mount_options = MountOptions::default();
    mount_options.force_readdir_plus(true).uid(uid).gid(gid);

    Session::new(mount_options)
        .mount_with_unprivileged(fs, mount_path)
        .await
}

/// Drive `umount` against `mountpoint` up to `attempts` times, half a
/// second apart. Returns true once the detach went through.
pub async fn detach_mount(mountpoint: &Path, attempts: u32) -> bool {
    for attempt in 1..=attempts {
        match Command::new("umount").arg(mountpoint).status().await {
            Ok(status) if status.success() => return true,
            Ok(status) => {
                warn!(
                    mountpoint = %mountpoint.display(),
                    %status,
                    attempt,
                    "umount exited nonzero"
                );
            }
            Err(err) => {
                warn!(
                    mountpoint = %mountpoint.display(),
                    %err,
                    attempt,
                    "failed to run umount"
                );
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    false
}

/// Serve until the session ends on its own or the process receives
/// SIGINT/SIGTERM, then unmount. On the signal path the unmount is
/// retried until it succeeds: the process is about to exit and must not
/// leave a live mount behind.
pub async fn serve_until_signal(mut handle: MountHandle, mountpoint: &Path) -> io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        res = &mut handle => return res,
        _ = sigint.recv() => info!("caught SIGINT, unmounting"),
        _ = sigterm.recv() => info!("caught SIGTERM, unmounting"),
    }

    if let Err(err) = handle.unmount().await {
        warn!(%err, "session unmount failed, forcing detach");
        while !detach_mount(mountpoint, 1).await {}
    }
    Ok(())
}
