// Copyright 2026 Hymo Daemon Authors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Result, ensure};
use rustix::{
    fs::Mode,
    mount::{UnmountFlags, unmount},
};
use serde::Serialize;
use walkdir::WalkDir;

use crate::{
    conf::config::FsType,
    core::state::RuntimeState,
    defs::DEFAULT_SELINUX_CONTEXT,
    try_umount::send_umountable,
    utils,
};

pub struct StorageHandle {
    pub mount_point: PathBuf,
    pub mode: String,
    pub backing_image: Option<PathBuf>,
}

impl StorageHandle {
    /// Finish an erofs staging root: pack the tmpfs content into the image,
    /// swap the mount for the read-only image.
    pub fn commit(&mut self, disable_umount: bool) -> Result<()> {
        if self.mode != "erofs_staging" {
            return Ok(());
        }

        let image_path = self
            .backing_image
            .as_ref()
            .context("EROFS backing image path missing")?;

        utils::create_erofs_image(&self.mount_point, image_path)
            .context("Failed to pack EROFS image")?;

        unmount(&self.mount_point, UnmountFlags::DETACH)
            .context("Failed to unmount staging tmpfs")?;

        utils::mount_erofs_image(image_path, &self.mount_point)
            .context("Failed to mount finalized EROFS image")?;

        if !disable_umount {
            let _ = send_umountable(&self.mount_point);
        }

        self.mode = "erofs".to_string();
        Ok(())
    }
}

#[derive(Serialize)]
struct StorageStatus {
    #[serde(rename = "type")]
    mode: String,
    mount_point: String,
    usage_percent: u8,
    total_size: u64,
    used_size: u64,
    supported_modes: Vec<String>,
}

pub fn get_usage(path: &Path) -> (u64, u64, u8) {
    if let Ok(stat) = rustix::fs::statvfs(path) {
        let total = stat.f_blocks * stat.f_frsize;
        let free = stat.f_bfree * stat.f_frsize;
        let used = total - free;
        let percent = if total > 0 { (used * 100 / total) as u8 } else { 0 };
        (total, used, percent)
    } else {
        (0, 0, 0)
    }
}

fn calculate_total_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .flatten()
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

fn check_image(img: &Path) -> Result<()> {
    let result = Command::new("e2fsck")
        .arg("-yf")
        .arg(img)
        .status()
        .with_context(|| format!("Failed to exec e2fsck {}", img.display()))?;

    let code = result.code().unwrap_or(-1);
    log::info!("e2fsck exit code: {code}");
    // 0 = clean, 1/2 = corrected
    ensure!(code >= 0 && code <= 2, "e2fsck reported unrecoverable errors");
    Ok(())
}

/// Prepare the staging root at `mnt_base`.
///
/// Selection: tmpfs when it carries xattrs, else a loop-mounted ext4 image
/// (created on demand, repaired on mount failure). `FsType::Erofs` stages
/// into tmpfs first and is packed read-only by [`StorageHandle::commit`].
pub fn setup(
    mnt_base: &Path,
    img_path: &Path,
    moduledir: &Path,
    fs_type: FsType,
    mount_source: &str,
    disable_umount: bool,
) -> Result<StorageHandle> {
    if utils::is_mounted(mnt_base) {
        let _ = unmount(mnt_base, UnmountFlags::DETACH);
    }
    utils::ensure_dir_exists(mnt_base)?;

    let try_hide = |path: &Path| {
        if !disable_umount {
            let _ = send_umountable(path);
        }
    };

    if fs_type == FsType::Erofs && utils::is_erofs_supported() {
        let erofs_path = img_path.with_extension("erofs");

        utils::mount_tmpfs(mnt_base, mount_source)?;
        try_hide(mnt_base);

        return Ok(StorageHandle {
            mount_point: mnt_base.to_path_buf(),
            mode: "erofs_staging".to_string(),
            backing_image: Some(erofs_path),
        });
    }

    if fs_type != FsType::Ext4 && try_setup_tmpfs(mnt_base, mount_source)? {
        try_hide(mnt_base);

        let erofs_path = img_path.with_extension("erofs");
        if erofs_path.exists() {
            let _ = fs::remove_file(erofs_path);
        }

        return Ok(StorageHandle {
            mount_point: mnt_base.to_path_buf(),
            mode: "tmpfs".to_string(),
            backing_image: None,
        });
    }

    let handle = setup_ext4_image(mnt_base, img_path, moduledir)?;
    try_hide(mnt_base);
    Ok(handle)
}

fn try_setup_tmpfs(target: &Path, mount_source: &str) -> Result<bool> {
    if utils::mount_tmpfs(target, mount_source).is_ok() {
        if utils::is_xattr_supported(target) && utils::is_overlay_xattr_supported(target) {
            log::info!("Tmpfs mounted and supports xattrs.");
            return Ok(true);
        }
        log::warn!("Tmpfs mounted but xattrs are NOT supported.");
        log::warn!(">> Your kernel likely lacks CONFIG_TMPFS_XATTR=y.");
        log::warn!(">> Falling back to ext4 image mode.");
        let _ = unmount(target, UnmountFlags::DETACH);
    }

    Ok(false)
}

fn setup_ext4_image(target: &Path, img_path: &Path, moduledir: &Path) -> Result<StorageHandle> {
    if !img_path.exists() || check_image(img_path).is_err() {
        log::info!("Modules image missing or corrupted, creating it.");

        if img_path.exists()
            && let Err(e) = fs::remove_file(img_path)
        {
            log::warn!("Failed to remove old image: {}", e);
        }

        let total_size = calculate_total_size(moduledir);
        log::info!(
            "Total size of files in '{}': {} bytes",
            moduledir.display(),
            total_size,
        );

        // Content plus headroom for metadata and later hot additions
        let grow_size = 128 * 1024 * 1024 + total_size;

        fs::File::create(img_path)
            .context("Failed to create ext4 image file")?
            .set_len(grow_size)
            .context("Failed to extend ext4 image")?;

        let result = Command::new("mkfs.ext4")
            .arg("-b")
            .arg("1024")
            .arg(img_path)
            .stdout(std::process::Stdio::piped())
            .output()?;

        ensure!(
            result.status.success(),
            "Failed to format ext4 image: {}",
            String::from_utf8_lossy(&result.stderr)
        );

        check_image(img_path)?;
    }

    utils::lsetfilecon(img_path, "u:object_r:ksu_file:s0").ok();

    log::info!("Mounting image {}", img_path.display());
    if utils::mount_ext4_image(img_path, target).is_err() {
        utils::repair_image(img_path).context("Failed to repair modules.img")?;
        utils::mount_ext4_image(img_path, target)
            .context("Failed to mount modules.img after repair")?;
    }

    log::info!("mounted {} to {}", img_path.display(), target.display());

    for entry in WalkDir::new(target).into_iter().flatten() {
        let _ = utils::lsetfilecon(entry.path(), DEFAULT_SELINUX_CONTEXT);
    }

    Ok(StorageHandle {
        mount_point: target.to_path_buf(),
        mode: "ext4".to_string(),
        backing_image: Some(img_path.to_path_buf()),
    })
}

/// Run after sync has populated an ext4 root: 0755, root:root, system label.
pub fn finalize_storage_permissions(target: &Path) {
    if let Err(e) = rustix::fs::chmod(target, Mode::from_raw_mode(0o755)) {
        log::warn!("Failed to chmod storage root: {}", e);
    }

    if let Err(e) = rustix::fs::chown(
        target,
        Some(rustix::fs::Uid::from_raw(0)),
        Some(rustix::fs::Gid::from_raw(0)),
    ) {
        log::warn!("Failed to chown storage root: {}", e);
    }

    if let Err(e) = utils::lsetfilecon(target, DEFAULT_SELINUX_CONTEXT) {
        log::warn!("Failed to set SELinux context: {}", e);
    }
}

pub fn print_status() -> Result<()> {
    let state = RuntimeState::load().ok();
    let (mnt_base, expected_mode) = if let Some(ref s) = state {
        (PathBuf::from(&s.mount_point), s.storage_mode.clone())
    } else {
        (PathBuf::from(crate::defs::FALLBACK_CONTENT_DIR), "unknown".to_string())
    };

    let mut mode = "unknown".to_string();
    let mut total = 0;
    let mut used = 0;
    let mut percent = 0;

    if utils::is_mounted(&mnt_base) {
        (total, used, percent) = get_usage(&mnt_base);
        mode = if expected_mode != "unknown" {
            expected_mode
        } else {
            "active".to_string()
        };
    }

    let mut supported_modes = vec!["ext4".to_string()];
    if utils::is_erofs_supported() {
        supported_modes.push("erofs".to_string());
    }
    let check_dir = Path::new("/data/local/tmp/.hymo_xattr_chk");
    if utils::mount_tmpfs(check_dir, "hymo_check").is_ok() {
        if utils::is_xattr_supported(check_dir) {
            supported_modes.insert(0, "tmpfs".to_string());
        }
        let _ = unmount(check_dir, UnmountFlags::DETACH);
        let _ = fs::remove_dir(check_dir);
    }

    let status = StorageStatus {
        mode,
        mount_point: mnt_base.to_string_lossy().to_string(),
        usage_percent: percent,
        total_size: total,
        used_size: used,
        supported_modes,
    };

    println!("{}", serde_json::to_string(&status)?);
    Ok(())
}
