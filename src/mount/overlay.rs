// Copyright 2026 Hymo Daemon Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! OverlayFS execution with the mirror strategy: the target is recursively
//! bind-mounted to a private mirror first, the mirror becomes the lowest
//! layer, and child mounts are restored from it afterwards.

use std::{
    ffi::CString,
    os::fd::AsFd,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use procfs::process::Process;
use rustix::{
    fs::CWD,
    mount::{
        FsMountFlags, FsOpenFlags, MountAttrFlags, MountFlags, MountPropagationFlags,
        MoveMountFlags, OpenTreeFlags, UnmountFlags, fsconfig_create, fsconfig_set_string,
        fsmount, fsopen, mount, mount_change, move_mount, open_tree, unmount,
    },
};

use crate::{mount::hymofs, try_umount, utils};

fn build_lowerdir_config(lower_dirs: &[String], lowest: &str) -> String {
    lower_dirs
        .iter()
        .map(|s| s.as_str())
        .chain(std::iter::once(lowest))
        .collect::<Vec<_>>()
        .join(":")
}

fn mount_overlayfs_modern(
    lowerdir_config: &str,
    upperdir: Option<&str>,
    workdir: Option<&str>,
    dest: &Path,
    mount_source: &str,
) -> Result<()> {
    let fs = fsopen("overlay", FsOpenFlags::FSOPEN_CLOEXEC)?;
    let fd = fs.as_fd();
    fsconfig_set_string(fd, "lowerdir", lowerdir_config)?;
    if let (Some(upper), Some(work)) = (upperdir, workdir) {
        fsconfig_set_string(fd, "upperdir", upper)?;
        fsconfig_set_string(fd, "workdir", work)?;
    }
    fsconfig_set_string(fd, "source", mount_source)?;
    fsconfig_create(fd)?;
    let mnt = fsmount(fd, FsMountFlags::FSMOUNT_CLOEXEC, MountAttrFlags::empty())?;
    move_mount(mnt.as_fd(), "", CWD, dest, MoveMountFlags::MOVE_MOUNT_F_EMPTY_PATH)?;
    Ok(())
}

fn mount_overlayfs_legacy(
    lowerdir_config: &str,
    upperdir: Option<&str>,
    workdir: Option<&str>,
    dest: &Path,
    mount_source: &str,
) -> Result<()> {
    let mut data = format!("lowerdir={}", lowerdir_config.replace(',', "\\,"));
    if let (Some(upper), Some(work)) = (upperdir, workdir) {
        data.push_str(&format!(
            ",upperdir={},workdir={}",
            upper.replace(',', "\\,"),
            work.replace(',', "\\,")
        ));
    }
    mount(
        mount_source,
        dest,
        "overlay",
        MountFlags::empty(),
        Some(CString::new(data)?.as_c_str()),
    )?;
    Ok(())
}

/// One overlay mount: new mount API first, plain mount(2) as fallback. On
/// success the kernel peer is asked to conceal the overlay's private xattrs.
pub fn mount_overlayfs(
    lower_dirs: &[String],
    lowest: &str,
    upperdir: Option<PathBuf>,
    workdir: Option<PathBuf>,
    dest: impl AsRef<Path>,
    mount_source: &str,
) -> Result<()> {
    let dest = dest.as_ref();
    let lowerdir_config = build_lowerdir_config(lower_dirs, lowest);

    let upper = upperdir
        .as_ref()
        .filter(|p| p.exists())
        .map(|p| p.to_string_lossy().to_string());
    let work = workdir
        .as_ref()
        .filter(|p| p.exists())
        .map(|p| p.to_string_lossy().to_string());

    log::debug!("overlay {} lowerdir={}", dest.display(), lowerdir_config);

    let modern = mount_overlayfs_modern(
        &lowerdir_config,
        upper.as_deref(),
        work.as_deref(),
        dest,
        mount_source,
    );
    if let Err(e) = modern {
        log::debug!("fsopen mount failed for {}: {e:#}, trying legacy", dest.display());
        mount_overlayfs_legacy(
            &lowerdir_config,
            upper.as_deref(),
            work.as_deref(),
            dest,
            mount_source,
        )
        .with_context(|| format!("overlay mount failed for {}", dest.display()))?;
    }

    let _ = hymofs::hide_overlay_xattrs(dest);
    Ok(())
}

/// Recursive bind mount: open_tree + move_mount, mount(2) fallback.
pub fn bind_mount(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
    let from = from.as_ref();
    let to = to.as_ref();

    let result = (|| {
        let tree = open_tree(
            CWD,
            from,
            OpenTreeFlags::OPEN_TREE_CLOEXEC
                | OpenTreeFlags::OPEN_TREE_CLONE
                | OpenTreeFlags::AT_RECURSIVE,
        )?;
        move_mount(tree.as_fd(), "", CWD, to, MoveMountFlags::MOVE_MOUNT_F_EMPTY_PATH)
    })();

    if result.is_err() {
        log::debug!("open_tree failed for {}, falling back to bind mount", from.display());
        mount(from, to, "", MountFlags::BIND | MountFlags::REC, None)
            .with_context(|| format!("bind mount {} -> {}", from.display(), to.display()))?;
    }

    Ok(())
}

/// Child mounts beneath `target_root`, sorted, read from mountinfo.
fn get_child_mounts(target_root: &str) -> Vec<String> {
    let mut mounts: Vec<String> = Process::myself()
        .and_then(|p| p.mountinfo())
        .map(|info| {
            info.into_iter()
                .map(|m| m.mount_point.to_string_lossy().to_string())
                .filter(|mp| {
                    mp != target_root
                        && mp.starts_with(target_root)
                        && mp.as_bytes().get(target_root.len()) == Some(&b'/')
                })
                .collect()
        })
        .unwrap_or_default();

    mounts.sort();
    mounts.dedup();
    mounts
}

/// Deterministic mirror directory for a target root.
pub fn mirror_path_for(mirror_base: &Path, target_root: &str) -> PathBuf {
    mirror_base.join(target_root.replace('/', "_"))
}

enum ChildRestore {
    BindStock,
    Overlay(Vec<String>),
}

/// Decide how to restore one child mountpoint: bind the mirror copy back, or
/// overlay the module subtrees over it. A module serving a non-directory at
/// the child path invalidates the overlay.
fn plan_child_restore(module_roots: &[String], relative: &str) -> ChildRestore {
    let rel = relative.trim_start_matches('/');

    let mut has_modification = false;
    for root in module_roots {
        if Path::new(root).join(rel).exists() {
            has_modification = true;
            break;
        }
    }
    if !has_modification {
        return ChildRestore::BindStock;
    }

    let mut sub_lowers = Vec::new();
    for root in module_roots {
        let path = Path::new(root).join(rel);
        if path.is_dir() {
            sub_lowers.push(path.to_string_lossy().to_string());
        } else if path.exists() {
            return ChildRestore::BindStock;
        }
    }

    if sub_lowers.is_empty() {
        ChildRestore::BindStock
    } else {
        ChildRestore::Overlay(sub_lowers)
    }
}

fn mount_overlay_child(
    mount_point: &str,
    relative: &str,
    module_roots: &[String],
    stock_root: &str,
    mount_source: &str,
    disable_umount: bool,
) -> Result<()> {
    match plan_child_restore(module_roots, relative) {
        ChildRestore::BindStock => {
            bind_mount(stock_root, mount_point)?;
        }
        ChildRestore::Overlay(sub_lowers) => {
            if !Path::new(stock_root).is_dir() {
                return Ok(());
            }
            if let Err(e) = mount_overlayfs(
                &sub_lowers,
                stock_root,
                None,
                None,
                mount_point,
                mount_source,
            ) {
                log::warn!(
                    "failed to overlay child {mount_point}: {e:#}, fallback to bind mount"
                );
                bind_mount(stock_root, mount_point)?;
            }
        }
    }

    if !disable_umount {
        let _ = try_umount::send_umountable(mount_point);
    }
    Ok(())
}

/// Mount the root overlay for `target_root_raw` and restore everything that
/// lived beneath it: child mounts from the mirror, then root-level partition
/// directories that the stock tree reaches through bind mounts.
#[allow(clippy::too_many_arguments)]
pub fn mount_overlay(
    target_root_raw: &str,
    module_roots: &[String],
    mount_source: &str,
    upperdir: Option<PathBuf>,
    workdir: Option<PathBuf>,
    disable_umount: bool,
    mirror_base: &Path,
    partitions: &[String],
) -> Result<()> {
    let target_root = match Path::new(target_root_raw).canonicalize() {
        Ok(resolved) => {
            let resolved = resolved.to_string_lossy().to_string();
            if resolved != target_root_raw {
                log::debug!("Resolved symlink: {target_root_raw} -> {resolved}");
            }
            resolved
        }
        Err(e) => {
            log::warn!("Failed to resolve path {target_root_raw}: {e}");
            target_root_raw.to_string()
        }
    };

    log::info!("Starting mirror overlay mount for {target_root}");

    let mirror = mirror_path_for(mirror_base, &target_root);
    utils::ensure_dir_exists(mirror_base)?;
    utils::ensure_dir_exists(&mirror)?;

    // Recursive so child mounts (e.g. /system/vendor) are captured
    mount(&target_root, &mirror, "", MountFlags::BIND | MountFlags::REC, None)
        .with_context(|| format!("Failed to create mirror for {target_root}"))?;
    if let Err(e) = mount_change(&mirror, MountPropagationFlags::PRIVATE) {
        log::warn!("make mirror {} private: {e:#?}", mirror.display());
    }

    let mirror_str = mirror.to_string_lossy().to_string();

    // List child mounts up front; restoration needs the pre-overlay set
    let children = get_child_mounts(&target_root);
    if !children.is_empty() {
        log::debug!("Found {} child mounts under {target_root}", children.len());
    }

    if let Err(e) = mount_overlayfs(
        module_roots,
        &mirror_str,
        upperdir,
        workdir,
        &target_root,
        mount_source,
    ) {
        let _ = unmount(&mirror, UnmountFlags::DETACH);
        return Err(e).with_context(|| format!("mount overlayfs for root {target_root}"));
    }

    if !disable_umount {
        let _ = try_umount::send_umountable(&target_root);
    }

    for mount_point in &children {
        let relative = mount_point
            .strip_prefix(&target_root)
            .unwrap_or(mount_point)
            .to_string();
        let stock_root = format!("{mirror_str}{relative}");

        log::debug!("Restoring child mount: {mount_point} from {stock_root}");
        if let Err(e) = mount_overlay_child(
            mount_point,
            &relative,
            module_roots,
            &stock_root,
            mount_source,
            disable_umount,
        ) {
            log::warn!("failed to restore child mount {mount_point}: {e:#}");
        }
    }

    // Partitions reachable through the target (e.g. /system/vendor -> /vendor)
    // that were not child mounts get the real partition bound back
    for part in partitions {
        let root_part = format!("/{part}");
        let target_part = format!("{target_root}/{part}");

        if !Path::new(&root_part).is_dir() {
            continue;
        }
        let target_path = Path::new(&target_part);
        if !target_path.exists()
            || target_path.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(true)
            || !target_path.is_dir()
        {
            continue;
        }
        if children.contains(&target_part) {
            continue;
        }

        log::info!("Restoring partition mount: {root_part} -> {target_part}");
        if let Err(e) = bind_mount(&root_part, &target_part) {
            log::error!("Failed to restore partition {part}: {e:#}");
        } else if !disable_umount {
            let _ = try_umount::send_umountable(&target_part);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn lowerdir_config_appends_lowest_last() {
        let lowers = vec!["/s/m2/system".to_string(), "/s/m1/system".to_string()];
        assert_eq!(
            build_lowerdir_config(&lowers, "/dev/hymo_mirror/_system"),
            "/s/m2/system:/s/m1/system:/dev/hymo_mirror/_system"
        );
        assert_eq!(build_lowerdir_config(&[], "/mirror"), "/mirror");
    }

    #[test]
    fn mirror_path_sanitizes_target() {
        let base = Path::new("/dev/hymo_mirror");
        assert_eq!(
            mirror_path_for(base, "/system"),
            PathBuf::from("/dev/hymo_mirror/_system")
        );
        assert_eq!(
            mirror_path_for(base, "/system_ext"),
            PathBuf::from("/dev/hymo_mirror/_system_ext")
        );
    }

    #[test]
    fn untouched_child_restores_from_stock() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("m1");
        fs::create_dir_all(module.join("system/bin")).unwrap();

        let roots = vec![module.join("system").to_string_lossy().to_string()];
        assert!(matches!(
            plan_child_restore(&roots, "/vendor"),
            ChildRestore::BindStock
        ));
    }

    #[test]
    fn modified_child_overlays_module_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("m1/system");
        fs::create_dir_all(module.join("vendor/lib")).unwrap();

        let roots = vec![module.to_string_lossy().to_string()];
        match plan_child_restore(&roots, "/vendor") {
            ChildRestore::Overlay(lowers) => {
                assert_eq!(lowers, vec![module.join("vendor").to_string_lossy().to_string()]);
            }
            ChildRestore::BindStock => panic!("expected overlay restore"),
        }
    }

    #[test]
    fn file_over_child_mountpoint_falls_back_to_stock() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("m1/system");
        fs::create_dir_all(&module).unwrap();
        fs::write(module.join("vendor"), b"not a dir").unwrap();

        let roots = vec![module.to_string_lossy().to_string()];
        assert!(matches!(
            plan_child_restore(&roots, "/vendor"),
            ChildRestore::BindStock
        ));
    }
}
