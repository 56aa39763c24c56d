// Copyright 2026 Hymo Daemon Authors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    ffi::CString,
    fs::{self, File, OpenOptions, create_dir_all, remove_dir_all, remove_file},
    io::Write,
    os::fd::AsRawFd,
    os::unix::{
        ffi::OsStrExt,
        fs::{FileTypeExt, MetadataExt, PermissionsExt, symlink},
    },
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::OnceLock,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result, anyhow, bail};
#[cfg(any(target_os = "linux", target_os = "android"))]
use extattr::{Flags as XattrFlags, lgetxattr, llistxattr, lsetxattr};
use procfs::process::Process;
use regex_lite::Regex;
use rustix::{
    fs::ioctl_ficlone,
    mount::{MountFlags, mount},
};
use walkdir::WalkDir;

use crate::defs::{
    DEFAULT_SELINUX_CONTEXT, REPLACE_DIR_XATTR, RUN_DIR, SELINUX_XATTR,
};

const CONTEXT_VENDOR: &str = "u:object_r:vendor_file:s0";
const CONTEXT_HAL: &str = "u:object_r:same_process_hal_file:s0";
const CONTEXT_ROOTFS: &str = "u:object_r:rootfs:s0";

static MODULE_ID_REGEX: OnceLock<Regex> = OnceLock::new();

pub fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    #[cfg(target_os = "android")]
    {
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(level)
                .with_tag("hymod"),
        );
    }

    #[cfg(not(target_os = "android"))]
    {
        let mut builder = env_logger::Builder::new();
        builder.format(|buf, record| {
            writeln!(buf, "[{}] [{}] {}", record.level(), record.target(), record.args())
        });
        builder.filter_level(level).init();
    }
    Ok(())
}

/// Write-to-temp + rename, with a guard that removes the temp file on error.
pub fn atomic_write<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, content: C) -> Result<()> {
    let path = path.as_ref();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let temp_name = format!(
        ".hymo_tmp_{}_{}.tmp",
        std::process::id(),
        SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos()
    );
    let temp_file = dir.join(temp_name);

    struct CleanupGuard<'a>(&'a Path);
    impl Drop for CleanupGuard<'_> {
        fn drop(&mut self) {
            let _ = fs::remove_file(self.0);
        }
    }
    let guard = CleanupGuard(&temp_file);

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_file)
            .context("Failed to create temporary file for atomic write")?;
        file.write_all(content.as_ref())?;
        file.sync_all()?;
    }

    fs::rename(&temp_file, path).context("Failed to rename atomic temporary file")?;
    std::mem::forget(guard);
    Ok(())
}

pub fn validate_module_id(module_id: &str) -> Result<()> {
    let re = MODULE_ID_REGEX
        .get_or_init(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9._-]+$").expect("Invalid Regex pattern"));
    if re.is_match(module_id) {
        Ok(())
    } else {
        bail!("Invalid module ID: '{module_id}'. Must match /^[a-zA-Z][a-zA-Z0-9._-]+$/")
    }
}

pub fn ensure_dir_exists<T: AsRef<Path>>(dir: T) -> Result<()> {
    if !dir.as_ref().exists() {
        create_dir_all(&dir)?;
    }
    Ok(())
}

pub fn camouflage_process(name: &str) -> Result<()> {
    let c_name = CString::new(name)?;
    unsafe {
        libc::prctl(libc::PR_SET_NAME, c_name.as_ptr() as u64, 0, 0, 0);
    }
    Ok(())
}

// ---- SELinux / xattr ----

/// Set the SELinux label on `path` without following symlinks. Unlike the
/// relabel helpers scattered below, this one reports failure; callers that
/// only relabel opportunistically drop the result.
pub fn lsetfilecon<P: AsRef<Path>>(path: P, context: &str) -> Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    lsetxattr(
        path.as_ref(),
        SELINUX_XATTR,
        context.as_bytes(),
        XattrFlags::empty(),
    )
    .map_err(|errno| {
        anyhow!(
            "cannot label {} as {context}: {}",
            path.as_ref().display(),
            std::io::Error::from(errno)
        )
    })?;
    Ok(())
}

/// SELinux label of `path` (not followed), decoded up to the first NUL.
pub fn lgetfilecon<P: AsRef<Path>>(path: P) -> Result<String> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let raw = lgetxattr(path.as_ref(), SELINUX_XATTR).map_err(|errno| {
            anyhow!(
                "no SELinux label on {}: {}",
                path.as_ref().display(),
                std::io::Error::from(errno)
            )
        })?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    bail!("SELinux labels are unsupported on this platform")
}

pub fn set_overlay_opaque<P: AsRef<Path>>(dir: P) -> Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    lsetxattr(dir.as_ref(), REPLACE_DIR_XATTR, b"y", XattrFlags::empty()).map_err(|errno| {
        anyhow!(
            "opaque flag on {}: {}",
            dir.as_ref().display(),
            std::io::Error::from(errno)
        )
    })?;
    Ok(())
}

pub fn get_overlay_opaque<P: AsRef<Path>>(dir: P) -> bool {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    return matches!(
        lgetxattr(dir.as_ref(), REPLACE_DIR_XATTR),
        Ok(value) if value.first() == Some(&b'y')
    );
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    false
}

/// Carry the attributes that matter for serving module content from `src`
/// to `dst` in one listing pass: the SELinux label (rootfs labels are
/// remapped, they never belong on module files) and the overlay-private
/// `trusted.overlay.*` set. Losing the opaque flag would silently turn a
/// replacing directory into a merging one, so only that failure is fatal.
fn propagate_xattrs(src: &Path, dst: &Path) -> Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let Ok(names) = llistxattr(src) else {
            return Ok(());
        };

        for name in names {
            let text = String::from_utf8_lossy(name.as_bytes()).into_owned();
            if text != SELINUX_XATTR && !text.starts_with("trusted.overlay.") {
                continue;
            }
            let Ok(mut value) = lgetxattr(src, &name) else {
                continue;
            };
            if text == SELINUX_XATTR && value.starts_with(CONTEXT_ROOTFS.as_bytes()) {
                value = DEFAULT_SELINUX_CONTEXT.as_bytes().to_vec();
            }

            if let Err(errno) = lsetxattr(dst, &name, &value, XattrFlags::empty()) {
                let err = std::io::Error::from(errno);
                if text == REPLACE_DIR_XATTR {
                    bail!("opaque flag lost copying {}: {err}", dst.display());
                }
                log::debug!("xattr {text} not carried to {}: {err}", dst.display());
            }
        }
    }
    Ok(())
}

/// Can this filesystem hold SELinux labels? Label a scratch file and read
/// the label back; some filesystems accept the write and drop it.
pub fn is_xattr_supported(dir: &Path) -> bool {
    let probe = dir.join(format!(".selinux_probe_{}", std::process::id()));
    if fs::File::create(&probe).is_err() {
        return false;
    }

    let verified = lsetfilecon(&probe, DEFAULT_SELINUX_CONTEXT).is_ok()
        && lgetfilecon(&probe).is_ok_and(|label| label == DEFAULT_SELINUX_CONTEXT);

    let _ = remove_file(&probe);
    verified
}

/// Whether the filesystem under `dir` can answer for `trusted.overlay.*`
/// attributes at all. Asking for the opaque attribute on a directory that
/// does not carry it distinguishes "absent" from "unsupported".
pub fn is_overlay_xattr_supported(dir: &Path) -> bool {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let mut buf = [0u8; 8];
        match rustix::fs::lgetxattr(dir, REPLACE_DIR_XATTR, &mut buf) {
            Err(rustix::io::Errno::OPNOTSUPP) => false,
            Ok(_) | Err(_) => true,
        }
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    true
}

// ---- mountinfo queries ----

pub fn is_mounted<P: AsRef<Path>>(path: P) -> bool {
    let path_str = path.as_ref().to_string_lossy();
    let search = path_str.trim_end_matches('/');

    if let Ok(process) = Process::myself()
        && let Ok(mountinfo) = process.mountinfo()
    {
        return mountinfo
            .into_iter()
            .any(|m| m.mount_point.to_string_lossy() == search);
    }

    if let Ok(content) = fs::read_to_string("/proc/mounts") {
        for line in content.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() > 1 && parts[1] == search {
                return true;
            }
        }
    }
    false
}

// ---- mounts ----

pub fn mount_tmpfs(target: &Path, source: &str) -> Result<()> {
    ensure_dir_exists(target)?;
    let data = CString::new("mode=0755")?;
    mount(source, target, "tmpfs", MountFlags::empty(), Some(data.as_c_str()))
        .context("Failed to mount tmpfs")?;
    Ok(())
}

const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;
const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;

/// Attach `image_path` to a free loop device and mount it as ext4 at
/// `target`. The loop fd is scoped to this call; the device stays attached
/// while the mount lives and the kernel releases it on final unmount.
pub fn mount_ext4_image(image_path: &Path, target: &Path) -> Result<()> {
    ensure_dir_exists(target)?;

    let ctl = File::open("/dev/loop-control").context("Failed to open /dev/loop-control")?;
    let num = unsafe { libc::ioctl(ctl.as_raw_fd(), LOOP_CTL_GET_FREE as _) };
    if num < 0 {
        bail!("LOOP_CTL_GET_FREE failed: {}", std::io::Error::last_os_error());
    }

    let loop_path = PathBuf::from(format!("/dev/loop{num}"));
    let loop_dev = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&loop_path)
        .with_context(|| format!("Failed to open {}", loop_path.display()))?;
    let backing = OpenOptions::new()
        .read(true)
        .write(true)
        .open(image_path)
        .with_context(|| format!("Failed to open {}", image_path.display()))?;

    let ret =
        unsafe { libc::ioctl(loop_dev.as_raw_fd(), LOOP_SET_FD as _, backing.as_raw_fd()) };
    if ret < 0 {
        bail!("LOOP_SET_FD failed: {}", std::io::Error::last_os_error());
    }

    if let Err(e) = mount(&loop_path, target, "ext4", MountFlags::NOATIME, None) {
        // Detach so the device is not left pinned to a dead image
        unsafe { libc::ioctl(loop_dev.as_raw_fd(), LOOP_CLR_FD as _, 0) };
        return Err(e).with_context(|| {
            format!("Failed to mount {} on {}", image_path.display(), target.display())
        });
    }

    Ok(())
}

pub fn repair_image(image_path: &Path) -> Result<()> {
    log::info!("Running e2fsck on {}", image_path.display());
    let status = Command::new("e2fsck")
        .args(["-y", "-f"])
        .arg(image_path)
        .status()
        .context("Failed to execute e2fsck")?;

    // 0 = clean, 1/2 = errors corrected
    if let Some(code) = status.code()
        && code > 2
    {
        bail!("e2fsck failed with exit code: {}", code);
    }
    Ok(())
}

// ---- recursive copy ----

pub fn reflink_or_copy(src: &Path, dest: &Path) -> Result<u64> {
    let src_file = File::open(src)?;
    let dest_file = File::create(dest)?;

    if ioctl_ficlone(&dest_file, &src_file).is_ok() {
        let metadata = src_file.metadata()?;
        let len = metadata.len();
        dest_file.set_permissions(metadata.permissions())?;
        return Ok(len);
    }
    drop(dest_file);
    drop(src_file);
    fs::copy(src, dest).map_err(|e| e.into())
}

pub fn make_device_node(path: &Path, mode: u32, rdev: u64) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_encoded_bytes())?;
    let dev = rdev as libc::dev_t;
    unsafe {
        if libc::mknod(c_path.as_ptr(), mode as libc::mode_t, dev) != 0 {
            let err = std::io::Error::last_os_error();
            bail!("mknod failed for {}: {}", path.display(), err);
        }
    }
    Ok(())
}

fn guess_context_by_path(path: &Path) -> &'static str {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/vendor") || path_str.starts_with("/odm") {
        if path_str.contains("/lib/") || path_str.contains("/lib64/") || path_str.ends_with(".so") {
            return CONTEXT_HAL;
        }
        return CONTEXT_VENDOR;
    }

    DEFAULT_SELINUX_CONTEXT
}

/// Relabel a staged path from its host counterpart. `upperdir`/`workdir`
/// are overlay bookkeeping and inherit the parent's context instead.
/// Always returns Ok so a failed label never aborts a sync.
fn apply_system_context(current: &Path, relative: &Path) -> Result<()> {
    if let Some(name) = current.file_name().and_then(|n| n.to_str())
        && (name == "upperdir" || name == "workdir")
        && let Some(parent) = current.parent()
        && let Ok(ctx) = lgetfilecon(parent)
    {
        let _ = lsetfilecon(current, &ctx);
        return Ok(());
    }

    let current_ctx = lgetfilecon(current).ok();
    if let Some(ctx) = &current_ctx
        && !ctx.is_empty()
        && ctx != CONTEXT_ROOTFS
        && ctx != "u:object_r:unlabeled:s0"
    {
        return Ok(());
    }

    let system_path = Path::new("/").join(relative);
    if system_path.exists() {
        if let Ok(sys_ctx) = lgetfilecon(&system_path) {
            let target_ctx = if sys_ctx == CONTEXT_ROOTFS {
                DEFAULT_SELINUX_CONTEXT
            } else {
                &sys_ctx
            };
            let _ = lsetfilecon(current, target_ctx);
            return Ok(());
        }
    } else if let Some(parent) = system_path.parent()
        && parent.exists()
        && let Ok(parent_ctx) = lgetfilecon(parent)
        && parent_ctx != CONTEXT_ROOTFS
    {
        let guessed = guess_context_by_path(&system_path);
        if guessed == CONTEXT_HAL && parent_ctx == CONTEXT_VENDOR {
            let _ = lsetfilecon(current, CONTEXT_HAL);
        } else {
            let _ = lsetfilecon(current, &parent_ctx);
        }
        return Ok(());
    }

    let target_context = guess_context_by_path(&system_path);
    let _ = lsetfilecon(current, target_context);
    Ok(())
}

fn iterative_sync(src: &Path, dst: &Path, repair: bool) -> Result<()> {
    let mut stack: Vec<(PathBuf, PathBuf, PathBuf)> =
        vec![(src.to_path_buf(), dst.to_path_buf(), PathBuf::new())];

    while let Some((curr_src, curr_dst, rel_path)) = stack.pop() {
        if !curr_dst.exists() {
            if curr_src.is_dir() {
                create_dir_all(&curr_dst)?;
            }
            if let Ok(src_meta) = curr_src.metadata() {
                let _ = fs::set_permissions(&curr_dst, src_meta.permissions());
            }

            if repair {
                let _ = apply_system_context(&curr_dst, &rel_path);
            } else {
                let _ = propagate_xattrs(&curr_src, &curr_dst);
            }
        }

        if curr_src.is_dir() {
            for entry in fs::read_dir(&curr_src)? {
                let entry = entry?;
                let s = entry.path();
                let name = entry.file_name();
                let d = curr_dst.join(&name);
                let next_rel = rel_path.join(&name);

                let metadata = entry.path().symlink_metadata()?;
                let ft = metadata.file_type();

                if ft.is_dir() {
                    stack.push((s, d, next_rel));
                } else {
                    if ft.is_symlink() {
                        if d.exists() {
                            remove_file(&d)?;
                        }
                        symlink(fs::read_link(&s)?, &d)?;
                    } else if ft.is_char_device() || ft.is_block_device() || ft.is_fifo() {
                        if d.exists() {
                            remove_file(&d)?;
                        }
                        make_device_node(&d, metadata.permissions().mode(), metadata.rdev())?;
                    } else {
                        reflink_or_copy(&s, &d)?;
                    }

                    let _ = propagate_xattrs(&s, &d);
                    if repair {
                        let _ = apply_system_context(&d, &next_rel);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Mirror `src` into `dst`, preserving directory modes, symlinks and device
/// nodes. `repair_context` additionally relabels each entry from its host
/// counterpart (used when staging module content).
pub fn sync_dir(src: &Path, dst: &Path, repair_context: bool) -> Result<()> {
    if !src.exists() {
        return Ok(());
    }
    ensure_dir_exists(dst)?;
    iterative_sync(src, dst, repair_context)
        .with_context(|| format!("Failed to sync {} to {}", src.display(), dst.display()))
}

pub fn has_files(path: &Path) -> bool {
    fs::read_dir(path).map(|mut entries| entries.next().is_some()).unwrap_or(false)
}

pub fn has_files_recursive(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    WalkDir::new(path).min_depth(1).into_iter().flatten().any(|entry| {
        let ft = entry.file_type();
        !ft.is_dir()
    })
}

// ---- erofs ----

pub fn is_erofs_supported() -> bool {
    fs::read_to_string("/proc/filesystems")
        .map(|content| content.contains("erofs"))
        .unwrap_or(false)
}

pub fn create_erofs_image(src_dir: &Path, image_path: &Path) -> Result<()> {
    log::info!("Packing EROFS image: {}", image_path.display());

    let output = Command::new("mkfs.erofs")
        .arg("-z")
        .arg("lz4hc")
        .arg("-x")
        .arg("256")
        .arg(image_path)
        .arg(src_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("Failed to execute mkfs.erofs")?;

    let log_lines = |bytes: &[u8]| {
        let s = String::from_utf8_lossy(bytes);
        for line in s.lines() {
            if !line.trim().is_empty() {
                log::debug!("{}", line);
            }
        }
    };
    log_lines(&output.stdout);
    log_lines(&output.stderr);

    if !output.status.success() {
        bail!("Failed to create EROFS image");
    }

    let _ = fs::set_permissions(image_path, fs::Permissions::from_mode(0o644));
    lsetfilecon(image_path, "u:object_r:ksu_file:s0")?;
    Ok(())
}

pub fn mount_erofs_image(image_path: &Path, target: &Path) -> Result<()> {
    ensure_dir_exists(target)?;
    lsetfilecon(image_path, "u:object_r:ksu_file:s0").ok();
    let status = Command::new("mount")
        .args(["-t", "erofs", "-o", "loop,ro,nodev,noatime"])
        .arg(image_path)
        .arg(target)
        .status()
        .context("Failed to execute mount command for EROFS")?;

    if !status.success() {
        bail!("EROFS mount command failed");
    }
    Ok(())
}

// ---- temp dirs ----

pub fn select_temp_dir() -> Result<PathBuf> {
    let run_dir = Path::new(RUN_DIR);
    ensure_dir_exists(run_dir)?;
    Ok(run_dir.join("workdir"))
}

pub fn ensure_temp_dir(temp_dir: &Path) -> Result<()> {
    if temp_dir.exists() {
        remove_dir_all(temp_dir).ok();
    }
    create_dir_all(temp_dir)?;
    Ok(())
}

pub fn cleanup_temp_dir(temp_dir: &Path) {
    if temp_dir.exists()
        && let Err(e) = remove_dir_all(temp_dir)
    {
        log::warn!("Failed to clean up temp dir {}: {:#}", temp_dir.display(), e);
    }
}

pub fn extract_module_id(path: &Path) -> Option<String> {
    let mut current = path;
    loop {
        if current.join("module.prop").exists() {
            return current.file_name().map(|s| s.to_string_lossy().to_string());
        }
        match current.parent() {
            Some(p) => current = p,
            None => break,
        }
    }

    path.parent()
        .and_then(|p| p.file_name())
        .map(|s| s.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_id_validation() {
        assert!(validate_module_id("a01").is_ok());
        assert!(validate_module_id("font.mod-v2_final").is_ok());
        assert!(validate_module_id("1leading").is_err());
        assert!(validate_module_id("sp ace").is_err());
        assert!(validate_module_id("").is_err());
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state.json");

        atomic_write(&target, b"first").unwrap();
        atomic_write(&target, b"second").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"second");

        // No stray temp files left behind
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".hymo_tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn sync_dir_copies_tree_and_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");

        fs::create_dir_all(src.join("system/bin")).unwrap();
        fs::write(src.join("system/bin/tool"), b"#!/bin/sh\n").unwrap();
        symlink("tool", src.join("system/bin/alias")).unwrap();

        sync_dir(&src, &dst, false).unwrap();

        assert_eq!(fs::read(dst.join("system/bin/tool")).unwrap(), b"#!/bin/sh\n");
        let link = dst.join("system/bin/alias");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(link).unwrap(), PathBuf::from("tool"));
    }

    #[test]
    fn has_files_recursive_sees_nested_entries() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("part");
        fs::create_dir_all(root.join("only/dirs")).unwrap();
        assert!(!has_files_recursive(&root));

        fs::write(root.join("only/dirs/f"), b"x").unwrap();
        assert!(has_files_recursive(&root));
    }

    #[test]
    fn extract_module_id_walks_to_prop() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("mymod");
        fs::create_dir_all(module.join("system/etc")).unwrap();
        fs::write(module.join("module.prop"), b"id=mymod\n").unwrap();

        assert_eq!(
            extract_module_id(&module.join("system/etc")).as_deref(),
            Some("mymod")
        );
    }
}
