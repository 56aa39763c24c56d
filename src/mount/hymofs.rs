// Copyright 2026 Hymo Daemon Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Client for the HymoFS kernel peer.
//!
//! The peer serves per-file redirection, hide and merge rules. A process
//! acquires one communication fd through a magic `reboot` call and then
//! drives the versioned ioctl command set on it. The fd and the probed
//! status live for the process lifetime.

use std::{
    ffi::CString,
    os::unix::ffi::OsStrExt,
    path::Path,
    sync::OnceLock,
};

use anyhow::{Context, Result, bail};
use walkdir::WalkDir;

pub const EXPECTED_PROTOCOL_VERSION: i32 = 10;

const HYMO_MAGIC1: libc::c_long = 0x48594D4F; // "HYMO"
const HYMO_MAGIC2: libc::c_long = 0x524F4F54; // "ROOT"
const HYMO_CMD_GET_FD: libc::c_long = 0x48000;

// ioctl number encoding, magic byte 'H'
const IOC_MAGIC: u32 = b'H' as u32;
const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;
const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;
const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, nr: u32, size: usize) -> libc::c_ulong {
    ((dir << IOC_DIRSHIFT)
        | (IOC_MAGIC << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)) as libc::c_ulong
}

#[repr(C)]
struct HymoRuleArg {
    src: *const libc::c_char,
    target: *const libc::c_char,
    kind: libc::c_int,
}

#[repr(C)]
struct HymoListArg {
    buf: *mut libc::c_char,
    size: libc::size_t,
}

#[repr(C)]
struct HymoUnameArg {
    release: [u8; 65],
    version: [u8; 65],
}

const IOC_ADD_RULE: libc::c_ulong = ioc(IOC_WRITE, 1, size_of::<HymoRuleArg>());
const IOC_DEL_RULE: libc::c_ulong = ioc(IOC_WRITE, 2, size_of::<HymoRuleArg>());
const IOC_HIDE_RULE: libc::c_ulong = ioc(IOC_WRITE, 3, size_of::<HymoRuleArg>());
const IOC_CLEAR_ALL: libc::c_ulong = ioc(IOC_NONE, 5, 0);
const IOC_GET_VERSION: libc::c_ulong = ioc(IOC_READ, 6, size_of::<libc::c_int>());
const IOC_LIST_RULES: libc::c_ulong =
    ioc(IOC_READ | IOC_WRITE, 7, size_of::<HymoListArg>());
const IOC_SET_DEBUG: libc::c_ulong = ioc(IOC_WRITE, 8, size_of::<libc::c_int>());
const IOC_REORDER_MNT_ID: libc::c_ulong = ioc(IOC_NONE, 9, 0);
const IOC_SET_STEALTH: libc::c_ulong = ioc(IOC_WRITE, 10, size_of::<libc::c_int>());
const IOC_HIDE_OVERLAY_XATTRS: libc::c_ulong =
    ioc(IOC_WRITE, 11, size_of::<HymoRuleArg>());
const IOC_ADD_MERGE_RULE: libc::c_ulong = ioc(IOC_WRITE, 12, size_of::<HymoRuleArg>());
const IOC_SET_AVC_LOG_SPOOFING: libc::c_ulong =
    ioc(IOC_WRITE, 13, size_of::<libc::c_int>());
const IOC_SET_MIRROR_PATH: libc::c_ulong = ioc(IOC_WRITE, 14, size_of::<HymoRuleArg>());
const IOC_SET_UNAME: libc::c_ulong = ioc(IOC_WRITE, 15, size_of::<HymoUnameArg>());
const IOC_SET_ENABLED: libc::c_ulong = ioc(IOC_WRITE, 16, size_of::<libc::c_int>());

/// Directory-entry type codes used as rule kinds on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RuleKind {
    Unknown = 0,
    Fifo = 1,
    Chr = 2,
    Dir = 4,
    Blk = 6,
    Reg = 8,
    Lnk = 10,
    Sock = 12,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HymoFsStatus {
    Available,
    NotPresent,
    KernelTooOld,
    ModuleTooOld,
}

static PEER_FD: OnceLock<i32> = OnceLock::new();
static STATUS: OnceLock<HymoFsStatus> = OnceLock::new();

fn peer_fd() -> i32 {
    *PEER_FD.get_or_init(|| {
        let mut fd: i32 = -1;
        let ret = unsafe {
            libc::syscall(
                libc::SYS_reboot,
                HYMO_MAGIC1,
                HYMO_MAGIC2,
                HYMO_CMD_GET_FD,
                &mut fd as *mut i32,
            )
        };
        if ret < 0 || fd < 0 {
            log::debug!(
                "HymoFS: handle acquire failed: {}",
                std::io::Error::last_os_error()
            );
            -1
        } else {
            fd
        }
    })
}

fn path_cstr(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).context("Path contains NUL byte")
}

fn do_ioctl<T>(request: libc::c_ulong, arg: *mut T, what: &str) -> Result<()> {
    let fd = peer_fd();
    if fd < 0 {
        bail!("HymoFS not present");
    }
    let ret = unsafe { libc::ioctl(fd, request as _, arg) };
    if ret != 0 {
        bail!("HymoFS {what} failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

pub fn get_protocol_version() -> Result<i32> {
    let mut version: libc::c_int = 0;
    do_ioctl(IOC_GET_VERSION, &mut version, "get_version")?;
    Ok(version)
}

pub(crate) fn status_from_version(version: i32) -> HymoFsStatus {
    if version < EXPECTED_PROTOCOL_VERSION {
        HymoFsStatus::KernelTooOld
    } else if version > EXPECTED_PROTOCOL_VERSION {
        HymoFsStatus::ModuleTooOld
    } else {
        HymoFsStatus::Available
    }
}

/// Probe and cache the peer status for the process lifetime.
pub fn check_status() -> HymoFsStatus {
    *STATUS.get_or_init(|| match get_protocol_version() {
        Err(_) => {
            log::warn!("HymoFS status: NotPresent");
            HymoFsStatus::NotPresent
        }
        Ok(version) => {
            let status = status_from_version(version);
            log::info!("HymoFS status: {status:?} (version {version})");
            status
        }
    })
}

pub fn is_available() -> bool {
    check_status() == HymoFsStatus::Available
}

pub fn clear_rules() -> Result<()> {
    do_ioctl::<libc::c_void>(IOC_CLEAR_ALL, std::ptr::null_mut(), "clear_rules")
}

/// Redirect reads of `target` to the staged file `src`.
pub fn add_rule(src: &Path, target: &Path, kind: RuleKind) -> Result<()> {
    let c_src = path_cstr(src)?;
    let c_target = path_cstr(target)?;
    let mut arg = HymoRuleArg {
        src: c_src.as_ptr(),
        target: c_target.as_ptr(),
        kind: kind as libc::c_int,
    };
    log::debug!(
        "HymoFS: add rule {} -> {} ({kind:?})",
        target.display(),
        src.display()
    );
    do_ioctl(IOC_ADD_RULE, &mut arg, "add_rule")
}

/// Merge the children of the staged directory `target` into the host
/// directory `src`; the peer resolves children itself.
pub fn add_merge_rule(src: &Path, target: &Path) -> Result<()> {
    let c_src = path_cstr(src)?;
    let c_target = path_cstr(target)?;
    let mut arg = HymoRuleArg {
        src: c_src.as_ptr(),
        target: c_target.as_ptr(),
        kind: 0,
    };
    log::debug!("HymoFS: merge {} <- {}", src.display(), target.display());
    do_ioctl(IOC_ADD_MERGE_RULE, &mut arg, "add_merge_rule")
}

/// Deletion is keyed by the redirected (virtual) path.
pub fn delete_rule(target: &Path) -> Result<()> {
    let c_target = path_cstr(target)?;
    let mut arg = HymoRuleArg {
        src: c_target.as_ptr(),
        target: std::ptr::null(),
        kind: 0,
    };
    log::debug!("HymoFS: delete rule {}", target.display());
    do_ioctl(IOC_DEL_RULE, &mut arg, "delete_rule")
}

pub fn hide_path(target: &Path) -> Result<()> {
    let c_target = path_cstr(target)?;
    let mut arg = HymoRuleArg {
        src: c_target.as_ptr(),
        target: std::ptr::null(),
        kind: 0,
    };
    log::debug!("HymoFS: hide {}", target.display());
    do_ioctl(IOC_HIDE_RULE, &mut arg, "hide_path")
}

/// Strip overlay private xattrs from userspace views of `target`.
pub fn hide_overlay_xattrs(target: &Path) -> Result<()> {
    let c_target = path_cstr(target)?;
    let mut arg = HymoRuleArg {
        src: c_target.as_ptr(),
        target: std::ptr::null(),
        kind: 0,
    };
    do_ioctl(IOC_HIDE_OVERLAY_XATTRS, &mut arg, "hide_overlay_xattrs")
}

pub fn set_mirror_path(path: &Path) -> Result<()> {
    let c_path = path_cstr(path)?;
    let mut arg = HymoRuleArg {
        src: c_path.as_ptr(),
        target: std::ptr::null(),
        kind: 0,
    };
    do_ioctl(IOC_SET_MIRROR_PATH, &mut arg, "set_mirror_path")
}

fn set_flag(request: libc::c_ulong, enable: bool, what: &str) -> Result<()> {
    let mut value: libc::c_int = if enable { 1 } else { 0 };
    do_ioctl(request, &mut value, what)
}

pub fn set_debug(enable: bool) -> Result<()> {
    set_flag(IOC_SET_DEBUG, enable, "set_debug")
}

pub fn set_stealth(enable: bool) -> Result<()> {
    set_flag(IOC_SET_STEALTH, enable, "set_stealth")
}

pub fn set_enabled(enable: bool) -> Result<()> {
    set_flag(IOC_SET_ENABLED, enable, "set_enabled")
}

pub fn set_avc_log_spoofing(enable: bool) -> Result<()> {
    set_flag(IOC_SET_AVC_LOG_SPOOFING, enable, "set_avc_log_spoofing")
}

fn fill_uname_field(field: &mut [u8; 65], value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(field.len() - 1);
    field[..len].copy_from_slice(&bytes[..len]);
}

pub fn set_uname(release: &str, version: &str) -> Result<()> {
    let mut arg = HymoUnameArg {
        release: [0u8; 65],
        version: [0u8; 65],
    };
    fill_uname_field(&mut arg.release, release);
    fill_uname_field(&mut arg.version, version);
    do_ioctl(IOC_SET_UNAME, &mut arg, "set_uname")
}

/// Reorder mount ids so injected mounts do not stand out in mountinfo.
pub fn fix_mounts() -> Result<()> {
    do_ioctl::<libc::c_void>(IOC_REORDER_MNT_ID, std::ptr::null_mut(), "reorder_mnt_id")
}

/// Newline separated rule listing; lines start with a type keyword
/// (ADD, MERGE, HIDE, ...).
pub fn get_active_rules() -> Result<String> {
    let mut buf = vec![0u8; 128 * 1024];
    let mut arg = HymoListArg {
        buf: buf.as_mut_ptr() as *mut libc::c_char,
        size: buf.len(),
    };
    do_ioctl(IOC_LIST_RULES, &mut arg, "list_rules")?;

    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).to_string())
}

/// Walk one module partition tree and install an add rule per file or
/// symlink and a hide rule per whiteout, targeting `target_base`.
pub fn add_rules_from_directory(target_base: &Path, module_dir: &Path) -> Result<bool> {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    if !module_dir.is_dir() {
        return Ok(false);
    }

    let mut any = false;
    for entry in WalkDir::new(module_dir).min_depth(1).into_iter().flatten() {
        let rel = match entry.path().strip_prefix(module_dir) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let target = target_base.join(rel);
        let file_type = entry.file_type();

        if file_type.is_file() || file_type.is_symlink() {
            let kind = if file_type.is_symlink() {
                RuleKind::Lnk
            } else {
                RuleKind::Reg
            };
            if add_rule(entry.path(), &target, kind).is_ok() {
                any = true;
            }
        } else if file_type.is_char_device()
            && let Ok(metadata) = entry.path().symlink_metadata()
            && metadata.rdev() == 0
            && hide_path(&target).is_ok()
        {
            any = true;
        }
    }
    Ok(any)
}

/// Inverse of [`add_rules_from_directory`].
pub fn remove_rules_from_directory(target_base: &Path, module_dir: &Path) -> Result<bool> {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    if !module_dir.is_dir() {
        return Ok(false);
    }

    let mut any = false;
    for entry in WalkDir::new(module_dir).min_depth(1).into_iter().flatten() {
        let rel = match entry.path().strip_prefix(module_dir) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let target = target_base.join(rel);
        let file_type = entry.file_type();

        let matches = file_type.is_file()
            || file_type.is_symlink()
            || (file_type.is_char_device()
                && entry
                    .path()
                    .symlink_metadata()
                    .map(|m| m.rdev() == 0)
                    .unwrap_or(false));

        if matches && delete_rule(&target).is_ok() {
            any = true;
        }
    }
    Ok(any)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_structs_have_expected_layout() {
        assert_eq!(size_of::<HymoRuleArg>(), 2 * size_of::<usize>() + 8);
        assert_eq!(size_of::<HymoListArg>(), 2 * size_of::<usize>());
        assert_eq!(size_of::<HymoUnameArg>(), 130);
    }

    #[test]
    fn ioctl_numbers_encode_magic_and_ordinal() {
        // type byte 'H' and the nr live in the low 16 bits
        assert_eq!(IOC_CLEAR_ALL & 0xFFFF, (0x48 << 8) | 5);
        assert_eq!(IOC_GET_VERSION & 0xFFFF, (0x48 << 8) | 6);
        assert_eq!(IOC_ADD_RULE & 0xFFFF, (0x48 << 8) | 1);

        // directions
        assert_eq!(IOC_CLEAR_ALL >> 30, IOC_NONE as libc::c_ulong);
        assert_eq!(IOC_ADD_RULE >> 30, IOC_WRITE as libc::c_ulong);
        assert_eq!(IOC_GET_VERSION >> 30, IOC_READ as libc::c_ulong);
        assert_eq!(
            IOC_LIST_RULES >> 30,
            (IOC_READ | IOC_WRITE) as libc::c_ulong
        );

        // payload size field
        assert_eq!(
            (IOC_GET_VERSION >> 16) & 0x3FFF,
            size_of::<libc::c_int>() as libc::c_ulong
        );
    }

    #[test]
    fn status_mapping_matches_version_comparison() {
        assert_eq!(
            status_from_version(EXPECTED_PROTOCOL_VERSION),
            HymoFsStatus::Available
        );
        assert_eq!(
            status_from_version(EXPECTED_PROTOCOL_VERSION - 1),
            HymoFsStatus::KernelTooOld
        );
        assert_eq!(
            status_from_version(EXPECTED_PROTOCOL_VERSION + 3),
            HymoFsStatus::ModuleTooOld
        );
    }

    #[test]
    fn uname_fields_truncate_and_terminate() {
        let mut field = [0u8; 65];
        fill_uname_field(&mut field, &"x".repeat(100));
        assert_eq!(field[63], b'x');
        assert_eq!(field[64], 0);

        let mut short = [0u8; 65];
        fill_uname_field(&mut short, "5.15.0");
        assert_eq!(&short[..7], b"5.15.0\0");
    }
}
