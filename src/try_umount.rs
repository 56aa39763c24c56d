// Copyright 2026 Hymo Daemon Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! KSU companion ioctls: register mounts for namespace try-umount and nuke
//! the ext4 sysfs traces of the backing image.

use std::{
    collections::HashSet,
    ffi::CString,
    path::Path,
    sync::{Mutex, OnceLock},
};

use anyhow::{Result, bail};

const KSU_INSTALL_MAGIC1: libc::c_long = 0xDEADBEEF_u32 as libc::c_long;
const KSU_INSTALL_MAGIC2: libc::c_long = 0xCAFEBABE_u32 as libc::c_long;
const KSU_IOCTL_NUKE_EXT4_SYSFS: libc::c_ulong = 0x40004b11;
const KSU_IOCTL_ADD_TRY_UMOUNT: libc::c_ulong = 0x40004b12;

#[repr(C)]
struct KsuAddTryUmount {
    arg: u64,
    flags: u32,
    mode: u8,
}

#[repr(C)]
struct NukeExt4SysfsCmd {
    arg: u64,
}

static KSU_FD: OnceLock<i32> = OnceLock::new();

fn grab_ksu_fd() -> i32 {
    *KSU_FD.get_or_init(|| {
        let mut fd: i32 = -1;
        unsafe {
            libc::syscall(
                libc::SYS_reboot,
                KSU_INSTALL_MAGIC1,
                KSU_INSTALL_MAGIC2,
                0,
                &mut fd as *mut i32,
            );
        }
        fd
    })
}

fn sent_paths() -> &'static Mutex<HashSet<String>> {
    static SENT: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    SENT.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Register `target` so the KSU driver detaches it from denied namespaces.
/// Repeat registrations for the same path are dropped client-side.
pub fn send_umountable<P: AsRef<Path>>(target: P) -> Result<()> {
    let path_str = target.as_ref().to_string_lossy().to_string();
    if path_str.is_empty() {
        return Ok(());
    }

    {
        let sent = sent_paths().lock().expect("try_umount set poisoned");
        if sent.contains(&path_str) {
            return Ok(());
        }
    }

    let fd = grab_ksu_fd();
    if fd < 0 {
        bail!("KSU driver not available");
    }

    let c_path = CString::new(path_str.clone())?;
    let cmd = KsuAddTryUmount {
        arg: c_path.as_ptr() as u64,
        flags: 2,
        mode: 1,
    };

    let ret = unsafe { libc::ioctl(fd, KSU_IOCTL_ADD_TRY_UMOUNT as _, &cmd) };
    if ret != 0 {
        bail!(
            "ADD_TRY_UMOUNT failed for {}: {}",
            path_str,
            std::io::Error::last_os_error()
        );
    }

    sent_paths()
        .lock()
        .expect("try_umount set poisoned")
        .insert(path_str);
    Ok(())
}

/// Ask the KSU driver to unregister the ext4 sysfs entry of the loop-backed
/// image mounted at `target`, removing the `/sys/fs/ext4/loopN` trace.
pub fn ksu_nuke_sysfs(target: &str) -> Result<()> {
    let fd = grab_ksu_fd();
    if fd < 0 {
        bail!("KSU driver not available");
    }

    let c_path = CString::new(target)?;
    let cmd = NukeExt4SysfsCmd {
        arg: c_path.as_ptr() as u64,
    };

    let ret = unsafe { libc::ioctl(fd, KSU_IOCTL_NUKE_EXT4_SYSFS as _, &cmd) };
    if ret != 0 {
        bail!("NUKE_EXT4_SYSFS failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}
