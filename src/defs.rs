// Copyright 2026 Hymo Daemon Authors
// SPDX-License-Identifier: GPL-3.0-or-later

// Installation layout

pub const BASE_DIR: &str = "/data/adb/hymo/";
pub const RUN_DIR: &str = "/data/adb/hymo/run/";
pub const STATE_FILE: &str = "/data/adb/hymo/run/daemon_state.json";
pub const HOT_UNMOUNT_DIR: &str = "/data/adb/hymo/run/hot_unmounted/";
pub const DAEMON_LOG_FILE: &str = "/data/adb/hymo/daemon.log";

// Default staging mount point when no mirror path is configured
pub const FALLBACK_CONTENT_DIR: &str = "/data/adb/hymo/img_mnt/";

// Default module source tree
pub const MODULE_DIR: &str = "/data/adb/modules/";

// The daemon's own module metadata, rewritten with run statistics
pub const MODULE_PROP_FILE: &str = "/data/adb/modules/hymo/module.prop";

// Mirror base: per-target overlay mirrors and the HymoFS staging root
pub const HYMO_MIRROR_DEV: &str = "/dev/hymo_mirror";

// Optional per-partition upperdir/workdir roots for writable overlays
pub const SYSTEM_RW_DIR: &str = "/data/adb/hymo/rw";

// Module marker files
pub const DISABLE_FILE_NAME: &str = "disable";
pub const REMOVE_FILE_NAME: &str = "remove";
pub const SKIP_MOUNT_FILE_NAME: &str = "skip_mount";
pub const REPLACE_DIR_FILE_NAME: &str = ".replace";

// Per-module rule override file, inside the module root
pub const MODULE_RULES_FILE_NAME: &str = "hymo_rules.conf";

// OverlayFS source name shown in /proc/mounts
pub const OVERLAY_SOURCE: &str = "KSU";

// Standard partitions every scan considers
pub const BUILTIN_PARTITIONS: &[&str] =
    &["system", "vendor", "product", "system_ext", "odm", "oem"];

// xattr names
pub const SELINUX_XATTR: &str = "security.selinux";
pub const REPLACE_DIR_XATTR: &str = "trusted.overlay.opaque";
pub const DEFAULT_SELINUX_CONTEXT: &str = "u:object_r:system_file:s0";
