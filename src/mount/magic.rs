// Copyright 2026 Hymo Daemon Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Magic mount: synthesize a tmpfs-backed union of the module trees and move
//! it over the host partitions, importing everything the modules do not
//! touch.
//!
//! Terminology: `real` is the live host path, `shadow` the same path inside
//! the tmpfs workspace. A directory whose children cannot be expressed on
//! the read-only host tree gets a "view": its shadow is populated, sealed
//! read-only and swapped over the real directory with move_mount.

use std::{
    fs::{self, DirEntry, create_dir, create_dir_all, read_link},
    os::unix::fs::{MetadataExt, symlink},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, bail};
use rustix::{
    fs::{Gid, Mode, Uid, chmod, chown},
    mount::{
        MountFlags, MountPropagationFlags, UnmountFlags, mount, mount_bind, mount_change,
        mount_move, mount_remount, unmount,
    },
};

use crate::{
    defs::{DISABLE_FILE_NAME, REMOVE_FILE_NAME, SKIP_MOUNT_FILE_NAME},
    mount::node::{Node, NodeFileType},
    try_umount::send_umountable,
    utils::{ensure_dir_exists, lgetfilecon, lsetfilecon},
};

// Partitions that live under /system on single-partition devices but may be
// real root mounts; these three appear as /system/<p> symlinks when split
const SYSTEM_ALIASED: [&str; 3] = ["vendor", "system_ext", "product"];

fn mount_disabled(module: &Path) -> bool {
    [DISABLE_FILE_NAME, REMOVE_FILE_NAME, SKIP_MOUNT_FILE_NAME]
        .iter()
        .any(|marker| module.join(marker).exists())
}

/// Move a partition node from under the synthetic system tree to the root
/// when the host really mounts it at /.
fn hoist_partition(system: &mut Node, root: &mut Node, name: &str, require_alias: bool) {
    if !Path::new("/").join(name).is_dir() {
        return;
    }
    if require_alias && !Path::new("/system").join(name).is_symlink() {
        return;
    }
    if let Some(node) = system.children.remove(name) {
        root.children.insert(name.to_string(), node);
    }
}

fn build_mount_tree(
    module_paths: &[PathBuf],
    extra_partitions: &[String],
) -> Result<Option<Node>> {
    let mut root = Node::new_root("");
    let mut system = Node::new_root("system");
    let mut collected = false;

    for module in module_paths {
        if mount_disabled(module) {
            continue;
        }

        let mod_system = module.join("system");
        if mod_system.is_dir() {
            collected |= system.collect_module_files(&mod_system)?;
        }

        for part in SYSTEM_ALIASED.iter().copied().chain(["odm"]) {
            let mod_part = module.join(part);
            if !mod_part.is_dir() {
                continue;
            }
            let slot = system
                .children
                .entry(part.to_string())
                .or_insert_with(|| Node::new_root(part));
            // A module may have shipped /system/<p> as a symlink; partition
            // content flattens the slot back into a directory
            if slot.file_type == NodeFileType::Symlink {
                slot.file_type = NodeFileType::Directory;
                slot.module_path = None;
            }
            collected |= slot.collect_module_files(&mod_part)?;
        }

        for part in extra_partitions {
            if part == "system" || part == "odm" || SYSTEM_ALIASED.contains(&part.as_str()) {
                continue;
            }
            let mod_part = module.join(part);
            if Path::new("/").join(part).is_dir() && mod_part.is_dir() {
                let slot = root
                    .children
                    .entry(part.clone())
                    .or_insert_with(|| Node::new_root(part));
                collected |= slot.collect_module_files(&mod_part)?;
            }
        }
    }

    if !collected {
        return Ok(None);
    }

    for part in SYSTEM_ALIASED {
        hoist_partition(&mut system, &mut root, part, true);
    }
    hoist_partition(&mut system, &mut root, "odm", false);

    root.children.insert("system".to_string(), system);
    Ok(Some(root))
}

fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = read_link(src)?;
    symlink(&target, dst)?;
    if let Ok(label) = lgetfilecon(src) {
        let _ = lsetfilecon(dst, &label);
    }
    Ok(())
}

struct TreeMounter {
    register_umount: bool,
    bound_files: u32,
    placed_symlinks: u32,
}

impl TreeMounter {
    fn new(register_umount: bool) -> Self {
        Self {
            register_umount,
            bound_files: 0,
            placed_symlinks: 0,
        }
    }

    fn mount_node(&mut self, node: Node, real: &Path, shadow: &Path, building: bool) -> Result<()> {
        match node.file_type {
            NodeFileType::Whiteout => {
                // The enclosing view simply does not contain the entry
                log::debug!("{} withheld by whiteout", real.display());
                Ok(())
            }
            NodeFileType::RegularFile => self.place_file(&node, real, shadow, building),
            NodeFileType::Symlink => self.place_symlink(&node, real, shadow, building),
            NodeFileType::Directory => self.assemble_directory(node, real, shadow, building),
        }
    }

    fn place_file(
        &mut self,
        node: &Node,
        real: &Path,
        shadow: &Path,
        building: bool,
    ) -> Result<()> {
        let source = node
            .module_path
            .as_ref()
            .ok_or_else(|| anyhow!("no module source behind file {}", real.display()))?;

        let anchor: &Path = if building {
            if !shadow.exists() {
                fs::File::create(shadow)?;
            }
            shadow
        } else {
            real
        };

        mount_bind(source, anchor)
            .with_context(|| format!("bind {} over {}", source.display(), anchor.display()))?;
        if self.register_umount {
            let _ = send_umountable(anchor);
        }
        if let Err(e) = mount_remount(anchor, MountFlags::RDONLY | MountFlags::BIND, "") {
            log::warn!("read-only remount of {} failed: {e:#?}", anchor.display());
        }

        self.bound_files += 1;
        Ok(())
    }

    fn place_symlink(
        &mut self,
        node: &Node,
        real: &Path,
        shadow: &Path,
        building: bool,
    ) -> Result<()> {
        let source = node
            .module_path
            .as_ref()
            .ok_or_else(|| anyhow!("no module source behind symlink {}", real.display()))?;
        if !building {
            // view_required() forces a view for symlink children
            bail!("symlink {} cannot exist outside a view", real.display());
        }

        copy_symlink(source, shadow)
            .with_context(|| format!("recreate symlink {}", real.display()))?;
        self.placed_symlinks += 1;
        Ok(())
    }

    /// Does this directory need a tmpfs view? Anything the host tree cannot
    /// express forces one: symlinks, effective whiteouts, type changes and
    /// entries the host does not have. Children that would need a view where
    /// none can be anchored are dropped instead.
    fn view_required(&self, node: &mut Node, real: &Path) -> bool {
        if node.replace && node.module_path.is_some() {
            return true;
        }

        for (name, child) in &mut node.children {
            let host = real.join(name);
            let mismatch = match child.file_type {
                NodeFileType::Symlink => true,
                NodeFileType::Whiteout => host.exists(),
                NodeFileType::RegularFile | NodeFileType::Directory => {
                    match host.symlink_metadata() {
                        Ok(meta) => {
                            NodeFileType::from_file_type(meta.file_type())
                                != Some(child.file_type)
                        }
                        Err(_) => true, // entry is new on the host
                    }
                }
            };
            if !mismatch {
                continue;
            }

            if node.module_path.is_none() && !real.exists() {
                log::error!("no anchor for a view at {}, dropping {name}", real.display());
                child.skip = true;
                continue;
            }
            return true;
        }

        false
    }

    /// Create the shadow directory and clone mode, owner and label from the
    /// host directory, or from the module copy when the host has none.
    fn prepare_shadow_dir(&self, node: &Node, real: &Path, shadow: &Path) -> Result<()> {
        create_dir_all(shadow)?;

        let reference = if real.exists() {
            real.to_path_buf()
        } else if let Some(module_path) = &node.module_path {
            module_path.clone()
        } else {
            bail!("directory {} exists nowhere", real.display());
        };

        let meta = reference.metadata()?;
        chmod(shadow, Mode::from_raw_mode(meta.mode()))?;
        chown(
            shadow,
            Some(Uid::from_raw(meta.uid())),
            Some(Gid::from_raw(meta.gid())),
        )?;
        if let Ok(label) = lgetfilecon(&reference) {
            let _ = lsetfilecon(shadow, &label);
        }
        Ok(())
    }

    fn assemble_directory(
        &mut self,
        mut node: Node,
        real: &Path,
        shadow: &Path,
        building: bool,
    ) -> Result<()> {
        let starts_view = !building && self.view_required(&mut node, real);
        let building = building || starts_view;

        if node.replace && node.module_path.is_none() {
            bail!("replace-marked {} has no module backing", real.display());
        }

        if building {
            self.prepare_shadow_dir(&node, real, shadow)?;
        }
        if starts_view {
            // the later move_mount needs a mount point as its source
            mount_bind(shadow, shadow)
                .with_context(|| format!("anchor view for {}", real.display()))?;
        }

        // Host entries first: module children land over their host
        // counterparts, the untouched remainder is imported into the view
        if real.is_dir() && !node.replace {
            for entry in real.read_dir()?.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                match node.children.remove(&name) {
                    Some(child) => self.descend(child, real, shadow, building, &name)?,
                    None if building => {
                        self.import_host_entry(real, shadow, &entry)
                            .with_context(|| format!("import {}/{name}", real.display()))?;
                    }
                    None => {}
                }
            }
        }

        for (name, child) in std::mem::take(&mut node.children) {
            self.descend(child, real, shadow, building, &name)?;
        }

        if starts_view {
            self.seal_and_swap(real, shadow)?;
        }
        Ok(())
    }

    /// Recurse into one child. Failures inside a view are fatal (a half
    /// built view must never be committed); outside they only cost the one
    /// entry.
    fn descend(
        &mut self,
        child: Node,
        real: &Path,
        shadow: &Path,
        building: bool,
        name: &str,
    ) -> Result<()> {
        if child.skip {
            return Ok(());
        }
        let outcome = self
            .mount_node(child, &real.join(name), &shadow.join(name), building)
            .with_context(|| format!("assemble {}/{name}", real.display()));
        match outcome {
            Err(e) if building => Err(e),
            Err(e) => {
                log::error!("skipping {}/{name}: {e:#}", real.display());
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// Re-create one untouched host entry inside the view: files are bound,
    /// directories recreated and filled recursively, symlinks copied.
    fn import_host_entry(
        &mut self,
        real_parent: &Path,
        shadow_parent: &Path,
        entry: &DirEntry,
    ) -> Result<()> {
        let real = real_parent.join(entry.file_name());
        let shadow = shadow_parent.join(entry.file_name());
        let kind = entry.file_type()?;

        if kind.is_symlink() {
            copy_symlink(&real, &shadow)?;
        } else if kind.is_file() {
            fs::File::create(&shadow)?;
            mount_bind(&real, &shadow)?;
            if let Ok(label) = lgetfilecon(&real) {
                let _ = lsetfilecon(&shadow, &label);
            }
        } else if kind.is_dir() {
            create_dir(&shadow)?;
            let meta = entry.metadata()?;
            chmod(&shadow, Mode::from_raw_mode(meta.mode()))?;
            chown(
                &shadow,
                Some(Uid::from_raw(meta.uid())),
                Some(Gid::from_raw(meta.gid())),
            )?;
            if let Ok(label) = lgetfilecon(&real) {
                let _ = lsetfilecon(&shadow, &label);
            }
            for sub in real.read_dir()?.flatten() {
                self.import_host_entry(&real, &shadow, &sub)?;
            }
        } else {
            log::debug!("not importing special host entry {}", real.display());
        }

        Ok(())
    }

    /// Seal a finished view read-only and swap it over the real directory.
    fn seal_and_swap(&self, real: &Path, shadow: &Path) -> Result<()> {
        if let Err(e) = mount_remount(shadow, MountFlags::RDONLY | MountFlags::BIND, "") {
            log::warn!("read-only remount of view {} failed: {e:#?}", shadow.display());
        }

        mount_move(shadow, real)
            .with_context(|| format!("swap view into {}", real.display()))?;

        if let Err(e) = mount_change(real, MountPropagationFlags::PRIVATE) {
            log::warn!("could not make {} private: {e:#?}", real.display());
        }
        if self.register_umount {
            let _ = send_umountable(real);
        }
        Ok(())
    }
}

/// Build the synthetic tree for the queued module roots and materialize it
/// over `/`. The tmpfs workspace only lives for the duration of the call.
pub fn mount_partitions(
    tmp_path: &Path,
    module_paths: &[PathBuf],
    mount_source: &str,
    extra_partitions: &[String],
    disable_umount: bool,
) -> Result<()> {
    let Some(tree) = build_mount_tree(module_paths, extra_partitions)? else {
        log::info!("no modules to magic mount, skipping!");
        return Ok(());
    };

    log::debug!("magic mount tree:\n{tree:?}");

    let workdir = tmp_path.join("workdir");
    ensure_dir_exists(&workdir)?;

    mount(mount_source, &workdir, "tmpfs", MountFlags::empty(), None)
        .context("workspace tmpfs")?;
    mount_change(&workdir, MountPropagationFlags::PRIVATE)
        .context("workspace propagation")?;

    let mut mounter = TreeMounter::new(!disable_umount);
    let outcome = mounter.mount_node(tree, Path::new("/"), &workdir, false);

    if let Err(e) = unmount(&workdir, UnmountFlags::DETACH) {
        log::error!("failed to detach workspace: {e}");
    }
    let _ = fs::remove_dir(&workdir);

    log::info!(
        "magic mount placed {} files and {} symlinks",
        mounter.bound_files,
        mounter.placed_symlinks
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_queue_builds_no_tree() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("m1");
        fs::create_dir_all(module.join("system")).unwrap();

        let tree = build_mount_tree(&[module], &[]).unwrap();
        assert!(tree.is_none());
    }

    #[test]
    fn system_content_lands_under_system_node() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("m1");
        fs::create_dir_all(module.join("system/etc")).unwrap();
        fs::write(module.join("system/etc/hosts"), b"x").unwrap();

        let tree = build_mount_tree(&[module], &[]).unwrap().unwrap();
        let system = &tree.children["system"];
        assert_eq!(
            system.children["etc"].children["hosts"].file_type,
            NodeFileType::RegularFile
        );
    }

    #[test]
    fn disabled_module_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("m1");
        fs::create_dir_all(module.join("system")).unwrap();
        fs::write(module.join("system/f"), b"x").unwrap();
        fs::write(module.join("disable"), b"").unwrap();

        assert!(build_mount_tree(&[module], &[]).unwrap().is_none());
    }

    #[test]
    fn extra_partition_with_root_mount_attaches_to_root() {
        // /tmp exists on any host running the tests, so it doubles as a
        // root-level extra partition
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("m1");
        fs::create_dir_all(module.join("tmp")).unwrap();
        fs::write(module.join("tmp/marker"), b"x").unwrap();

        let tree = build_mount_tree(&[module], &["tmp".to_string()])
            .unwrap()
            .unwrap();
        assert!(tree.children.contains_key("tmp"));
        assert_eq!(
            tree.children["tmp"].children["marker"].file_type,
            NodeFileType::RegularFile
        );
        // The synthetic system node is always present at the root
        assert!(tree.children.contains_key("system"));
    }
}
