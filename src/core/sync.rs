// Copyright 2026 Hymo Daemon Authors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{collections::HashSet, fs, path::Path};

use anyhow::{Context, Result};
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::{core::inventory::Module, defs, utils};

// Staging entries that are never treated as stale modules
const STAGING_KEEP: [&str; 2] = ["hymo", "lost+found"];

/// Mirror enabled modules into the staging root.
///
/// Each module is copied into a scratch sibling and committed with a rename,
/// so a crashed sync never leaves a half-written module behind. `force`
/// bypasses the change detection.
pub fn perform_sync(
    modules: &[Module],
    target_base: &Path,
    extra_partitions: &[String],
    force: bool,
) -> Result<()> {
    if force {
        log::info!("Forced full sync to {}", target_base.display());
    } else {
        log::info!("Starting smart module sync to {}", target_base.display());
    }

    let active: HashSet<&str> = modules.iter().map(|m| m.id.as_str()).collect();
    sweep_stale_entries(target_base, &active);

    modules.par_iter().for_each(|module| {
        match stage_module(module, target_base, extra_partitions, force) {
            Ok(true) => log::info!("Staged module: {}", module.id),
            Ok(false) => log::debug!("Module {} needs no staging", module.id),
            Err(e) => log::error!("Staging {} failed: {e:#}", module.id),
        }
    });

    Ok(())
}

/// Copy one module if its staged copy is missing or outdated. Returns
/// whether a fresh copy was committed.
fn stage_module(
    module: &Module,
    target_base: &Path,
    extra_partitions: &[String],
    force: bool,
) -> Result<bool> {
    if !module_has_payload(module, extra_partitions) {
        return Ok(false);
    }

    let dst = target_base.join(&module.id);
    if !force && staged_copy_current(&module.source_path, &dst) {
        return Ok(false);
    }

    let scratch = target_base.join(format!(".tmp_{}", module.id));
    if scratch.exists() {
        fs::remove_dir_all(&scratch).context("stale scratch dir in the way")?;
    }

    let built = utils::sync_dir(&module.source_path, &scratch, true)
        .and_then(|()| finish_staged_tree(&scratch));
    if let Err(e) = built {
        let _ = fs::remove_dir_all(&scratch);
        return Err(e);
    }

    if dst.exists() {
        fs::remove_dir_all(&dst)
            .with_context(|| format!("cannot replace staged copy of {}", module.id))?;
    }
    if let Err(e) = fs::rename(&scratch, &dst) {
        let _ = fs::remove_dir_all(&scratch);
        return Err(e).context("commit of staged copy failed");
    }

    Ok(true)
}

/// One contents-first walk over a freshly staged tree: directories carrying
/// a `.replace` marker get the overlay opaque attribute, and directories
/// that end up with no payload at all are dropped.
fn finish_staged_tree(root: &Path) -> Result<()> {
    for entry in WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .flatten()
    {
        if !entry.file_type().is_dir() {
            continue;
        }
        let dir = entry.path();

        if dir.join(defs::REPLACE_DIR_FILE_NAME).exists() {
            if let Err(e) = utils::set_overlay_opaque(dir) {
                // Without the attribute the directory merges instead of
                // replacing; keep going, the marker file still exists
                log::warn!("{e:#}");
            }
        } else if fs::remove_dir(dir).is_ok() {
            log::debug!("Dropped empty staging dir: {}", dir.display());
        }
    }
    Ok(())
}

/// Remove staging entries that no scanned module accounts for.
fn sweep_stale_entries(target_base: &Path, active: &HashSet<&str>) {
    let Ok(entries) = fs::read_dir(target_base) else {
        return;
    };

    for entry in entries.flatten() {
        let name_os = entry.file_name();
        let name = name_os.to_string_lossy();
        if STAGING_KEEP.contains(&name.as_ref()) || active.contains(name.as_ref()) {
            continue;
        }

        log::info!("Removing stale staging entry: {name}");
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let removed = if is_dir {
            fs::remove_dir_all(entry.path())
        } else {
            fs::remove_file(entry.path())
        };
        if let Err(e) = removed {
            log::warn!("Could not remove stale entry {name}: {e}");
        }
    }
}

/// A staged copy is current when both module.prop files exist and match
/// byte for byte. Any read failure counts as outdated.
fn staged_copy_current(src: &Path, dst: &Path) -> bool {
    match (fs::read(src.join("module.prop")), fs::read(dst.join("module.prop"))) {
        (Ok(source_prop), Ok(staged_prop)) => source_prop == staged_prop,
        _ => false,
    }
}

fn module_has_payload(module: &Module, extra_partitions: &[String]) -> bool {
    defs::BUILTIN_PARTITIONS
        .iter()
        .map(|p| module.source_path.join(p))
        .chain(extra_partitions.iter().map(|p| module.source_path.join(p)))
        .any(|part| utils::has_files_recursive(&part))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::inventory::MountMode;
    use std::path::PathBuf;

    fn module(dir: &Path, id: &str) -> Module {
        Module {
            id: id.to_string(),
            source_path: dir.join(id),
            mode: MountMode::Auto,
            rules: Vec::new(),
            name: String::new(),
            version: String::new(),
            author: String::new(),
            description: String::new(),
        }
    }

    fn write_module(dir: &Path, id: &str, version: &str) -> PathBuf {
        let path = dir.join(id);
        fs::create_dir_all(path.join("system/etc")).unwrap();
        fs::write(path.join("system/etc/a.conf"), b"conf").unwrap();
        fs::write(path.join("module.prop"), format!("id={id}\nversion={version}\n")).unwrap();
        path
    }

    #[test]
    fn syncs_new_module_and_skips_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let src_base = dir.path().join("modules");
        let staging = dir.path().join("staging");
        fs::create_dir_all(&staging).unwrap();
        write_module(&src_base, "m1", "1");

        let modules = vec![module(&src_base, "m1")];
        perform_sync(&modules, &staging, &[], false).unwrap();
        assert!(staging.join("m1/system/etc/a.conf").exists());

        // Mutate the staged copy; an unchanged module.prop means no re-sync
        fs::write(staging.join("m1/system/etc/a.conf"), b"mutated").unwrap();
        perform_sync(&modules, &staging, &[], false).unwrap();
        assert_eq!(fs::read(staging.join("m1/system/etc/a.conf")).unwrap(), b"mutated");

        // Version bump changes module.prop and triggers a full re-copy
        write_module(&src_base, "m1", "2");
        perform_sync(&modules, &staging, &[], false).unwrap();
        assert_eq!(fs::read(staging.join("m1/system/etc/a.conf")).unwrap(), b"conf");
    }

    #[test]
    fn empty_modules_are_never_staged() {
        let dir = tempfile::tempdir().unwrap();
        let src_base = dir.path().join("modules");
        let staging = dir.path().join("staging");
        fs::create_dir_all(&staging).unwrap();

        let path = src_base.join("empty");
        fs::create_dir_all(path.join("system/only/dirs")).unwrap();
        fs::write(path.join("module.prop"), b"id=empty\n").unwrap();

        perform_sync(&[module(&src_base, "empty")], &staging, &[], false).unwrap();
        assert!(!staging.join("empty").exists());
    }

    #[test]
    fn staged_tree_is_pruned_of_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let src_base = dir.path().join("modules");
        let staging = dir.path().join("staging");
        fs::create_dir_all(&staging).unwrap();

        let path = write_module(&src_base, "m1", "1");
        fs::create_dir_all(path.join("system/hollow/nested")).unwrap();

        perform_sync(&[module(&src_base, "m1")], &staging, &[], false).unwrap();
        assert!(staging.join("m1/system/etc/a.conf").exists());
        assert!(!staging.join("m1/system/hollow").exists());
    }

    #[test]
    fn orphans_are_pruned_but_reserved_names_stay() {
        let dir = tempfile::tempdir().unwrap();
        let src_base = dir.path().join("modules");
        let staging = dir.path().join("staging");
        write_module(&src_base, "m1", "1");
        fs::create_dir_all(staging.join("stale/system")).unwrap();
        fs::create_dir_all(staging.join("lost+found")).unwrap();
        fs::create_dir_all(staging.join("hymo")).unwrap();

        perform_sync(&[module(&src_base, "m1")], &staging, &[], false).unwrap();

        assert!(!staging.join("stale").exists());
        assert!(staging.join("lost+found").exists());
        assert!(staging.join("hymo").exists());
        assert!(staging.join("m1").exists());
    }

    #[test]
    fn extra_partition_content_counts() {
        let dir = tempfile::tempdir().unwrap();
        let src_base = dir.path().join("modules");
        let staging = dir.path().join("staging");
        fs::create_dir_all(&staging).unwrap();

        let path = src_base.join("m1");
        fs::create_dir_all(path.join("mi_ext")).unwrap();
        fs::write(path.join("mi_ext/f"), b"x").unwrap();
        fs::write(path.join("module.prop"), b"id=m1\n").unwrap();

        // Not a builtin partition: skipped without the extra list
        perform_sync(&[module(&src_base, "m1")], &staging, &[], false).unwrap();
        assert!(!staging.join("m1").exists());

        perform_sync(
            &[module(&src_base, "m1")],
            &staging,
            &["mi_ext".to_string()],
            false,
        )
        .unwrap();
        assert!(staging.join("m1/mi_ext/f").exists());
    }
}
