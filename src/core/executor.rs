// Copyright 2026 Hymo Daemon Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Realizes a MountPlan: kernel rules first, then overlay mounts, then the
//! magic mount queue. Overlay failures downgrade the affected modules to
//! magic mount instead of aborting the run.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Result;

use crate::{
    conf::config::Config,
    core::planner::{KernelOp, MountPlan, OverlayOperation},
    defs,
    mount::{hymofs, magic, overlay},
    utils,
};

pub struct ExecutionResult {
    pub overlay_module_ids: Vec<String>,
    pub magic_module_ids: Vec<String>,
}

/// Apply the planner-emitted rules in order. Individual failures are
/// recorded, not fatal: the peer tolerates partial rule sets.
pub fn apply_kernel_ops(ops: &[KernelOp]) -> usize {
    let mut failed = 0usize;

    for op in ops {
        let result = match op {
            KernelOp::Add { src, target, kind } => hymofs::add_rule(src, target, *kind),
            KernelOp::Merge { src, target } => hymofs::add_merge_rule(src, target),
            KernelOp::Hide { target } => hymofs::hide_path(target),
        };
        if let Err(e) = result {
            failed += 1;
            log::warn!("Kernel rule failed: {e:#}");
        }
    }

    failed
}

fn extract_module_root(partition_path: &Path) -> Option<PathBuf> {
    let mut current = partition_path;
    while let Some(parent) = current.parent() {
        if current.join("module.prop").exists() {
            return Some(current.to_path_buf());
        }
        current = parent;
    }
    partition_path.parent().map(Path::to_path_buf)
}

/// Modules participating in a failed overlay op: their roots join the magic
/// queue, their ids move from the overlay to the magic set.
pub(crate) fn fallback_targets(op: &OverlayOperation) -> Vec<(PathBuf, String)> {
    let mut targets = Vec::new();
    for layer in &op.lowerdirs {
        if let Some(root) = extract_module_root(layer)
            && let Some(id) = utils::extract_module_id(layer)
        {
            targets.push((root, id));
        }
    }
    targets
}

fn prepare_rw_dirs(op: &OverlayOperation) -> (Option<PathBuf>, Option<PathBuf>) {
    let (Some(upper), Some(work)) = (op.upperdir.clone(), op.workdir.clone()) else {
        return (None, None);
    };

    // A dirty workdir poisons the next overlay mount
    if work.exists()
        && let Err(e) = fs::remove_dir_all(&work)
    {
        log::warn!("Failed to clean workdir {}: {}", work.display(), e);
    }
    if let Err(e) = fs::create_dir_all(&work) {
        log::warn!("Failed to recreate workdir {}: {}", work.display(), e);
    }
    if !upper.exists()
        && let Err(e) = fs::create_dir_all(&upper)
    {
        log::warn!("Failed to create upperdir {}: {}", upper.display(), e);
    }

    if upper.exists() && work.exists() {
        (Some(upper), Some(work))
    } else {
        (None, None)
    }
}

pub fn execute(
    plan: &MountPlan,
    config: &Config,
    kernel_ready: bool,
) -> Result<ExecutionResult> {
    let mut final_overlay_ids: HashSet<String> =
        plan.overlay_module_ids.iter().cloned().collect();
    let mut final_magic_ids: HashSet<String> =
        plan.magic_module_ids.iter().cloned().collect();
    let mut magic_queue: Vec<PathBuf> = plan.magic_module_paths.clone();

    if kernel_ready && !plan.hymofs_module_ids.is_empty() {
        log::info!(">> Phase 1: HymoFS rules ({} ops)...", plan.kernel_ops.len());
        // Start from a known state
        if let Err(e) = hymofs::clear_rules() {
            log::warn!("HymoFS clear before apply failed: {e:#}");
        }
        let failed = apply_kernel_ops(&plan.kernel_ops);
        if failed > 0 {
            log::warn!("{failed} kernel rules failed to apply");
        }
    }

    let mirror_base = config
        .mirror_path
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(defs::HYMO_MIRROR_DEV));

    let mut partitions: Vec<String> =
        defs::BUILTIN_PARTITIONS.iter().map(|s| s.to_string()).collect();
    partitions.extend(config.partitions.iter().cloned());
    partitions.dedup();

    log::info!(">> Phase 2: OverlayFS execution ({} ops)...", plan.overlay_ops.len());

    for op in &plan.overlay_ops {
        let lowerdir_strings: Vec<String> = op
            .lowerdirs
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let (upperdir, workdir) = prepare_rw_dirs(op);

        log::info!("Mounting {} [OVERLAY] ({} layers)", op.target, lowerdir_strings.len());

        match overlay::mount_overlay(
            &op.target,
            &lowerdir_strings,
            &config.mountsource,
            upperdir,
            workdir,
            config.disable_umount,
            &mirror_base,
            &partitions,
        ) {
            Ok(()) => {}
            Err(e) => {
                log::warn!(
                    "OverlayFS failed for {}: {e:#}. Fallback to Magic Mount.",
                    op.target
                );
                let _ = rustix::mount::unmount(
                    Path::new(&op.target),
                    rustix::mount::UnmountFlags::DETACH,
                );

                for (root, id) in fallback_targets(op) {
                    magic_queue.push(root);
                    final_magic_ids.insert(id);
                }
            }
        }
    }

    // A module taken over by magic mount leaves the overlay set
    final_overlay_ids.retain(|id| !final_magic_ids.contains(id));

    magic_queue.sort();
    magic_queue.dedup();

    if !magic_queue.is_empty() {
        let tempdir = match &config.tempdir {
            Some(t) => t.clone(),
            None => utils::select_temp_dir()?,
        };

        log::info!(
            ">> Phase 3: Magic Mount for {} module roots using {}",
            magic_queue.len(),
            tempdir.display()
        );

        utils::ensure_temp_dir(&tempdir)?;

        if let Err(e) = magic::mount_partitions(
            &tempdir,
            &magic_queue,
            &config.mountsource,
            &config.partitions,
            config.disable_umount,
        ) {
            log::error!("Magic Mount critical failure: {e:#}");
            final_magic_ids.clear();
        }

        utils::cleanup_temp_dir(&tempdir);
    }

    let mut overlay_module_ids: Vec<String> = final_overlay_ids.into_iter().collect();
    let mut magic_module_ids: Vec<String> = final_magic_ids.into_iter().collect();
    overlay_module_ids.sort();
    magic_module_ids.sort();

    Ok(ExecutionResult { overlay_module_ids, magic_module_ids })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_resolves_module_roots_and_ids() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path();
        for id in ["m1", "m2"] {
            fs::create_dir_all(storage.join(id).join("system")).unwrap();
            fs::write(storage.join(id).join("module.prop"), format!("id={id}\n")).unwrap();
        }

        let op = OverlayOperation {
            partition_name: "system".into(),
            target: "/system".into(),
            lowerdirs: vec![storage.join("m2/system"), storage.join("m1/system")],
            upperdir: None,
            workdir: None,
        };

        let targets = fallback_targets(&op);
        assert_eq!(
            targets,
            vec![
                (storage.join("m2"), "m2".to_string()),
                (storage.join("m1"), "m1".to_string()),
            ]
        );
    }

    #[test]
    fn downgraded_modules_leave_the_overlay_set() {
        // The reconciliation the executor performs after a failed op
        let mut overlay_ids: HashSet<String> =
            ["m1".to_string(), "m2".to_string()].into_iter().collect();
        let mut magic_ids: HashSet<String> = HashSet::new();

        magic_ids.insert("m1".to_string());
        overlay_ids.retain(|id| !magic_ids.contains(id));

        assert!(!overlay_ids.contains("m1"));
        assert!(overlay_ids.contains("m2"));
        assert!(magic_ids.contains("m1"));
    }

    #[test]
    fn rw_dirs_require_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let rw = dir.path().join("rw/system");
        fs::create_dir_all(&rw).unwrap();

        let op = OverlayOperation {
            partition_name: "system".into(),
            target: "/system".into(),
            lowerdirs: vec![],
            upperdir: Some(rw.join("upperdir")),
            workdir: Some(rw.join("workdir")),
        };

        let (upper, work) = prepare_rw_dirs(&op);
        assert_eq!(upper, Some(rw.join("upperdir")));
        assert_eq!(work, Some(rw.join("workdir")));
        assert!(rw.join("upperdir").is_dir());
        assert!(rw.join("workdir").is_dir());

        let bare = OverlayOperation {
            partition_name: "system".into(),
            target: "/system".into(),
            lowerdirs: vec![],
            upperdir: None,
            workdir: None,
        };
        assert_eq!(prepare_rw_dirs(&bare), (None, None));
    }
}
