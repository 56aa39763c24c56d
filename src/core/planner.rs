// Copyright 2026 Hymo Daemon Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Converts scanned modules, rules and the peer capability into a MountPlan:
//! which paths are served by kernel rules, which partitions get an overlay,
//! and which module trees fall back to magic mount.

use std::{
    collections::{BTreeMap, HashSet},
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Result;
use walkdir::WalkDir;

use crate::{
    conf::config::Config,
    core::inventory::{Module, MountMode},
    defs,
    mount::hymofs::{HymoFsStatus, RuleKind},
    utils,
};

#[derive(Debug, Clone)]
pub struct OverlayOperation {
    /// First path component of the target, for status reporting
    pub partition_name: String,
    pub target: String,
    pub lowerdirs: Vec<PathBuf>,
    pub upperdir: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
}

/// One command for the kernel peer, in emission order semantics: adds first
/// (the peer auto-creates parents), then merges, then hides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelOp {
    Add {
        src: PathBuf,
        target: PathBuf,
        kind: RuleKind,
    },
    Merge {
        src: PathBuf,
        target: PathBuf,
    },
    Hide {
        target: PathBuf,
    },
}

#[derive(Debug, Default)]
pub struct MountPlan {
    pub overlay_ops: Vec<OverlayOperation>,
    pub kernel_ops: Vec<KernelOp>,
    pub magic_module_paths: Vec<PathBuf>,

    pub overlay_module_ids: Vec<String>,
    pub magic_module_ids: Vec<String>,
    pub hymofs_module_ids: Vec<String>,
}

impl MountPlan {
    fn find_covering_op(&mut self, virtual_path: &str) -> Option<&mut OverlayOperation> {
        self.overlay_ops.iter_mut().find(|op| {
            virtual_path == op.target
                || (virtual_path.len() > op.target.len()
                    && virtual_path.starts_with(op.target.as_str())
                    && virtual_path.as_bytes()[op.target.len()] == b'/')
        })
    }

    pub fn print_visuals(&self) {
        if self.overlay_ops.is_empty()
            && self.magic_module_paths.is_empty()
            && self.hymofs_module_ids.is_empty()
        {
            log::info!(">> Empty plan. Standby mode.");
            return;
        }

        if !self.hymofs_module_ids.is_empty() {
            log::info!("[HymoFS Injection]");
            for id in &self.hymofs_module_ids {
                log::info!("├── [Inject] {}", id);
            }
            log::info!("│   ({} kernel rules)", self.kernel_ops.len());
        }

        if !self.overlay_ops.is_empty() {
            log::info!("[OverlayFS Sequence]");
            for op in &self.overlay_ops {
                log::info!("├── [Target] {}", op.target);
                for layer in &op.lowerdirs {
                    log::info!("│   ├── [Layer] {}", layer.display());
                }
            }
        }

        if !self.magic_module_paths.is_empty() {
            log::info!("[Magic Mount Fallback]");
            for path in &self.magic_module_paths {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "UNKNOWN".into());
                log::info!("├── [Bind] {}", name);
            }
        }
    }
}

/// Capability gate: the peer must be present, and on a protocol mismatch the
/// operator has to opt in explicitly.
pub fn use_kernel(status: HymoFsStatus, ignore_protocol_mismatch: bool) -> bool {
    status == HymoFsStatus::Available
        || (ignore_protocol_mismatch
            && matches!(
                status,
                HymoFsStatus::KernelTooOld | HymoFsStatus::ModuleTooOld
            ))
}

fn all_partitions(config: &Config) -> Vec<String> {
    let mut partitions: Vec<String> =
        defs::BUILTIN_PARTITIONS.iter().map(|s| s.to_string()).collect();
    partitions.extend(config.partitions.iter().cloned());
    partitions.dedup();
    partitions
}

fn has_meaningful_content(base: &Path, partitions: &[String]) -> bool {
    partitions.iter().any(|part| utils::has_files(&base.join(part)))
}

fn resolve_default(mode: MountMode, kernel_ready: bool) -> MountMode {
    match mode {
        MountMode::Auto => {
            if kernel_ready {
                MountMode::HymoFs
            } else {
                MountMode::Overlay
            }
        }
        other => other,
    }
}

/// Resolve symlinks in the directory part of `path_str` while keeping the
/// final component untouched, so a rule can still target a symlink itself.
/// Missing ancestors are walked over and re-appended after canonicalizing
/// the deepest existing one.
pub(crate) fn resolve_path_for_hymofs(path_str: &str) -> String {
    let path = Path::new(path_str);
    let (Some(parent), Some(filename)) = (path.parent(), path.file_name()) else {
        return path_str.to_string();
    };

    let mut curr = parent.to_path_buf();
    let mut suffix: Vec<OsString> = Vec::new();

    while !curr.as_os_str().is_empty() && curr != Path::new("/") && !curr.exists() {
        if let Some(name) = curr.file_name() {
            suffix.push(name.to_os_string());
        }
        match curr.parent() {
            Some(p) => curr = p.to_path_buf(),
            None => break,
        }
    }

    if curr.exists()
        && let Ok(canonical) = curr.canonicalize()
    {
        curr = canonical;
    }

    for name in suffix.iter().rev() {
        curr.push(name);
    }
    curr.push(filename);
    curr.to_string_lossy().into_owned()
}

fn partition_name_of(target: &str) -> String {
    target
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or("")
        .to_string()
}

/// Phase one: decide a strategy per module (or per rule path) and group
/// overlay layers by target. Kernel rules are produced by the separate
/// [`update_kernel_rules`] pass so rule sources can be segregated in
/// between.
pub fn generate(
    config: &Config,
    modules: &[Module],
    storage_root: &Path,
    status: HymoFsStatus,
) -> Result<MountPlan> {
    let mut plan = MountPlan::default();

    let mut overlay_layers: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    let mut magic_paths: HashSet<PathBuf> = HashSet::new();
    let mut overlay_ids: HashSet<String> = HashSet::new();
    let mut magic_ids: HashSet<String> = HashSet::new();
    let mut hymofs_ids: Vec<String> = Vec::new();

    let target_partitions = all_partitions(config);
    let kernel_ready = use_kernel(status, config.ignore_protocol_mismatch);

    for module in modules {
        let mut content_path = storage_root.join(&module.id);
        if !content_path.exists() {
            content_path = module.source_path.clone();
        }
        if !content_path.exists() {
            continue;
        }
        if !has_meaningful_content(&content_path, &target_partitions) {
            continue;
        }

        let default_mode = resolve_default(module.mode, kernel_ready);

        if module.rules.is_empty() {
            match default_mode {
                MountMode::None => continue,
                MountMode::Magic => {
                    magic_paths.insert(content_path.clone());
                    magic_ids.insert(module.id.clone());
                }
                MountMode::HymoFs if kernel_ready => {
                    hymofs_ids.push(module.id.clone());
                }
                _ => {
                    // Overlay, whether chosen or forced by the missing peer
                    let mut participates = false;
                    for part in &target_partitions {
                        let part_path = content_path.join(part);
                        if part_path.is_dir() && utils::has_files(&part_path) {
                            overlay_layers
                                .entry(format!("/{part}"))
                                .or_default()
                                .push(part_path);
                            participates = true;
                        }
                    }
                    if participates {
                        overlay_ids.insert(module.id.clone());
                    }
                }
            }
            continue;
        }

        // Rules present: walk the partition subtrees and dispatch per path
        let mut hymofs_active = false;
        let mut overlay_active = false;
        let mut magic_active = false;

        for part in &target_partitions {
            let part_root = content_path.join(part);
            if !part_root.exists() {
                continue;
            }

            for entry in WalkDir::new(&part_root).into_iter().flatten() {
                let Ok(rel) = entry.path().strip_prefix(&content_path) else {
                    continue;
                };
                let path_str = format!("/{}", rel.to_string_lossy());

                let matched_rule = crate::core::inventory::match_rule(&module.rules, &path_str);
                let mode = matched_rule.map(|r| r.mode).unwrap_or(default_mode);

                if mode == MountMode::None {
                    continue;
                }

                if entry.file_type().is_dir() {
                    match mode {
                        MountMode::Overlay => {
                            let exact =
                                matched_rule.map(|r| r.path == path_str).unwrap_or(false);
                            if exact {
                                overlay_layers
                                    .entry(path_str.clone())
                                    .or_default()
                                    .push(entry.path().to_path_buf());
                                overlay_active = true;
                            } else if matched_rule.is_none()
                                && default_mode == MountMode::Overlay
                                && entry.path() == part_root
                            {
                                overlay_layers
                                    .entry(format!("/{part}"))
                                    .or_default()
                                    .push(entry.path().to_path_buf());
                                overlay_active = true;
                            }
                        }
                        MountMode::Magic => {
                            let exact =
                                matched_rule.map(|r| r.path == path_str).unwrap_or(false);
                            if exact {
                                // Magic mount works on module roots; a scoped
                                // magic rule pulls the whole module in
                                magic_paths.insert(content_path.clone());
                                magic_ids.insert(module.id.clone());
                                magic_active = true;
                            }
                        }
                        _ => {}
                    }
                }

                if mode == MountMode::HymoFs && kernel_ready {
                    hymofs_active = true;
                }
            }
        }

        if default_mode == MountMode::Magic && !magic_active {
            // Default magic with rules that never matched a magic path still
            // queues the module root
            magic_paths.insert(content_path.clone());
            magic_ids.insert(module.id.clone());
        }

        if hymofs_active {
            hymofs_ids.push(module.id.clone());
        }
        if overlay_active {
            overlay_ids.insert(module.id.clone());
        }
    }

    // Materialize overlay operations; symlinked targets are followed once
    // and dropped when they do not resolve to a directory
    for (target, mut layers) in overlay_layers {
        let target_path = Path::new(&target);
        let resolved = match target_path.canonicalize() {
            Ok(resolved) => resolved,
            Err(_) => continue,
        };
        if !resolved.is_dir() {
            continue;
        }

        let mut seen = HashSet::new();
        layers.retain(|layer| seen.insert(layer.clone()));

        let partition_name = partition_name_of(&target);
        let rw_dir = Path::new(defs::SYSTEM_RW_DIR).join(&partition_name);
        let (upperdir, workdir) = if rw_dir.is_dir() {
            (Some(rw_dir.join("upperdir")), Some(rw_dir.join("workdir")))
        } else {
            (None, None)
        };

        plan.overlay_ops.push(OverlayOperation {
            partition_name,
            target: resolved.to_string_lossy().to_string(),
            lowerdirs: layers,
            upperdir,
            workdir,
        });
    }

    plan.magic_module_paths = magic_paths.into_iter().collect();
    plan.magic_module_paths.sort();
    plan.overlay_module_ids = overlay_ids.into_iter().collect();
    plan.overlay_module_ids.sort();
    plan.magic_module_ids = magic_ids.into_iter().collect();
    plan.magic_module_ids.sort();
    hymofs_ids.sort();
    hymofs_ids.dedup();
    plan.hymofs_module_ids = hymofs_ids;

    Ok(plan)
}

/// When kernel mode is active, overlay and magic rule sources living inside
/// the staging tree are moved aside so the peer does not also serve them
/// through merge rules.
pub fn segregate_custom_rules(plan: &mut MountPlan, staging_root: &Path) {
    let staging_dir = staging_root.join(".overlay_staging");

    let relocate = |path: &mut PathBuf| {
        let Ok(rel) = path.strip_prefix(staging_root) else {
            return;
        };
        if rel.starts_with(".overlay_staging") {
            return;
        }
        let target = staging_dir.join(rel);

        if !path.exists() {
            return;
        }
        if let Some(parent) = target.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            log::warn!("Failed to prepare segregation dir: {e}");
            return;
        }
        match fs::rename(&*path, &target) {
            Ok(()) => {
                log::debug!(
                    "Segregated custom rule source: {} -> {}",
                    path.display(),
                    target.display()
                );
                *path = target;
            }
            Err(e) => {
                log::warn!("Failed to segregate {}: {e}", path.display());
            }
        }
    };

    for op in &mut plan.overlay_ops {
        for layer in &mut op.lowerdirs {
            relocate(layer);
        }
    }
    for path in &mut plan.magic_module_paths {
        relocate(path);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ScanKind {
    Dir,
    File,
    Symlink,
    Char { rdev: u64 },
    Other,
}

#[derive(Debug, Clone)]
pub(crate) struct ScanEntry {
    pub virtual_path: String,
    pub source: PathBuf,
    pub kind: ScanKind,
}

fn collect_scan_entries(mod_path: &Path, partitions: &[String]) -> Vec<ScanEntry> {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    let mut entries = Vec::new();

    for part in partitions {
        let part_root = mod_path.join(part);
        if !part_root.exists() {
            continue;
        }

        for entry in WalkDir::new(&part_root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .flatten()
        {
            let Ok(rel) = entry.path().strip_prefix(mod_path) else {
                continue;
            };
            let virtual_path = format!("/{}", rel.to_string_lossy());
            let file_type = entry.file_type();

            let kind = if file_type.is_dir() {
                ScanKind::Dir
            } else if file_type.is_file() {
                ScanKind::File
            } else if file_type.is_symlink() {
                ScanKind::Symlink
            } else if file_type.is_char_device() {
                match entry.path().symlink_metadata() {
                    Ok(metadata) => ScanKind::Char { rdev: metadata.rdev() },
                    Err(_) => ScanKind::Other,
                }
            } else {
                ScanKind::Other
            };

            entries.push(ScanEntry {
                virtual_path,
                source: entry.path().to_path_buf(),
                kind,
            });
        }
    }

    // The partition walk already yields parents before children; a stable
    // sort keeps that while making cross-partition order deterministic
    entries
}

/// Per-module emission over pre-collected entries. Separated from the
/// filesystem walk so whiteout and safety behavior is testable.
pub(crate) fn emit_kernel_rules(
    module: &Module,
    default_mode: MountMode,
    mod_path: &Path,
    entries: &[ScanEntry],
    plan: &mut MountPlan,
    add_rules: &mut Vec<KernelOp>,
    merge_rules: &mut Vec<KernelOp>,
    hide_rules: &mut Vec<KernelOp>,
) {
    let mut skip_prefixes: Vec<String> = Vec::new();

    'entries: for entry in entries {
        for prefix in &skip_prefixes {
            if entry.virtual_path.len() > prefix.len()
                && entry.virtual_path.starts_with(prefix.as_str())
                && entry.virtual_path.as_bytes()[prefix.len()] == b'/'
            {
                continue 'entries;
            }
        }

        let mode = module.effective_mode(default_mode, &entry.virtual_path);
        if mode != MountMode::HymoFs && mode != MountMode::Auto {
            continue;
        }

        // Overlay coverage wins: fold the module's layer into the op instead
        // of emitting rules, and stop descending into the covered subtree
        if let Some(op) = plan.find_covering_op(&entry.virtual_path) {
            if op.target.len() > 1 {
                let layer_path = mod_path.join(&op.target[1..]);
                if layer_path.exists() && !op.lowerdirs.contains(&layer_path) {
                    op.lowerdirs.push(layer_path);
                }
            }
            if entry.kind == ScanKind::Dir {
                skip_prefixes.push(entry.virtual_path.clone());
            }
            continue;
        }

        match &entry.kind {
            ScanKind::Dir => {
                let resolved = resolve_path_for_hymofs(&entry.virtual_path);
                if Path::new(&resolved).is_dir() {
                    merge_rules.push(KernelOp::Merge {
                        src: PathBuf::from(resolved),
                        target: entry.source.clone(),
                    });
                    // The peer merges children itself
                    skip_prefixes.push(entry.virtual_path.clone());
                }
            }
            ScanKind::File | ScanKind::Symlink => {
                if entry.kind == ScanKind::Symlink {
                    let host = Path::new(&entry.virtual_path);
                    if host.exists() && host.is_dir() {
                        log::warn!(
                            "Safety: Skipping symlink replacement for directory: {}",
                            entry.virtual_path
                        );
                        continue;
                    }
                }
                let kind = if entry.kind == ScanKind::File {
                    RuleKind::Reg
                } else {
                    RuleKind::Lnk
                };
                add_rules.push(KernelOp::Add {
                    src: entry.source.clone(),
                    target: PathBuf::from(resolve_path_for_hymofs(&entry.virtual_path)),
                    kind,
                });
            }
            ScanKind::Char { rdev } => {
                // Whiteout convention: char device 0:0 hides the host entry
                if *rdev == 0 {
                    hide_rules.push(KernelOp::Hide {
                        target: PathBuf::from(resolve_path_for_hymofs(&entry.virtual_path)),
                    });
                }
            }
            ScanKind::Other => {}
        }
    }
}

/// Phase two: walk HymoFS modules in ascending priority (last write wins in
/// the peer) and fill `plan.kernel_ops` in emission order.
pub fn update_kernel_rules(
    config: &Config,
    modules: &[Module],
    storage_root: &Path,
    plan: &mut MountPlan,
) -> Result<()> {
    let target_partitions = all_partitions(config);
    let hymofs_ids: HashSet<String> = plan.hymofs_module_ids.iter().cloned().collect();

    let mut add_rules: Vec<KernelOp> = Vec::new();
    let mut merge_rules: Vec<KernelOp> = Vec::new();
    let mut hide_rules: Vec<KernelOp> = Vec::new();

    // Explicit hide rules first, independent of the tree walks
    for module in modules {
        if !hymofs_ids.contains(module.id.as_str()) {
            continue;
        }
        for rule in &module.rules {
            if rule.mode == MountMode::Hide {
                hide_rules.push(KernelOp::Hide {
                    target: PathBuf::from(resolve_path_for_hymofs(&rule.path)),
                });
            }
        }
    }

    // modules is sorted high priority first; iterate in reverse
    for module in modules.iter().rev() {
        if !hymofs_ids.contains(module.id.as_str()) {
            continue;
        }

        let mut mod_path = storage_root.join(&module.id);
        if !mod_path.exists() {
            mod_path = module.source_path.clone();
        }

        // A module in the kernel set defaults to hymofs unless a rule says
        // otherwise
        let default_mode = match module.mode {
            MountMode::Auto => MountMode::HymoFs,
            other => other,
        };

        let entries = collect_scan_entries(&mod_path, &target_partitions);
        emit_kernel_rules(
            module,
            default_mode,
            &mod_path,
            &entries,
            plan,
            &mut add_rules,
            &mut merge_rules,
            &mut hide_rules,
        );
    }

    plan.kernel_ops.clear();
    plan.kernel_ops.extend(add_rules);
    plan.kernel_ops.extend(merge_rules);
    plan.kernel_ops.extend(hide_rules);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::inventory::PathRule;
    use std::os::unix::fs::symlink;

    fn test_module(id: &str, source: &Path, mode: MountMode, rules: Vec<PathRule>) -> Module {
        Module {
            id: id.to_string(),
            source_path: source.to_path_buf(),
            mode,
            rules,
            name: String::new(),
            version: String::new(),
            author: String::new(),
            description: String::new(),
        }
    }

    fn config_with_partitions(partitions: &[&str]) -> Config {
        let mut config = Config::default();
        config.partitions = partitions.iter().map(|s| s.to_string()).collect();
        config
    }

    fn stage_file(storage: &Path, id: &str, rel: &str, content: &[u8]) {
        let path = storage.join(id).join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn kernel_available_auto_module_goes_to_hymofs() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path();
        stage_file(storage, "a01", "system/etc/x.conf", b"x");

        let modules = vec![test_module(
            "a01",
            &storage.join("a01"),
            MountMode::Auto,
            vec![],
        )];
        let config = Config::default();

        let mut plan =
            generate(&config, &modules, storage, HymoFsStatus::Available).unwrap();
        assert_eq!(plan.hymofs_module_ids, vec!["a01"]);
        assert!(plan.overlay_ops.is_empty());
        assert!(plan.magic_module_ids.is_empty());

        update_kernel_rules(&config, &modules, storage, &mut plan).unwrap();
        let adds: Vec<_> = plan
            .kernel_ops
            .iter()
            .filter_map(|op| match op {
                KernelOp::Add { src, target, kind } => Some((src, target, kind)),
                _ => None,
            })
            .collect();
        assert_eq!(adds.len(), 1);
        let (src, target, kind) = &adds[0];
        assert_eq!(src.as_path(), storage.join("a01/system/etc/x.conf").as_path());
        assert_eq!(target.as_path(), Path::new("/system/etc/x.conf"));
        assert_eq!(**kind, RuleKind::Reg);
    }

    #[test]
    fn conflicting_files_last_write_wins_by_priority() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path();
        stage_file(storage, "a01", "system/lib/libfoo.so", b"a01");
        stage_file(storage, "a02", "system/lib/libfoo.so", b"a02");

        // scan order is descending: a02 first (higher priority)
        let modules = vec![
            test_module("a02", &storage.join("a02"), MountMode::Auto, vec![]),
            test_module("a01", &storage.join("a01"), MountMode::Auto, vec![]),
        ];
        let config = Config::default();

        let mut plan =
            generate(&config, &modules, storage, HymoFsStatus::Available).unwrap();
        update_kernel_rules(&config, &modules, storage, &mut plan).unwrap();

        let srcs: Vec<&PathBuf> = plan
            .kernel_ops
            .iter()
            .filter_map(|op| match op {
                KernelOp::Add { src, target, .. }
                    if target == Path::new("/system/lib/libfoo.so") =>
                {
                    Some(src)
                }
                _ => None,
            })
            .collect();
        assert_eq!(srcs.len(), 2);
        // ascending-priority application: a01 first, a02 last so it wins
        assert!(srcs[0].starts_with(storage.join("a01")));
        assert!(srcs[1].starts_with(storage.join("a02")));
    }

    #[test]
    fn kernel_unavailable_falls_back_to_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path();
        stage_file(storage, "m1", "tmp/bin/t", b"t");

        let modules = vec![test_module("m1", &storage.join("m1"), MountMode::Auto, vec![])];
        let config = config_with_partitions(&["tmp"]);

        let mut plan =
            generate(&config, &modules, storage, HymoFsStatus::NotPresent).unwrap();
        assert!(plan.hymofs_module_ids.is_empty());
        assert_eq!(plan.overlay_module_ids, vec!["m1"]);

        let op = plan
            .overlay_ops
            .iter()
            .find(|op| op.target == "/tmp")
            .expect("overlay op for /tmp");
        assert_eq!(op.lowerdirs, vec![storage.join("m1/tmp")]);
        assert_eq!(op.partition_name, "tmp");

        update_kernel_rules(&config, &modules, storage, &mut plan).unwrap();
        assert!(plan.kernel_ops.is_empty());
    }

    #[test]
    fn mismatch_requires_explicit_opt_in() {
        assert!(!use_kernel(HymoFsStatus::KernelTooOld, false));
        assert!(use_kernel(HymoFsStatus::KernelTooOld, true));
        assert!(use_kernel(HymoFsStatus::ModuleTooOld, true));
        assert!(!use_kernel(HymoFsStatus::NotPresent, true));
        assert!(use_kernel(HymoFsStatus::Available, false));
    }

    #[test]
    fn whiteout_emits_exactly_one_hide_rule() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path();
        let mod_path = storage.join("m1");
        fs::create_dir_all(&mod_path).unwrap();

        let module = test_module("m1", &mod_path, MountMode::HymoFs, vec![]);
        let mut plan = MountPlan::default();
        let entries = vec![
            ScanEntry {
                virtual_path: "/system/app".to_string(),
                source: mod_path.join("system/app"),
                kind: ScanKind::Dir,
            },
            ScanEntry {
                virtual_path: "/system/app/Bloat".to_string(),
                source: mod_path.join("system/app/Bloat"),
                kind: ScanKind::Char { rdev: 0 },
            },
        ];

        let (mut adds, mut merges, mut hides) = (Vec::new(), Vec::new(), Vec::new());
        emit_kernel_rules(
            &module,
            MountMode::HymoFs,
            &mod_path,
            &entries,
            &mut plan,
            &mut adds,
            &mut merges,
            &mut hides,
        );

        assert!(adds.is_empty());
        assert_eq!(
            hides,
            vec![KernelOp::Hide { target: PathBuf::from("/system/app/Bloat") }]
        );
    }

    #[test]
    fn nonzero_rdev_char_device_is_not_a_whiteout() {
        let dir = tempfile::tempdir().unwrap();
        let mod_path = dir.path().join("m1");
        let module = test_module("m1", &mod_path, MountMode::HymoFs, vec![]);
        let mut plan = MountPlan::default();
        let entries = vec![ScanEntry {
            virtual_path: "/system/dev/null".to_string(),
            source: mod_path.join("system/dev/null"),
            kind: ScanKind::Char { rdev: 0x0103 },
        }];

        let (mut adds, mut merges, mut hides) = (Vec::new(), Vec::new(), Vec::new());
        emit_kernel_rules(
            &module,
            MountMode::HymoFs,
            &mod_path,
            &entries,
            &mut plan,
            &mut adds,
            &mut merges,
            &mut hides,
        );
        assert!(hides.is_empty());
        assert!(adds.is_empty());
    }

    #[test]
    fn symlink_never_replaces_host_directory() {
        // A directory that really exists on the host
        let host_dir = tempfile::tempdir().unwrap();
        let host_name = host_dir.path().to_string_lossy().to_string();

        let dir = tempfile::tempdir().unwrap();
        let mod_path = dir.path().join("m1");
        let module = test_module("m1", &mod_path, MountMode::HymoFs, vec![]);
        let mut plan = MountPlan::default();
        let entries = vec![ScanEntry {
            virtual_path: host_name.clone(),
            source: mod_path.join("whatever"),
            kind: ScanKind::Symlink,
        }];

        let (mut adds, mut merges, mut hides) = (Vec::new(), Vec::new(), Vec::new());
        emit_kernel_rules(
            &module,
            MountMode::HymoFs,
            &mod_path,
            &entries,
            &mut plan,
            &mut adds,
            &mut merges,
            &mut hides,
        );
        assert!(adds.is_empty(), "symlink over host dir must be skipped");
    }

    #[test]
    fn existing_host_dir_becomes_merge_rule_and_prunes_children() {
        // /tmp/<x> exists, so the module's matching dir merges instead of
        // emitting per-file adds
        let host_dir = tempfile::tempdir().unwrap();
        let host_base = host_dir
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .to_string();

        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path();
        let rel = format!("tmp/{host_base}/conf/x.conf");
        stage_file(storage, "m1", &rel, b"x");

        let modules = vec![test_module(
            "m1",
            &storage.join("m1"),
            MountMode::Auto,
            vec![],
        )];
        let config = config_with_partitions(&["tmp"]);

        let mut plan =
            generate(&config, &modules, storage, HymoFsStatus::Available).unwrap();
        update_kernel_rules(&config, &modules, storage, &mut plan).unwrap();

        let merges: Vec<_> = plan
            .kernel_ops
            .iter()
            .filter(|op| matches!(op, KernelOp::Merge { .. }))
            .collect();
        assert_eq!(merges.len(), 1);
        match merges[0] {
            KernelOp::Merge { src, target } => {
                assert_eq!(src.as_path(), host_dir.path());
                assert_eq!(
                    target.as_path(),
                    storage.join("m1").join(format!("tmp/{host_base}")).as_path()
                );
            }
            _ => unreachable!(),
        }
        // children are the peer's business now
        assert!(
            !plan
                .kernel_ops
                .iter()
                .any(|op| matches!(op, KernelOp::Add { .. }))
        );
    }

    #[test]
    fn overlay_coverage_folds_and_suppresses_adds() {
        // Build a real host dir /tmp/<x>/fonts for the overlay target
        let host_dir = tempfile::tempdir().unwrap();
        let host_base = host_dir
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .to_string();
        fs::create_dir_all(host_dir.path().join("fonts")).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path();
        let fonts_rule_path = format!("/tmp/{host_base}/fonts");
        stage_file(storage, "m1", &format!("tmp/{host_base}/fonts/a.ttf"), b"f");
        // A sibling that has no host counterpart, so it must become add rules
        let absent = format!("{host_base}-absent");
        stage_file(storage, "m1", &format!("tmp/{absent}/etc/x.conf"), b"x");

        let modules = vec![test_module(
            "m1",
            &storage.join("m1"),
            MountMode::HymoFs,
            vec![PathRule { path: fonts_rule_path.clone(), mode: MountMode::Overlay }],
        )];
        let config = config_with_partitions(&["tmp"]);

        let mut plan =
            generate(&config, &modules, storage, HymoFsStatus::Available).unwrap();

        let op = plan
            .overlay_ops
            .iter()
            .find(|op| op.target == host_dir.path().join("fonts").to_string_lossy())
            .expect("overlay op for the fonts rule");
        assert_eq!(
            op.lowerdirs,
            vec![storage.join("m1").join(format!("tmp/{host_base}/fonts"))]
        );

        update_kernel_rules(&config, &modules, storage, &mut plan).unwrap();

        // No kernel rule may target anything under the covered subtree
        for kernel_op in &plan.kernel_ops {
            if let KernelOp::Add { target, .. } = kernel_op {
                assert!(
                    !target.starts_with(host_dir.path().join("fonts")),
                    "covered path leaked into kernel rules: {}",
                    target.display()
                );
            }
        }
        // The uncovered file still gets its add rule
        let expected = PathBuf::from(format!("/tmp/{absent}/etc/x.conf"));
        assert!(plan.kernel_ops.iter().any(|op| matches!(
            op,
            KernelOp::Add { target, .. } if *target == expected
        )));
        assert_eq!(plan.hymofs_module_ids, vec!["m1"]);
    }

    #[test]
    fn magic_default_with_rules_still_queues_root() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path();
        stage_file(storage, "m1", "system/bin/t", b"t");

        let modules = vec![test_module(
            "m1",
            &storage.join("m1"),
            MountMode::Magic,
            vec![PathRule { path: "/system/bin".to_string(), mode: MountMode::HymoFs }],
        )];
        let config = Config::default();

        let plan = generate(&config, &modules, storage, HymoFsStatus::Available).unwrap();
        assert_eq!(plan.magic_module_ids, vec!["m1"]);
        assert_eq!(plan.magic_module_paths, vec![storage.join("m1")]);
        // the hymofs rule path keeps the module in the kernel set too
        assert_eq!(plan.hymofs_module_ids, vec!["m1"]);
    }

    #[test]
    fn strategy_sets_are_disjoint_for_plain_modules() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path();
        stage_file(storage, "k1", "system/a", b"a");
        stage_file(storage, "o1", "tmp/b", b"b");
        stage_file(storage, "g1", "system/c", b"c");

        let modules = vec![
            test_module("o1", &storage.join("o1"), MountMode::Overlay, vec![]),
            test_module("k1", &storage.join("k1"), MountMode::Auto, vec![]),
            test_module("g1", &storage.join("g1"), MountMode::Magic, vec![]),
        ];
        let config = config_with_partitions(&["tmp"]);

        let plan = generate(&config, &modules, storage, HymoFsStatus::Available).unwrap();
        assert_eq!(plan.hymofs_module_ids, vec!["k1"]);
        assert_eq!(plan.overlay_module_ids, vec!["o1"]);
        assert_eq!(plan.magic_module_ids, vec!["g1"]);

        let hymofs: HashSet<_> = plan.hymofs_module_ids.iter().collect();
        let overlay: HashSet<_> = plan.overlay_module_ids.iter().collect();
        let magic: HashSet<_> = plan.magic_module_ids.iter().collect();
        assert!(hymofs.is_disjoint(&overlay));
        assert!(hymofs.is_disjoint(&magic));
        assert!(overlay.is_disjoint(&magic));
    }

    #[test]
    fn overlay_lowerdirs_keep_priority_order_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path();
        stage_file(storage, "a01", "tmp/f1", b"1");
        stage_file(storage, "z99", "tmp/f2", b"2");

        // scan order descending: z99 before a01
        let modules = vec![
            test_module("z99", &storage.join("z99"), MountMode::Overlay, vec![]),
            test_module("a01", &storage.join("a01"), MountMode::Overlay, vec![]),
        ];
        let config = config_with_partitions(&["tmp"]);

        let plan = generate(&config, &modules, storage, HymoFsStatus::NotPresent).unwrap();
        let op = plan.overlay_ops.iter().find(|op| op.target == "/tmp").unwrap();
        assert_eq!(
            op.lowerdirs,
            vec![storage.join("z99/tmp"), storage.join("a01/tmp")]
        );
        let unique: HashSet<_> = op.lowerdirs.iter().collect();
        assert_eq!(unique.len(), op.lowerdirs.len());
    }

    #[test]
    fn none_mode_drops_module_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path();
        stage_file(storage, "m1", "system/a", b"a");

        let modules = vec![test_module("m1", &storage.join("m1"), MountMode::None, vec![])];
        let plan = generate(
            &Config::default(),
            &modules,
            storage,
            HymoFsStatus::Available,
        )
        .unwrap();
        assert!(plan.hymofs_module_ids.is_empty());
        assert!(plan.overlay_module_ids.is_empty());
        assert!(plan.magic_module_ids.is_empty());
        assert!(plan.overlay_ops.is_empty());
    }

    #[test]
    fn resolve_walks_symlinked_ancestors() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        fs::create_dir_all(&real).unwrap();
        let link = dir.path().join("alias");
        symlink(&real, &link).unwrap();

        // existing ancestor is a symlink: canonicalized
        let resolved =
            resolve_path_for_hymofs(&format!("{}/missing/x", link.to_string_lossy()));
        assert_eq!(resolved, format!("{}/missing/x", real.to_string_lossy()));

        // final component symlinks are preserved
        let file_link = dir.path().join("file_link");
        symlink(real.join("f"), &file_link).unwrap();
        let resolved = resolve_path_for_hymofs(&file_link.to_string_lossy());
        assert!(resolved.ends_with("/file_link"));
    }

    #[test]
    fn segregation_moves_staged_sources_aside() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path();
        stage_file(storage, "m1", "tmp/fonts/a.ttf", b"f");

        let mut plan = MountPlan::default();
        plan.overlay_ops.push(OverlayOperation {
            partition_name: "tmp".into(),
            target: "/tmp/fonts".into(),
            lowerdirs: vec![storage.join("m1/tmp/fonts")],
            upperdir: None,
            workdir: None,
        });

        segregate_custom_rules(&mut plan, storage);

        let relocated = storage.join(".overlay_staging/m1/tmp/fonts");
        assert_eq!(plan.overlay_ops[0].lowerdirs, vec![relocated.clone()]);
        assert!(relocated.join("a.ttf").exists());
        assert!(!storage.join("m1/tmp/fonts").exists());
    }
}
