// Copyright 2026 Hymo Daemon Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Boot-path engine. The phases are encoded as typestates so the controller
//! cannot execute a plan before storage, sync and planning have happened:
//! Init -> StorageReady -> ModulesReady -> Planned -> Executed.

pub mod executor;
pub mod inventory;
pub mod modules;
pub mod planner;
pub mod state;
pub mod storage;
pub mod sync;

use std::{collections::HashSet, path::Path};

use anyhow::{Context, Result};

use crate::{
    conf::config::{Config, FsType},
    defs,
    mount::hymofs::{self, HymoFsStatus},
    try_umount,
};

pub struct Init;

pub struct StorageReady {
    pub handle: storage::StorageHandle,
}

pub struct ModulesReady {
    pub handle: storage::StorageHandle,
    pub modules: Vec<inventory::Module>,
}

pub struct Planned {
    pub handle: storage::StorageHandle,
    pub modules: Vec<inventory::Module>,
    pub plan: planner::MountPlan,
}

pub struct Executed {
    pub handle: storage::StorageHandle,
    pub modules: Vec<inventory::Module>,
    pub plan: planner::MountPlan,
    pub result: executor::ExecutionResult,
}

pub struct MountEngine<S> {
    config: Config,
    status: HymoFsStatus,
    state: S,
}

pub fn mismatch_warning(status: HymoFsStatus) -> &'static str {
    match status {
        HymoFsStatus::KernelTooOld => {
            "⚠️Kernel version is lower than module version. Please update your kernel."
        }
        HymoFsStatus::ModuleTooOld => {
            "⚠️Module version is lower than kernel version. Please update your module."
        }
        _ => "",
    }
}

impl MountEngine<Init> {
    pub fn new(config: Config, status: HymoFsStatus) -> Self {
        Self { config, status, state: Init }
    }

    pub fn init_storage(
        self,
        mnt_base: &Path,
        img_path: &Path,
    ) -> Result<MountEngine<StorageReady>> {
        let setup = |fs_type: FsType| {
            storage::setup(
                mnt_base,
                img_path,
                &self.config.moduledir,
                fs_type,
                &self.config.mountsource,
                self.config.disable_umount,
            )
        };

        let handle = match setup(self.config.fs_type) {
            Ok(handle) => handle,
            Err(e) if self.config.fs_type == FsType::Ext4 => {
                // A broken image must not leave the device unmodded
                log::warn!("Forced ext4 failed: {e:#}. Retrying in auto mode.");
                setup(FsType::Auto)?
            }
            Err(e) => return Err(e).context("Storage setup failed"),
        };

        log::info!(">> Storage backend: [{}]", handle.mode.to_uppercase());

        Ok(MountEngine {
            config: self.config,
            status: self.status,
            state: StorageReady { handle },
        })
    }
}

impl MountEngine<StorageReady> {
    pub fn scan_and_sync(mut self) -> Result<MountEngine<ModulesReady>> {
        let modules = inventory::scan(&self.config.moduledir, &self.config)?;
        log::info!(">> Inventory scan: {} enabled modules.", modules.len());

        sync::perform_sync(
            &modules,
            &self.state.handle.mount_point,
            &self.config.partitions,
            false,
        )?;

        self.state.handle.commit(self.config.disable_umount)?;

        if self.state.handle.mode == "ext4" {
            storage::finalize_storage_permissions(&self.state.handle.mount_point);
        }

        Ok(MountEngine {
            config: self.config,
            status: self.status,
            state: ModulesReady { handle: self.state.handle, modules },
        })
    }
}

impl MountEngine<ModulesReady> {
    pub fn generate_plan(self) -> Result<MountEngine<Planned>> {
        let mut plan = planner::generate(
            &self.config,
            &self.state.modules,
            &self.state.handle.mount_point,
            self.status,
        )?;

        if planner::use_kernel(self.status, self.config.ignore_protocol_mismatch) {
            // Sources served by overlay or magic must leave the tree the
            // peer merges from
            planner::segregate_custom_rules(&mut plan, &self.state.handle.mount_point);
            planner::update_kernel_rules(
                &self.config,
                &self.state.modules,
                &self.state.handle.mount_point,
                &mut plan,
            )?;
        }

        plan.print_visuals();

        Ok(MountEngine {
            config: self.config,
            status: self.status,
            state: Planned {
                handle: self.state.handle,
                modules: self.state.modules,
                plan,
            },
        })
    }
}

impl MountEngine<Planned> {
    fn apply_kernel_flags(&self) {
        if let Some(mirror) = &self.config.mirror_path {
            if hymofs::set_mirror_path(Path::new(mirror)).is_ok() {
                log::info!("Applied custom mirror path: {mirror}");
            } else {
                log::warn!("Failed to apply custom mirror path: {mirror}");
            }
        }

        if self.config.enable_kernel_debug
            && let Err(e) = hymofs::set_debug(true)
        {
            log::warn!("Failed to enable kernel debug logging: {e:#}");
        }

        if let Err(e) = hymofs::set_stealth(self.config.enable_stealth) {
            log::warn!("Failed to set stealth mode: {e:#}");
        }

        if self.config.avc_spoof
            && let Err(e) = hymofs::set_avc_log_spoofing(true)
        {
            log::warn!("Failed to enable AVC log spoofing: {e:#}");
        }
    }

    pub fn execute(self) -> Result<MountEngine<Executed>> {
        log::info!(">> Executing mount plan...");

        let kernel_ready =
            planner::use_kernel(self.status, self.config.ignore_protocol_mismatch);
        if kernel_ready {
            self.apply_kernel_flags();
        }

        let result = executor::execute(&self.state.plan, &self.config, kernel_ready)?;

        if kernel_ready && self.config.enable_stealth {
            // Freshly created mounts need their mnt_ids reordered too
            if let Err(e) = hymofs::fix_mounts() {
                log::warn!("Failed to fix mount namespace after mounting: {e:#}");
            }
        }

        Ok(MountEngine {
            config: self.config,
            status: self.status,
            state: Executed {
                handle: self.state.handle,
                modules: self.state.modules,
                plan: self.state.plan,
                result,
            },
        })
    }
}

/// Partitions a set of modules actually touches, used for the state file's
/// `active_mounts`.
pub fn active_partitions(
    modules: &[inventory::Module],
    ids: &[String],
    partitions: &[String],
) -> Vec<String> {
    let id_set: HashSet<&str> = ids.iter().map(|s| s.as_str()).collect();
    partitions
        .iter()
        .filter(|part| {
            modules
                .iter()
                .filter(|m| id_set.contains(m.id.as_str()))
                .any(|m| m.source_path.join(part).exists())
        })
        .cloned()
        .collect()
}

impl MountEngine<Executed> {
    pub fn finalize(self) -> Result<()> {
        let mut nuke_active = false;
        if self.state.handle.mode == "ext4" && self.config.enable_nuke {
            match try_umount::ksu_nuke_sysfs(
                self.state.handle.mount_point.to_string_lossy().as_ref(),
            ) {
                Ok(()) => {
                    log::info!(">> Ext4 sysfs traces nuked.");
                    nuke_active = true;
                }
                Err(e) => log::warn!("Sysfs nuke failed: {e:#}"),
            }
        }

        let warning = mismatch_warning(self.status);
        let hymofs_active = !self.state.plan.hymofs_module_ids.is_empty();

        let mut all_partitions: Vec<String> =
            defs::BUILTIN_PARTITIONS.iter().map(|s| s.to_string()).collect();
        all_partitions.extend(self.config.partitions.iter().cloned());

        let mut active_mounts = active_partitions(
            &self.state.modules,
            &self.state.plan.hymofs_module_ids,
            &all_partitions,
        );
        for op in &self.state.plan.overlay_ops {
            if !active_mounts.contains(&op.partition_name) {
                active_mounts.push(op.partition_name.clone());
            }
        }
        for part in active_partitions(
            &self.state.modules,
            &self.state.result.magic_module_ids,
            &all_partitions,
        ) {
            if !active_mounts.contains(&part) {
                active_mounts.push(part);
            }
        }

        let runtime_state = state::RuntimeState {
            storage_mode: self.state.handle.mode.clone(),
            mount_point: self.state.handle.mount_point.to_string_lossy().to_string(),
            pid: std::process::id(),
            nuke_active,
            hymofs_mismatch: !warning.is_empty(),
            mismatch_message: warning.to_string(),
            overlay_module_ids: self.state.result.overlay_module_ids.clone(),
            magic_module_ids: self.state.result.magic_module_ids.clone(),
            hymofs_module_ids: self.state.plan.hymofs_module_ids.clone(),
            active_mounts,
        };

        if let Err(e) = runtime_state.save() {
            log::error!("Failed to save runtime state: {e:#}");
        }

        modules::update_description(
            true,
            &self.state.handle.mode,
            nuke_active,
            self.state.result.overlay_module_ids.len(),
            self.state.result.magic_module_ids.len(),
            self.state.plan.hymofs_module_ids.len(),
            warning,
            hymofs_active,
        );

        log::info!(
            ">> Mount sequence complete: {} HymoFS, {} overlay, {} magic.",
            self.state.plan.hymofs_module_ids.len(),
            self.state.result.overlay_module_ids.len(),
            self.state.result.magic_module_ids.len()
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::inventory::{Module, MountMode};
    use std::fs;

    #[test]
    fn active_partitions_reflect_module_content() {
        let dir = tempfile::tempdir().unwrap();
        let m1 = dir.path().join("m1");
        fs::create_dir_all(m1.join("system")).unwrap();
        let m2 = dir.path().join("m2");
        fs::create_dir_all(m2.join("vendor")).unwrap();

        let modules = vec![
            Module {
                id: "m1".into(),
                source_path: m1,
                mode: MountMode::Auto,
                rules: vec![],
                name: String::new(),
                version: String::new(),
                author: String::new(),
                description: String::new(),
            },
            Module {
                id: "m2".into(),
                source_path: m2,
                mode: MountMode::Auto,
                rules: vec![],
                name: String::new(),
                version: String::new(),
                author: String::new(),
                description: String::new(),
            },
        ];

        let partitions: Vec<String> =
            ["system", "vendor", "product"].iter().map(|s| s.to_string()).collect();

        // only m1 active: vendor content does not count
        let active = active_partitions(&modules, &["m1".to_string()], &partitions);
        assert_eq!(active, vec!["system"]);

        let active = active_partitions(
            &modules,
            &["m1".to_string(), "m2".to_string()],
            &partitions,
        );
        assert_eq!(active, vec!["system", "vendor"]);
    }

    #[test]
    fn mismatch_warnings_only_for_version_skew() {
        assert!(mismatch_warning(HymoFsStatus::Available).is_empty());
        assert!(mismatch_warning(HymoFsStatus::NotPresent).is_empty());
        assert!(!mismatch_warning(HymoFsStatus::KernelTooOld).is_empty());
        assert!(!mismatch_warning(HymoFsStatus::ModuleTooOld).is_empty());
    }
}
