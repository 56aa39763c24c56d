// Copyright 2026 Hymo Daemon Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Feedback into the daemon's own module.prop and the module list endpoint.

use std::{fs, path::Path};

use anyhow::Result;
use serde::Serialize;

use crate::{
    conf::config::Config,
    core::inventory::{self, Module, MountMode},
    defs,
    utils,
};

fn build_description(
    success: bool,
    storage_mode: &str,
    nuke_active: bool,
    overlay_count: usize,
    magic_count: usize,
    hymofs_count: usize,
    warning_msg: &str,
) -> String {
    let mut desc = format!("{} Hymo", if success { "😋" } else { "😭" });
    if nuke_active {
        desc.push_str(" 🐾");
    }
    desc.push_str(&format!(
        " | fs: {storage_mode} | Modules: {hymofs_count} HymoFS + {overlay_count} Overlay + {magic_count} Magic"
    ));
    if !warning_msg.is_empty() {
        desc.push(' ');
        desc.push_str(warning_msg);
    }
    desc
}

fn rewrite_prop(content: &str, description: &str, name: &str) -> String {
    let mut out = String::new();
    let mut desc_updated = false;
    let mut name_updated = false;

    for line in content.lines() {
        if line.starts_with("description=") {
            out.push_str(&format!("description={description}\n"));
            desc_updated = true;
        } else if line.starts_with("name=") {
            out.push_str(&format!("name={name}\n"));
            name_updated = true;
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }

    if !desc_updated {
        out.push_str(&format!("description={description}\n"));
    }
    if !name_updated {
        out.push_str(&format!("name={name}\n"));
    }

    out
}

/// One-line run summary written into the daemon's module.prop so module
/// managers surface it without talking to the daemon.
#[allow(clippy::too_many_arguments)]
pub fn update_description(
    success: bool,
    storage_mode: &str,
    nuke_active: bool,
    overlay_count: usize,
    magic_count: usize,
    hymofs_count: usize,
    warning_msg: &str,
    hymofs_active: bool,
) {
    let path = Path::new(defs::MODULE_PROP_FILE);
    if !path.exists() {
        log::warn!("module.prop not found, skipping update");
        return;
    }

    let description = build_description(
        success,
        storage_mode,
        nuke_active,
        overlay_count,
        magic_count,
        hymofs_count,
        warning_msg,
    );
    let name = if hymofs_active { "Hymo - HymoFS Enabled" } else { "Hymo" };

    match fs::read_to_string(path) {
        Ok(content) => {
            let updated = rewrite_prop(&content, &description, name);
            if let Err(e) = fs::write(path, updated) {
                log::error!("Failed to update module.prop: {}", e);
            } else {
                log::debug!("Updated module.prop description and name");
            }
        }
        Err(e) => log::error!("Failed to read module.prop: {}", e),
    }
}

#[derive(Serialize)]
struct ModuleListing<'a> {
    count: usize,
    modules: Vec<ModuleEntry<'a>>,
}

#[derive(Serialize)]
struct ModuleEntry<'a> {
    #[serde(flatten)]
    module: &'a Module,
    strategy: &'static str,
}

fn has_content(module: &Module, extra_partitions: &[String]) -> bool {
    defs::BUILTIN_PARTITIONS
        .iter()
        .map(|p| module.source_path.join(p))
        .chain(extra_partitions.iter().map(|p| module.source_path.join(p)))
        .any(|part| utils::has_files_recursive(&part))
}

/// JSON module list for the WebUI, with the strategy each module resolves to
/// under the current peer capability.
pub fn print_module_list(config: &Config, kernel_ready: bool) -> Result<()> {
    let modules = inventory::scan(&config.moduledir, config)?;

    let filtered: Vec<&Module> = modules
        .iter()
        .filter(|m| has_content(m, &config.partitions))
        .collect();

    let entries: Vec<ModuleEntry> = filtered
        .iter()
        .map(|module| {
            let strategy = match module.mode {
                MountMode::Auto => {
                    if kernel_ready {
                        "hymofs"
                    } else {
                        "overlay"
                    }
                }
                other => other.as_str(),
            };
            ModuleEntry { module, strategy }
        })
        .collect();

    let listing = ModuleListing { count: entries.len(), modules: entries };
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_carries_counts_and_warning() {
        let desc = build_description(true, "tmpfs", false, 2, 1, 3, "");
        assert_eq!(desc, "😋 Hymo | fs: tmpfs | Modules: 3 HymoFS + 2 Overlay + 1 Magic");

        let desc = build_description(false, "error", true, 0, 0, 0, "⚠️kernel too old");
        assert!(desc.starts_with("😭 Hymo 🐾"));
        assert!(desc.ends_with("⚠️kernel too old"));
    }

    #[test]
    fn prop_rewrite_replaces_or_appends() {
        let content = "id=hymo\nname=Hymo\nversion=v1\ndescription=old\n";
        let updated = rewrite_prop(content, "new desc", "Hymo - HymoFS Enabled");
        assert!(updated.contains("description=new desc\n"));
        assert!(updated.contains("name=Hymo - HymoFS Enabled\n"));
        assert!(updated.contains("version=v1\n"));
        assert!(!updated.contains("description=old"));

        // prop file missing both keys gets them appended
        let updated = rewrite_prop("id=hymo\n", "d", "n");
        assert!(updated.ends_with("description=d\nname=n\n"));
    }
}
