// Copyright 2026 Hymo Daemon Authors
// SPDX-License-Identifier: GPL-3.0-or-later

mod cli;
mod conf;
mod core;
mod defs;
mod mount;
mod try_umount;
mod utils;

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use clap::Parser;

use crate::cli::{ApiCommands, Cli, Commands, ConfigCommands, HymofsCommands, ModuleCommands};
use crate::conf::config::{self, CONFIG_FILE_DEFAULT, Config};
use crate::core::{
    MountEngine, active_partitions, executor, inventory, mismatch_warning, modules as mod_info,
    planner, state::RuntimeState, storage, sync,
};
use crate::mount::hymofs;

fn load_config(cli: &Cli) -> Result<Config> {
    if let Some(config_path) = &cli.config {
        return Config::from_file(config_path);
    }
    match Config::load_default() {
        Ok(config) => Ok(config),
        Err(e) => {
            if Path::new(CONFIG_FILE_DEFAULT).exists() {
                eprintln!("Error loading config: {e:#}");
            }
            Ok(Config::default())
        }
    }
}

fn parse_toggle(value: &str) -> bool {
    matches!(value, "on" | "1" | "true")
}

/// Priority for the staging/mirror root in kernel mode:
/// configured mirror path, then tempdir, then the builtin default.
fn effective_mirror_dir(config: &Config) -> PathBuf {
    if let Some(mirror) = &config.mirror_path {
        PathBuf::from(mirror)
    } else if let Some(tempdir) = &config.tempdir {
        tempdir.clone()
    } else {
        PathBuf::from(defs::HYMO_MIRROR_DEV)
    }
}

fn all_partitions(config: &Config) -> Vec<String> {
    let mut partitions: Vec<String> =
        defs::BUILTIN_PARTITIONS.iter().map(|s| s.to_string()).collect();
    partitions.extend(config.partitions.iter().cloned());
    partitions.sort();
    partitions.dedup();
    partitions
}

/// Everything failed upstream of mounting: magic-mount straight from the
/// module source tree so the device still boots with its modules.
fn source_magic_fallback(config: &Config) -> Result<()> {
    log::warn!("Staging unavailable. Falling back to magic mount from source.");

    let modules = inventory::scan(&config.moduledir, config)?;
    let mut plan = planner::MountPlan::default();

    for module in &modules {
        let has_content = all_partitions(config)
            .iter()
            .any(|part| utils::has_files_recursive(&module.source_path.join(part)));
        if has_content {
            plan.magic_module_paths.push(module.source_path.clone());
            plan.magic_module_ids.push(module.id.clone());
        }
    }

    let result = executor::execute(&plan, config, false)?;

    let runtime_state = RuntimeState {
        storage_mode: "source".to_string(),
        mount_point: config.moduledir.to_string_lossy().to_string(),
        pid: std::process::id(),
        magic_module_ids: result.magic_module_ids.clone(),
        ..Default::default()
    };
    if let Err(e) = runtime_state.save() {
        log::error!("Failed to save runtime state: {e:#}");
    }

    mod_info::update_description(
        true,
        "source",
        false,
        0,
        result.magic_module_ids.len(),
        0,
        "",
        false,
    );
    Ok(())
}

fn cmd_mount(config: Config) -> Result<()> {
    utils::camouflage_process("kworker/u9:1")?;
    utils::ensure_dir_exists(defs::RUN_DIR)?;

    if config.disable_umount {
        log::warn!("Namespace detach (try_umount) is DISABLED.");
    }

    let status = hymofs::check_status();
    let kernel_ready = planner::use_kernel(status, config.ignore_protocol_mismatch);
    if !mismatch_warning(status).is_empty() {
        log::warn!("HymoFS protocol mismatch: {}", mismatch_warning(status));
    }

    let mnt_base = if kernel_ready {
        log::info!("Mode: HymoFS fast path");
        effective_mirror_dir(&config)
    } else {
        log::info!("Mode: standard Overlay/Magic");
        PathBuf::from(defs::FALLBACK_CONTENT_DIR)
    };
    let img_path = Path::new(defs::BASE_DIR).join("modules.img");

    let staged = MountEngine::new(config.clone(), status)
        .init_storage(&mnt_base, &img_path)
        .and_then(MountEngine::scan_and_sync);

    match staged {
        Ok(engine) => engine.generate_plan()?.execute()?.finalize(),
        Err(e) if kernel_ready => {
            log::error!("Staging setup failed: {e:#}");
            source_magic_fallback(&config)
        }
        Err(e) => Err(e),
    }
}

/// Re-scan and reapply kernel rules without touching overlay or magic
/// mounts left from boot.
fn cmd_reload(config: Config) -> Result<()> {
    if !hymofs::is_available() {
        bail!("HymoFS not available, cannot hot reload");
    }

    log::info!("Reloading HymoFS mappings...");
    let staging_root = effective_mirror_dir(&config);

    let mut modules = inventory::scan(&config.moduledir, &config)?;
    modules.retain(|module| {
        if Path::new(defs::HOT_UNMOUNT_DIR).join(&module.id).exists() {
            log::info!("Skipping hot-unmounted module: {}", module.id);
            return false;
        }
        all_partitions(&config)
            .iter()
            .any(|part| utils::has_files_recursive(&module.source_path.join(part)))
    });

    sync::perform_sync(&modules, &staging_root, &config.partitions, false)?;

    let mut plan = planner::generate(
        &config,
        &modules,
        &staging_root,
        hymofs::check_status(),
    )?;
    planner::segregate_custom_rules(&mut plan, &staging_root);
    planner::update_kernel_rules(&config, &modules, &staging_root, &mut plan)?;

    if let Err(e) = hymofs::clear_rules() {
        log::warn!("HymoFS clear before reload failed: {e:#}");
    }
    let failed = executor::apply_kernel_ops(&plan.kernel_ops);
    if failed > 0 {
        log::warn!("{failed} kernel rules failed to apply");
    }

    if let Err(e) = hymofs::set_stealth(config.enable_stealth) {
        log::warn!("Failed to set stealth mode: {e:#}");
    }
    if config.enable_stealth
        && let Err(e) = hymofs::fix_mounts()
    {
        log::warn!("Failed to fix mount namespace after reload: {e:#}");
    }

    let mut state = RuntimeState::load().unwrap_or_default();
    if state.storage_mode.is_empty() {
        state.storage_mode = "hymofs".to_string();
    }
    state.mount_point = staging_root.to_string_lossy().to_string();
    state.hymofs_module_ids = plan.hymofs_module_ids.clone();
    state.active_mounts =
        active_partitions(&modules, &plan.hymofs_module_ids, &all_partitions(&config));
    state.save()?;

    log::info!("Reload complete.");
    Ok(())
}

fn module_partition_dirs(config: &Config, module_path: &Path) -> Vec<(String, PathBuf)> {
    all_partitions(config)
        .into_iter()
        .map(|part| {
            let dir = module_path.join(&part);
            (part, dir)
        })
        .filter(|(_, dir)| dir.is_dir())
        .collect()
}

fn cmd_module_add(config: &Config, id: &str) -> Result<()> {
    utils::validate_module_id(id)?;
    let module_path = config.moduledir.join(id);
    if !module_path.exists() {
        bail!("Module not found: {id}");
    }

    // Drop the hot-removal marker first so a concurrent reload keeps the
    // module active
    let _ = fs::remove_file(Path::new(defs::HOT_UNMOUNT_DIR).join(id));

    let mut installed = 0;
    for (part, dir) in module_partition_dirs(config, &module_path) {
        let target_base = PathBuf::from(format!("/{part}"));
        if hymofs::add_rules_from_directory(&target_base, &dir)? {
            installed += 1;
        }
    }

    if installed == 0 {
        println!("No content found to add for module {id}");
        return Ok(());
    }

    let mut state = RuntimeState::load().unwrap_or_default();
    if !state.hymofs_module_ids.iter().any(|existing| existing == id) {
        state.hymofs_module_ids.push(id.to_string());
        state.save()?;
    }

    println!("Successfully added module {id}");
    log::info!("CLI: Added module {id}");
    Ok(())
}

fn cmd_module_delete(config: &Config, id: &str) -> Result<()> {
    utils::validate_module_id(id)?;
    let module_path = config.moduledir.join(id);

    // Marker first: a reload racing this command must not resurrect the
    // rules being removed
    utils::ensure_dir_exists(defs::HOT_UNMOUNT_DIR)?;
    fs::write(Path::new(defs::HOT_UNMOUNT_DIR).join(id), b"")?;

    let mut removed = 0;
    for (part, dir) in module_partition_dirs(config, &module_path) {
        let target_base = PathBuf::from(format!("/{part}"));
        if hymofs::remove_rules_from_directory(&target_base, &dir)? {
            removed += 1;
        }
    }

    if removed == 0 {
        println!("No active rules found or removed for module {id}");
        return Ok(());
    }

    let mut state = RuntimeState::load().unwrap_or_default();
    let before = state.hymofs_module_ids.len();
    state.hymofs_module_ids.retain(|existing| existing != id);
    if state.hymofs_module_ids.len() != before {
        state.save()?;
    }

    println!("Successfully removed rules for module {id}");
    log::info!("CLI: Removed rules for module {id}");
    Ok(())
}

fn cmd_clear() -> Result<()> {
    if !hymofs::is_available() {
        bail!("HymoFS not available");
    }
    hymofs::clear_rules().context("Failed to clear HymoFS rules")?;

    let mut state = RuntimeState::load().unwrap_or_default();
    state.hymofs_module_ids.clear();
    state.save()?;

    println!("Successfully cleared all HymoFS rules.");
    log::info!("User manually cleared all HymoFS rules via CLI");
    Ok(())
}

fn cmd_sync_partitions(cli: &Cli, config: &mut Config) -> Result<()> {
    let candidates = inventory::scan_partition_candidates(&config.moduledir);

    let mut added = 0;
    for candidate in candidates {
        let builtin = defs::BUILTIN_PARTITIONS.contains(&candidate.as_str());
        if !builtin && !config.partitions.contains(&candidate) {
            println!("Added partition: {candidate}");
            config.partitions.push(candidate);
            added += 1;
        }
    }

    if added > 0 {
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_DEFAULT));
        config.save_to_file(&config_path)?;
        println!("Updated config with {added} new partitions.");
    } else {
        println!("No new partitions found.");
    }
    Ok(())
}

fn cmd_hymofs(cli: &Cli, command: &HymofsCommands) -> Result<()> {
    match command {
        HymofsCommands::Version => {
            println!("HymoFS Protocol Version: {}", hymofs::EXPECTED_PROTOCOL_VERSION);
            match hymofs::get_protocol_version() {
                Ok(version) => println!("HymoFS Kernel Version: {version}"),
                Err(_) => println!("HymoFS not available."),
            }
        }
        HymofsCommands::List => {
            print!("{}", hymofs::get_active_rules()?);
        }
        HymofsCommands::Debug { state } => {
            hymofs::set_debug(parse_toggle(state))?;
            println!(
                "Kernel debug logging {}.",
                if parse_toggle(state) { "enabled" } else { "disabled" }
            );
        }
        HymofsCommands::Enable { state } => {
            hymofs::set_enabled(parse_toggle(state))?;
            println!(
                "HymoFS {}.",
                if parse_toggle(state) { "enabled" } else { "disabled" }
            );
        }
        HymofsCommands::Stealth { state } => {
            hymofs::set_stealth(parse_toggle(state))?;
            println!(
                "Stealth mode {}.",
                if parse_toggle(state) { "enabled" } else { "disabled" }
            );
        }
        HymofsCommands::AvcSpoof { state } => {
            hymofs::set_avc_log_spoofing(parse_toggle(state))?;
            println!(
                "AVC log spoofing {}.",
                if parse_toggle(state) { "enabled" } else { "disabled" }
            );
        }
        HymofsCommands::SetMirror { path } => {
            let mut config = load_config(cli)?;
            config.mirror_path = Some(path.clone());
            let config_path = cli
                .config
                .clone()
                .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_DEFAULT));
            config.save_to_file(&config_path)?;
            println!("Mirror path set to: {path}");

            if hymofs::is_available() {
                hymofs::set_mirror_path(Path::new(path))?;
                println!("Applied mirror path to kernel.");
            }
        }
        HymofsCommands::Uname { release, version } => {
            hymofs::set_uname(release, version)?;
            println!("Spoofed uname to {release} / {version}");
        }
        HymofsCommands::Raw { args } => {
            let Some(cmd) = args.first().map(String::as_str) else {
                bail!("Usage: hymod hymofs raw <add|hide|delete|merge|clear> [args...]");
            };
            match (cmd, &args[1..]) {
                ("add", [src, target, rest @ ..]) => {
                    let kind = match rest.first().map(|s| s.parse::<i32>()) {
                        Some(Ok(1)) => hymofs::RuleKind::Fifo,
                        Some(Ok(2)) => hymofs::RuleKind::Chr,
                        Some(Ok(4)) => hymofs::RuleKind::Dir,
                        Some(Ok(6)) => hymofs::RuleKind::Blk,
                        Some(Ok(8)) | None => hymofs::RuleKind::Reg,
                        Some(Ok(10)) => hymofs::RuleKind::Lnk,
                        Some(Ok(12)) => hymofs::RuleKind::Sock,
                        _ => hymofs::RuleKind::Unknown,
                    };
                    hymofs::add_rule(Path::new(src), Path::new(target), kind)?;
                }
                ("hide", [path]) => hymofs::hide_path(Path::new(path))?,
                ("delete", [target]) => hymofs::delete_rule(Path::new(target))?,
                ("merge", [src, target]) => {
                    hymofs::add_merge_rule(Path::new(src), Path::new(target))?
                }
                ("clear", []) => hymofs::clear_rules()?,
                _ => bail!("Unknown or malformed raw command: {cmd}"),
            }
            println!("Command executed successfully.");
            log::info!("Executed raw command: {cmd}");
        }
    }
    Ok(())
}

fn cmd_module(cli: &Cli, command: &ModuleCommands) -> Result<()> {
    match command {
        ModuleCommands::List => {
            let config = load_config(cli)?;
            let kernel_ready = hymofs::is_available();
            mod_info::print_module_list(&config, kernel_ready)?;
        }
        ModuleCommands::Add { id } => {
            let config = load_config(cli)?;
            cmd_module_add(&config, id)?;
        }
        ModuleCommands::Delete { id } => {
            let config = load_config(cli)?;
            cmd_module_delete(&config, id)?;
        }
        ModuleCommands::SetMode { id, mode } => {
            utils::validate_module_id(id)?;
            if inventory::MountMode::parse(mode).is_none() {
                bail!("Unknown mode '{mode}' (expected auto, hymofs, overlay, magic, none)");
            }
            let path = config::module_mode_file();
            let mut modes = config::load_module_modes(&path);
            modes.insert(id.clone(), mode.to_ascii_lowercase());
            config::save_module_modes(&path, &modes)?;
            println!("Set mode for {id} to {mode}");
        }
        ModuleCommands::AddRule { id, path, mode } => {
            utils::validate_module_id(id)?;
            if inventory::MountMode::parse(mode).is_none() {
                bail!("Unknown mode '{mode}' (expected hymofs, overlay, magic, hide, none)");
            }
            let rules_path = config::module_rules_file();
            let mut rules = config::load_module_rules(&rules_path);
            let module_rules = rules.entry(id.clone()).or_default();
            if let Some(rule) = module_rules.iter_mut().find(|r| &r.path == path) {
                rule.mode = mode.to_ascii_lowercase();
            } else {
                module_rules.push(config::ModuleRuleConfig {
                    path: path.clone(),
                    mode: mode.to_ascii_lowercase(),
                });
            }
            config::save_module_rules(&rules_path, &rules)?;
            println!("Added rule for {id}: {path} -> {mode}");
        }
        ModuleCommands::RemoveRule { id, path } => {
            let rules_path = config::module_rules_file();
            let mut rules = config::load_module_rules(&rules_path);
            let Some(module_rules) = rules.get_mut(id) else {
                println!("Module not found in rules.");
                return Ok(());
            };
            let before = module_rules.len();
            module_rules.retain(|r| &r.path != path);
            if module_rules.len() == before {
                println!("Rule not found.");
            } else {
                if module_rules.is_empty() {
                    rules.remove(id);
                }
                config::save_module_rules(&rules_path, &rules)?;
                println!("Removed rule for {id}: {path}");
            }
        }
    }
    Ok(())
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // Commands that only read or write configuration come first; they must
    // not require the daemon environment
    match &cli.command {
        Commands::Config(ConfigCommands::Gen { output }) => {
            let path = output
                .clone()
                .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_DEFAULT));
            Config::default().save_to_file(&path)?;
            println!("Generated config: {}", path.display());
            return Ok(());
        }
        Commands::Config(ConfigCommands::Show) => {
            let config = load_config(&cli)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            return Ok(());
        }
        _ => {}
    }

    let mut config = load_config(&cli)?;
    config.merge_with_cli(
        cli.moduledir.clone(),
        cli.tempdir.clone(),
        cli.mountsource.clone(),
        cli.verbose,
        cli.partitions.clone(),
    );

    utils::init_logging(config.verbose)?;

    match &cli.command {
        Commands::Mount => cmd_mount(config),
        Commands::Clear => cmd_clear(),
        Commands::FixMounts => {
            if !hymofs::is_available() {
                bail!("HymoFS not available");
            }
            hymofs::fix_mounts()?;
            println!("Mount namespace fixed (mnt_id reordered).");
            Ok(())
        }
        Commands::Reload => cmd_reload(config),
        Commands::SyncPartitions => cmd_sync_partitions(&cli, &mut config),
        Commands::Config(_) => unreachable!("handled above"),
        Commands::Module(command) => cmd_module(&cli, command),
        Commands::Hymofs(command) => cmd_hymofs(&cli, command),
        Commands::Api(ApiCommands::Storage) => storage::print_status(),
        Commands::Api(ApiCommands::Modules) => {
            mod_info::print_module_list(&config, hymofs::is_available())
        }
        Commands::Api(ApiCommands::State) => {
            let state = RuntimeState::load().unwrap_or_default();
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        Commands::Hide { path } => {
            hymofs::hide_path(Path::new(path))?;
            println!("Hidden: {path}");
            Ok(())
        }
        Commands::Debug { state } => {
            hymofs::set_debug(parse_toggle(state))?;
            println!(
                "Kernel debug logging {}.",
                if parse_toggle(state) { "enabled" } else { "disabled" }
            );
            Ok(())
        }
    }
}

/// Fatal errors leave a degraded state file behind so the UI can show that
/// the run failed; already-installed mounts are not rolled back.
fn write_degraded_state() {
    let mut state = RuntimeState::load().unwrap_or_default();
    state.storage_mode = "error".to_string();
    state.pid = std::process::id();
    if let Err(e) = state.save() {
        log::error!("Failed to write degraded state: {e:#}");
    }
    mod_info::update_description(false, "error", false, 0, 0, 0, "", false);
}

fn main() {
    if let Err(e) = run() {
        log::error!("Fatal Error: {e:#}");
        eprintln!("Fatal Error: {e:#}");
        write_degraded_state();
        std::process::exit(1);
    }
}
