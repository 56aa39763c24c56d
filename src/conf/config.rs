// Copyright 2026 Hymo Daemon Authors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    collections::HashMap,
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::defs;

pub const CONFIG_FILE_DEFAULT: &str = "/data/adb/hymo/config.toml";

/// Storage backend preference for the staging root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    Auto,
    Ext4,
    Erofs,
}

impl FsType {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "ext4" => FsType::Ext4,
            "erofs" => FsType::Erofs,
            _ => FsType::Auto,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FsType::Auto => "auto",
            FsType::Ext4 => "ext4",
            FsType::Erofs => "erofs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleRuleConfig {
    pub path: String,
    pub mode: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub moduledir: PathBuf,
    pub tempdir: Option<PathBuf>,
    pub mountsource: String,
    pub verbose: bool,
    pub fs_type: FsType,
    pub disable_umount: bool,
    pub enable_nuke: bool,
    pub ignore_protocol_mismatch: bool,
    pub enable_kernel_debug: bool,
    pub enable_stealth: bool,
    pub avc_spoof: bool,
    pub mirror_path: Option<String>,
    pub partitions: Vec<String>,
    #[serde(skip)]
    pub module_modes: HashMap<String, String>,
    #[serde(skip)]
    pub module_rules: HashMap<String, Vec<ModuleRuleConfig>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            moduledir: PathBuf::from(defs::MODULE_DIR),
            tempdir: None,
            mountsource: defs::OVERLAY_SOURCE.to_string(),
            verbose: false,
            fs_type: FsType::Auto,
            disable_umount: false,
            enable_nuke: false,
            ignore_protocol_mismatch: false,
            enable_kernel_debug: false,
            enable_stealth: false,
            avc_spoof: false,
            mirror_path: None,
            partitions: Vec::new(),
            module_modes: HashMap::new(),
            module_rules: HashMap::new(),
        }
    }
}

fn strip_value(raw: &str) -> &str {
    raw.trim().trim_matches('"')
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "true" | "1" | "on")
}

impl Config {
    pub fn load_default() -> Result<Self> {
        let default_path = Path::new(CONFIG_FILE_DEFAULT);
        if default_path.exists() {
            Self::from_file(default_path)
        } else {
            let mut config = Config::default();
            config.load_module_overrides();
            Ok(config)
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Cannot open config file {}", path.display()))?;
        let mut config = Self::from_str_content(&content);
        config.load_module_overrides();
        Ok(config)
    }

    /// Line oriented `key = value` with optional double quotes. Unknown keys
    /// are skipped so newer configs keep loading on older daemons.
    fn from_str_content(content: &str) -> Self {
        let mut config = Config::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = strip_value(value);

            match key {
                "moduledir" => config.moduledir = PathBuf::from(value),
                "tempdir" => {
                    if !value.is_empty() {
                        config.tempdir = Some(PathBuf::from(value));
                    }
                }
                "mountsource" => config.mountsource = value.to_string(),
                "verbose" => config.verbose = parse_bool(value),
                "fs_type" => config.fs_type = FsType::parse(value),
                // Legacy spelling, kept so old installs keep their backend
                "force_ext4" => {
                    if parse_bool(value) {
                        config.fs_type = FsType::Ext4;
                    }
                }
                "disable_umount" => config.disable_umount = parse_bool(value),
                "enable_nuke" => config.enable_nuke = parse_bool(value),
                "ignore_protocol_mismatch" => {
                    config.ignore_protocol_mismatch = parse_bool(value)
                }
                "enable_kernel_debug" => config.enable_kernel_debug = parse_bool(value),
                "enable_stealth" => config.enable_stealth = parse_bool(value),
                "avc_spoof" => config.avc_spoof = parse_bool(value),
                "mirror_path" => {
                    if !value.is_empty() {
                        config.mirror_path = Some(value.to_string());
                    }
                }
                "partitions" => {
                    config.partitions = value
                        .split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                _ => log::debug!("Skipping unknown config key: {key}"),
            }
        }

        config
    }

    fn load_module_overrides(&mut self) {
        self.module_modes = load_module_modes(&module_mode_file());
        self.module_rules = load_module_rules(&module_rules_file());
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let mut out = String::from("# Hymo Configuration\n");
        writeln!(out, "moduledir = \"{}\"", self.moduledir.display())?;
        if let Some(tempdir) = &self.tempdir {
            writeln!(out, "tempdir = \"{}\"", tempdir.display())?;
        }
        writeln!(out, "mountsource = \"{}\"", self.mountsource)?;
        writeln!(out, "verbose = {}", self.verbose)?;
        writeln!(out, "fs_type = \"{}\"", self.fs_type.as_str())?;
        writeln!(out, "disable_umount = {}", self.disable_umount)?;
        writeln!(out, "enable_nuke = {}", self.enable_nuke)?;
        writeln!(out, "ignore_protocol_mismatch = {}", self.ignore_protocol_mismatch)?;
        writeln!(out, "enable_kernel_debug = {}", self.enable_kernel_debug)?;
        writeln!(out, "enable_stealth = {}", self.enable_stealth)?;
        writeln!(out, "avc_spoof = {}", self.avc_spoof)?;
        if let Some(mirror) = &self.mirror_path {
            writeln!(out, "mirror_path = \"{mirror}\"")?;
        }
        if !self.partitions.is_empty() {
            writeln!(out, "partitions = \"{}\"", self.partitions.join(","))?;
        }

        crate::utils::atomic_write(path, out)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    pub fn merge_with_cli(
        &mut self,
        moduledir: Option<PathBuf>,
        tempdir: Option<PathBuf>,
        mountsource: Option<String>,
        verbose: bool,
        partitions: Vec<String>,
    ) {
        if let Some(dir) = moduledir {
            self.moduledir = dir;
        }
        if let Some(dir) = tempdir {
            self.tempdir = Some(dir);
        }
        if let Some(source) = mountsource {
            self.mountsource = source;
        }
        if verbose {
            self.verbose = true;
        }
        if !partitions.is_empty() {
            self.partitions = partitions;
        }
    }
}

pub fn module_mode_file() -> PathBuf {
    Path::new(defs::BASE_DIR).join("module_mode.conf")
}

pub fn module_rules_file() -> PathBuf {
    Path::new(defs::BASE_DIR).join("module_rules.conf")
}

/// `module_id = mode` lines.
pub fn load_module_modes(path: &Path) -> HashMap<String, String> {
    let mut modes = HashMap::new();
    let Ok(content) = fs::read_to_string(path) else {
        return modes;
    };

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((id, mode)) = line.split_once('=') {
            let id = id.trim();
            let mode = mode.trim().to_ascii_lowercase();
            if !id.is_empty() && !mode.is_empty() {
                modes.insert(id.to_string(), mode);
            }
        }
    }

    modes
}

pub fn save_module_modes(path: &Path, modes: &HashMap<String, String>) -> Result<()> {
    let mut out = String::new();
    out.push_str("# HymoFS Module Modes Configuration\n");
    out.push_str("# Format: module_id = mode\n");
    out.push_str("# Modes: auto, hymofs, overlay, magic, none\n\n");

    let mut ids: Vec<_> = modes.keys().collect();
    ids.sort();
    for id in ids {
        writeln!(out, "{id} = {}", modes[id])?;
    }

    crate::utils::atomic_write(path, out).context("Failed to write module modes")
}

/// `module_id:absolute_path = mode` lines.
pub fn load_module_rules(path: &Path) -> HashMap<String, Vec<ModuleRuleConfig>> {
    let mut rules: HashMap<String, Vec<ModuleRuleConfig>> = HashMap::new();
    let Ok(content) = fs::read_to_string(path) else {
        return rules;
    };

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((id, rest)) = line.split_once(':') else {
            continue;
        };
        let Some((path, mode)) = rest.split_once('=') else {
            continue;
        };

        let id = id.trim();
        let path = path.trim();
        let mode = mode.trim().to_ascii_lowercase();
        if id.is_empty() || path.is_empty() || mode.is_empty() {
            continue;
        }

        rules.entry(id.to_string()).or_default().push(ModuleRuleConfig {
            path: path.to_string(),
            mode,
        });
    }

    rules
}

pub fn save_module_rules(
    path: &Path,
    rules: &HashMap<String, Vec<ModuleRuleConfig>>,
) -> Result<()> {
    let mut out = String::new();
    out.push_str("# HymoFS Module Rules Configuration\n");
    out.push_str("# Format: module_id:path = mode\n");
    out.push_str("# Modes: hymofs, overlay, magic, hide, none\n\n");

    let mut ids: Vec<_> = rules.keys().collect();
    ids.sort();
    for id in ids {
        for rule in &rules[id] {
            writeln!(out, "{id}:{} = {}", rule.path, rule.mode)?;
        }
    }

    crate::utils::atomic_write(path, out).context("Failed to write module rules")
}
