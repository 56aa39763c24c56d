// Copyright 2026 Hymo Daemon Authors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    collections::HashSet,
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use anyhow::Result;
use procfs::process::Process;
use serde::Serialize;

use crate::{
    conf::config::Config,
    defs::{
        DISABLE_FILE_NAME, MODULE_RULES_FILE_NAME, REMOVE_FILE_NAME, SKIP_MOUNT_FILE_NAME,
    },
};

/// Mount strategy, used both as module default and per-path rule mode.
/// `Auto` only appears as a module default; `Hide` only in rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    Auto,
    #[serde(rename = "hymofs")]
    HymoFs,
    Overlay,
    Magic,
    Hide,
    None,
}

impl MountMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Some(MountMode::Auto),
            // "kernel" is accepted as a synonym in configs
            "hymofs" | "kernel" => Some(MountMode::HymoFs),
            "overlay" => Some(MountMode::Overlay),
            "magic" => Some(MountMode::Magic),
            "hide" => Some(MountMode::Hide),
            "none" => Some(MountMode::None),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MountMode::Auto => "auto",
            MountMode::HymoFs => "hymofs",
            MountMode::Overlay => "overlay",
            MountMode::Magic => "magic",
            MountMode::Hide => "hide",
            MountMode::None => "none",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PathRule {
    pub path: String,
    pub mode: MountMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct Module {
    pub id: String,
    #[serde(rename = "path")]
    pub source_path: PathBuf,
    pub mode: MountMode,
    pub rules: Vec<PathRule>,
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
}

/// Longest-prefix rule lookup. Among rules whose path equals `path` or is a
/// proper directory ancestor of it, the longest wins; equal lengths resolve
/// to the later declaration.
pub fn match_rule<'a>(rules: &'a [PathRule], path: &str) -> Option<&'a PathRule> {
    let mut best: Option<&PathRule> = None;
    let mut max_len = 0usize;

    for rule in rules {
        let matches = path == rule.path
            || (path.len() > rule.path.len()
                && path.starts_with(rule.path.as_str())
                && path.as_bytes()[rule.path.len()] == b'/');
        if matches && rule.path.len() >= max_len {
            max_len = rule.path.len();
            best = Some(rule);
        }
    }

    best
}

impl Module {
    /// Effective mode for a virtual path, falling back to `resolved_default`
    /// when no rule matches.
    pub fn effective_mode(&self, resolved_default: MountMode, virtual_path: &str) -> MountMode {
        match_rule(&self.rules, virtual_path)
            .map(|rule| rule.mode)
            .unwrap_or(resolved_default)
    }
}

fn parse_module_prop(module_path: &Path, module: &mut Module) {
    let prop_file = module_path.join("module.prop");
    let Ok(file) = fs::File::open(&prop_file) else {
        return;
    };

    for line in BufReader::new(file).lines().map_while(|l| l.ok()) {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "name" => module.name = value.to_string(),
            "version" => module.version = value.to_string(),
            "author" => module.author = value.to_string(),
            "description" => module.description = value.to_string(),
            "mode" => {
                if let Some(mode) = MountMode::parse(value) {
                    module.mode = mode;
                } else {
                    log::warn!("Module {}: unknown mode '{}'", module.id, value);
                }
            }
            _ => {}
        }
    }
}

/// `path = mode` lines from the module's own rule file.
fn parse_module_rules(module_path: &Path, module: &mut Module) {
    let rules_file = module_path.join(MODULE_RULES_FILE_NAME);
    let Ok(content) = fs::read_to_string(&rules_file) else {
        return;
    };

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((path, mode)) = line.split_once('=') else {
            continue;
        };
        let path = path.trim();
        let Some(mode) = MountMode::parse(mode.trim()) else {
            log::warn!("Module {}: skipping rule with unknown mode: {line}", module.id);
            continue;
        };
        module.rules.push(PathRule { path: path.to_string(), mode });
    }
}

/// Scan the source directory for enabled modules.
///
/// Rule precedence: the module's own rule file loads first, config-file rules
/// after it, so a config rule on the same path overrides. A config-file mode
/// entry replaces the module's declared default mode. The result is sorted by
/// id descending: higher id means higher priority in overlay stacks.
pub fn scan(source_dir: &Path, config: &Config) -> Result<Vec<Module>> {
    let mut modules = Vec::new();

    if !source_dir.exists() {
        return Ok(modules);
    }

    for entry in fs::read_dir(source_dir)?.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let id = entry.file_name().to_string_lossy().to_string();
        if id == "hymo" || id == "lost+found" || id == ".git" {
            continue;
        }
        if path.join(DISABLE_FILE_NAME).exists()
            || path.join(REMOVE_FILE_NAME).exists()
            || path.join(SKIP_MOUNT_FILE_NAME).exists()
        {
            continue;
        }

        let mut module = Module {
            id: id.clone(),
            source_path: path.clone(),
            mode: MountMode::Auto,
            rules: Vec::new(),
            name: String::new(),
            version: String::new(),
            author: String::new(),
            description: String::new(),
        };

        parse_module_rules(&path, &mut module);
        if let Some(config_rules) = config.module_rules.get(&id) {
            for rule in config_rules {
                let Some(mode) = MountMode::parse(&rule.mode) else {
                    log::warn!("Config rule for {id}: unknown mode '{}'", rule.mode);
                    continue;
                };
                module.rules.push(PathRule { path: rule.path.clone(), mode });
            }
        }

        parse_module_prop(&path, &mut module);

        if let Some(global_mode) = config.module_modes.get(&id) {
            if let Some(mode) = MountMode::parse(global_mode) {
                module.mode = mode;
            } else {
                log::warn!("Config mode for {id}: unknown mode '{global_mode}'");
            }
        }

        modules.push(module);
    }

    modules.sort_by(|a, b| b.id.cmp(&a.id));

    Ok(modules)
}

fn is_mountpoint(path: &str) -> bool {
    if let Ok(process) = Process::myself()
        && let Ok(mountinfo) = process.mountinfo()
    {
        return mountinfo
            .into_iter()
            .any(|m| m.mount_point.to_string_lossy() == path);
    }
    false
}

/// Immediate module children that shadow a real mounted root directory and
/// are not already a known partition or packaging artifact.
pub fn scan_partition_candidates(source_dir: &Path) -> Vec<String> {
    let mut candidates = HashSet::new();

    if !source_dir.exists() {
        return Vec::new();
    }

    let ignored: HashSet<&str> = [
        "META-INF", "common", "system", "vendor", "product", "system_ext", "odm", "oem",
        ".git", ".github", "lost+found",
    ]
    .into_iter()
    .collect();

    let Ok(entries) = fs::read_dir(source_dir) else {
        return Vec::new();
    };

    for mod_entry in entries.flatten() {
        if !mod_entry.path().is_dir() {
            continue;
        }
        let Ok(children) = fs::read_dir(mod_entry.path()) else {
            continue;
        };
        for entry in children.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if ignored.contains(name.as_str()) {
                continue;
            }

            let root_path_str = format!("/{name}");
            let root_path = Path::new(&root_path_str);
            if root_path.is_dir() && is_mountpoint(&root_path_str) {
                candidates.insert(name);
            }
        }
    }

    let mut result: Vec<String> = candidates.into_iter().collect();
    result.sort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_module(dir: &Path, id: &str) -> PathBuf {
        let path = dir.join(id);
        fs::create_dir_all(path.join("system")).unwrap();
        fs::write(path.join("module.prop"), format!("id={id}\nname={id}\n")).unwrap();
        path
    }

    #[test]
    fn scan_returns_ids_descending() {
        let dir = tempfile::tempdir().unwrap();
        for id in ["a01", "c03", "b02"] {
            make_module(dir.path(), id);
        }

        let modules = scan(dir.path(), &Config::default()).unwrap();
        let ids: Vec<&str> = modules.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["c03", "b02", "a01"]);
    }

    #[test]
    fn markers_and_reserved_names_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        make_module(dir.path(), "keep");
        let disabled = make_module(dir.path(), "disabled");
        fs::write(disabled.join(DISABLE_FILE_NAME), b"").unwrap();
        let removed = make_module(dir.path(), "removed");
        fs::write(removed.join(REMOVE_FILE_NAME), b"").unwrap();
        let skipped = make_module(dir.path(), "skipped");
        fs::write(skipped.join(SKIP_MOUNT_FILE_NAME), b"").unwrap();
        fs::create_dir_all(dir.path().join("lost+found")).unwrap();

        let modules = scan(dir.path(), &Config::default()).unwrap();
        let ids: Vec<&str> = modules.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["keep"]);
    }

    #[test]
    fn prop_mode_and_config_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_module(dir.path(), "m1");
        fs::write(path.join("module.prop"), "id=m1\nmode=magic\n").unwrap();

        let modules = scan(dir.path(), &Config::default()).unwrap();
        assert_eq!(modules[0].mode, MountMode::Magic);

        // config-file mode replaces the declared default
        let mut config = Config::default();
        config.module_modes =
            HashMap::from([("m1".to_string(), "overlay".to_string())]);
        let modules = scan(dir.path(), &config).unwrap();
        assert_eq!(modules[0].mode, MountMode::Overlay);
    }

    #[test]
    fn config_rules_append_after_module_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_module(dir.path(), "m1");
        fs::write(path.join(MODULE_RULES_FILE_NAME), "/system/fonts = magic\n").unwrap();

        let mut config = Config::default();
        config.module_rules = HashMap::from([(
            "m1".to_string(),
            vec![crate::conf::config::ModuleRuleConfig {
                path: "/system/fonts".to_string(),
                mode: "overlay".to_string(),
            }],
        )]);

        let modules = scan(dir.path(), &config).unwrap();
        let module = &modules[0];
        assert_eq!(module.rules.len(), 2);
        // config rule declared later wins the exact-path tie
        assert_eq!(
            module.effective_mode(MountMode::HymoFs, "/system/fonts/Roboto.ttf"),
            MountMode::Overlay
        );
    }

    #[test]
    fn longest_prefix_match_wins() {
        let rules = vec![
            PathRule { path: "/a".to_string(), mode: MountMode::Magic },
            PathRule { path: "/a/b".to_string(), mode: MountMode::Overlay },
        ];
        let module = Module {
            id: "m".into(),
            source_path: PathBuf::new(),
            mode: MountMode::HymoFs,
            rules,
            name: String::new(),
            version: String::new(),
            author: String::new(),
            description: String::new(),
        };

        assert_eq!(
            module.effective_mode(MountMode::HymoFs, "/a/b/c/f"),
            MountMode::Overlay
        );
        assert_eq!(module.effective_mode(MountMode::HymoFs, "/a/x/f"), MountMode::Magic);
        assert_eq!(module.effective_mode(MountMode::HymoFs, "/other"), MountMode::HymoFs);
        // "/ab" must not match the "/a" prefix rule
        assert_eq!(module.effective_mode(MountMode::HymoFs, "/ab"), MountMode::HymoFs);
    }

    #[test]
    fn mode_parsing_accepts_kernel_alias() {
        assert_eq!(MountMode::parse("hymofs"), Some(MountMode::HymoFs));
        assert_eq!(MountMode::parse("kernel"), Some(MountMode::HymoFs));
        assert_eq!(MountMode::parse("MAGIC"), Some(MountMode::Magic));
        assert_eq!(MountMode::parse("bogus"), None);
    }
}
