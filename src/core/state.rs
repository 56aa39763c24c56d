// Copyright 2026 Hymo Daemon Authors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{defs, utils};

/// Post-run snapshot for out-of-band inspection (WebUI, CLI status verbs).
/// The daemon is the only writer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeState {
    #[serde(default)]
    pub storage_mode: String,
    #[serde(default)]
    pub mount_point: String,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub nuke_active: bool,
    #[serde(default)]
    pub hymofs_mismatch: bool,
    #[serde(default)]
    pub mismatch_message: String,
    #[serde(default)]
    pub overlay_module_ids: Vec<String>,
    #[serde(default)]
    pub magic_module_ids: Vec<String>,
    #[serde(default)]
    pub hymofs_module_ids: Vec<String>,
    #[serde(default)]
    pub active_mounts: Vec<String>,
}

/// Hand-edited or older state files may carry trailing commas; strip them
/// outside of strings so the strict parser accepts the document.
fn strip_trailing_commas(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = raw.chars().collect();

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            out.push(c);
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next_meaning = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if !matches!(next_meaning, Some(']') | Some('}')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }

    out
}

impl RuntimeState {
    pub fn from_json(raw: &str) -> Result<Self> {
        match serde_json::from_str(raw) {
            Ok(state) => Ok(state),
            Err(_) => serde_json::from_str(&strip_trailing_commas(raw))
                .context("Failed to parse runtime state"),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json(&raw)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(defs::STATE_FILE))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            utils::ensure_dir_exists(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        utils::atomic_write(path, json).context("Failed to save runtime state")
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(Path::new(defs::STATE_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_id_arrays_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon_state.json");

        let state = RuntimeState {
            storage_mode: "tmpfs".into(),
            mount_point: "/dev/hymo_mirror".into(),
            pid: 4242,
            nuke_active: false,
            hymofs_mismatch: true,
            mismatch_message: "kernel too old".into(),
            overlay_module_ids: vec!["zmod".into(), "amod".into()],
            magic_module_ids: vec!["m2".into()],
            hymofs_module_ids: vec!["k9".into(), "k1".into(), "k5".into()],
            active_mounts: vec!["system".into(), "vendor".into()],
        };
        state.save_to(&path).unwrap();

        let loaded = RuntimeState::load_from(&path).unwrap();
        assert_eq!(loaded.overlay_module_ids, vec!["zmod", "amod"]);
        assert_eq!(loaded.hymofs_module_ids, vec!["k9", "k1", "k5"]);
        assert_eq!(loaded.active_mounts, vec!["system", "vendor"]);
        assert_eq!(loaded.storage_mode, "tmpfs");
        assert!(loaded.hymofs_mismatch);
        assert_eq!(loaded.pid, 4242);
    }

    #[test]
    fn loader_tolerates_trailing_commas_and_unknown_keys() {
        let raw = r#"{
            "storage_mode": "ext4",
            "mount_point": "/data/adb/hymo/img_mnt",
            "nuke_active": false,
            "webui_theme": "dark",
            "overlay_module_ids": ["a", "b",],
            "magic_module_ids": [],
        }"#;

        let state = RuntimeState::from_json(raw).unwrap();
        assert_eq!(state.storage_mode, "ext4");
        assert_eq!(state.overlay_module_ids, vec!["a", "b"]);
        assert!(state.magic_module_ids.is_empty());
        // absent keys default
        assert!(state.hymofs_module_ids.is_empty());
        assert!(!state.hymofs_mismatch);
    }

    #[test]
    fn commas_inside_strings_survive_sanitizing() {
        let raw = r#"{"mismatch_message": "a, b,]", "storage_mode": "tmpfs",}"#;
        let state = RuntimeState::from_json(raw).unwrap();
        assert_eq!(state.mismatch_message, "a, b,]");
    }
}
