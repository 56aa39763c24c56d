// Copyright 2026 Hymo Daemon Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Synthetic tree for magic mount. Strictly tree shaped: every node owns its
//! children, moving a partition out from under `system` is a move, never a
//! link.

use std::{
    collections::BTreeMap,
    fmt,
    fs,
    os::unix::fs::{FileTypeExt, MetadataExt},
    path::{Path, PathBuf},
};

use anyhow::Result;

use crate::{defs::REPLACE_DIR_FILE_NAME, utils};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFileType {
    RegularFile,
    Directory,
    Symlink,
    Whiteout,
}

impl NodeFileType {
    pub fn from_file_type(file_type: fs::FileType) -> Option<Self> {
        if file_type.is_file() {
            Some(NodeFileType::RegularFile)
        } else if file_type.is_dir() {
            Some(NodeFileType::Directory)
        } else if file_type.is_symlink() {
            Some(NodeFileType::Symlink)
        } else {
            None
        }
    }
}

#[derive(Clone)]
pub struct Node {
    pub name: String,
    pub file_type: NodeFileType,
    pub children: BTreeMap<String, Node>,
    // Module side source for this entry; None for host-backed scaffolding
    pub module_path: Option<PathBuf>,
    pub replace: bool,
    pub skip: bool,
}

impl Node {
    pub fn new_root<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            file_type: NodeFileType::Directory,
            children: BTreeMap::new(),
            module_path: None,
            replace: false,
            skip: false,
        }
    }

    /// Merge one module partition directory into this node. Later modules
    /// win on conflicting entries. Returns true if any file, symlink or
    /// whiteout was collected.
    pub fn collect_module_files<P: AsRef<Path>>(&mut self, module_dir: P) -> Result<bool> {
        let dir = module_dir.as_ref();
        let mut has_file = false;

        for entry in dir.read_dir()?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let path = entry.path();
            let metadata = path.symlink_metadata()?;
            let file_type = metadata.file_type();

            if file_type.is_dir() {
                let node = self
                    .children
                    .entry(name.clone())
                    .or_insert_with(|| Node::new_root(&name));

                // A module directory over a previously collected non-directory
                // replaces it outright
                if node.file_type != NodeFileType::Directory {
                    *node = Node::new_root(&name);
                }

                node.module_path = Some(path.clone());
                node.replace = node.replace || is_replace_dir(&path);
                has_file |= node.collect_module_files(&path)?;
                // An opaque directory hides everything beneath it, so it is
                // meaningful content even when empty
                has_file |= node.replace;
            } else {
                let node_type = if file_type.is_char_device() && metadata.rdev() == 0 {
                    NodeFileType::Whiteout
                } else if let Some(t) = NodeFileType::from_file_type(file_type) {
                    t
                } else {
                    log::debug!("Ignoring special file: {}", path.display());
                    continue;
                };

                let node = Node {
                    name: name.clone(),
                    file_type: node_type,
                    children: BTreeMap::new(),
                    module_path: Some(path),
                    replace: false,
                    skip: false,
                };
                self.children.insert(name, node);
                has_file = true;
            }
        }

        Ok(has_file)
    }
}

fn is_replace_dir(path: &Path) -> bool {
    path.join(REPLACE_DIR_FILE_NAME).exists() || utils::get_overlay_opaque(path)
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_node(node: &Node, depth: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let tag = match node.file_type {
                NodeFileType::RegularFile => "file",
                NodeFileType::Directory => "dir",
                NodeFileType::Symlink => "link",
                NodeFileType::Whiteout => "whiteout",
            };
            let name = if node.name.is_empty() { "/" } else { &node.name };
            writeln!(
                f,
                "{}{} [{}]{}",
                "  ".repeat(depth),
                name,
                tag,
                if node.replace { " (replace)" } else { "" }
            )?;
            for child in node.children.values() {
                write_node(child, depth + 1, f)?;
            }
            Ok(())
        }
        write_node(self, 0, f)
    }
}
