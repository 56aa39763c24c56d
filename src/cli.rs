// Copyright 2026 Hymo Daemon Authors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "hymod", version, about = "Hymo hybrid mount daemon")]
pub struct Cli {
    /// Config file path
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,
    /// Module directory
    #[arg(short = 'm', long = "moduledir")]
    pub moduledir: Option<PathBuf>,
    /// Temporary directory
    #[arg(short = 't', long = "tempdir")]
    pub tempdir: Option<PathBuf>,
    /// Mount source name
    #[arg(short = 's', long = "mountsource")]
    pub mountsource: Option<String>,
    /// Verbose logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
    /// Extra partitions (comma separated)
    #[arg(short = 'p', long = "partitions", value_delimiter = ',')]
    pub partitions: Vec<String>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compose and mount all modules (boot action)
    Mount,
    /// Clear all HymoFS rules
    Clear,
    /// Fix mount namespace issues (reorder mnt_id)
    FixMounts,
    /// Re-scan modules and reapply HymoFS rules without touching mounts
    Reload,
    /// Scan modules and add new partition candidates to the config
    SyncPartitions,
    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Module management
    #[command(subcommand)]
    Module(ModuleCommands),
    /// HymoFS kernel peer control
    #[command(subcommand)]
    Hymofs(HymofsCommands),
    /// JSON status endpoints for the WebUI
    #[command(subcommand)]
    Api(ApiCommands),
    /// Hide a single path via the kernel peer
    Hide { path: String },
    /// Toggle kernel debug logging
    Debug { state: String },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Generate a default config file
    Gen {
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },
    /// Show the effective configuration as JSON
    Show,
}

#[derive(Subcommand, Debug)]
pub enum ModuleCommands {
    /// List modules with metadata and rules as JSON
    List,
    /// Hot-add a module's rules to the live kernel peer
    Add { id: String },
    /// Hot-remove a module's rules from the live kernel peer
    Delete { id: String },
    /// Set the mount mode for a module (auto, hymofs, overlay, magic, none)
    SetMode { id: String, mode: String },
    /// Add or update a per-path rule for a module
    AddRule { id: String, path: String, mode: String },
    /// Remove a per-path rule for a module
    RemoveRule { id: String, path: String },
}

#[derive(Subcommand, Debug)]
pub enum HymofsCommands {
    /// Show expected and reported protocol versions
    Version,
    /// List active kernel rules
    List,
    /// Toggle kernel debug logging
    Debug { state: String },
    /// Enable or disable the peer without clearing its rules
    Enable { state: String },
    /// Toggle stealth mode
    Stealth { state: String },
    /// Toggle AVC log spoofing
    AvcSpoof { state: String },
    /// Set and persist the kernel mirror path
    SetMirror { path: String },
    /// Spoof uname release/version strings
    Uname { release: String, version: String },
    /// Issue a raw command (add/hide/delete/merge/clear)
    Raw { args: Vec<String> },
}

#[derive(Subcommand, Debug)]
pub enum ApiCommands {
    /// Storage usage as JSON
    Storage,
    /// Module list as JSON
    Modules,
    /// Raw runtime state document
    State,
}
