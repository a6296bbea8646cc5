// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! Argument grammar for the `meshctl` binary (§6 "CLI surface").

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[clap(name = "meshctl", author, version, about = "Operate a meshctl cluster node", long_about = None)]
#[clap(propagate_version = true, disable_help_subcommand = true)]
pub struct Cli {
    /// Directory holding this node's persisted config, tasks, and groups.
    #[clap(long, global = true, env = "MESHCTL_HOME", default_value = ".")]
    pub home: PathBuf,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Copy every document from one store into another, chunk by chunk.
    Migrate {
        #[clap(subcommand)]
        target: MigrateTarget,
    },
    /// Create one or more services for a task.
    Create {
        #[clap(subcommand)]
        by: CreateBy,
    },
    /// Inspect or act on services (`service list`, `service <pattern> <action>`).
    Service(ServiceArgs),
    /// Manage service templates on disk.
    Template {
        #[clap(subcommand)]
        action: TemplateAction,
    },
    /// Configuration operations.
    Config {
        #[clap(subcommand)]
        action: ConfigAction,
    },
    /// Print the full command grammar.
    Help,
    /// Run the ordered shutdown sequence and exit.
    Shutdown,
}

#[derive(Subcommand, Debug)]
pub enum MigrateTarget {
    /// `migrate database <from> <to> [--chunk-size N]`
    Database {
        from: PathBuf,
        to: PathBuf,
        #[clap(long, default_value_t = 100)]
        chunk_size: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum CreateBy {
    /// `create by <task> <amount> [--start] [--id ...] [--memory MiB] [--node name]`
    By {
        task: String,
        amount: u32,
        #[clap(long)]
        start: bool,
        #[clap(long)]
        id: Option<u32>,
        #[clap(long)]
        memory: Option<u64>,
        #[clap(long)]
        node: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
pub struct ServiceArgs {
    /// `list`, or a glob matching service display names (e.g. `lobby-*`).
    pub pattern: String,
    /// start|stop|restart|delete|copy|cmd|screen — omitted for `service list`.
    pub action: Option<String>,
    /// Extra words, e.g. the console line for `cmd`.
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum TemplateAction {
    List,
    Create { name: String },
    Delete { name: String },
    Copy { name: String, destination: String },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    Reload,
}
