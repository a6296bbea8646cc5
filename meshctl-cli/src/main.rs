// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! `meshctl` — the operator-facing entry point into one cluster node.
//!
//! Every subcommand loads (or lazily creates) this node's persisted
//! [`meshctl_core::Runtime`] and dispatches into `C8`/`C9`/the document
//! store directly; there is no separate daemon process this binary talks
//! to over RPC (§2's "operator request (CLI or RPC) enters C8" names the
//! CLI as one of two equally-valid entry paths into the same component).

use clap::{CommandFactory, Parser};

mod bootstrap;
mod cli;
mod commands;
mod error;

use cli::{Cli, Command};
use error::UsageError;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let home = cli.home.clone();
    match dispatch(cli).await {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            log::error!("meshctl command against {} failed: {err:#}", home.display());
            eprintln!("error: {err:#}");
            let exit_code = if err.downcast_ref::<UsageError>().is_some() { 2 } else { 1 };
            std::process::exit(exit_code);
        },
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Migrate { target } => commands::migrate::run(target).await,
        Command::Create { by } => {
            let runtime = bootstrap::load_runtime(&cli.home).await?;
            commands::create::run(&runtime, by).await
        },
        Command::Service(args) => {
            let runtime = bootstrap::load_runtime(&cli.home).await?;
            commands::service::run(&runtime, args).await
        },
        Command::Template { action } => commands::template::run(&cli.home, action).await,
        Command::Config { action } => commands::config::run(&cli.home, action).await,
        Command::Help => {
            Cli::command().print_long_help()?;
            println!();
            Ok(())
        },
        Command::Shutdown => {
            let runtime = bootstrap::load_runtime(&cli.home).await?;
            commands::shutdown::run(&runtime).await
        },
    }
}
