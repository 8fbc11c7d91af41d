// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use clap::{Args, Parser};
use thiserror::Error;

use crate::{env, Env};

mod run;
mod version;

#[derive(Debug, Parser)]
pub struct Command {
    #[command(flatten)]
    pub global: Global,
    #[command(subcommand)]
    pub subcommand: Option<Subcommand>,
}

#[derive(Debug, Args)]
pub struct Global {
    #[arg(
        short,
        long = "verbose",
        help = "Prints additional information about what bld is doing",
        default_value = "false",
        global = true
    )]
    pub verbose: bool,
    #[arg(long, global = true, help = "Content-addressed store directory")]
    pub store_dir: Option<PathBuf>,
    #[arg(long, global = true, help = "Per-build scratch directory")]
    pub build_dir: Option<PathBuf>,
    #[arg(long, global = true, help = "Directory source targets are resolved relative to")]
    pub root_dir: Option<PathBuf>,
}

#[derive(Debug, clap::Subcommand)]
pub enum Subcommand {
    Run(run::Command),
    Version(version::Command),
}

pub async fn process() -> Result<(), Error> {
    let Command { global, subcommand } = Command::parse();

    let env = Env::new(global.store_dir, global.build_dir, global.root_dir)?;

    if global.verbose {
        match subcommand {
            Some(Subcommand::Version(_)) => (),
            _ => version::print(),
        }
        println!("store directory: {:?}", env.store_dir);
        println!("build directory: {:?}", env.build_dir);
        println!("root directory: {:?}", env.root_dir);
    }

    match subcommand {
        Some(Subcommand::Run(command)) => run::handle(command, env).await?,
        Some(Subcommand::Version(command)) => version::handle(command),
        None => (),
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("run")]
    Run(#[from] run::Error),
    #[error("env")]
    Env(#[from] env::Error),
}
