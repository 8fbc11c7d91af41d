// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{path::PathBuf, sync::Arc};

use bld_container::NamespaceDriver;
use bld_model::Build;
use bld_store::{LocalBlobStore, LocalImageStore};
use clap::Parser;
use log::info;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::Env;

#[derive(Debug, Parser)]
#[command(about = "Run a build file to completion")]
pub struct Command {
    #[arg(default_value = "./build.yaml", help = "Path to the build file")]
    file: PathBuf,
    #[arg(short, long, default_value = "5", help = "Number of concurrent workers")]
    workers: usize,
}

pub async fn handle(command: Command, env: Env) -> Result<(), Error> {
    let build = ensure_build_id(bld_spec::read(&command.file)?);

    info!("running {} ({})", build.name, build.id);

    let blobs = LocalBlobStore::new(&env.store_dir);
    let images = LocalImageStore::new(blobs.clone());
    let driver = NamespaceDriver::new(env.store_dir.join("images"));

    let runner = Arc::new(bld_runner::Runner::new(
        build,
        env.root_dir,
        env.build_dir,
        Arc::new(blobs),
        Arc::new(images),
        Arc::new(driver),
        command.workers,
    ));

    runner.run(CancellationToken::new()).await?;
    Ok(())
}

/// A build file never carries its own run id; each invocation gets a fresh
/// one so re-running the same file twice doesn't collide in `build_dir`.
fn ensure_build_id(mut build: Build) -> Build {
    if build.id.is_empty() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        build.id = format!("{}-{nanos}", std::process::id());
    }
    build
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("spec")]
    Spec(#[from] bld_spec::Error),
    #[error("runner")]
    Runner(#[from] bld_runner::Error),
}
