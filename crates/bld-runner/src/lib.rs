// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Drives a [`Build`] to completion: constructs a [`bld_solver::Solver`],
//! spawns `Workers` concurrent tasks that each pull a ready node, run its
//! fingerprint → cache-probe → restore-or-execute → export-save workflow,
//! and report it done.

mod source_table;

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
    time::Instant,
};

use bld_container::ContainerDriver;
use bld_model::{Build, Step, StepExec};
use bld_store::{BlobStore, ImageStore};
use fs_err as fs;
use log::{debug, info};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use source_table::SourceTable;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io")]
    Io(#[from] std::io::Error),
    #[error("digest")]
    Digest(#[from] bld_digest::Error),
    #[error("store")]
    Store(#[from] bld_store::Error),
    #[error("container")]
    Container(#[from] bld_container::Error),
    #[error("source not found: {0}")]
    SourceNotFound(String),
    #[error("step not found: {0}")]
    StepNotFound(String),
    #[error("import source {0} has no recorded digest")]
    MissingDigest(String),
    #[error("cancelled")]
    Cancelled,
    #[error("worker task panicked")]
    Join,
}

/// Runs a [`Build`]: state shared by every worker task.
pub struct Runner {
    build: Build,
    root_dir: PathBuf,
    build_dir: PathBuf,
    store: Arc<dyn BlobStore>,
    images: Arc<dyn ImageStore>,
    driver: Arc<dyn ContainerDriver>,
    workers: usize,
    sources: SourceTable,
    steps: StdMutex<HashMap<String, String>>,
}

impl Runner {
    pub fn new(
        build: Build,
        root_dir: PathBuf,
        build_dir: PathBuf,
        store: Arc<dyn BlobStore>,
        images: Arc<dyn ImageStore>,
        driver: Arc<dyn ContainerDriver>,
        workers: usize,
    ) -> Self {
        let sources = SourceTable::seed_volumes(&build);
        Self {
            build,
            root_dir,
            build_dir,
            store,
            images,
            driver,
            workers: workers.max(1),
            sources,
            steps: StdMutex::new(HashMap::new()),
        }
    }

    /// `digest_strings` over every recorded step digest, sorted by step
    /// name. Summarises the whole build once it has finished.
    pub fn checksum(&self) -> String {
        let steps = self.steps.lock().unwrap();
        let mut names: Vec<&String> = steps.keys().collect();
        names.sort();
        let digests: Vec<String> = names.into_iter().map(|name| steps[name].clone()).collect();
        bld_digest::digest_strings(digests)
    }

    /// Constructs the Solver over `self.build`, spawns `workers` tasks, and
    /// waits for them. Returns the first error reported by any worker, if
    /// any. `cancel` is shared with every worker and the solver's producer
    /// task; a worker error cancels it, unblocking its peers.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), Error> {
        let solver = Arc::new(bld_solver::Solver::new(&self.build, cancel.clone()));

        info!("starting build {}", self.build.id);

        let (err_tx, mut err_rx) = mpsc::channel(self.workers);

        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let runner = self.clone();
            let solver = solver.clone();
            let cancel = cancel.clone();
            let err_tx = err_tx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let id = match solver.select().await {
                        Ok(id) => id,
                        Err(bld_solver::Error::Finished) => return,
                        Err(bld_solver::Error::Cancelled) => return,
                    };

                    debug!("worker {worker} starting {id}");
                    match runner.run_node(&id).await {
                        Ok(()) => {
                            debug!("worker {worker} finished {id}");
                            solver.done(&id);
                        }
                        Err(e) => {
                            debug!("worker {worker} failed {id}: {e}");
                            cancel.cancel();
                            let _ = err_tx.send(e).await;
                            return;
                        }
                    }
                }
            }));
        }
        drop(err_tx);

        for handle in handles {
            let _ = handle.await;
        }

        if let Some(err) = err_rx.recv().await {
            return Err(err);
        }

        info!("finished ({})", self.checksum());
        Ok(())
    }

    async fn run_node(&self, id: &str) -> Result<(), Error> {
        match id.strip_prefix("source/") {
            Some(name) => self.run_source(name).await,
            None => self.run_step(id).await,
        }
    }

    async fn run_source(&self, name: &str) -> Result<(), Error> {
        let source = self.build.source(name).ok_or_else(|| Error::SourceNotFound(name.to_owned()))?.clone();

        let root_dir = self.root_dir.clone();
        let build_dir = self.build_dir.clone();
        let sources = self.sources.clone();

        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            let src_dir = root_dir.join(&source.target);
            let digest = if source.files.is_empty() {
                bld_digest::digest_dir(&src_dir)?
            } else {
                bld_digest::digest_files(&src_dir, &source.files)?
            };

            let dest_dir = build_dir.join("sources/work").join(&digest);
            if !dest_dir.exists() {
                source_table::copy_tree(&src_dir, &dest_dir)?;
            }

            sources.set(&source.name, dest_dir, Some(digest));
            Ok(())
        })
        .await
        .map_err(|_| Error::Join)??;

        Ok(())
    }

    async fn run_step(&self, name: &str) -> Result<(), Error> {
        let step = self.build.step(name).ok_or_else(|| Error::StepNotFound(name.to_owned()))?.clone();
        let start = Instant::now();

        let mut import_digests = Vec::with_capacity(step.imports.len());
        for import in &step.imports {
            let digest = self
                .sources
                .digest(&import.source)
                .ok_or_else(|| Error::MissingDigest(import.source.clone()))?;
            import_digests.push(digest);
        }
        let step_digest = bld_digest::digest_strings(import_digests);
        self.steps.lock().unwrap().insert(step.name.clone(), step_digest.clone());

        info!("STEP: {} ({})", step.name, step_digest);
        let key = format!("step/{step_digest}");

        match self.store.get_key(&key) {
            Ok(_) => {
                info!("> {}: step cached", step.name);
                let exec = self.step_exec(&step, &step_digest);
                if step.save.is_some() {
                    let rootfs = self.driver.committed_rootfs(&exec);
                    self.images.restore(&step.name, &step_digest, &rootfs)?;
                }
                self.restore_exports(&step, &step_digest).await?;
            }
            Err(bld_store::Error::NotFound(_)) => {
                debug!("{}: step not cached, running", step.name);
                self.prepare_exports(&step).await?;

                let exec = self.step_exec(&step, &step_digest);
                let driver = self.driver.clone();
                let exec_for_blocking = exec.clone();
                tokio::task::spawn_blocking(move || driver.execute(&exec_for_blocking))
                    .await
                    .map_err(|_| Error::Join)??;

                if step.save.is_some() {
                    let rootfs = self.driver.committed_rootfs(&exec);
                    self.images.save(&step.name, &step_digest, &rootfs)?;
                }

                self.save_exports(&step, &step_digest).await?;
                self.store.put_key(&key, "")?;
            }
            Err(e) => return Err(e.into()),
        }

        info!("> {}: step finished ({:?})", step.name, start.elapsed());
        Ok(())
    }

    fn step_exec(&self, step: &Step, step_digest: &str) -> StepExec {
        StepExec {
            step: step.clone(),
            step_digest: step_digest.to_owned(),
            source_dirs: self.sources.snapshot(),
            build_dir: self.build_dir.clone(),
            build_id: self.build.id.clone(),
            root_dir: self.root_dir.clone(),
        }
    }

    fn export_dir(&self, name: &str) -> PathBuf {
        self.build_dir.join("sources/mount").join(&self.build.id).join(name)
    }

    async fn prepare_exports(&self, step: &Step) -> Result<(), Error> {
        for export in &step.exports {
            let dir = self.export_dir(&export.source);
            fs::create_dir_all(&dir)?;
            self.sources.set(&export.source, dir, None);
        }
        Ok(())
    }

    async fn restore_exports(&self, step: &Step, step_digest: &str) -> Result<(), Error> {
        for export in &step.exports {
            let source_digest = self.store.get_key(&format!("export/{step_digest}"))?;
            let dir = self.export_dir(&export.source);
            self.store.load_dir(&source_digest, &dir)?;
            self.sources.set(&export.source, dir, Some(source_digest));
        }
        Ok(())
    }

    async fn save_exports(&self, step: &Step, step_digest: &str) -> Result<(), Error> {
        for export in &step.exports {
            let dir = self.export_dir(&export.source);
            let source_digest = bld_digest::digest_dir(&dir)?;
            self.store.put_key(&format!("export/{step_digest}"), &source_digest)?;
            self.store.save_dir(&source_digest, &dir)?;
            self.sources.set(&export.source, dir, Some(source_digest));
        }
        Ok(())
    }
}
