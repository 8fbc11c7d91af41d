// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::util;

/// Resolved directories a build runs against: the content-addressed
/// store, the per-build scratch area, and the directory source targets
/// are resolved relative to.
pub struct Env {
    pub store_dir: PathBuf,
    pub build_dir: PathBuf,
    pub root_dir: PathBuf,
}

impl Env {
    pub fn new(store_dir: Option<PathBuf>, build_dir: Option<PathBuf>, root_dir: Option<PathBuf>) -> Result<Self, Error> {
        let is_root = util::is_root();

        let store_dir = resolve_store_dir(is_root, store_dir)?;
        let build_dir = resolve_build_dir(is_root, build_dir)?;
        let root_dir = root_dir.map_or_else(std::env::current_dir, Ok)?;

        util::ensure_dir_exists(&store_dir)?;
        util::ensure_dir_exists(&build_dir)?;

        Ok(Self {
            store_dir,
            build_dir,
            root_dir,
        })
    }
}

fn resolve_store_dir(is_root: bool, custom: Option<PathBuf>) -> Result<PathBuf, Error> {
    if let Some(dir) = custom {
        Ok(dir)
    } else if is_root {
        Ok(PathBuf::from("/var/cache/bld/store"))
    } else {
        Ok(dirs::cache_dir().ok_or(Error::UserCache)?.join("bld/store"))
    }
}

fn resolve_build_dir(is_root: bool, custom: Option<PathBuf>) -> Result<PathBuf, Error> {
    if let Some(dir) = custom {
        Ok(dir)
    } else if is_root {
        Ok(PathBuf::from("/var/cache/bld/build"))
    } else {
        Ok(dirs::cache_dir().ok_or(Error::UserCache)?.join("bld/build"))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot find cache dir, $XDG_CACHE_HOME or $HOME env not set")]
    UserCache,
    #[error("io")]
    Io(#[from] io::Error),
}
