// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Content-addressed byte storage and a small key/value table, plus image
//! persistence. These are the external collaborators the spec calls
//! `BlobStore` and `ImageStore`; only their interfaces are load-bearing for
//! the core engine. [`local`] provides a filesystem-backed implementation
//! good enough to run and test against.

use std::{io::Read, path::Path};

use thiserror::Error;

pub mod local;

pub use local::{LocalBlobStore, LocalImageStore};

/// Opaque content-addressed byte store, plus a small key/value table.
pub trait BlobStore: Send + Sync {
    /// Persist the directory at `dir` under the opaque content id `id`.
    fn save_dir(&self, id: &str, dir: &Path) -> Result<(), Error>;
    /// Restore the directory previously saved under `id` into `dir`.
    fn load_dir(&self, id: &str, dir: &Path) -> Result<(), Error>;
    /// Persist a byte stream under `id` (used for image archives).
    fn save_stream(&self, id: &str, reader: &mut dyn Read) -> Result<(), Error>;
    /// Open a reader over the byte stream previously saved under `id`.
    fn load_stream(&self, id: &str) -> Result<Box<dyn Read + Send>, Error>;
    /// Write `value` under `key` in the key/value table.
    fn put_key(&self, key: &str, value: &str) -> Result<(), Error>;
    /// Read the value under `key`. `Err(Error::NotFound)` if absent.
    fn get_key(&self, key: &str) -> Result<String, Error>;
}

/// Persist and restore a committed container image by `(name, digest)`.
///
/// The underlying mechanism (registry push/pull, daemon load/save, or a tar
/// of a root filesystem) is implementation specific; the core only relies on
/// this interface.
pub trait ImageStore: Send + Sync {
    /// Save the root filesystem at `rootfs` as the image `name:digest`.
    fn save(&self, name: &str, digest: &str, rootfs: &Path) -> Result<(), Error>;
    /// Restore the image `name:digest` into `rootfs`.
    fn restore(&self, name: &str, digest: &str, rootfs: &Path) -> Result<(), Error>;
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("key not found: {0}")]
    NotFound(String),
}
