// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Content-addressed fingerprinting of directory trees, file subsets and
//! ordered sets of strings. All hashes are SHA-256, lowercase hex encoded.

use std::{io, path::Path};

use fs_err as fs;
use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// Digest a directory tree, walking in lexicographic order.
///
/// Every entry's path (relative to `root`) is fed into the hash; regular
/// files additionally contribute their bytes. Directory bodies and symlink
/// targets are never read.
pub fn digest_dir(root: impl AsRef<Path>) -> Result<String, Error> {
    let root = root.as_ref();

    let mut hasher = Sha256::new();
    walk(root, root, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Digest an explicit subset of files under `root`, in the order supplied.
pub fn digest_files<S: AsRef<str>>(root: impl AsRef<Path>, files: &[S]) -> Result<String, Error> {
    let root = root.as_ref();

    let mut hasher = Sha256::new();
    for file in files {
        let rel = file.as_ref();
        let path = root.join(rel);

        hasher.update(rel.as_bytes());

        let bytes = fs::read(&path)?;
        hasher.update(&bytes);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digest an ordered set of strings. The strings are sorted lexicographically
/// first, so the result does not depend on call-site ordering.
pub fn digest_strings<S: AsRef<str>>(strs: impl IntoIterator<Item = S>) -> String {
    let mut sorted = strs.into_iter().map(|s| s.as_ref().to_owned()).collect::<Vec<_>>();
    sorted.sort();

    let mut hasher = Sha256::new();
    for s in &sorted {
        hasher.update(s.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn walk(root: &Path, dir: &Path, hasher: &mut Sha256) -> Result<(), Error> {
    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, io::Error>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let rel = path.strip_prefix(root).expect("entry is under root");

        hasher.update(rel.to_string_lossy().as_bytes());

        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            continue;
        } else if file_type.is_dir() {
            walk(root, &path, hasher)?;
        } else {
            let bytes = fs::read(&path)?;
            hasher.update(&bytes);
        }
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
}
