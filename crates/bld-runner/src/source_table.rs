// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Process-wide `name -> {local_dir, digest}` map, written once per name by
//! the worker that produced it and read by every downstream worker.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use bld_model::Build;
use fs_err as fs;

#[derive(Debug, Clone)]
struct Entry {
    dir: PathBuf,
    digest: Option<String>,
}

/// Cheap to clone: shares the underlying map via `Arc`.
#[derive(Debug, Clone, Default)]
pub struct SourceTable {
    inner: Arc<RwLock<HashMap<String, Entry>>>,
}

impl SourceTable {
    /// Seeds one entry per `Volume`, directory only, no digest. Volumes
    /// appear in snapshots but are never fingerprinted.
    pub fn seed_volumes(build: &Build) -> Self {
        let mut map = HashMap::new();
        for volume in &build.volumes {
            map.insert(
                volume.name.clone(),
                Entry {
                    dir: PathBuf::from(&volume.target),
                    digest: None,
                },
            );
        }
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    /// Records (or overwrites) `name`'s directory and optional digest.
    pub fn set(&self, name: &str, dir: PathBuf, digest: Option<String>) {
        self.inner.write().unwrap().insert(name.to_owned(), Entry { dir, digest });
    }

    pub fn dir(&self, name: &str) -> Option<PathBuf> {
        self.inner.read().unwrap().get(name).map(|entry| entry.dir.clone())
    }

    pub fn digest(&self, name: &str) -> Option<String> {
        self.inner.read().unwrap().get(name).and_then(|entry| entry.digest.clone())
    }

    /// A plain `name -> dir` copy, handed to the container driver.
    pub fn snapshot(&self) -> HashMap<String, PathBuf> {
        self.inner
            .read()
            .unwrap()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.dir.clone()))
            .collect()
    }
}

pub(crate) fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use bld_model::Source;

    use super::*;

    #[test]
    fn seeds_one_entry_per_volume_without_a_digest() {
        let build = Build {
            id: "1".into(),
            name: "b".into(),
            volumes: vec![Source {
                name: "cache".into(),
                target: "/var/cache".into(),
                files: vec![],
            }],
            sources: vec![],
            steps: vec![],
            requires: vec![],
        };

        let table = SourceTable::seed_volumes(&build);
        assert_eq!(table.dir("cache"), Some(PathBuf::from("/var/cache")));
        assert_eq!(table.digest("cache"), None);
    }

    #[test]
    fn set_then_get_round_trips() {
        let table = SourceTable::default();
        table.set("r1", PathBuf::from("/work/r1"), Some("deadbeef".into()));

        assert_eq!(table.dir("r1"), Some(PathBuf::from("/work/r1")));
        assert_eq!(table.digest("r1"), Some("deadbeef".to_owned()));
        assert_eq!(table.snapshot().get("r1"), Some(&PathBuf::from("/work/r1")));
    }
}
