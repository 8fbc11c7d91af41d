// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Filesystem-backed [`BlobStore`]/[`ImageStore`]. Blobs are gzipped
//! tarballs under `<root>/store/content/<id>`; keys are flat files under
//! `<root>/store/keys/<key>` (the key's path separators are preserved, so
//! `step/<digest>` becomes a file at `store/keys/step/<digest>`).

use std::{
    io::Read,
    path::{Path, PathBuf},
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use fs_err::{self as fs, File};

use crate::{BlobStore, Error, ImageStore};

#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn content_path(&self, id: &str) -> PathBuf {
        self.root.join("store/content").join(id)
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root.join("store/keys").join(key)
    }
}

impl BlobStore for LocalBlobStore {
    fn save_dir(&self, id: &str, dir: &Path) -> Result<(), Error> {
        let dest = self.content_path(id);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(&dest)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut archive = tar::Builder::new(encoder);
        archive.append_dir_all(".", dir)?;
        archive.into_inner()?.finish()?;
        Ok(())
    }

    fn load_dir(&self, id: &str, dir: &Path) -> Result<(), Error> {
        fs::create_dir_all(dir)?;

        let file = File::open(self.content_path(id))?;
        let decoder = GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        archive.unpack(dir)?;
        Ok(())
    }

    fn save_stream(&self, id: &str, reader: &mut dyn Read) -> Result<(), Error> {
        let dest = self.content_path(id);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(dest)?;
        std::io::copy(reader, &mut file)?;
        Ok(())
    }

    fn load_stream(&self, id: &str) -> Result<Box<dyn Read + Send>, Error> {
        Ok(Box::new(File::open(self.content_path(id))?))
    }

    fn put_key(&self, key: &str, value: &str) -> Result<(), Error> {
        let dest = self.key_path(key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, value)?;
        Ok(())
    }

    fn get_key(&self, key: &str) -> Result<String, Error> {
        fs::read_to_string(self.key_path(key)).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(key.to_owned())
            } else {
                Error::Io(source)
            }
        })
    }
}

/// Persists a committed container image as a tarball in the same blob
/// store used for exports, keyed `image/<name>/<digest>`.
#[derive(Debug, Clone)]
pub struct LocalImageStore {
    blobs: LocalBlobStore,
}

impl LocalImageStore {
    pub fn new(blobs: LocalBlobStore) -> Self {
        Self { blobs }
    }

    fn image_id(name: &str, digest: &str) -> String {
        format!("image/{name}/{digest}")
    }
}

impl ImageStore for LocalImageStore {
    fn save(&self, name: &str, digest: &str, rootfs: &Path) -> Result<(), Error> {
        self.blobs.save_dir(&Self::image_id(name, digest), rootfs)
    }

    fn restore(&self, name: &str, digest: &str, rootfs: &Path) -> Result<(), Error> {
        self.blobs.load_dir(&Self::image_id(name, digest), rootfs)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn round_trips_a_directory() {
        let store_dir = tempdir().unwrap();
        let store = LocalBlobStore::new(store_dir.path());

        let src = tempdir().unwrap();
        fs::write(src.path().join("file.txt"), b"hello").unwrap();

        store.save_dir("abc123", src.path()).unwrap();

        let dest = tempdir().unwrap();
        store.load_dir("abc123", dest.path()).unwrap();

        assert_eq!(fs::read_to_string(dest.path().join("file.txt")).unwrap(), "hello");
    }

    #[test]
    fn keys_round_trip_and_preserve_path_separators() {
        let store_dir = tempdir().unwrap();
        let store = LocalBlobStore::new(store_dir.path());

        store.put_key("step/deadbeef", "").unwrap();
        store.put_key("export/deadbeef", "cafef00d").unwrap();

        assert_eq!(store.get_key("step/deadbeef").unwrap(), "");
        assert_eq!(store.get_key("export/deadbeef").unwrap(), "cafef00d");
        assert!(store_dir.path().join("store/keys/step/deadbeef").exists());
    }

    #[test]
    fn missing_key_is_not_found() {
        let store_dir = tempdir().unwrap();
        let store = LocalBlobStore::new(store_dir.path());

        let err = store.get_key("step/missing").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn image_store_round_trips_a_rootfs() {
        let store_dir = tempdir().unwrap();
        let images = LocalImageStore::new(LocalBlobStore::new(store_dir.path()));

        let rootfs = tempdir().unwrap();
        fs::write(rootfs.path().join("marker"), b"rootfs").unwrap();

        images.save("s1", "digest1", rootfs.path()).unwrap();

        let restored = tempdir().unwrap();
        images.restore("s1", "digest1", restored.path()).unwrap();

        assert_eq!(fs::read_to_string(restored.path().join("marker")).unwrap(), "rootfs");
    }
}
