// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! [`NamespaceDriver`]: a [`ContainerDriver`] built on the [`container`]
//! crate's Linux mount-namespace sandbox rather than an external container
//! runtime daemon.

use std::{
    fs::Permissions,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use bld_model::StepExec;
use container::Container;
use fs_err as fs;
use log::{debug, info};

use crate::{ensure_dir, entrypoint_file_name, entrypoint_script, resolve_binds, ContainerDriver, Error, WORKSPACE_MOUNT};

/// Drives a step by pivoting into a Linux mount namespace rooted at a copy
/// of the step's base image, executing the generated entrypoint script
/// inside it.
///
/// Pulling an image from a registry is out of scope (peripheral per spec);
/// `step.image` is resolved as a local directory usable directly as a root
/// filesystem, and cached under `cache_dir/images/<sanitized-ref>` so it is
/// only copied once per engine lifetime.
pub struct NamespaceDriver {
    cache_dir: PathBuf,
}

impl NamespaceDriver {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    fn workspace_root(&self, exec: &StepExec) -> PathBuf {
        exec.build_dir.join("workspaces").join(&exec.build_id).join(&exec.step.name)
    }

    fn resolve_base_image(&self, image: &str) -> Result<PathBuf, Error> {
        let cached = self.cache_dir.join("images").join(sanitize(image));
        if cached.exists() {
            return Ok(cached);
        }

        let source = Path::new(image);
        if !source.is_dir() {
            return Err(Error::ImageNotFound(image.to_owned()));
        }

        debug!("pulling image {image}");
        copy_dir(source, &cached)?;
        Ok(cached)
    }

}

impl ContainerDriver for NamespaceDriver {
    fn committed_rootfs(&self, exec: &StepExec) -> PathBuf {
        self.workspace_root(exec).join("rootfs")
    }

    fn execute(&self, exec: &StepExec) -> Result<(), Error> {
        let step = &exec.step;

        info!("pulling {}", step.image);
        let base = self.resolve_base_image(&step.image)?;

        let workspace_root = self.workspace_root(exec);
        let rootfs = workspace_root.join("rootfs");
        if rootfs.exists() {
            fs::remove_dir_all(&rootfs)?;
        }
        copy_dir(&base, &rootfs)?;

        let exec_dir = workspace_root.join("workspace");
        ensure_dir(&exec_dir)?;

        let entrypoint_name = entrypoint_file_name(&step.name);
        let entrypoint_path = exec_dir.join(&entrypoint_name);
        fs::write(&entrypoint_path, entrypoint_script(&step.commands))?;
        fs::set_permissions(&entrypoint_path, Permissions::from_mode(0o755))?;

        if let Some(user) = &step.user {
            if user != "root" {
                log::warn!("step {} requests user {user}, but the namespace driver always runs as root", step.name);
            }
        }

        let mut container = Container::new(&rootfs).bind(&exec_dir, WORKSPACE_MOUNT);
        for (host, guest) in resolve_binds(exec)? {
            container = container.bind(host, guest);
        }
        if let Some(workdir) = &step.workdir {
            container = container.work_dir(workdir);
        }

        debug!("creating container name={} step={:?}", step.name, step.name);
        let entrypoint_in_container = PathBuf::from(WORKSPACE_MOUNT).join(&entrypoint_name);
        let env = step.env.clone();

        let exit_code = container.run(move || {
            for entry in &env {
                if let Some((key, value)) = entry.split_once('=') {
                    std::env::set_var(key, value);
                }
            }
            let status = std::process::Command::new(&entrypoint_in_container).status()?;
            if status.success() {
                Ok(())
            } else {
                Err(format!("entrypoint exited with {status}").into())
            }
        })?;

        debug!("container finished code={exit_code}");
        if exit_code != 0 {
            return Err(Error::NonZeroExit(exit_code));
        }

        Ok(())
    }
}

fn sanitize(image: &str) -> String {
    image.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }).collect()
}

fn copy_dir(src: &Path, dest: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link_target = fs::read_link(entry.path())?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(link_target, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn resolve_base_image_copies_a_local_directory_once() {
        let cache = tempdir().unwrap();
        let driver = NamespaceDriver::new(cache.path());

        let image = tempdir().unwrap();
        fs::write(image.path().join("etc-release"), b"alpine").unwrap();

        let resolved = driver.resolve_base_image(image.path().to_str().unwrap()).unwrap();
        assert_eq!(fs::read_to_string(resolved.join("etc-release")).unwrap(), "alpine");

        // Mutating the source afterwards must not affect the cached copy.
        fs::write(image.path().join("etc-release"), b"changed").unwrap();
        let resolved_again = driver.resolve_base_image(image.path().to_str().unwrap()).unwrap();
        assert_eq!(fs::read_to_string(resolved_again.join("etc-release")).unwrap(), "alpine");
    }

    #[test]
    fn resolve_base_image_fails_for_unknown_reference() {
        let cache = tempdir().unwrap();
        let driver = NamespaceDriver::new(cache.path());

        let err = driver.resolve_base_image("not-a-real-path-or-cached-ref").unwrap_err();
        assert!(matches!(err, Error::ImageNotFound(_)));
    }
}
