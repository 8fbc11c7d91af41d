// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Container execution. [`ContainerDriver`] is the interface the core
//! consumes; [`NamespaceDriver`] is the one concrete implementation, built
//! directly on the [`container`] crate's Linux-namespace primitives.

use std::path::{Path, PathBuf};

use bld_model::StepExec;
use fs_err as fs;
use thiserror::Error;

mod namespace;

pub use namespace::NamespaceDriver;

/// The path the per-step workspace (holding the generated entrypoint
/// script) is bind-mounted at inside the container.
pub const WORKSPACE_MOUNT: &str = "/.bld/workspace";

/// Pulls an image, runs a step's commands inside it with the declared
/// mounts, and optionally commits the result as a new image.
pub trait ContainerDriver: Send + Sync {
    fn execute(&self, exec: &StepExec) -> Result<(), Error>;

    /// Root filesystem directory `execute` committed for a step whose
    /// `save` is set. Valid only after a successful `execute` for the same
    /// `build_id`/step/digest; used by the Runner to hand the committed
    /// filesystem to an `ImageStore`.
    fn committed_rootfs(&self, exec: &StepExec) -> PathBuf;
}

/// Render the `#!/bin/sh` entrypoint script for a step's commands.
pub fn entrypoint_script(commands: &[String]) -> String {
    let mut script = String::from("#!/bin/sh\n");
    for command in commands {
        script.push_str(command);
        script.push('\n');
    }
    script
}

/// The entrypoint script's file name, relative to the workspace mount.
pub fn entrypoint_file_name(step_name: &str) -> String {
    format!("{step_name}_step.sh")
}

/// Resolve the bind mounts for a step: its imports, exports and volumes, in
/// that order, each bound from `source_dirs` at the declared in-container
/// path. Fails if a referenced mount has no known source directory, which
/// would indicate the Solver handed out this node before its dependency
/// actually completed.
pub fn resolve_binds(exec: &StepExec) -> Result<Vec<(PathBuf, PathBuf)>, Error> {
    let mut binds = Vec::new();

    for mount in exec
        .step
        .imports
        .iter()
        .chain(exec.step.exports.iter())
        .chain(exec.step.volumes.iter())
    {
        let dir = exec
            .source_dirs
            .get(&mount.source)
            .ok_or_else(|| Error::UnknownMount(mount.source.clone()))?;
        binds.push((dir.clone(), PathBuf::from(&mount.mount)));
    }

    Ok(binds)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io")]
    Io(#[from] std::io::Error),
    #[error("container: {0}")]
    Container(#[source] container::Error),
    #[error("mount references unknown source: {0}")]
    UnknownMount(String),
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("container: exit code {0}")]
    NonZeroExit(i32),
}

impl From<container::Error> for Error {
    fn from(source: container::Error) -> Self {
        Error::Container(source)
    }
}

pub(crate) fn ensure_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bld_model::{Mount, Step};

    use super::*;

    fn exec(step: Step, source_dirs: HashMap<String, PathBuf>) -> StepExec {
        StepExec {
            step,
            step_digest: "digest".into(),
            source_dirs,
            build_dir: PathBuf::from("/build"),
            build_id: "1".into(),
            root_dir: PathBuf::from("/root"),
        }
    }

    #[test]
    fn entrypoint_script_has_shebang_and_one_line_per_command() {
        let script = entrypoint_script(&["echo hi".into(), "echo bye".into()]);
        assert_eq!(script, "#!/bin/sh\necho hi\necho bye\n");
    }

    #[test]
    fn resolve_binds_orders_imports_then_exports_then_volumes() {
        let step = Step {
            name: "s1".into(),
            image: "alpine".into(),
            commands: vec![],
            imports: vec![Mount {
                source: "r1".into(),
                mount: "/mnt/in".into(),
            }],
            exports: vec![Mount {
                source: "r2".into(),
                mount: "/mnt/out".into(),
            }],
            volumes: vec![Mount {
                source: "cache".into(),
                mount: "/cache".into(),
            }],
            workdir: None,
            env: vec![],
            user: None,
            save: None,
        };

        let mut dirs = HashMap::new();
        dirs.insert("r1".to_owned(), PathBuf::from("/src/r1"));
        dirs.insert("r2".to_owned(), PathBuf::from("/src/r2"));
        dirs.insert("cache".to_owned(), PathBuf::from("/src/cache"));

        let binds = resolve_binds(&exec(step, dirs)).unwrap();

        assert_eq!(
            binds,
            vec![
                (PathBuf::from("/src/r1"), PathBuf::from("/mnt/in")),
                (PathBuf::from("/src/r2"), PathBuf::from("/mnt/out")),
                (PathBuf::from("/src/cache"), PathBuf::from("/cache")),
            ]
        );
    }

    #[test]
    fn resolve_binds_fails_on_unknown_mount() {
        let step = Step {
            name: "s1".into(),
            image: "alpine".into(),
            commands: vec![],
            imports: vec![Mount {
                source: "missing".into(),
                mount: "/mnt".into(),
            }],
            exports: vec![],
            volumes: vec![],
            workdir: None,
            env: vec![],
            user: None,
            save: None,
        };

        let err = resolve_binds(&exec(step, HashMap::new())).unwrap_err();
        assert!(matches!(err, Error::UnknownMount(name) if name == "missing"));
    }
}
