// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Parses a [`Build`] from YAML, and resolves its `requires` list: other
//! build files merged in, each namespaced under its own declared name
//! before merging so their source/step names cannot collide with the
//! including build's.

use std::path::Path;

use bld_model::Build;
use fs_err as fs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io")]
    Io(#[from] std::io::Error),
    #[error("yaml")]
    Yaml(#[from] serde_yaml::Error),
}

/// Parses a single build file's bytes. Does not resolve `requires`.
pub fn from_slice(bytes: &[u8]) -> Result<Build, Error> {
    Ok(serde_yaml::from_slice(bytes)?)
}

/// Reads `path` and merges in every build file listed in its `requires`,
/// each namespaced under its own `name` first.
pub fn read(path: &Path) -> Result<Build, Error> {
    let mut build = read_file(path)?;

    for required in build.requires.clone() {
        let mut child = read_file(Path::new(&required))?;
        let name = child.name.clone();
        child.namespace(&name);

        build.volumes.extend(child.volumes);
        build.sources.extend(child.sources);
        build.steps.extend(child.steps);
    }

    Ok(build)
}

fn read_file(path: &Path) -> Result<Build, Error> {
    from_slice(&fs::read(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_build() {
        let yaml = br#"
name: demo
sources:
  - name: r1
    target: testdata
steps:
  - name: s1
    image: alpine
    imports:
      - source: r1
        mount: /mnt
"#;
        let build = from_slice(yaml).unwrap();
        assert_eq!(build.name, "demo");
        assert_eq!(build.sources[0].name, "r1");
        assert_eq!(build.steps[0].imports[0].source, "r1");
    }

    #[test]
    fn read_merges_and_namespaces_required_builds() {
        let dir = tempfile::tempdir().unwrap();

        let child_path = dir.path().join("child.yaml");
        fs::write(
            &child_path,
            br#"
name: lib
sources:
  - name: r1
    target: testdata
steps:
  - name: compile
    image: alpine
    imports:
      - source: r1
        mount: /mnt
    exports:
      - source: out
        mount: /out
"#,
        )
        .unwrap();

        let main_path = dir.path().join("main.yaml");
        fs::write(
            main_path.clone(),
            format!(
                r#"
name: app
requires:
  - {}
steps:
  - name: package
    image: alpine
    imports:
      - source: lib_out
        mount: /in
"#,
                child_path.display()
            ),
        )
        .unwrap();

        let build = read(&main_path).unwrap();

        assert_eq!(build.name, "app");
        assert_eq!(build.steps.len(), 2);
        assert!(build.step("lib_compile").is_some());
        assert_eq!(build.step("lib_compile").unwrap().exports[0].source, "lib_out");
        assert_eq!(build.sources[0].name, "lib_r1");
    }
}
