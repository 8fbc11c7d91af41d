// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! In-memory representation of a [`Build`]: its [`Source`]s, [`Volume`]s and
//! [`Step`]s, plus the lookup and namespacing helpers the rest of the engine
//! relies on.

use serde::Deserialize;

/// Separator used when [`Build::namespace`] composes a prefix onto a name.
pub const NAMESPACE_SEP: &str = "_";

/// A full build declaration, as produced by the (external) spec parser.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Build {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub volumes: Vec<Source>,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Other build files to merge in, namespaced by this build's name before
    /// merging. Dropped by the distilled spec, present in the original.
    #[serde(default)]
    pub requires: Vec<String>,
}

impl Build {
    /// Look up a declared source by name.
    pub fn source(&self, name: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.name == name)
    }

    /// Look up a declared step by name.
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Look up a declared volume by name.
    pub fn volume(&self, name: &str) -> Option<&Source> {
        self.volumes.iter().find(|v| v.name == name)
    }

    /// Prefix every source/volume/step name, and every import/export/volume
    /// reference that is not already namespaced, with `prefix`.
    ///
    /// Used when composing sub-builds pulled in via `requires`.
    pub fn namespace(&mut self, prefix: &str) {
        for source in self.sources.iter_mut().chain(self.volumes.iter_mut()) {
            source.name = namespaced(prefix, &source.name);
        }
        for step in &mut self.steps {
            step.name = namespaced(prefix, &step.name);
            for mount in step
                .imports
                .iter_mut()
                .chain(step.exports.iter_mut())
                .chain(step.volumes.iter_mut())
            {
                if !mount.source.contains(NAMESPACE_SEP) {
                    mount.source = namespaced(prefix, &mount.source);
                }
            }
        }
    }
}

fn namespaced(prefix: &str, name: &str) -> String {
    format!("{prefix}{NAMESPACE_SEP}{name}")
}

/// A named directory tree read from the user's working copy.
#[derive(Debug, Clone, Deserialize)]
pub struct Source {
    pub name: String,
    pub target: String,
    /// Restricts digesting (and copying) to this subset of relative paths.
    /// When absent, the whole subtree under `target` is used.
    #[serde(default)]
    pub files: Vec<String>,
}

/// A binding from a named source/volume/export to an in-container mount path.
#[derive(Debug, Clone, Deserialize)]
pub struct Mount {
    pub source: String,
    pub mount: String,
}

/// A container image to commit the step's final filesystem into.
#[derive(Debug, Clone, Deserialize)]
pub struct Image {
    pub tag: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub workdir: Option<String>,
}

/// A named container execution unit.
#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub imports: Vec<Mount>,
    #[serde(default)]
    pub exports: Vec<Mount>,
    #[serde(default)]
    pub volumes: Vec<Mount>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub save: Option<Image>,
}

/// The fully resolved inputs handed to a container driver invocation: a step
/// plus everything it needs to run.
#[derive(Debug, Clone)]
pub struct StepExec {
    pub step: Step,
    pub step_digest: String,
    pub source_dirs: std::collections::HashMap<String, std::path::PathBuf>,
    pub build_dir: std::path::PathBuf,
    pub build_id: String,
    pub root_dir: std::path::PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build() -> Build {
        Build {
            id: "1".into(),
            name: "test".into(),
            volumes: vec![],
            sources: vec![Source {
                name: "r1".into(),
                target: "testdata".into(),
                files: vec![],
            }],
            steps: vec![Step {
                name: "s1".into(),
                image: "alpine".into(),
                commands: vec![],
                imports: vec![Mount {
                    source: "r1".into(),
                    mount: "/mnt".into(),
                }],
                exports: vec![],
                volumes: vec![],
                workdir: None,
                env: vec![],
                user: None,
                save: None,
            }],
            requires: vec![],
        }
    }

    #[test]
    fn lookups_return_first_match() {
        let b = build();
        assert!(b.source("r1").is_some());
        assert!(b.step("s1").is_some());
        assert!(b.source("missing").is_none());
    }

    #[test]
    fn namespace_prefixes_names_and_unqualified_references() {
        let mut b = build();
        b.namespace("outer");

        assert_eq!(b.sources[0].name, "outer_r1");
        assert_eq!(b.steps[0].name, "outer_s1");
        assert_eq!(b.steps[0].imports[0].source, "outer_r1");
    }

    #[test]
    fn namespace_does_not_double_prefix_already_namespaced_references() {
        let mut b = build();
        b.steps[0].imports[0].source = "inner_r1".into();
        b.namespace("outer");

        assert_eq!(b.steps[0].imports[0].source, "inner_r1");
    }
}
