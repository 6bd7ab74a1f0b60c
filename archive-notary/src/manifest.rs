// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Declarative descriptions of the archives to sign.

A manifest is an ordered list of [ArchiveSpec] trees. Each spec names a zip
file by its path relative to the remote storage base and lists the members to
sign. A listed member is either a binary ([FileRef::Plain]) or another zip file
inside the archive that must itself be unpacked and signed
([FileRef::Nested]).

Manifests are read from JSON or YAML. In JSON form a plain entry is a string
and a nested entry is an object:

```json
{
    "path": "ios-profile/artifacts.zip",
    "files": [
        "gen_snapshot_arm64",
        {"path": "Flutter.framework.zip", "files": ["Flutter"]}
    ]
}
```
*/

use {
    crate::ArchiveNotaryError,
    serde::{Deserialize, Serialize},
    std::{
        collections::BTreeMap,
        path::{Component, Path},
    },
};

/// The manifest compiled into the binary.
const BUILTIN_MANIFEST: &str = include_str!("../manifests/default.json");

/// An entry in one of the file lists of an [ArchiveSpec].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FileRef {
    /// Path of a binary to sign, relative to the archive root.
    Plain(String),

    /// A zip file within the archive to recurse into.
    Nested(ArchiveSpec),
}

impl From<&str> for FileRef {
    fn from(path: &str) -> Self {
        Self::Plain(path.to_string())
    }
}

impl From<ArchiveSpec> for FileRef {
    fn from(spec: ArchiveSpec) -> Self {
        Self::Nested(spec)
    }
}

/// Describes one zip archive and the members within it to sign.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ArchiveSpec {
    /// Location of the archive.
    ///
    /// For top-level archives this is relative to `<remote base>/<commit>`. For
    /// nested archives it is relative to the parent archive's root.
    pub path: String,

    /// Members signed without entitlements.
    #[serde(default)]
    pub files: Vec<FileRef>,

    /// Members signed with the entitlements plist.
    #[serde(default)]
    pub files_with_entitlements: Vec<FileRef>,
}

impl ArchiveSpec {
    pub fn new(path: impl ToString) -> Self {
        Self {
            path: path.to_string(),
            files: vec![],
            files_with_entitlements: vec![],
        }
    }

    /// Add an entry signed without entitlements.
    pub fn file(mut self, entry: impl Into<FileRef>) -> Self {
        self.files.push(entry.into());
        self
    }

    /// Add an entry signed with entitlements.
    pub fn file_with_entitlements(mut self, entry: impl Into<FileRef>) -> Self {
        self.files_with_entitlements.push(entry.into());
        self
    }

    /// Iterate over all entries in signing order.
    ///
    /// Entries without entitlements come first. The boolean is true for entries
    /// from `files_with_entitlements`.
    pub fn entries(&self) -> impl Iterator<Item = (&FileRef, bool)> {
        self.files
            .iter()
            .map(|entry| (entry, false))
            .chain(self.files_with_entitlements.iter().map(|entry| (entry, true)))
    }

    /// Validate the structure of this spec and all nested specs.
    pub fn validate(&self) -> Result<(), ArchiveNotaryError> {
        validate_relative_path(&self.path)?;

        for (entry, _) in self.entries() {
            match entry {
                FileRef::Plain(path) => validate_relative_path(path)?,
                FileRef::Nested(spec) => spec.validate()?,
            }
        }

        Ok(())
    }

    /// Render the spec as an indented tree, one line per entry.
    pub fn tree_lines(&self) -> Vec<String> {
        let mut lines = vec![];
        self.push_tree_lines(0, &mut lines);
        lines
    }

    fn push_tree_lines(&self, depth: usize, lines: &mut Vec<String>) {
        let indent = "  ".repeat(depth);
        lines.push(format!("{}{}", indent, self.path));

        for (entry, entitlements) in self.entries() {
            match entry {
                FileRef::Plain(path) => lines.push(format!(
                    "{}  {}{}",
                    indent,
                    path,
                    if entitlements { " (entitlements)" } else { "" }
                )),
                FileRef::Nested(spec) => spec.push_tree_lines(depth + 1, lines),
            }
        }
    }
}

fn validate_relative_path(path: &str) -> Result<(), ArchiveNotaryError> {
    if path.is_empty() {
        return Err(ArchiveNotaryError::ManifestInvalid(
            "empty path in archive spec".into(),
        ));
    }

    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveNotaryError::ManifestInvalid(format!(
                    "path must be relative and stay within its archive: {}",
                    path
                )));
            }
        }
    }

    Ok(())
}

/// A collection of archive lists.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// Archives processed by a full run.
    #[serde(default)]
    pub archives: Vec<ArchiveSpec>,

    /// Named lists of auxiliary archives that are processed on demand.
    #[serde(default)]
    pub side_manifests: BTreeMap<String, Vec<ArchiveSpec>>,
}

impl Manifest {
    pub fn from_json(s: &str) -> Result<Self, ArchiveNotaryError> {
        let manifest = serde_json::from_str::<Self>(s)?;
        manifest.validate()?;

        Ok(manifest)
    }

    pub fn from_yaml(s: &str) -> Result<Self, ArchiveNotaryError> {
        let manifest = serde_yaml::from_str::<Self>(s)?;
        manifest.validate()?;

        Ok(manifest)
    }

    /// Read a manifest from a file.
    ///
    /// Files ending in `.yaml` or `.yml` are parsed as YAML. Everything else is JSON.
    pub fn from_path(path: &Path) -> Result<Self, ArchiveNotaryError> {
        let data = std::fs::read_to_string(path)?;

        match path.extension().and_then(|x| x.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&data),
            _ => Self::from_json(&data),
        }
    }

    /// The manifest compiled into this crate.
    pub fn builtin() -> Result<Self, ArchiveNotaryError> {
        Self::from_json(BUILTIN_MANIFEST)
    }

    pub fn validate(&self) -> Result<(), ArchiveNotaryError> {
        for spec in &self.archives {
            spec.validate()?;
        }

        for (name, specs) in &self.side_manifests {
            if name.is_empty() {
                return Err(ArchiveNotaryError::ManifestInvalid(
                    "side manifest with empty name".into(),
                ));
            }

            for spec in specs {
                spec.validate()?;
            }
        }

        Ok(())
    }

    /// Resolve a named side manifest.
    pub fn side_manifest(&self, name: &str) -> Result<&[ArchiveSpec], ArchiveNotaryError> {
        self.side_manifests
            .get(name)
            .map(|specs| specs.as_slice())
            .ok_or_else(|| ArchiveNotaryError::UnknownSideManifest(name.to_string()))
    }
}
