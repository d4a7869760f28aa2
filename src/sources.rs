//! The migration source model: an immutable, in-memory representation of a
//! versioned tree of install/rollback scripts.
//!
//! On disk a source tree looks like:
//!
//! ```text
//! R/<versionName>/install/<scriptName>{.sql|.js|...}
//! R/<versionName>/rollback/<scriptName>{.sql|.js|...}
//! ```
//!
//! Directory names form version identifiers, file names are preserved
//! verbatim as script names, and all content is UTF-8. Versions and script
//! names are ordered by raw ASCII byte comparison everywhere — users encode
//! sequencing into names (`01-…`, `50-…`, `v0001`) deliberately, and no
//! natural/numeric sort is ever applied.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{ensure_not_cancelled, Error};

/// Classification of a script, derived from its filename extension.
/// The extension match is case-sensitive: only the literal `.sql` and
/// `.js` suffixes classify; everything else is [ScriptKind::Unknown].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    Sql,
    JavaScript,
    Unknown,
}

impl ScriptKind {
    fn from_script_name(name: &str) -> Self {
        match Path::new(name).extension().and_then(|ext| ext.to_str()) {
            Some("sql") => Self::Sql,
            Some("js") => Self::JavaScript,
            _ => Self::Unknown,
        }
    }
}

/// Whether a script belongs to the install or the rollback set of its
/// version. Also names the on-disk subdirectory the script lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Install,
    Rollback,
}

impl Direction {
    pub(crate) fn directory_name(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Rollback => "rollback",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.directory_name())
    }
}

/// One migration script: an immutable value holding the script's name,
/// kind, origin path and textual content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    name: String,
    kind: ScriptKind,
    file: PathBuf,
    content: String,
}

impl Script {
    /// Create a script. The kind is derived from the name's extension;
    /// `file` records the absolute origin path for diagnostics and is
    /// preserved across content transforms.
    pub fn new(name: impl Into<String>, file: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        let name = name.into();
        let kind = ScriptKind::from_script_name(&name);
        Self {
            name,
            kind,
            file: file.into(),
            content: content.into(),
        }
    }

    /// The filename relative to its direction directory, e.g. `01-init.sql`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ScriptKind {
        self.kind
    }

    /// The absolute origin path of the script at load time.
    pub fn file(&self) -> &Path {
        &self.file
    }

    /// The textual body of the script (UTF-8).
    pub fn content(&self) -> &str {
        &self.content
    }

    /// The filename extension, if any. Script-handler registration keys
    /// on this value.
    pub fn extension(&self) -> Option<&str> {
        Path::new(&self.name).extension().and_then(|ext| ext.to_str())
    }

    /// SHA-256 over the script's name and content, hex-encoded. Lets
    /// callers detect source drift between deployments.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(b"|");
        hasher.update(self.content.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn with_content(&self, content: String) -> Self {
        Self {
            name: self.name.clone(),
            kind: self.kind,
            file: self.file.clone(),
            content,
        }
    }
}

/// Context handed to a [Sources::map] transform for every visited script.
#[derive(Debug, Clone, Copy)]
pub struct MapContext<'a> {
    pub version_name: &'a str,
    pub direction: Direction,
    pub item_name: &'a str,
}

/// The install set and rollback set of scripts for one named version.
/// Immutable; transforms produce new bundles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionBundle {
    version_name: String,
    install_scripts: BTreeMap<String, Script>,
    rollback_scripts: BTreeMap<String, Script>,
}

impl VersionBundle {
    /// Build a bundle from its install and rollback scripts. Script names
    /// are unique within a direction (a duplicate name replaces the
    /// earlier script, matching last-write-wins directory semantics).
    pub fn new(
        version_name: impl Into<String>,
        install_scripts: impl IntoIterator<Item = Script>,
        rollback_scripts: impl IntoIterator<Item = Script>,
    ) -> Self {
        Self {
            version_name: version_name.into(),
            install_scripts: install_scripts
                .into_iter()
                .map(|script| (script.name.clone(), script))
                .collect(),
            rollback_scripts: rollback_scripts
                .into_iter()
                .map(|script| (script.name.clone(), script))
                .collect(),
        }
    }

    /// The directory name this bundle was loaded from, e.g. `v0001`.
    /// Compared as a raw string under ASCII lexicographic order.
    pub fn version_name(&self) -> &str {
        &self.version_name
    }

    /// Install script names, ASCII-ascending.
    pub fn install_script_names(&self) -> Vec<&str> {
        self.install_scripts.keys().map(String::as_str).collect()
    }

    /// Rollback script names, ASCII-ascending.
    pub fn rollback_script_names(&self) -> Vec<&str> {
        self.rollback_scripts.keys().map(String::as_str).collect()
    }

    pub fn install_script(&self, name: &str) -> Option<&Script> {
        self.install_scripts.get(name)
    }

    pub fn rollback_script(&self, name: &str) -> Option<&Script> {
        self.rollback_scripts.get(name)
    }

    /// Install scripts in ASCII-ascending name order.
    pub fn install_scripts(&self) -> impl DoubleEndedIterator<Item = &Script> {
        self.install_scripts.values()
    }

    /// Rollback scripts in ASCII-ascending name order. The engine walks
    /// this backwards when rolling a version back.
    pub fn rollback_scripts(&self) -> impl DoubleEndedIterator<Item = &Script> {
        self.rollback_scripts.values()
    }

    /// SHA-256 over every script checksum in the bundle, both directions,
    /// in ASCII name order.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version_name.as_bytes());
        for script in self.install_scripts.values() {
            hasher.update(b"|i|");
            hasher.update(script.checksum().as_bytes());
        }
        for script in self.rollback_scripts.values() {
            hasher.update(b"|r|");
            hasher.update(script.checksum().as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    fn map<F>(&self, transform: &F) -> Self
    where
        F: Fn(&str, MapContext<'_>) -> String,
    {
        let map_direction = |scripts: &BTreeMap<String, Script>, direction: Direction| {
            scripts
                .iter()
                .map(|(name, script)| {
                    let context = MapContext {
                        version_name: &self.version_name,
                        direction,
                        item_name: name,
                    };
                    (name.clone(), script.with_content(transform(&script.content, context)))
                })
                .collect()
        };
        Self {
            version_name: self.version_name.clone(),
            install_scripts: map_direction(&self.install_scripts, Direction::Install),
            rollback_scripts: map_direction(&self.rollback_scripts, Direction::Rollback),
        }
    }
}

/// An ordered, immutable set of [VersionBundle]s — the complete migration
/// source tree held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sources {
    versions: BTreeMap<String, VersionBundle>,
}

impl Sources {
    /// Build sources from bundles, rejecting duplicate version names.
    pub fn new(bundles: impl IntoIterator<Item = VersionBundle>) -> Result<Self, Error> {
        let mut versions = BTreeMap::new();
        for bundle in bundles {
            let version_name = bundle.version_name.clone();
            if versions.insert(version_name.clone(), bundle).is_some() {
                return Err(Error::WrongMigrationData(format!(
                    "duplicate version '{version_name}' in migration sources"
                )));
            }
        }
        Ok(Self { versions })
    }

    /// Load sources from a URL. Only the `file` scheme is implemented;
    /// the remote-archive schemes `http+tar+gz` and `https+tar+gz` are
    /// recognized but deliberately unimplemented.
    pub fn load(cancel: &CancellationToken, url: &Url) -> Result<Self, Error> {
        match url.scheme() {
            "file" => {
                let root = url.to_file_path().map_err(|_| Error::InvalidArgument {
                    argument: "url",
                    message: format!("cannot convert '{url}' to a filesystem path"),
                })?;
                Self::load_from_filesystem(cancel, &root)
            }
            scheme @ ("http+tar+gz" | "https+tar+gz") => Err(Error::NotImplemented(format!(
                "loading migration sources from '{scheme}' URLs is not implemented yet"
            ))),
            scheme => Err(Error::NotSupportedUrlSchema(scheme.to_owned())),
        }
    }

    /// Load sources from a directory tree. Every immediate child
    /// directory of `root` is a version; its `install/` and `rollback/`
    /// subdirectories contribute scripts. A missing direction directory
    /// yields an empty script set for that direction.
    pub fn load_from_filesystem(cancel: &CancellationToken, root: &Path) -> Result<Self, Error> {
        ensure_not_cancelled(cancel)?;
        if !root.is_dir() {
            return Err(Error::WrongMigrationData(format!(
                "migration directory '{}' does not exist",
                root.display()
            )));
        }

        let mut bundles = Vec::new();
        let entries = fs::read_dir(root).map_err(|source| Error::Io {
            path: root.to_path_buf(),
            source,
        })?;
        for entry in entries {
            ensure_not_cancelled(cancel)?;
            let entry = entry.map_err(|source| Error::Io {
                path: root.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let version_name = file_name_utf8(&path)?;
            let install_scripts =
                load_direction_directory(cancel, &path.join(Direction::Install.directory_name()))?;
            let rollback_scripts =
                load_direction_directory(cancel, &path.join(Direction::Rollback.directory_name()))?;
            bundles.push(VersionBundle::new(version_name, install_scripts, rollback_scripts));
        }
        Self::new(bundles)
    }

    /// Write the sources back to a directory tree. The destination
    /// directory must already exist; the per-version and direction
    /// subdirectories are created as needed.
    pub fn save_to_filesystem(
        &self,
        cancel: &CancellationToken,
        destination: &Path,
    ) -> Result<(), Error> {
        ensure_not_cancelled(cancel)?;
        if !destination.is_dir() {
            return Err(Error::InvalidArgument {
                argument: "destination_directory",
                message: format!("directory '{}' does not exist", destination.display()),
            });
        }

        for bundle in self.versions.values() {
            let version_directory = destination.join(&bundle.version_name);
            for (direction, scripts) in [
                (Direction::Install, &bundle.install_scripts),
                (Direction::Rollback, &bundle.rollback_scripts),
            ] {
                let direction_directory = version_directory.join(direction.directory_name());
                ensure_not_cancelled(cancel)?;
                fs::create_dir_all(&direction_directory).map_err(|source| Error::Io {
                    path: direction_directory.clone(),
                    source,
                })?;
                for script in scripts.values() {
                    ensure_not_cancelled(cancel)?;
                    let script_path = direction_directory.join(&script.name);
                    fs::write(&script_path, script.content.as_bytes()).map_err(|source| {
                        Error::Io {
                            path: script_path.clone(),
                            source,
                        }
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Version names, ASCII-ascending.
    pub fn version_names(&self) -> Vec<&str> {
        self.versions.keys().map(String::as_str).collect()
    }

    pub fn contains_version(&self, version_name: &str) -> bool {
        self.versions.contains_key(version_name)
    }

    /// Look up a version's bundle; an unknown name is an
    /// [Error::InvalidArgument].
    pub fn version_bundle(&self, version_name: &str) -> Result<&VersionBundle, Error> {
        self.versions
            .get(version_name)
            .ok_or_else(|| Error::InvalidArgument {
                argument: "version_name",
                message: format!("version '{version_name}' is not present in the sources"),
            })
    }

    /// Bundles in ASCII-ascending version-name order.
    pub fn version_bundles(&self) -> impl DoubleEndedIterator<Item = &VersionBundle> {
        self.versions.values()
    }

    /// Produce new sources with every script's content replaced by
    /// `transform(content, context)`. Names, kinds and origin paths are
    /// preserved; the transform is called exactly once per script, in
    /// ASCII-ascending version and name order. Template expansion is the
    /// typical use.
    pub fn map<F>(&self, transform: F) -> Self
    where
        F: Fn(&str, MapContext<'_>) -> String,
    {
        let versions = self
            .versions
            .iter()
            .map(|(version_name, bundle)| (version_name.clone(), bundle.map(&transform)))
            .collect();
        Self { versions }
    }
}

fn file_name_utf8(path: &Path) -> Result<String, Error> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or_else(|| {
            Error::WrongMigrationData(format!("non UTF-8 file name at '{}'", path.display()))
        })
}

fn load_direction_directory(
    cancel: &CancellationToken,
    directory: &Path,
) -> Result<Vec<Script>, Error> {
    if !directory.is_dir() {
        return Ok(Vec::new());
    }
    let mut scripts = Vec::new();
    let entries = fs::read_dir(directory).map_err(|source| Error::Io {
        path: directory.to_path_buf(),
        source,
    })?;
    for entry in entries {
        ensure_not_cancelled(cancel)?;
        let entry = entry.map_err(|source| Error::Io {
            path: directory.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = file_name_utf8(&path)?;
        let content = fs::read_to_string(&path).map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?;
        let file = fs::canonicalize(&path).map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?;
        scripts.push(Script::new(name, file, content));
    }
    Ok(scripts)
}
