//! Layer repository: locates layers across the local and remote roots and
//! owns the on-disk parent-chain metadata.
//!
//! Every root carries the same three subtrees:
//!
//! ```text
//!   .
//!   ├── layers   // one metadata file per layer, parent ids line by line
//!   ├── diff     // the content each layer contributes
//!   └── mnt      // union mount targets for active layers
//! ```
//!
//! The remote root interposes one sub-partition directory per shared pool
//! between itself and the subtrees.

use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use lager_common::paths::{self, DriverRoots};
use lager_common::{LagerError, LagerResult};

use crate::platform::MountBackend;

const SUBTREES: [&str; 3] = ["mnt", "diff", "layers"];

/// A layer id resolved to the root that holds its subtrees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdDesc {
    /// The layer id.
    pub id: String,
    /// Root (or remote sub-partition) containing `layers/`, `diff/` and
    /// `mnt/` for this id.
    pub root_path: PathBuf,
}

impl IdDesc {
    /// The layer's content directory.
    #[must_use]
    pub fn diff_dir(&self) -> PathBuf {
        paths::diff_dir(&self.root_path, &self.id)
    }

    /// The layer's union mount target.
    #[must_use]
    pub fn mnt_dir(&self) -> PathBuf {
        paths::mnt_dir(&self.root_path, &self.id)
    }

    /// The layer's parent-chain metadata file.
    #[must_use]
    pub fn layers_file(&self) -> PathBuf {
        paths::layers_file(&self.root_path, &self.id)
    }
}

/// Locates layers and reads/writes their parent-chain files.
#[derive(Debug)]
pub struct LayerStore {
    roots: DriverRoots,
}

impl LayerStore {
    /// Open the store, bootstrapping both local roots.
    ///
    /// Each local root gets the three subtrees (mode 0755) and is marked
    /// as a private mount point so union mounts beneath it do not
    /// propagate back out. Bootstrap is idempotent. The remote root is
    /// used as-is.
    pub fn open(roots: DriverRoots, mount: &dyn MountBackend) -> LagerResult<Self> {
        for root in roots.locals() {
            bootstrap_root(root, mount)?;
        }
        Ok(Self { roots })
    }

    /// The roots this store searches.
    #[must_use]
    pub fn roots(&self) -> &DriverRoots {
        &self.roots
    }

    /// Resolve an id to the root that holds it.
    ///
    /// Search order is fixed: local container root, local image root,
    /// then each remote sub-partition in listing order. Remote
    /// sub-partitions that cannot be read are skipped; local roots must
    /// be readable.
    pub fn resolve(&self, id: &str) -> LagerResult<IdDesc> {
        for root in self.roots.locals() {
            let layers = root.join("layers");
            let ids = load_ids(&layers).map_err(|source| LagerError::Metadata {
                path: layers,
                source,
            })?;
            if ids.iter().any(|known| known == id) {
                return Ok(IdDesc {
                    id: id.to_string(),
                    root_path: root.to_path_buf(),
                });
            }
        }

        let remote = &self.roots.remote_image;
        let partitions = match child_dirs(remote) {
            Ok(partitions) => partitions,
            // Hosts without a shared pool simply have no remote root.
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => {
                return Err(LagerError::Metadata {
                    path: remote.clone(),
                    source,
                });
            }
        };

        for partition in partitions {
            let root = remote.join(&partition);
            let Ok(ids) = load_ids(&root.join("layers")) else {
                continue;
            };
            if ids.iter().any(|known| known == id) {
                return Ok(IdDesc {
                    id: id.to_string(),
                    root_path: root,
                });
            }
        }

        Err(LagerError::UnknownId { id: id.to_string() })
    }

    /// Create `mnt/<id>` and `diff/<id>` under the local image or
    /// container root. Existing directories are fine.
    pub fn create_dirs(&self, id: &str, is_image_layer: bool) -> LagerResult<PathBuf> {
        let root = if is_image_layer {
            &self.roots.local_image
        } else {
            &self.roots.local_container
        };

        let mut builder = fs::DirBuilder::new();
        builder.recursive(true).mode(0o755);
        for subtree in ["mnt", "diff"] {
            builder.create(root.join(subtree).join(id))?;
        }

        tracing::debug!(id, root = %root.display(), "Layer directories created");
        Ok(root.clone())
    }

    /// Every id known to any root.
    ///
    /// Local roots must be readable; remote sub-partitions that cannot be
    /// enumerated are silently skipped.
    pub fn list_all(&self) -> LagerResult<Vec<String>> {
        let mut all = Vec::new();

        for root in self.roots.locals() {
            let layers = root.join("layers");
            all.extend(load_ids(&layers).map_err(|source| LagerError::Metadata {
                path: layers,
                source,
            })?);
        }

        let remote = &self.roots.remote_image;
        let Ok(partitions) = child_dirs(remote) else {
            return Ok(all);
        };
        for partition in partitions {
            if let Ok(ids) = load_ids(&remote.join(&partition).join("layers")) {
                all.extend(ids);
            }
        }

        Ok(all)
    }
}

/// Read a layer's parent chain: one id per line, nearest parent first,
/// empty lines dropped. An empty file means no parents.
pub fn read_parents(root: &Path, id: &str) -> LagerResult<Vec<String>> {
    let path = paths::layers_file(root, id);
    let contents = fs::read_to_string(&path).map_err(|source| LagerError::Metadata {
        path: path.clone(),
        source,
    })?;
    Ok(contents
        .lines()
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Write a layer's parent chain, one id per line, newline-terminated.
/// An empty chain produces an empty file.
pub fn write_parents(root: &Path, id: &str, chain: &[String]) -> LagerResult<()> {
    let path = paths::layers_file(root, id);
    let mut contents = String::new();
    for parent in chain {
        contents.push_str(parent);
        contents.push('\n');
    }
    fs::write(&path, contents).map_err(|source| LagerError::Metadata { path, source })
}

fn bootstrap_root(root: &Path, mount: &dyn MountBackend) -> LagerResult<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true).mode(0o755);
    builder.create(root)?;
    for subtree in SUBTREES {
        builder.create(root.join(subtree))?;
    }
    mount.make_private(root)
}

/// Plain files directly under `dir`, sorted by name.
fn load_ids(dir: &Path) -> std::io::Result<Vec<String>> {
    list_children(dir, |is_dir| !is_dir)
}

/// Directories directly under `dir`, sorted by name.
fn child_dirs(dir: &Path) -> std::io::Result<Vec<String>> {
    list_children(dir, |is_dir| is_dir)
}

fn list_children(dir: &Path, keep: fn(bool) -> bool) -> std::io::Result<Vec<String>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if keep(entry.file_type()?.is_dir()) {
            out.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    out.sort();
    Ok(out)
}
