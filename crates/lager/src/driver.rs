//! The aufs storage driver.
//!
//! Composes image and container layers into rootfs trees: layers are
//! located through the [`LayerStore`], stacked by the [`UnionMounter`],
//! and handed out through ref-counted `get`/`put` pairs.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::PathBuf;

use lager_common::paths::DriverRoots;
use lager_common::{LagerError, LagerResult};
use parking_lot::Mutex;

use crate::archive::{self, Change};
use crate::mount::UnionMounter;
use crate::platform::{self, MountBackend, SysMount};
use crate::store::{self, IdDesc, LayerStore};

/// Name this driver registers under.
pub const DRIVER_NAME: &str = "aufs";

/// Layered copy-on-write storage driver.
///
/// One instance owns the active-mount table for its roots; construct it
/// once and share it across worker threads.
pub struct Driver {
    store: LayerStore,
    mounter: UnionMounter,
    /// id → refcount of callers currently holding the layer via `get`.
    active: Mutex<HashMap<String, usize>>,
    backing_fs: String,
}

impl Driver {
    /// Initialise the driver under `root`.
    ///
    /// Fails with [`LagerError::NotSupported`] when the kernel cannot
    /// mount aufs and [`LagerError::IncompatibleFs`] when `root` sits on
    /// a filesystem aufs cannot stack over. `options` may override the
    /// layer roots (`lager.containerroot=`, `lager.imageroot=`,
    /// `lager.remoteroot=`).
    pub fn init(root: impl Into<PathBuf>, options: &[String]) -> LagerResult<Self> {
        platform::supports_aufs()?;

        let root = root.into();
        fs::create_dir_all(&root)?;

        let magic = platform::fs_magic(&root)?;
        let backing_fs = platform::fs_name(magic).unwrap_or("<unknown>").to_string();
        if platform::INCOMPATIBLE_FS_MAGIC.contains(&magic) {
            return Err(LagerError::IncompatibleFs {
                backing: backing_fs,
            });
        }

        let roots = parse_options(options);
        let mut driver = Self::with_backend(roots, Box::new(SysMount))?;
        driver.backing_fs = backing_fs;
        Ok(driver)
    }

    /// Construct against explicit roots and a custom mount backend,
    /// skipping the kernel-support and backing-filesystem checks.
    pub fn with_backend(roots: DriverRoots, backend: Box<dyn MountBackend>) -> LagerResult<Self> {
        let store = LayerStore::open(roots, backend.as_ref())?;
        Ok(Self {
            store,
            mounter: UnionMounter::new(backend),
            active: Mutex::new(HashMap::new()),
            backing_fs: "<unknown>".to_string(),
        })
    }

    /// Driver name literal.
    #[must_use]
    pub fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    /// Whether `id` is registered with this driver.
    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        self.store.resolve(id).is_ok()
    }

    /// Create the layer directories and parent metadata for `id`.
    ///
    /// The metadata file records `parent` first, followed by the parent's
    /// own chain. An empty `parent` produces an empty file.
    pub fn create(&self, id: &str, parent: &str, is_image_layer: bool) -> LagerResult<()> {
        let root = self.store.create_dirs(id, is_image_layer)?;

        let chain = if parent.is_empty() {
            Vec::new()
        } else {
            let parent_desc = self.store.resolve(parent)?;
            let mut chain = vec![parent.to_string()];
            chain.extend(store::read_parents(&parent_desc.root_path, &parent_desc.id)?);
            chain
        };

        store::write_parents(&root, id, &chain)?;
        tracing::debug!(id, parent, is_image_layer, "Layer created");
        Ok(())
    }

    /// Return the rootfs path for `id`, mounting the union on first use.
    ///
    /// Layers without parents have nothing to stack; their bare diff
    /// directory is returned and no mount happens.
    pub fn get(&self, id: &str, mount_label: &str) -> LagerResult<PathBuf> {
        let desc = self.store.resolve(id)?;

        let parents = match store::read_parents(&desc.root_path, &desc.id) {
            Ok(parents) => parents,
            Err(err) if err.is_not_found() => Vec::new(),
            Err(err) => return Err(err),
        };

        let mut active = self.active.lock();
        let count = active.get(id).copied().unwrap_or(0);

        let out = if parents.is_empty() {
            desc.diff_dir()
        } else {
            if count == 0 {
                self.mount_layer(&desc, &parents, mount_label)?;
            }
            desc.mnt_dir()
        };

        active.insert(id.to_string(), count + 1);
        Ok(out)
    }

    /// Release one reference on `id`, unmounting on the last one.
    pub fn put(&self, id: &str) -> LagerResult<()> {
        let desc = self.store.resolve(id)?;

        let mut active = self.active.lock();
        let count = active.get(&desc.id).copied().unwrap_or(0);
        if count > 1 {
            active.insert(desc.id.clone(), count - 1);
            return Ok(());
        }

        // Only layers with parents were ever mounted. The refcount must
        // drop regardless of how the unmount goes.
        let parents = store::read_parents(&desc.root_path, &desc.id).unwrap_or_default();
        if !parents.is_empty() {
            if let Err(err) = self.mounter.unmount(&desc.mnt_dir()) {
                tracing::warn!(id = %desc.id, error = %err, "Unmount failed during put");
            }
        }
        active.remove(&desc.id);
        Ok(())
    }

    /// Unmount and delete the layer.
    ///
    /// The content directories are renamed out of the way before removal
    /// so a concurrent lookup cannot re-observe the layer under its
    /// original name. Removal while the layer is in use is permitted but
    /// logged.
    pub fn remove(&self, id: &str) -> LagerResult<()> {
        let active = self.active.lock();

        let desc = self.store.resolve(id)?;
        if active.get(&desc.id).copied().unwrap_or(0) != 0 {
            tracing::error!(id = %desc.id, "Removing layer that is still in use");
        }

        self.mounter.unmount(&desc.mnt_dir())?;

        for subtree in ["mnt", "diff"] {
            let real = desc.root_path.join(subtree).join(&desc.id);
            let doomed = desc
                .root_path
                .join(subtree)
                .join(format!("{}-removing", desc.id));
            match fs::rename(&real, &doomed) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            }
            match fs::remove_dir_all(&doomed) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        match fs::remove_file(desc.layers_file()) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        tracing::debug!(id = %desc.id, "Layer removed");
        Ok(())
    }

    /// Stream an uncompressed tar of the layer's own content.
    ///
    /// The parent is not needed; the diff directory already holds exactly
    /// what this layer contributes. Whiteout bookkeeping entries are
    /// excluded.
    pub fn diff(&self, id: &str, _parent: &str) -> LagerResult<Box<dyn Read + Send>> {
        let desc = self.store.resolve(id)?;
        archive::tar_diff(&desc.diff_dir())
    }

    /// Extract a diff stream into the layer and return its new size.
    pub fn apply_diff(
        &self,
        id: &str,
        parent: &str,
        diff: impl Read,
    ) -> LagerResult<u64> {
        let desc = self.store.resolve(id)?;
        archive::apply(diff, &desc.diff_dir())?;
        self.diff_size(id, parent)
    }

    /// Byte size of the layer's own content.
    pub fn diff_size(&self, id: &str, _parent: &str) -> LagerResult<u64> {
        let desc = self.store.resolve(id)?;
        archive::directory_size(&desc.diff_dir())
    }

    /// Changes the layer introduces relative to its parent chain.
    pub fn changes(&self, id: &str, _parent: &str) -> LagerResult<Vec<Change>> {
        let desc = self.store.resolve(id)?;
        let layers = self.parent_layer_paths(&desc)?;
        archive::changes(&layers, &desc.diff_dir())
    }

    /// Driver metadata for `id`. The aufs driver exposes none.
    pub fn metadata(&self, id: &str) -> LagerResult<HashMap<String, String>> {
        self.store.resolve(id)?;
        Ok(HashMap::new())
    }

    /// Unmount every known layer, then the local roots. Per-layer
    /// failures are logged and skipped.
    pub fn cleanup(&self) -> LagerResult<()> {
        let ids = self.store.list_all()?;

        for id in ids {
            let desc = match self.store.resolve(&id) {
                Ok(desc) => desc,
                Err(err) => {
                    tracing::error!(id = %id, error = %err, "Unknown id during cleanup");
                    continue;
                }
            };
            if let Err(err) = self.mounter.unmount(&desc.mnt_dir()) {
                tracing::error!(id = %id, error = %err, "Unmount failed during cleanup");
            }
        }

        for root in self.store.roots().locals() {
            if let Err(err) = self.mounter.unmount(root) {
                tracing::debug!(root = %root.display(), error = %err, "Root unmount skipped");
            }
        }

        Ok(())
    }

    /// Stable label/value pairs for human display.
    #[must_use]
    pub fn status(&self) -> Vec<(&'static str, String)> {
        let roots = self.store.roots();
        let ids = self.store.list_all().unwrap_or_default();
        vec![
            (
                "Local Image Layers Root Dir",
                roots.local_image.display().to_string(),
            ),
            (
                "Local Container Layers Root Dir",
                roots.local_container.display().to_string(),
            ),
            (
                "Remote Image Layers Root Dir",
                roots.remote_image.display().to_string(),
            ),
            ("Backing Filesystem", self.backing_fs.clone()),
            ("Dirs", ids.len().to_string()),
            (
                "Dirperm1 Supported",
                self.mounter.dirperm1_supported().to_string(),
            ),
        ]
    }

    /// Diff-directory paths of all ancestors, nearest parent first.
    ///
    /// Each parent resolves independently; a container layer's parent is
    /// typically a shared image layer under a different root. A parent
    /// that no root contains makes the chain unusable.
    fn parent_layer_paths(&self, desc: &IdDesc) -> LagerResult<Vec<PathBuf>> {
        let parents = store::read_parents(&desc.root_path, &desc.id)?;
        self.resolve_chain(desc, &parents)
    }

    fn resolve_chain(&self, desc: &IdDesc, parents: &[String]) -> LagerResult<Vec<PathBuf>> {
        parents
            .iter()
            .map(|parent| match self.store.resolve(parent) {
                Ok(parent_desc) => Ok(parent_desc.diff_dir()),
                Err(LagerError::UnknownId { .. }) => Err(LagerError::DanglingParent {
                    id: desc.id.clone(),
                    parent: parent.clone(),
                }),
                Err(err) => Err(err),
            })
            .collect()
    }

    fn mount_layer(
        &self,
        desc: &IdDesc,
        parents: &[String],
        mount_label: &str,
    ) -> LagerResult<()> {
        let layers = self.resolve_chain(desc, parents)?;
        self.mounter
            .mount_union(&layers, &desc.diff_dir(), &desc.mnt_dir(), mount_label)
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(DRIVER_NAME)
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("roots", self.store.roots())
            .field("backing_fs", &self.backing_fs)
            .finish_non_exhaustive()
    }
}

fn parse_options(options: &[String]) -> DriverRoots {
    let mut roots = DriverRoots::new();
    for option in options {
        let Some((key, value)) = option.split_once('=') else {
            continue;
        };
        match key {
            "lager.containerroot" => roots.local_container = PathBuf::from(value),
            "lager.imageroot" => roots.local_image = PathBuf::from(value),
            "lager.remoteroot" => roots.remote_image = PathBuf::from(value),
            _ => tracing::warn!(option = %option, "Ignoring unknown driver option"),
        }
    }
    roots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_parsing_overrides_roots() {
        let options = vec![
            "lager.containerroot=/srv/ctr".to_string(),
            "lager.imageroot=/srv/img".to_string(),
            "lager.remoteroot=/srv/remote".to_string(),
            "unknown.key=zzz".to_string(),
            "garbage".to_string(),
        ];
        let roots = parse_options(&options);
        assert_eq!(roots.local_container, PathBuf::from("/srv/ctr"));
        assert_eq!(roots.local_image, PathBuf::from("/srv/img"));
        assert_eq!(roots.remote_image, PathBuf::from("/srv/remote"));
    }
}
