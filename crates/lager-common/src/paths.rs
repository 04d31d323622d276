//! Standard filesystem roots for the lager driver.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Default read-write root for local container layers.
pub static LAGER_CONTAINER_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("LAGER_CONTAINER_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/lager/container-layers"))
});

/// Default read-write root for local image layers.
pub static LAGER_IMAGE_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("LAGER_IMAGE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/lager/image-layers"))
});

/// Default root for the shared remote image-layer pool.
pub static LAGER_REMOTE_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("LAGER_REMOTE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/mnt"))
});

/// The three filesystem roots a driver instance operates on.
///
/// Each root holds the `layers/`, `diff/` and `mnt/` subtrees. The remote
/// root interposes sub-partition directories between itself and those
/// subtrees, one per shared pool.
#[derive(Debug, Clone)]
pub struct DriverRoots {
    /// Local read-write root for container layers.
    pub local_container: PathBuf,
    /// Local read-write root for image layers.
    pub local_image: PathBuf,
    /// Read-only root of the remote image-layer pool.
    pub remote_image: PathBuf,
}

impl DriverRoots {
    /// Roots at their default (env-overridable) locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Place all three roots under a single directory.
    ///
    /// Used by tests and single-host deployments that have no shared pool.
    #[must_use]
    pub fn under(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            local_container: base.join("container-layers"),
            local_image: base.join("image-layers"),
            remote_image: base.join("remote-layers"),
        }
    }

    /// The two local roots, in resolution order.
    #[must_use]
    pub fn locals(&self) -> [&Path; 2] {
        [&self.local_container, &self.local_image]
    }
}

impl Default for DriverRoots {
    fn default() -> Self {
        Self {
            local_container: LAGER_CONTAINER_ROOT.clone(),
            local_image: LAGER_IMAGE_ROOT.clone(),
            remote_image: LAGER_REMOTE_ROOT.clone(),
        }
    }
}

/// Path of a layer's metadata file under a root.
#[must_use]
pub fn layers_file(root: &Path, id: &str) -> PathBuf {
    root.join("layers").join(id)
}

/// Path of a layer's content directory under a root.
#[must_use]
pub fn diff_dir(root: &Path, id: &str) -> PathBuf {
    root.join("diff").join(id)
}

/// Path of a layer's mount point under a root.
#[must_use]
pub fn mnt_dir(root: &Path, id: &str) -> PathBuf {
    root.join("mnt").join(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roots_under_base() {
        let roots = DriverRoots::under("/tmp/lager-test");
        assert_eq!(
            roots.local_container,
            PathBuf::from("/tmp/lager-test/container-layers")
        );
        assert_eq!(
            roots.local_image,
            PathBuf::from("/tmp/lager-test/image-layers")
        );
        assert_eq!(
            roots.remote_image,
            PathBuf::from("/tmp/lager-test/remote-layers")
        );
    }

    #[test]
    fn subtree_paths() {
        let root = Path::new("/var/lib/lager/image-layers");
        assert_eq!(
            layers_file(root, "abc"),
            PathBuf::from("/var/lib/lager/image-layers/layers/abc")
        );
        assert_eq!(
            diff_dir(root, "abc"),
            PathBuf::from("/var/lib/lager/image-layers/diff/abc")
        );
        assert_eq!(
            mnt_dir(root, "abc"),
            PathBuf::from("/var/lib/lager/image-layers/mnt/abc")
        );
    }
}
