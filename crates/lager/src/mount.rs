//! Union mount engine.
//!
//! Assembles aufs branch lists and issues the mount calls. The kernel
//! clips mount options to one memory page, so branches that do not fit
//! into the first mount are applied afterwards as individual
//! remount-append calls.

use std::path::{Path, PathBuf};

use lager_common::LagerResult;
use once_cell::sync::OnceCell;

use crate::platform::{self, MountBackend, MountFlags};

/// Fixed trailing options of every union mount.
const XINO_OPTS: &str = "dio,xino=/dev/shm/aufs.xino";
/// Option enabling relaxed directory-permission semantics, probed once.
const DIRPERM1_OPT: &str = "dirperm1";

/// Issues union mounts through a [`MountBackend`].
pub struct UnionMounter {
    backend: Box<dyn MountBackend>,
    dirperm1: OnceCell<bool>,
}

impl UnionMounter {
    /// Wrap a mount backend.
    pub fn new(backend: Box<dyn MountBackend>) -> Self {
        Self {
            backend,
            dirperm1: OnceCell::new(),
        }
    }

    /// The underlying backend.
    #[must_use]
    pub fn backend(&self) -> &dyn MountBackend {
        self.backend.as_ref()
    }

    /// Mount the union of `rw` over the read-only branches at `target`.
    ///
    /// Branches are stacked in the given order, nearest parent first.
    /// A no-op when `target` is already mounted. On any failure the
    /// target is unmounted again so no half-populated mount lingers.
    pub fn mount_union(
        &self,
        ro: &[PathBuf],
        rw: &Path,
        target: &Path,
        mount_label: &str,
    ) -> LagerResult<()> {
        if self.backend.mounted(target)? {
            return Ok(());
        }

        let result = self.mount_branches(ro, rw, target, mount_label);
        if result.is_err() {
            if let Err(cleanup) = self.unmount(target) {
                tracing::warn!(
                    target = %target.display(),
                    error = %cleanup,
                    "Failed to clean up partial union mount"
                );
            }
        }
        result
    }

    fn mount_branches(
        &self,
        ro: &[PathBuf],
        rw: &Path,
        target: &Path,
        mount_label: &str,
    ) -> LagerResult<()> {
        let fixed = self.fixed_options();

        // Branch-list budget: one page minus the joining comma, the fixed
        // trailing options and the label suffix.
        let budget = platform::page_size()
            .saturating_sub(1 + fixed.len())
            .saturating_sub(label_suffix_len(mount_label));

        let mut branches = format!("br:{}=rw", rw.display());
        let mut fitted = 0;
        for path in ro {
            let branch = format!(":{}=ro+wh", path.display());
            if branches.len() + branch.len() > budget {
                break;
            }
            branches.push_str(&branch);
            fitted += 1;
        }

        let data = format_mount_label(&format!("{branches},{fixed}"), mount_label);
        self.backend
            .mount("none", target, "aufs", MountFlags::default(), &data)?;

        // Whatever did not fit goes in one at a time, same order.
        for path in &ro[fitted..] {
            let data = format_mount_label(&format!("append:{}=ro+wh", path.display()), mount_label);
            self.backend
                .mount("none", target, "aufs", MountFlags::remount(), &data)?;
        }

        tracing::debug!(
            target = %target.display(),
            branches = ro.len() + 1,
            appended = ro.len() - fitted,
            "Union mounted"
        );
        Ok(())
    }

    /// Unmount `target` if it is mounted.
    pub fn unmount(&self, target: &Path) -> LagerResult<()> {
        if !self.backend.mounted(target)? {
            return Ok(());
        }
        self.backend.unmount(target)
    }

    /// Whether the kernel accepts the dirperm1 option.
    ///
    /// Probed lazily with a throwaway single-branch mount; the outcome is
    /// cached for the lifetime of the engine, whichever way it went.
    pub fn dirperm1_supported(&self) -> bool {
        *self.dirperm1.get_or_init(|| self.probe_dirperm1())
    }

    fn probe_dirperm1(&self) -> bool {
        let base = match tempfile::Builder::new().prefix("lager-aufs-base").tempdir() {
            Ok(dir) => dir,
            Err(err) => {
                tracing::error!(error = %err, "dirperm1 probe: cannot create branch dir");
                return false;
            }
        };
        let union = match tempfile::Builder::new().prefix("lager-aufs-union").tempdir() {
            Ok(dir) => dir,
            Err(err) => {
                tracing::error!(error = %err, "dirperm1 probe: cannot create union dir");
                return false;
            }
        };

        let opts = format!(
            "br:{},{DIRPERM1_OPT},xino=/dev/shm/aufs.xino",
            base.path().display()
        );
        if self
            .backend
            .mount("none", union.path(), "aufs", MountFlags::default(), &opts)
            .is_err()
        {
            return false;
        }

        if let Err(err) = self.backend.unmount(union.path()) {
            tracing::error!(error = %err, "dirperm1 probe: failed to unmount");
        }
        true
    }

    fn fixed_options(&self) -> String {
        if self.dirperm1_supported() {
            format!("{XINO_OPTS},{DIRPERM1_OPT}")
        } else {
            XINO_OPTS.to_string()
        }
    }
}

/// Append a security label to a mount-option string, the way the kernel
/// expects it. An empty label leaves the options untouched.
#[must_use]
pub fn format_mount_label(data: &str, label: &str) -> String {
    if label.is_empty() {
        data.to_string()
    } else if data.is_empty() {
        format!("context=\"{label}\"")
    } else {
        format!("{data},context=\"{label}\"")
    }
}

/// Bytes `format_mount_label` adds for this label.
fn label_suffix_len(label: &str) -> usize {
    if label.is_empty() {
        0
    } else {
        ",context=\"\"".len() + label.len()
    }
}
