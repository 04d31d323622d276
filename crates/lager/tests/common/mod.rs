//! Shared test fixtures: a recording mount backend and driver setup.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lager::platform::{MountBackend, MountFlags};
use lager::Driver;
use lager_common::paths::DriverRoots;
use lager_common::{LagerError, LagerResult};

/// One recorded mount syscall.
#[derive(Debug, Clone)]
pub struct MountCall {
    pub target: PathBuf,
    pub fstype: String,
    pub remount: bool,
    pub data: String,
}

/// Mount backend that records calls instead of touching the kernel.
#[derive(Default)]
pub struct FakeMount {
    pub mounts: Mutex<Vec<MountCall>>,
    pub unmounts: Mutex<Vec<PathBuf>>,
    pub privates: Mutex<Vec<PathBuf>>,
    pub mounted: Mutex<HashSet<PathBuf>>,
    /// Whether the dirperm1 probe mount is accepted.
    pub probe_succeeds: bool,
    /// Reject every `append:` remount.
    pub fail_appends: bool,
}

impl FakeMount {
    /// Probe mounts carry a bare branch with no `=rw`/`=ro` mode.
    fn is_probe(data: &str) -> bool {
        data.starts_with("br:") && !data.contains("=rw")
    }

    /// Number of dirperm1 probe mounts seen.
    pub fn probe_count(&self) -> usize {
        self.mounts
            .lock()
            .unwrap()
            .iter()
            .filter(|call| Self::is_probe(&call.data))
            .count()
    }

    /// Recorded union mounts, probe traffic filtered out.
    pub fn union_mounts(&self) -> Vec<MountCall> {
        self.mounts
            .lock()
            .unwrap()
            .iter()
            .filter(|call| !Self::is_probe(&call.data))
            .cloned()
            .collect()
    }

    pub fn is_mounted(&self, target: &Path) -> bool {
        self.mounted.lock().unwrap().contains(target)
    }
}

impl MountBackend for FakeMount {
    fn mount(
        &self,
        _source: &str,
        target: &Path,
        fstype: &str,
        flags: MountFlags,
        data: &str,
    ) -> LagerResult<()> {
        if Self::is_probe(data) && !self.probe_succeeds {
            return Err(LagerError::MountFailed {
                target: target.to_path_buf(),
                source: std::io::Error::other("probe rejected"),
            });
        }
        self.mounts.lock().unwrap().push(MountCall {
            target: target.to_path_buf(),
            fstype: fstype.to_string(),
            remount: flags.remount,
            data: data.to_string(),
        });
        if self.fail_appends && data.starts_with("append:") {
            return Err(LagerError::MountFailed {
                target: target.to_path_buf(),
                source: std::io::Error::other("append rejected"),
            });
        }
        self.mounted.lock().unwrap().insert(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> LagerResult<()> {
        self.unmounts.lock().unwrap().push(target.to_path_buf());
        self.mounted.lock().unwrap().remove(target);
        Ok(())
    }

    fn mounted(&self, target: &Path) -> LagerResult<bool> {
        Ok(self.mounted.lock().unwrap().contains(target))
    }

    fn make_private(&self, target: &Path) -> LagerResult<()> {
        self.privates.lock().unwrap().push(target.to_path_buf());
        Ok(())
    }
}

/// Driver over tempdir roots and a default fake backend.
pub fn driver_in(base: &Path) -> (Driver, Arc<FakeMount>) {
    driver_with(base, FakeMount::default())
}

/// Driver over tempdir roots and the given fake backend.
pub fn driver_with(base: &Path, backend: FakeMount) -> (Driver, Arc<FakeMount>) {
    let backend = Arc::new(backend);
    let driver = Driver::with_backend(DriverRoots::under(base), Box::new(backend.clone()))
        .expect("driver construction");
    (driver, backend)
}
