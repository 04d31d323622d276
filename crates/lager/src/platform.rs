//! Platform adapter: mount syscalls and kernel feature detection.

use std::path::Path;

use lager_common::{LagerError, LagerResult};

/// Mount flags the driver uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MountFlags {
    /// Modify an existing mount in place (MS_REMOUNT).
    pub remount: bool,
}

impl MountFlags {
    /// Flags for a remount call.
    #[must_use]
    pub fn remount() -> Self {
        Self { remount: true }
    }
}

/// Narrow seam over the kernel mount interface.
///
/// The production implementation is [`SysMount`]; tests substitute a
/// recording fake.
pub trait MountBackend: Send + Sync {
    /// Mount `source` at `target` with the given filesystem type and data.
    fn mount(
        &self,
        source: &str,
        target: &Path,
        fstype: &str,
        flags: MountFlags,
        data: &str,
    ) -> LagerResult<()>;

    /// Unmount `target`.
    fn unmount(&self, target: &Path) -> LagerResult<()>;

    /// Whether `target` is currently a mount point.
    fn mounted(&self, target: &Path) -> LagerResult<bool>;

    /// Mark `target` as a private mount so mounts beneath it do not
    /// propagate to peers.
    fn make_private(&self, target: &Path) -> LagerResult<()>;
}

impl<T: MountBackend + ?Sized> MountBackend for std::sync::Arc<T> {
    fn mount(
        &self,
        source: &str,
        target: &Path,
        fstype: &str,
        flags: MountFlags,
        data: &str,
    ) -> LagerResult<()> {
        (**self).mount(source, target, fstype, flags, data)
    }

    fn unmount(&self, target: &Path) -> LagerResult<()> {
        (**self).unmount(target)
    }

    fn mounted(&self, target: &Path) -> LagerResult<bool> {
        (**self).mounted(target)
    }

    fn make_private(&self, target: &Path) -> LagerResult<()> {
        (**self).make_private(target)
    }
}

/// Mount backend issuing real syscalls.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysMount;

#[cfg(target_os = "linux")]
impl MountBackend for SysMount {
    fn mount(
        &self,
        source: &str,
        target: &Path,
        fstype: &str,
        flags: MountFlags,
        data: &str,
    ) -> LagerResult<()> {
        use rustix::mount::{MountFlags as SysFlags, mount, mount_remount};

        tracing::debug!(
            source,
            target = %target.display(),
            fstype,
            ?flags,
            data,
            "Mounting filesystem"
        );

        let sys = SysFlags::empty();

        let fstype_c = cstr(fstype, target)?;
        let data_c = cstr(data, target)?;

        if flags.remount {
            mount_remount(target, sys, data_c.as_c_str())
        } else {
            mount(source, target, fstype_c.as_c_str(), sys, data_c.as_c_str())
        }
        .map_err(|e| LagerError::MountFailed {
            target: target.to_path_buf(),
            source: e.into(),
        })
    }

    fn unmount(&self, target: &Path) -> LagerResult<()> {
        use rustix::mount::{UnmountFlags, unmount};

        tracing::debug!(target = %target.display(), "Unmounting filesystem");

        unmount(target, UnmountFlags::empty()).map_err(|e| LagerError::UnmountFailed {
            target: target.to_path_buf(),
            source: e.into(),
        })
    }

    fn mounted(&self, target: &Path) -> LagerResult<bool> {
        let contents = std::fs::read_to_string("/proc/self/mountinfo")?;
        Ok(mountinfo_lists(&contents, target))
    }

    fn make_private(&self, target: &Path) -> LagerResult<()> {
        use rustix::mount::{MountPropagationFlags, mount_bind, mount_change};

        tracing::debug!(target = %target.display(), "Making mount private");

        // A plain directory carries no propagation state; bind it onto
        // itself first so there is a mount to mark.
        if !self.mounted(target)? {
            mount_bind(target, target).map_err(|e| LagerError::MountFailed {
                target: target.to_path_buf(),
                source: e.into(),
            })?;
        }

        mount_change(target, MountPropagationFlags::PRIVATE).map_err(|e| {
            LagerError::MountFailed {
                target: target.to_path_buf(),
                source: e.into(),
            }
        })
    }
}

#[cfg(not(target_os = "linux"))]
impl MountBackend for SysMount {
    fn mount(
        &self,
        _source: &str,
        _target: &Path,
        _fstype: &str,
        _flags: MountFlags,
        _data: &str,
    ) -> LagerResult<()> {
        Err(LagerError::NotSupported)
    }

    fn unmount(&self, _target: &Path) -> LagerResult<()> {
        Err(LagerError::NotSupported)
    }

    fn mounted(&self, _target: &Path) -> LagerResult<bool> {
        Err(LagerError::NotSupported)
    }

    fn make_private(&self, _target: &Path) -> LagerResult<()> {
        Err(LagerError::NotSupported)
    }
}

#[cfg(target_os = "linux")]
fn cstr(s: &str, target: &Path) -> LagerResult<std::ffi::CString> {
    std::ffi::CString::new(s).map_err(|_| LagerError::MountFailed {
        target: target.to_path_buf(),
        source: std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "mount data contains a NUL byte",
        ),
    })
}

/// True when a `/proc/self/mountinfo` dump lists `target` as a mount point.
fn mountinfo_lists(contents: &str, target: &Path) -> bool {
    let want = target.to_string_lossy();
    contents.lines().any(|line| {
        line.split(' ')
            .nth(4)
            .is_some_and(|field| unescape_mountinfo(field) == want)
    })
}

/// Decode the octal escapes mountinfo uses for space, tab, newline and
/// backslash.
fn unescape_mountinfo(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut rest = field;
    while let Some(pos) = rest.find('\\') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if after.len() >= 3 && after.is_char_boundary(3) {
            if let Ok(code) = u8::from_str_radix(&after[..3], 8) {
                out.push(code as char);
                rest = &after[3..];
                continue;
            }
        }
        out.push('\\');
        rest = after;
    }
    out.push_str(rest);
    out
}

/// Filesystem magic number as reported by statfs.
pub type FsMagic = i64;

/// aufs magic.
pub const FS_MAGIC_AUFS: FsMagic = 0x6175_6673;
/// btrfs magic.
pub const FS_MAGIC_BTRFS: FsMagic = 0x9123_683E;

/// Backings the driver refuses to run on: stacking aufs on itself, or on a
/// filesystem with its own copy-on-write semantics.
pub const INCOMPATIBLE_FS_MAGIC: &[FsMagic] = &[FS_MAGIC_BTRFS, FS_MAGIC_AUFS];

/// Probe the filesystem magic of `path`.
#[cfg(target_os = "linux")]
pub fn fs_magic(path: &Path) -> LagerResult<FsMagic> {
    let stat = rustix::fs::statfs(path).map_err(|e| LagerError::Io(e.into()))?;
    Ok(stat.f_type as FsMagic)
}

#[cfg(not(target_os = "linux"))]
pub fn fs_magic(_path: &Path) -> LagerResult<FsMagic> {
    Err(LagerError::NotSupported)
}

/// Human name for a filesystem magic, for status display.
#[must_use]
pub fn fs_name(magic: FsMagic) -> Option<&'static str> {
    Some(match magic {
        FS_MAGIC_AUFS => "aufs",
        FS_MAGIC_BTRFS => "btrfs",
        0xF15F => "ecryptfs",
        0xEF53 => "extfs",
        0x6969 => "nfs",
        0x8584_58F6 => "ramfs",
        0x5265_4973 => "reiserfs",
        0x7371_7368 => "squashfs",
        0x0102_1994 => "tmpfs",
        0x5846_5342 => "xfs",
        0x2FC1_2FC1 => "zfs",
        0x794C_7630 => "overlayfs",
        _ => return None,
    })
}

/// Size of one memory page, the kernel's mount-options budget.
#[cfg(target_os = "linux")]
#[must_use]
pub fn page_size() -> usize {
    rustix::param::page_size()
}

#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn page_size() -> usize {
    4096
}

/// Check that the kernel can mount aufs filesystems.
///
/// modprobe is best-effort only; it cannot run inside nested containers,
/// so `/proc/filesystems` has the final say.
#[cfg(target_os = "linux")]
pub fn supports_aufs() -> LagerResult<()> {
    use std::io::BufRead;

    let _ = std::process::Command::new("modprobe")
        .arg("aufs")
        .status();

    let file = std::fs::File::open("/proc/filesystems")?;
    for line in std::io::BufReader::new(file).lines() {
        if line?.contains("aufs") {
            return Ok(());
        }
    }
    Err(LagerError::NotSupported)
}

#[cfg(not(target_os = "linux"))]
pub fn supports_aufs() -> LagerResult<()> {
    Err(LagerError::NotSupported)
}
