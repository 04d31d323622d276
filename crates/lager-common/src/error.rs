//! Common error types for the lager storage driver.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`LagerError`].
pub type LagerResult<T> = Result<T, LagerError>;

/// Errors surfaced by the storage driver.
#[derive(Error, Diagnostic, Debug)]
pub enum LagerError {
    /// The kernel does not support the aufs filesystem.
    #[error("aufs was not found in /proc/filesystems")]
    #[diagnostic(
        code(lager::not_supported),
        help("Load the aufs kernel module or pick another storage driver")
    )]
    NotSupported,

    /// The backing filesystem cannot host this driver.
    #[error("backing filesystem {backing} is incompatible with the aufs driver")]
    #[diagnostic(code(lager::incompatible_fs))]
    IncompatibleFs {
        /// Human name of the backing filesystem.
        backing: String,
    },

    /// No root contains the requested layer id.
    #[error("unknown layer id: {id}")]
    #[diagnostic(code(lager::unknown_id))]
    UnknownId {
        /// The id that could not be resolved.
        id: String,
    },

    /// A parent listed in a layer's metadata cannot be resolved.
    #[error("layer {id} references unknown parent {parent}")]
    #[diagnostic(
        code(lager::dangling_parent),
        help("The parent layer was removed while still referenced")
    )]
    DanglingParent {
        /// The layer whose chain is broken.
        id: String,
        /// The parent id that no root contains.
        parent: String,
    },

    /// Reading or writing a layer metadata file failed.
    #[error("layer metadata {} could not be accessed", .path.display())]
    #[diagnostic(code(lager::metadata))]
    Metadata {
        /// Path of the metadata file.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// A mount syscall failed.
    #[error("mounting {} failed", .target.display())]
    #[diagnostic(code(lager::mount_failed))]
    MountFailed {
        /// The mount target.
        target: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// An unmount syscall failed.
    #[error("unmounting {} failed", .target.display())]
    #[diagnostic(code(lager::unmount_failed))]
    UnmountFailed {
        /// The mount target.
        target: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(lager::io))]
    Io(#[from] std::io::Error),
}

impl LagerError {
    /// True when the error wraps a NotFound I/O failure.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            LagerError::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            LagerError::Metadata { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
