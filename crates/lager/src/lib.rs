//! # lager
//!
//! A layered copy-on-write storage driver. Image and container layers are
//! stacked with aufs union mounts: each layer's content lives in a plain
//! `diff/` directory, its ancestry in a line-oriented `layers/` metadata
//! file, and active layers are mounted under `mnt/`.
//!
//! Layers are looked up across three roots — local container layers,
//! local image layers, and a shared remote image pool — so a container
//! layer can stack directly on image layers another host extracted.
//!
//! ## Usage
//!
//! ```no_run
//! use lager::Driver;
//!
//! # fn example() -> lager_common::LagerResult<()> {
//! let driver = Driver::init("/var/lib/lager", &[])?;
//!
//! driver.create("base", "", true)?;
//! driver.create("app", "base", false)?;
//!
//! let rootfs = driver.get("app", "")?;
//! // ... run the container on rootfs ...
//! driver.put("app")?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod archive;
pub mod driver;
pub mod mount;
pub mod platform;
pub mod store;

pub use archive::{Change, ChangeKind};
pub use driver::{DRIVER_NAME, Driver};
pub use platform::{MountBackend, MountFlags, SysMount};
pub use store::{IdDesc, LayerStore};
