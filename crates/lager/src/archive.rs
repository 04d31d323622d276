//! Archive collaborator: tar streams of layer content, change lists and
//! directory sizing.
//!
//! Diffs are plain uncompressed tars of a layer's diff directory. The
//! union filesystem's whiteout bookkeeping entries (`.wh..wh.*`) never
//! leave the machine; `.wh.<name>` deletion markers do, since they carry
//! layer semantics.

use std::fmt;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use lager_common::LagerResult;
use walkdir::WalkDir;

/// Prefix marking a deleted lower-layer entry.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Prefix of the union filesystem's own bookkeeping entries.
pub const WHITEOUT_META_PREFIX: &str = ".wh..wh.";

/// One entry in a change list.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Change {
    /// Path relative to the layer root.
    pub path: PathBuf,
    /// What happened to it.
    pub kind: ChangeKind,
}

/// The kind of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeKind {
    /// Entry exists here but not in any parent.
    Added,
    /// Entry shadows one present in a parent.
    Modified,
    /// A whiteout marks the entry deleted from a parent.
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeKind::Added => "A",
            ChangeKind::Modified => "C",
            ChangeKind::Deleted => "D",
        })
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.path.display())
    }
}

fn is_meta_whiteout(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with(WHITEOUT_META_PREFIX)
}

/// Produce an uncompressed tar of `dir`, excluding `.wh..wh.*` entries.
///
/// The archive is spooled to an unlinked temporary file so arbitrarily
/// large layers stream without holding the bytes in memory.
pub fn tar_diff(dir: &Path) -> LagerResult<Box<dyn Read + Send>> {
    let spool = tempfile::tempfile()?;
    let mut builder = tar::Builder::new(spool);
    builder.follow_symlinks(false);

    let walk = WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !is_meta_whiteout(entry.file_name()));
    for entry in walk {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(std::io::Error::other)?;
        builder.append_path_with_name(entry.path(), rel)?;
    }

    let mut spool = builder.into_inner()?;
    spool.seek(SeekFrom::Start(0))?;
    Ok(Box::new(spool) as Box<dyn Read + Send>)
}

/// Extract a tar stream into `dir`.
///
/// Entries whose paths would escape `dir` are refused by the extractor,
/// so hostile archives cannot write outside the layer.
pub fn apply(reader: impl Read, dir: &Path) -> LagerResult<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(true);
    archive.set_unpack_xattrs(true);
    archive.unpack(dir)?;
    Ok(())
}

/// Changes `diff` introduces relative to the ordered parent layers.
///
/// A copy-on-write diff directory only holds entries that changed, so
/// presence decides: a `.wh.` marker is a deletion, a path present in
/// some parent is a modification, anything else is an addition.
pub fn changes(parents: &[PathBuf], diff: &Path) -> LagerResult<Vec<Change>> {
    let mut out = Vec::new();

    let walk = WalkDir::new(diff)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !is_meta_whiteout(entry.file_name()));
    for entry in walk {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(diff)
            .map_err(std::io::Error::other)?
            .to_path_buf();
        let name = entry.file_name().to_string_lossy();

        if let Some(stripped) = name.strip_prefix(WHITEOUT_PREFIX) {
            out.push(Change {
                path: rel.with_file_name(stripped),
                kind: ChangeKind::Deleted,
            });
        } else {
            let in_parent = parents
                .iter()
                .any(|parent| parent.join(&rel).symlink_metadata().is_ok());
            out.push(Change {
                path: rel,
                kind: if in_parent {
                    ChangeKind::Modified
                } else {
                    ChangeKind::Added
                },
            });
        }
    }

    out.sort();
    Ok(out)
}

/// Total byte size of the regular files under `dir`.
pub fn directory_size(dir: &Path) -> LagerResult<u64> {
    let mut total = 0;
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(std::io::Error::other)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(std::io::Error::other)?.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn read_entries(reader: Box<dyn Read + Send>) -> Vec<String> {
        let mut archive = tar::Archive::new(reader);
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|entry| {
                entry
                    .unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        names.sort();
        names
    }

    #[test]
    fn tar_excludes_meta_whiteouts() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("etc-passwd"), "root").unwrap();
        fs::write(temp.path().join(".wh.removed"), "").unwrap();
        fs::write(temp.path().join(".wh..wh.aufs"), "").unwrap();
        fs::create_dir(temp.path().join(".wh..wh.orph")).unwrap();
        fs::write(temp.path().join(".wh..wh.orph/junk"), "").unwrap();

        let names = read_entries(tar_diff(temp.path()).unwrap());
        assert_eq!(names, vec![".wh.removed", "etc-passwd"]);
    }

    #[test]
    fn tar_round_trips_through_apply() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("usr/bin")).unwrap();
        fs::write(src.path().join("usr/bin/sh"), "#!/bin/true").unwrap();
        fs::write(src.path().join("hello"), "world").unwrap();

        let dst = tempfile::tempdir().unwrap();
        apply(tar_diff(src.path()).unwrap(), dst.path()).unwrap();

        assert_eq!(
            fs::read_to_string(dst.path().join("usr/bin/sh")).unwrap(),
            "#!/bin/true"
        );
        assert_eq!(fs::read_to_string(dst.path().join("hello")).unwrap(), "world");
    }

    #[test]
    fn changes_classify_against_parents() {
        let parent = tempfile::tempdir().unwrap();
        fs::write(parent.path().join("kept"), "v1").unwrap();
        fs::write(parent.path().join("gone"), "v1").unwrap();

        let diff = tempfile::tempdir().unwrap();
        fs::write(diff.path().join("kept"), "v2").unwrap();
        fs::write(diff.path().join(".wh.gone"), "").unwrap();
        fs::write(diff.path().join("fresh"), "new").unwrap();
        fs::write(diff.path().join(".wh..wh.aufs"), "").unwrap();

        let changes = changes(&[parent.path().to_path_buf()], diff.path()).unwrap();
        assert_eq!(
            changes,
            vec![
                Change {
                    path: PathBuf::from("fresh"),
                    kind: ChangeKind::Added,
                },
                Change {
                    path: PathBuf::from("gone"),
                    kind: ChangeKind::Deleted,
                },
                Change {
                    path: PathBuf::from("kept"),
                    kind: ChangeKind::Modified,
                },
            ]
        );
        assert_eq!(changes[1].to_string(), "D gone");
    }

    #[test]
    fn size_counts_regular_files_only() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir(temp.path().join("sub")).unwrap();
        fs::write(temp.path().join("a"), [0u8; 100]).unwrap();
        fs::write(temp.path().join("sub/b"), [0u8; 28]).unwrap();
        std::os::unix::fs::symlink("a", temp.path().join("link")).unwrap();

        assert_eq!(directory_size(temp.path()).unwrap(), 128);
    }
}
