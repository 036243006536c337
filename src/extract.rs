//! Archive extraction with all-or-nothing promotion.
//!
//! Archives are unpacked into a fresh staging directory next to the final
//! installation path; only a fully successful extraction is renamed into
//! place. Any entry error removes the staging directory and fails with
//! `CorruptedArchive`, so a partially extracted tree is never observable
//! at the destination.
//!
//! Node.js archives wrap everything in a single `node-vX-os-arch/` root
//! directory, which is stripped during extraction.

use crate::error::{KnotError, Result};
use flate2::read::GzDecoder;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Successful extraction outcome.
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub installed_path: PathBuf,
    pub entries: usize,
}

/// Extract `archive_path` into `destination`.
///
/// With `replace_existing`, a tree already at the destination is removed
/// right before the rename promotion, so it survives any extraction
/// failure.
pub fn extract(
    archive_path: &Path,
    destination: &Path,
    replace_existing: bool,
) -> Result<ExtractionResult> {
    let parent = destination.parent().ok_or_else(|| KnotError::PathAccess {
        path: destination.to_path_buf(),
        message: "destination has no parent directory".into(),
    })?;
    std::fs::create_dir_all(parent)?;

    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "install".to_string());
    let staging = parent.join(format!(".{}.staging-{}", name, std::process::id()));
    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    std::fs::create_dir_all(&staging)?;

    let file_name = archive_path.to_string_lossy();
    let result = if file_name.ends_with(".tar.gz") || file_name.ends_with(".tgz") {
        extract_tar_gz(archive_path, &staging)
    } else if file_name.ends_with(".zip") {
        extract_zip(archive_path, &staging)
    } else {
        Err(KnotError::CorruptedArchive {
            path: archive_path.to_path_buf(),
            message: "unrecognized archive format".into(),
        })
    };

    match result {
        Ok(entries) => {
            let promoted = (|| {
                if replace_existing && destination.exists() {
                    std::fs::remove_dir_all(destination)?;
                }
                std::fs::rename(&staging, destination)
            })();
            if let Err(e) = promoted {
                let _ = std::fs::remove_dir_all(&staging);
                return Err(KnotError::PathAccess {
                    path: destination.to_path_buf(),
                    message: format!("could not promote extracted tree: {e}"),
                });
            }
            debug!("extracted {entries} entries to {}", destination.display());
            Ok(ExtractionResult {
                installed_path: destination.to_path_buf(),
                entries,
            })
        }
        Err(err) => {
            let _ = std::fs::remove_dir_all(&staging);
            Err(err)
        }
    }
}

fn extract_tar_gz(archive_path: &Path, staging: &Path) -> Result<usize> {
    let file = std::fs::File::open(archive_path)?;
    let decoder = GzDecoder::new(std::io::BufReader::new(file));
    let mut archive = tar::Archive::new(decoder);
    let mut entries = 0usize;

    for entry in archive.entries().map_err(|e| corrupted(archive_path, e))? {
        let mut entry = entry.map_err(|e| corrupted(archive_path, e))?;
        let path = entry
            .path()
            .map_err(|e| corrupted(archive_path, e))?
            .into_owned();
        let Some(stripped) = strip_root(archive_path, &path)? else {
            continue; // the wrapping root directory itself
        };
        let target = staging.join(&stripped);

        let entry_type = entry.header().entry_type();
        match entry_type {
            tar::EntryType::Directory => {
                std::fs::create_dir_all(&target)?;
            }
            tar::EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                entry
                    .unpack(&target)
                    .map_err(|e| corrupted(archive_path, e))?;
            }
            tar::EntryType::Symlink | tar::EntryType::Link => {
                let link = entry
                    .link_name()
                    .map_err(|e| corrupted(archive_path, e))?
                    .ok_or_else(|| KnotError::CorruptedArchive {
                        path: archive_path.to_path_buf(),
                        message: format!("link entry '{}' has no target", path.display()),
                    })?;
                // An escaping link target would let later entries write
                // through it to arbitrary paths.
                if !link_target_is_contained(&stripped, &link) {
                    return Err(KnotError::CorruptedArchive {
                        path: archive_path.to_path_buf(),
                        message: format!(
                            "link '{}' -> '{}' escapes the destination",
                            path.display(),
                            link.display()
                        ),
                    });
                }
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                entry
                    .unpack(&target)
                    .map_err(|e| corrupted(archive_path, e))?;
            }
            other => {
                return Err(KnotError::CorruptedArchive {
                    path: archive_path.to_path_buf(),
                    message: format!("unexpected entry type {other:?} at {}", path.display()),
                });
            }
        }
        entries += 1;
    }
    Ok(entries)
}

fn extract_zip(archive_path: &Path, staging: &Path) -> Result<usize> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| corrupted(archive_path, e))?;
    let mut entries = 0usize;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| corrupted(archive_path, e))?;
        let Some(enclosed) = entry.enclosed_name() else {
            return Err(KnotError::CorruptedArchive {
                path: archive_path.to_path_buf(),
                message: format!("entry '{}' escapes the archive root", entry.name()),
            });
        };
        let Some(stripped) = strip_root(archive_path, &enclosed)? else {
            continue;
        };
        let target = staging.join(&stripped);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = std::fs::File::create(&target)?;
            std::io::copy(&mut entry, &mut out).map_err(|e| corrupted(archive_path, e))?;

            #[cfg(unix)]
            if let Some(mode) = entry.unix_mode() {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))?;
            }
        }
        entries += 1;
    }
    Ok(entries)
}

/// Drop the wrapping root component and reject anything that is not a
/// plain relative path. Returns `None` for the root component itself.
fn strip_root(archive_path: &Path, path: &Path) -> Result<Option<PathBuf>> {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(_)) => {}
        _ => {
            return Err(KnotError::CorruptedArchive {
                path: archive_path.to_path_buf(),
                message: format!("illegal entry path '{}'", path.display()),
            });
        }
    }
    let mut stripped = PathBuf::new();
    for component in components {
        match component {
            Component::Normal(part) => stripped.push(part),
            Component::CurDir => {}
            _ => {
                return Err(KnotError::CorruptedArchive {
                    path: archive_path.to_path_buf(),
                    message: format!("illegal entry path '{}'", path.display()),
                });
            }
        }
    }
    if stripped.as_os_str().is_empty() {
        Ok(None)
    } else {
        Ok(Some(stripped))
    }
}

/// A link target is contained when it is relative and cannot climb above
/// the extraction root from the entry's own location.
fn link_target_is_contained(entry_path: &Path, target: &Path) -> bool {
    if target.is_absolute() {
        return false;
    }
    let mut depth = entry_path
        .parent()
        .map_or(0, |p| p.components().count() as i64);
    for component in target.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::CurDir => {}
            _ => return false,
        }
    }
    true
}

fn corrupted(archive_path: &Path, e: impl std::fmt::Display) -> KnotError {
    KnotError::CorruptedArchive {
        path: archive_path.to_path_buf(),
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::tempdir;

    enum TarEntry<'a> {
        Dir(&'a str),
        File(&'a str, &'a [u8]),
        Symlink(&'a str, &'a str),
    }

    fn write_tar_gz(path: &Path, entries: &[TarEntry<'_>]) {
        let file = std::fs::File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::fast());
        let mut builder = tar::Builder::new(encoder);
        for entry in entries {
            let mut header = tar::Header::new_gnu();
            match entry {
                TarEntry::File(name, data) => {
                    // `append_data` rejects `..` path components, which the
                    // traversal tests need, so write the name bytes directly.
                    let gnu = header.as_gnu_mut().unwrap();
                    gnu.name[..name.len()].copy_from_slice(name.as_bytes());
                    header.set_size(data.len() as u64);
                    header.set_mode(0o644);
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_cksum();
                    builder.append(&header, *data).unwrap();
                }
                TarEntry::Dir(name) => {
                    header.set_size(0);
                    header.set_mode(0o755);
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_cksum();
                    builder
                        .append_data(&mut header, name, std::io::empty())
                        .unwrap();
                }
                TarEntry::Symlink(name, target) => {
                    header.set_size(0);
                    header.set_mode(0o777);
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_link_name(target).unwrap();
                    header.set_cksum();
                    builder
                        .append_data(&mut header, name, std::io::empty())
                        .unwrap();
                }
            }
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_extract_strips_root_directory() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("node-v1.0.0-linux-x64.tar.gz");
        write_tar_gz(
            &archive,
            &[
                TarEntry::Dir("node-v1.0.0-linux-x64"),
                TarEntry::Dir("node-v1.0.0-linux-x64/bin"),
                TarEntry::File("node-v1.0.0-linux-x64/bin/node", b"#!binary"),
                TarEntry::File("node-v1.0.0-linux-x64/README.md", b"docs"),
            ],
        );

        let dest = dir.path().join("versions").join("work");
        let result = extract(&archive, &dest, false).unwrap();
        assert_eq!(result.installed_path, dest);
        assert!(dest.join("bin").join("node").exists());
        assert!(dest.join("README.md").exists());
        // Staging directory is gone after promotion.
        assert_eq!(
            std::fs::read_dir(dir.path().join("versions")).unwrap().count(),
            1
        );
    }

    #[test]
    fn test_traversal_entry_aborts_without_destination() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("evil.tar.gz");
        write_tar_gz(
            &archive,
            &[
                TarEntry::File("root/ok.txt", b"fine"),
                TarEntry::File("root/../../escape.txt", b"evil"),
            ],
        );

        let dest = dir.path().join("versions").join("evil");
        let err = extract(&archive, &dest, false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CorruptedArchive);
        assert!(!dest.exists());
        assert!(!dir.path().join("escape.txt").exists());
        // No staging leftovers either.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("versions"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_absolute_symlink_target_aborts_without_writes() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let archive = dir.path().join("evil.tar.gz");
        let target = outside.path().to_string_lossy().into_owned();
        write_tar_gz(
            &archive,
            &[
                TarEntry::Symlink("root/link", &target),
                TarEntry::File("root/link/pwned", b"evil"),
            ],
        );

        let dest = dir.path().join("versions").join("evil");
        let err = extract(&archive, &dest, false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CorruptedArchive);
        assert!(!dest.exists());
        // Nothing reached the directory the link pointed at.
        assert!(!outside.path().join("pwned").exists());
    }

    #[test]
    fn test_relative_symlink_escape_aborts() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("evil.tar.gz");
        write_tar_gz(
            &archive,
            &[
                TarEntry::Symlink("root/up", "../../outside"),
                TarEntry::File("root/up/pwned", b"evil"),
            ],
        );

        let dest = dir.path().join("versions").join("evil");
        let err = extract(&archive, &dest, false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CorruptedArchive);
        assert!(!dest.exists());
        assert!(!dir.path().join("outside").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_internal_symlink_is_preserved() {
        // Node archives link bin/npm to ../lib/node_modules/...; targets
        // that stay inside the tree must keep working.
        let dir = tempdir().unwrap();
        let archive = dir.path().join("node-v1.0.0-linux-x64.tar.gz");
        write_tar_gz(
            &archive,
            &[
                TarEntry::Dir("root/lib"),
                TarEntry::File("root/lib/npm-cli.js", b"#!node"),
                TarEntry::Dir("root/bin"),
                TarEntry::Symlink("root/bin/npm", "../lib/npm-cli.js"),
            ],
        );

        let dest = dir.path().join("versions").join("work");
        extract(&archive, &dest, false).unwrap();
        let link = std::fs::read_link(dest.join("bin").join("npm")).unwrap();
        assert_eq!(link, PathBuf::from("../lib/npm-cli.js"));
        assert!(dest.join("bin").join("npm").exists());
    }

    #[test]
    fn test_link_target_containment() {
        let contains = |entry: &str, target: &str| {
            link_target_is_contained(Path::new(entry), Path::new(target))
        };
        assert!(contains("bin/npm", "../lib/npm-cli.js"));
        assert!(contains("bin/npm", "node"));
        assert!(!contains("link", "../outside"));
        assert!(!contains("link", "/etc/passwd"));
        assert!(!contains("a/b", "../../../escape"));
        assert!(contains("a/b", "sub/../peer"));
    }

    #[test]
    fn test_replace_existing_swaps_tree_only_after_success() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("versions").join("work");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("old.txt"), b"previous runtime").unwrap();

        // A corrupt archive must leave the existing tree untouched.
        let garbage = dir.path().join("garbage.tar.gz");
        std::fs::write(&garbage, b"this is not a gzip stream").unwrap();
        let err = extract(&garbage, &dest, true).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CorruptedArchive);
        assert!(dest.join("old.txt").exists());

        // A good one replaces it wholesale.
        let archive = dir.path().join("node-v2.0.0-linux-x64.tar.gz");
        write_tar_gz(&archive, &[TarEntry::File("root/new.txt", b"replacement")]);
        extract(&archive, &dest, true).unwrap();
        assert!(dest.join("new.txt").exists());
        assert!(!dest.join("old.txt").exists());
    }

    #[test]
    fn test_garbage_archive_is_corrupted() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("garbage.tar.gz");
        std::fs::write(&archive, b"this is not a gzip stream").unwrap();
        let err = extract(&archive, &dir.path().join("out"), false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CorruptedArchive);
    }

    #[test]
    fn test_unknown_format_is_corrupted() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("archive.rar");
        std::fs::write(&archive, b"rar").unwrap();
        let err = extract(&archive, &dir.path().join("out"), false).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CorruptedArchive);
    }

    #[test]
    fn test_extract_zip_strips_root() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("node-v1.0.0-win-x64.zip");
        let file = std::fs::File::create(&archive).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        writer
            .start_file("node-v1.0.0-win-x64/node.exe", options)
            .unwrap();
        writer.write_all(b"binary").unwrap();
        writer
            .start_file("node-v1.0.0-win-x64/npm.cmd", options)
            .unwrap();
        writer.write_all(b"@echo off").unwrap();
        writer.finish().unwrap();

        let dest = dir.path().join("versions").join("winwork");
        let result = extract(&archive, &dest, false).unwrap();
        assert_eq!(result.entries, 2);
        assert!(dest.join("node.exe").exists());
        assert!(dest.join("npm.cmd").exists());
    }
}
