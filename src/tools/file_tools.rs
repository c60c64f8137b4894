use std::fs;
use std::path::{Path, PathBuf};

use crate::model::error::{Error, Result};

pub fn filename_from_path(path: &str) -> Option<String> {
    let escaped = path.replace('\\', "/");
    escaped.split('/').last().and_then(|last| {
        last.split('?').next().map(|c| c.to_owned())
    })
}

pub fn is_supported_image(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    lower.ends_with(".jpg") || lower.ends_with(".jpeg") || lower.ends_with(".png")
}

pub fn get_mime_from_filename(path: &str) -> Option<String> {
    mime_guess::from_path(path).first().map(|m| m.to_string())
}

/// Recursively list supported images under `root`, sorted by path so a given
/// input set always yields the same processing order.
pub fn list_images(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !root.exists() {
        return Ok(files);
    }
    walk_images(root, &mut files)?;
    files.sort();
    Ok(files)
}

fn walk_images(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_images(&path, files)?;
        } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if is_supported_image(name) {
                files.push(path);
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    Copy,
    Symlink,
}

/// Create `dst` from `src`, either as a symlink (falling back to a copy when
/// the filesystem refuses) or as a plain copy. Existing destinations are kept.
pub fn link_or_copy(src: &Path, dst: &Path, mode: LinkMode) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    if dst.exists() || dst.is_symlink() {
        return Ok(());
    }
    if mode == LinkMode::Symlink {
        #[cfg(unix)]
        {
            if std::os::unix::fs::symlink(src, dst).is_ok() {
                return Ok(());
            }
        }
    }
    fs::copy(src, dst)?;
    Ok(())
}

/// Replace a symlink with a real copy of its target. Returns false when the
/// path was not a symlink in the first place.
pub fn materialize_symlink(path: &Path) -> Result<bool> {
    if !path.is_symlink() {
        return Ok(false);
    }
    let target = fs::read_link(path)?;
    let target = if target.is_relative() {
        path.parent().map(|p| p.join(&target)).unwrap_or(target)
    } else {
        target
    };
    if !target.exists() {
        return Err(Error::FileNotFound(path.to_string_lossy().to_string()));
    }
    let tmp = path.with_extension("materialize.tmp");
    fs::copy(&target, &tmp)?;
    fs::remove_file(path)?;
    fs::rename(&tmp, path)?;
    Ok(true)
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct RemovedCounts {
    pub files: u64,
    pub dirs: u64,
}

/// Delete everything under `root` (the root itself is kept), counting what
/// was removed.
pub fn remove_dir_contents(root: &Path) -> Result<RemovedCounts> {
    let mut counts = RemovedCounts::default();
    if !root.exists() {
        return Ok(counts);
    }
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() && !path.is_symlink() {
            let sub = count_entries(&path)?;
            counts.files += sub.files;
            counts.dirs += sub.dirs + 1;
            fs::remove_dir_all(&path)?;
        } else {
            counts.files += 1;
            fs::remove_file(&path)?;
        }
    }
    Ok(counts)
}

fn count_entries(dir: &Path) -> Result<RemovedCounts> {
    let mut counts = RemovedCounts::default();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() && !path.is_symlink() {
            let sub = count_entries(&path)?;
            counts.files += sub.files;
            counts.dirs += sub.dirs + 1;
        } else {
            counts.files += 1;
        }
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_from_path() {
        assert_eq!(filename_from_path("a/b/c.jpg"), Some("c.jpg".to_string()));
        assert_eq!(filename_from_path("a\\b\\c.jpg"), Some("c.jpg".to_string()));
        assert_eq!(filename_from_path("c.jpg?x=1"), Some("c.jpg".to_string()));
    }

    #[test]
    fn test_is_supported_image() {
        assert!(is_supported_image("photo.JPG"));
        assert!(is_supported_image("photo.jpeg"));
        assert!(is_supported_image("photo.png"));
        assert!(!is_supported_image("photo.gif"));
        assert!(!is_supported_image("notes.txt"));
    }

    #[test]
    fn test_list_images_sorted_recursive() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("b.jpg"), b"x").unwrap();
        fs::write(dir.path().join("a.png"), b"x").unwrap();
        fs::write(dir.path().join("sub/c.jpeg"), b"x").unwrap();
        fs::write(dir.path().join("skip.txt"), b"x").unwrap();
        let found = list_images(dir.path()).unwrap();
        let names: Vec<_> = found.iter().map(|p| p.file_name().unwrap().to_str().unwrap().to_string()).collect();
        assert_eq!(names, vec!["a.png", "b.jpg", "c.jpeg"]);
    }

    #[test]
    fn test_remove_dir_contents_counts() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("x/y")).unwrap();
        fs::write(dir.path().join("x/a.bin"), b"1").unwrap();
        fs::write(dir.path().join("x/y/b.bin"), b"2").unwrap();
        fs::write(dir.path().join("c.bin"), b"3").unwrap();
        let counts = remove_dir_contents(dir.path()).unwrap();
        assert_eq!(counts.files, 3);
        assert_eq!(counts.dirs, 2);
        assert!(dir.path().exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_materialize_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("orig.jpg");
        let lnk = dir.path().join("link.jpg");
        fs::write(&src, b"pixels").unwrap();
        std::os::unix::fs::symlink(&src, &lnk).unwrap();
        assert!(materialize_symlink(&lnk).unwrap());
        assert!(!lnk.is_symlink());
        fs::remove_file(&src).unwrap();
        assert_eq!(fs::read(&lnk).unwrap(), b"pixels");
        // plain files are left alone
        assert!(!materialize_symlink(&lnk).unwrap());
    }
}
