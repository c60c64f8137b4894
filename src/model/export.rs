use std::io::{Cursor, Write};
use std::path::{Component, Path};

use serde::Serialize;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::tools::file_tools::{materialize_symlink, remove_dir_contents, RemovedCounts};
use crate::tools::log::{log_error, LogServiceType};

use super::error::{Error, Result};

/// True when the relative path stays inside its root.
fn is_safe_rel_path(rel: &str) -> bool {
    let path = Path::new(rel);
    !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Package the referenced files, resolved against the job output dir, into
/// one zip archive. Missing or unsafe paths are skipped, never fatal.
pub fn build_archive(output_dir: &Path, paths: &[String]) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for rel in paths {
        if !is_safe_rel_path(rel) {
            log_error(LogServiceType::Ledger, format!("export skipping unsafe path {}", rel));
            continue;
        }
        let abs = output_dir.join(rel);
        if !abs.is_file() {
            log_error(LogServiceType::Ledger, format!("export skipping missing path {}", rel));
            continue;
        }
        let data = std::fs::read(&abs)?;
        writer.start_file(rel.as_str(), options)?;
        writer.write_all(&data)?;
    }

    let cursor = writer.finish()?;
    Ok(cursor.into_inner())
}

#[derive(Debug, Default, Serialize)]
pub struct DeleteOriginalsReport {
    pub converted_symlinks: u64,
    pub convert_failures: u64,
}

/// Turn every grouped symlink into a real copy, then delete the job's stored
/// originals. When any conversion fails the originals are left untouched, so
/// no grouped view ever dangles.
pub fn delete_originals(input_dir: &Path, output_dir: &Path) -> Result<DeleteOriginalsReport> {
    let mut report = DeleteOriginalsReport::default();
    convert_links(output_dir, &mut report)?;
    if report.convert_failures == 0 && input_dir.exists() {
        remove_dir_contents(input_dir)?;
        std::fs::remove_dir(input_dir)?;
    }
    Ok(report)
}

fn convert_links(dir: &Path, report: &mut DeleteOriginalsReport) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() && !path.is_symlink() {
            convert_links(&path, report)?;
        } else if path.is_symlink() {
            match materialize_symlink(&path) {
                Ok(true) => report.converted_symlinks += 1,
                Ok(false) => {}
                Err(err) => {
                    log_error(
                        LogServiceType::Ledger,
                        format!("failed to materialize {:?}: {}", path, err),
                    );
                    report.convert_failures += 1;
                }
            }
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct PurgeReport {
    pub input: RemovedCounts,
    pub output: RemovedCounts,
}

/// Irreversibly wipe every stored original and derived artifact, across all
/// jobs.
pub fn purge_all(input_root: &Path, output_root: &Path) -> Result<PurgeReport> {
    let input = remove_dir_contents(input_root).map_err(storage)?;
    let output = remove_dir_contents(output_root).map_err(storage)?;
    Ok(PurgeReport { input, output })
}

fn storage(err: Error) -> Error {
    Error::Storage(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn read_archive_names(bytes: &[u8]) -> Vec<String> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes.to_vec())).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn test_archive_skips_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("grouped_photos/person_000")).unwrap();
        std::fs::write(dir.path().join("grouped_photos/person_000/a.jpg"), b"aaa").unwrap();
        std::fs::write(dir.path().join("grouped_photos/person_000/b.jpg"), b"bbb").unwrap();

        let bytes = build_archive(
            dir.path(),
            &[
                "grouped_photos/person_000/a.jpg".to_string(),
                "grouped_photos/person_000/gone.jpg".to_string(),
                "grouped_photos/person_000/b.jpg".to_string(),
            ],
        )
        .unwrap();

        let names = read_archive_names(&bytes);
        assert_eq!(names, vec!["grouped_photos/person_000/a.jpg", "grouped_photos/person_000/b.jpg"]);
    }

    #[test]
    fn test_archive_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in.jpg"), b"x").unwrap();
        let bytes =
            build_archive(dir.path(), &["../in.jpg".to_string(), "/etc/hosts".to_string()]).unwrap();
        assert!(read_archive_names(&bytes).is_empty());
    }

    #[test]
    fn test_archive_content_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.jpg"), b"payload").unwrap();
        let bytes = build_archive(dir.path(), &["x.jpg".to_string()]).unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut content = Vec::new();
        archive.by_index(0).unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(content, b"payload");
    }

    #[cfg(unix)]
    #[test]
    fn test_delete_originals_materializes_links_first() {
        let root = tempfile::tempdir().unwrap();
        let input = root.path().join("input");
        let output = root.path().join("output/grouped_photos/person_000");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::create_dir_all(&output).unwrap();
        std::fs::write(input.join("a.jpg"), b"pixels").unwrap();
        std::os::unix::fs::symlink(input.join("a.jpg"), output.join("a.jpg")).unwrap();

        let report = delete_originals(&input, &root.path().join("output")).unwrap();
        assert_eq!(report.converted_symlinks, 1);
        assert_eq!(report.convert_failures, 0);
        // the original is gone, the grouped copy still readable
        assert!(!input.exists());
        assert_eq!(std::fs::read(output.join("a.jpg")).unwrap(), b"pixels");
    }

    #[test]
    fn test_purge_all_counts_both_trees() {
        let root = tempfile::tempdir().unwrap();
        let input = root.path().join("in");
        let output = root.path().join("out");
        std::fs::create_dir_all(input.join("job1")).unwrap();
        std::fs::create_dir_all(output.join("job1/faces")).unwrap();
        std::fs::write(input.join("job1/a.jpg"), b"1").unwrap();
        std::fs::write(output.join("job1/clusters.json"), b"{}").unwrap();
        std::fs::write(output.join("job1/faces/f.jpg"), b"2").unwrap();

        let report = purge_all(&input, &output).unwrap();
        assert_eq!(report.input.files, 1);
        assert_eq!(report.input.dirs, 1);
        assert_eq!(report.output.files, 2);
        assert_eq!(report.output.dirs, 2);
        assert!(input.exists() && output.exists());
    }
}
