use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::domain::job::{JobCounts, JobPhase, JobProgress};
use crate::tools::file_tools::filename_from_path;

use super::error::{Error, Result};

pub const STATUS_FILE: &str = "status.json";
const PARTS_DIR: &str = "parts";

/// In-memory state of one job. Uploads and curation hold their own locks so
/// a slow chunk append never blocks a progress poll. Progress sits behind a
/// std lock because the pipeline updates it from a synchronous callback.
pub struct JobState {
    pub job_id: String,
    pub progress: std::sync::RwLock<JobProgress>,
    pub upload: Mutex<UploadSession>,
    /// Per-job exclusive lock for ledger mutations.
    pub curation: Mutex<()>,
    pub started: AtomicBool,
}

impl JobState {
    pub fn new(job_id: String) -> Self {
        Self {
            job_id,
            progress: std::sync::RwLock::new(JobProgress::default()),
            upload: Mutex::new(UploadSession::default()),
            curation: Mutex::new(()),
            started: AtomicBool::new(false),
        }
    }

    pub fn progress_snapshot(&self) -> StatusSnapshot {
        let progress = self
            .progress
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        StatusSnapshot::of(&progress)
    }
}

/// One parsed upload request: either a single chunk with its metadata, plain
/// whole files, or both.
#[derive(Debug, Default)]
pub struct UploadRequest {
    pub job_id: Option<String>,
    /// None when the form field was absent entirely, which matters for the
    /// legacy single-shot start policy.
    pub final_field: Option<bool>,
    pub chunk: Option<ChunkUpload>,
    pub files: Vec<(String, Vec<u8>)>,
}

#[derive(Debug)]
pub struct ChunkUpload {
    pub file_name: String,
    pub chunk_index: u32,
    pub chunk_total: u32,
    pub bytes: Vec<u8>,
}

/// Chunk bookkeeping for one file being uploaded.
#[derive(Debug)]
pub struct ChunkSet {
    pub total: u32,
    pub received: BTreeSet<u32>,
}

/// Chunk bookkeeping per job: which chunks of which declared files have
/// arrived, and which files are fully reassembled on disk.
#[derive(Debug, Default)]
pub struct UploadSession {
    files: HashMap<String, ChunkSet>,
    assembled: Vec<String>,
}

impl UploadSession {
    pub fn assembled_files(&self) -> &[String] {
        &self.assembled
    }

    pub fn pending_files(&self) -> usize {
        self.files.len()
    }

    /// Store one chunk; once every declared chunk of the file is present,
    /// reassemble it by concatenation in index order. Returns true when the
    /// file just became complete.
    pub fn store_chunk(
        &mut self,
        input_dir: &Path,
        file_name: &str,
        index: u32,
        total: u32,
        bytes: &[u8],
    ) -> Result<bool> {
        let name = filename_from_path(file_name)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::UploadBadChunkMeta(format!("bad file name: {}", file_name)))?;
        if total == 0 || index >= total {
            return Err(Error::UploadChunkOutOfRange { index, total });
        }
        let entry = self
            .files
            .entry(name.clone())
            .or_insert_with(|| ChunkSet { total, received: BTreeSet::new() });
        if entry.total != total {
            return Err(Error::UploadBadChunkMeta(format!(
                "chunk_total changed for {}: {} then {}",
                name, entry.total, total
            )));
        }

        let parts_dir = input_dir.join(PARTS_DIR);
        std::fs::create_dir_all(&parts_dir)?;
        std::fs::write(parts_dir.join(format!("{}.part{}", name, index)), bytes)?;
        entry.received.insert(index);

        if entry.received.len() < total as usize {
            return Ok(false);
        }

        // All chunks present: concatenate in index order, then drop the parts.
        let mut assembled = Vec::new();
        for i in 0..total {
            let part_path = parts_dir.join(format!("{}.part{}", name, i));
            assembled.extend_from_slice(&std::fs::read(&part_path)?);
            std::fs::remove_file(&part_path)?;
        }
        std::fs::write(input_dir.join(&name), assembled)?;
        self.files.remove(&name);
        self.assembled.push(name);
        Ok(true)
    }

    /// Single-shot upload of a whole file, no chunking involved.
    pub fn store_whole_file(&mut self, input_dir: &Path, file_name: &str, bytes: &[u8]) -> Result<()> {
        let name = filename_from_path(file_name)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::UploadBadChunkMeta(format!("bad file name: {}", file_name)))?;
        std::fs::create_dir_all(input_dir)?;
        std::fs::write(input_dir.join(&name), bytes)?;
        self.assembled.push(name);
        Ok(())
    }

    /// A job may only start once every declared file is fully reassembled.
    pub fn all_complete(&self) -> bool {
        self.files.is_empty()
    }
}

/// On-disk mirror of the progress record, so polls survive a process restart.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub phase: JobPhase,
    pub fraction: f64,
    pub counts: JobCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusSnapshot {
    pub fn of(progress: &JobProgress) -> Self {
        Self {
            phase: progress.phase,
            fraction: progress.fraction,
            counts: progress.counts,
            message: progress.message.clone(),
        }
    }
}

pub fn write_status(output_dir: &Path, progress: &JobProgress) -> Result<()> {
    std::fs::create_dir_all(output_dir)?;
    let path = output_dir.join(STATUS_FILE);
    let tmp = output_dir.join(format!("{}.tmp", STATUS_FILE));
    std::fs::write(&tmp, serde_json::to_string(&StatusSnapshot::of(progress))?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

pub fn read_status(output_dir: &Path) -> Result<StatusSnapshot> {
    let path = output_dir.join(STATUS_FILE);
    if !path.exists() {
        return Err(Error::JobNotFound(output_dir.to_string_lossy().to_string()));
    }
    let content = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_reassemble_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = UploadSession::default();
        let payload: Vec<u8> = (0..=255u8).cycle().take(3 * 1024).collect();
        let chunks: Vec<&[u8]> = payload.chunks(1024).collect();

        assert!(!session.store_chunk(dir.path(), "photo.jpg", 0, 3, chunks[0]).unwrap());
        assert!(!session.all_complete());
        assert!(!session.store_chunk(dir.path(), "photo.jpg", 1, 3, chunks[1]).unwrap());
        assert!(session.store_chunk(dir.path(), "photo.jpg", 2, 3, chunks[2]).unwrap());

        assert!(session.all_complete());
        assert_eq!(session.assembled_files(), &["photo.jpg".to_string()]);
        let reassembled = std::fs::read(dir.path().join("photo.jpg")).unwrap();
        assert_eq!(reassembled, payload);
        // parts are cleaned up
        assert_eq!(std::fs::read_dir(dir.path().join(PARTS_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn test_chunks_out_of_order_still_reassemble() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = UploadSession::default();
        session.store_chunk(dir.path(), "p.jpg", 2, 3, b"cc").unwrap();
        session.store_chunk(dir.path(), "p.jpg", 0, 3, b"aa").unwrap();
        let done = session.store_chunk(dir.path(), "p.jpg", 1, 3, b"bb").unwrap();
        assert!(done);
        assert_eq!(std::fs::read(dir.path().join("p.jpg")).unwrap(), b"aabbcc");
    }

    #[test]
    fn test_bad_chunk_meta_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = UploadSession::default();
        assert!(matches!(
            session.store_chunk(dir.path(), "p.jpg", 3, 3, b"x"),
            Err(Error::UploadChunkOutOfRange { index: 3, total: 3 })
        ));
        assert!(matches!(
            session.store_chunk(dir.path(), "p.jpg", 0, 0, b"x"),
            Err(Error::UploadChunkOutOfRange { .. })
        ));
        session.store_chunk(dir.path(), "p.jpg", 0, 2, b"x").unwrap();
        // total may not change mid-file
        assert!(matches!(
            session.store_chunk(dir.path(), "p.jpg", 1, 3, b"y"),
            Err(Error::UploadBadChunkMeta(_))
        ));
    }

    #[test]
    fn test_file_name_is_sanitized_to_basename() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = UploadSession::default();
        session.store_whole_file(dir.path(), "../../etc/passwd.jpg", b"data").unwrap();
        assert!(dir.path().join("passwd.jpg").exists());
        assert!(!dir.path().parent().unwrap().join("etc").exists());
    }

    #[test]
    fn test_duplicate_chunk_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = UploadSession::default();
        session.store_chunk(dir.path(), "p.jpg", 0, 2, b"aa").unwrap();
        session.store_chunk(dir.path(), "p.jpg", 0, 2, b"aa").unwrap();
        let done = session.store_chunk(dir.path(), "p.jpg", 1, 2, b"bb").unwrap();
        assert!(done);
        assert_eq!(std::fs::read(dir.path().join("p.jpg")).unwrap(), b"aabb");
    }

    #[test]
    fn test_status_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut progress = JobProgress::default();
        progress.advance(JobPhase::Clustering, 0.75, JobCounts { photos_done: 4, faces_done: 9, faces_total_est: 9 });
        write_status(dir.path(), &progress).unwrap();
        let snap = read_status(dir.path()).unwrap();
        assert_eq!(snap.phase, JobPhase::Clustering);
        assert!((snap.fraction - 0.75).abs() < 1e-9);
        assert_eq!(snap.counts.faces_done, 9);

        assert!(matches!(
            read_status(&dir.path().join("missing")),
            Err(Error::JobNotFound(_))
        ));
    }
}
