use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::spawn_blocking;

use crate::clustering::{cluster_faces, l2_normalize, DensityParams};
use crate::domain::cluster::{
    grouping_key, Cluster, ClusterStats, Grouping, LedgerParams, TopPick, NOISE_CLUSTER_ID,
};
use crate::domain::job::{JobCounts, JobPhase};
use crate::domain::photo::{Face, Photo};
use crate::model::error::{Error, Result};
use crate::model::ledger::Ledger;
use crate::ranking::{min_max_norm, quality_score, top_faces};
use crate::tools::file_tools::{link_or_copy, list_images, LinkMode};
use crate::tools::log::{log_error, log_info, LogServiceType};

pub mod engine;

use engine::{FaceCrop, FaceEngine};

pub const GROUPED_DIR: &str = "grouped_photos";
pub const FACES_DIR: &str = "faces";
pub const CACHE_DIR: &str = "cache";
pub const EMBEDDINGS_FILE: &str = "face_embeddings.bin";

#[derive(Debug, Clone, Copy)]
pub struct PipelineParams {
    pub topk: usize,
    pub min_cluster_size: usize,
    pub min_samples: Option<usize>,
    pub link_originals: bool,
}

struct AnalyzedFace {
    crop: FaceCrop,
    descriptor: Vec<f32>,
    smile_prob: f32,
    sharpness: f32,
}

/// Detection plus the per-crop scores, all on the blocking pool in one go.
fn analyze_photo(engine: &dyn FaceEngine, bytes: &[u8]) -> Result<Vec<AnalyzedFace>> {
    let crops = engine.detect_faces(bytes)?;
    let mut out = Vec::with_capacity(crops.len());
    for crop in crops {
        let descriptor = engine.embed(&crop)?;
        let smile_prob = engine.score_smile(&crop)?;
        let sharpness = engine.score_sharpness(&crop)?;
        out.push(AnalyzedFace { crop, descriptor, smile_prob, sharpness });
    }
    Ok(out)
}

/// Progress sink; the job registry feeds these into the polled job state.
pub type ProgressFn = Arc<dyn Fn(JobPhase, f64, JobCounts) + Send + Sync>;

pub struct PipelineRun {
    pub job_id: String,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub engine: Arc<dyn FaceEngine>,
    pub params: PipelineParams,
    pub progress: ProgressFn,
}

/// Full analysis of one job's input directory: analyze every image, cluster
/// the descriptors, rank shots per identity, materialize the grouped tree and
/// write the ledger. A failing image degrades locally; only infrastructure
/// failures abort the job.
pub async fn run_pipeline(run: PipelineRun) -> Result<Ledger> {
    let report = run.progress.clone();
    let mut counts = JobCounts::default();
    report(JobPhase::Preprocessing, 0.05, counts);

    tokio::fs::create_dir_all(run.output_dir.join(FACES_DIR)).await?;
    tokio::fs::create_dir_all(run.output_dir.join(CACHE_DIR)).await?;

    let image_paths = list_images(&run.input_dir)?;
    let total = image_paths.len();
    log_info(
        LogServiceType::Pipeline,
        format!("job {}: {} input image(s), engine {}", run.job_id, total, run.engine.name()),
    );

    // -- Per-photo analysis
    let mut photos: Vec<Photo> = Vec::new();
    let mut faces: Vec<Face> = Vec::new();
    let mut descriptors: Vec<Vec<f32>> = Vec::new();

    for (done, path) in image_paths.iter().enumerate() {
        let rel = path
            .strip_prefix(&run.input_dir)
            .map_err(|_| Error::Pipeline(format!("input escaped job dir: {:?}", path)))?
            .to_string_lossy()
            .to_string();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| rel.clone());

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                log_error(LogServiceType::Pipeline, format!("unreadable {}: {}", rel, err));
                continue;
            }
        };
        let byte_len = bytes.len() as u64;

        let engine = run.engine.clone();
        let analyzed = spawn_blocking(move || analyze_photo(engine.as_ref(), &bytes))
            .await
            .map_err(|err| Error::Pipeline(format!("analysis task failed: {}", err)))?;
        let detected = match analyzed {
            Ok(detected) => detected,
            Err(err) => {
                log_error(LogServiceType::Pipeline, format!("analysis failed for {}: {}", rel, err));
                continue;
            }
        };

        let photo_id = photos.len() as u64;
        photos.push(Photo { id: photo_id, path: rel, file_name, bytes: byte_len });

        for found in detected {
            let face_id = faces.len() as u64;
            let thumb_path = format!("{}/face_{:06}.jpg", FACES_DIR, face_id);
            tokio::fs::write(run.output_dir.join(&thumb_path), &found.crop.thumb_jpeg).await?;

            let mut descriptor = found.descriptor;
            l2_normalize(&mut descriptor);
            descriptors.push(descriptor);

            faces.push(Face {
                id: face_id,
                photo_id,
                bbox: found.crop.bbox,
                det_score: found.crop.det_score,
                smile_prob: found.smile_prob,
                sharpness: found.sharpness,
                score: 0.0,
                thumb_path,
                cluster_id: NOISE_CLUSTER_ID,
            });
        }

        counts.photos_done = (done + 1) as u64;
        counts.faces_done = faces.len() as u64;
        counts.faces_total_est = counts.faces_done * total as u64 / (done + 1) as u64;
        let fraction = 0.10 + 0.60 * (done + 1) as f64 / total.max(1) as f64;
        report(JobPhase::Detecting, fraction, counts);
    }
    counts.faces_total_est = counts.faces_done;

    // -- Descriptor cache, then clustering
    write_descriptor_cache(&run.output_dir, &descriptors).await?;
    report(JobPhase::Embedding, 0.72, counts);

    report(JobPhase::Clustering, 0.75, counts);
    let density_params = DensityParams {
        min_cluster_size: run.params.min_cluster_size,
        min_samples: run.params.min_samples,
    };
    let clustering = {
        let descriptors = descriptors.clone();
        spawn_blocking(move || cluster_faces(&descriptors, &density_params))
            .await
            .map_err(|err| Error::Pipeline(format!("clustering task failed: {}", err)))?
    };
    for (face, label) in faces.iter_mut().zip(clustering.labels.iter()) {
        face.cluster_id = *label;
    }

    // -- Scoring
    report(JobPhase::Ranking, 0.82, counts);
    let sharpness_norm = min_max_norm(&faces.iter().map(|f| f.sharpness).collect::<Vec<_>>());
    for (face, sharp) in faces.iter_mut().zip(sharpness_norm.iter()) {
        face.score = quality_score(face.smile_prob, *sharp);
    }

    // -- Grouped originals tree
    let grouping = materialize_grouping(&run, &photos, &faces).await?;
    report(JobPhase::Ranking, 0.90, counts);

    // -- Cluster records and the ledger
    let clusters = build_clusters(&run, &photos, &faces, &clustering.stabilities);
    let ledger = Ledger {
        photos,
        faces,
        clusters,
        params: LedgerParams {
            topk: run.params.topk,
            min_cluster_size: run.params.min_cluster_size,
        },
        grouping,
    };
    ledger.save(&run.output_dir)?;

    report(JobPhase::Done, 1.0, counts);
    log_info(
        LogServiceType::Pipeline,
        format!(
            "job {}: done, {} photo(s), {} face(s), {} cluster(s)",
            run.job_id,
            ledger.photos.len(),
            ledger.faces.len(),
            ledger.clusters.iter().filter(|c| !c.is_noise).count()
        ),
    );
    Ok(ledger)
}

/// Raw descriptor matrix: `count: u32, dim: u32` header then row-major f32,
/// all little-endian. Lets a later run reuse embeddings without re-analysis.
async fn write_descriptor_cache(output_dir: &std::path::Path, descriptors: &[Vec<f32>]) -> Result<()> {
    let dim = descriptors.first().map(|d| d.len()).unwrap_or(0);
    let mut buf = Vec::with_capacity(8 + descriptors.len() * dim * 4);
    buf.extend_from_slice(&(descriptors.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(dim as u32).to_le_bytes());
    for row in descriptors {
        for v in row {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
    tokio::fs::write(output_dir.join(CACHE_DIR).join(EMBEDDINGS_FILE), buf).await?;
    Ok(())
}

fn cluster_dir_name(cluster_id: i64) -> String {
    if cluster_id == NOISE_CLUSTER_ID {
        "noise".to_string()
    } else {
        format!("person_{:03}", cluster_id)
    }
}

/// Copy (or symlink) each original into the directory of every cluster one of
/// its faces belongs to; faceless photos land in `no_face/`. The noise key is
/// always present so curation can target it even when empty.
async fn materialize_grouping(run: &PipelineRun, photos: &[Photo], faces: &[Face]) -> Result<Grouping> {
    let mode = if run.params.link_originals { LinkMode::Symlink } else { LinkMode::Copy };
    let grouped_root = run.output_dir.join(GROUPED_DIR);

    let mut photos_per_cluster: BTreeMap<i64, Vec<u64>> = BTreeMap::new();
    photos_per_cluster.insert(NOISE_CLUSTER_ID, Vec::new());
    for face in faces {
        let members = photos_per_cluster.entry(face.cluster_id).or_default();
        if !members.contains(&face.photo_id) {
            members.push(face.photo_id);
        }
    }

    let mut grouping = Grouping {
        grouped_dir: GROUPED_DIR.to_string(),
        ..Default::default()
    };

    for (cluster_id, mut photo_ids) in photos_per_cluster {
        photo_ids.sort_unstable();
        let dir_name = cluster_dir_name(cluster_id);
        tokio::fs::create_dir_all(grouped_root.join(&dir_name)).await?;
        let mut rel_paths = Vec::with_capacity(photo_ids.len());
        for photo_id in photo_ids {
            let photo = &photos[photo_id as usize];
            let src = run.input_dir.join(&photo.path);
            let dst = grouped_root.join(&dir_name).join(&photo.file_name);
            link_or_copy(&src, &dst, mode)?;
            rel_paths.push(format!("{}/{}/{}", GROUPED_DIR, dir_name, photo.file_name));
        }
        grouping.clusters_to_photos.insert(grouping_key(cluster_id), rel_paths);
    }

    let no_face_dir = grouped_root.join("no_face");
    tokio::fs::create_dir_all(&no_face_dir).await?;
    let with_faces: std::collections::HashSet<u64> = faces.iter().map(|f| f.photo_id).collect();
    for photo in photos {
        if !with_faces.contains(&photo.id) {
            let src = run.input_dir.join(&photo.path);
            link_or_copy(&src, &no_face_dir.join(&photo.file_name), mode)?;
            grouping
                .no_face
                .push(format!("{}/no_face/{}", GROUPED_DIR, photo.file_name));
        }
    }

    Ok(grouping)
}

fn build_clusters(
    run: &PipelineRun,
    photos: &[Photo],
    faces: &[Face],
    stabilities: &[f64],
) -> Vec<Cluster> {
    let mut cluster_ids: Vec<i64> = faces
        .iter()
        .map(|f| f.cluster_id)
        .filter(|id| *id != NOISE_CLUSTER_ID)
        .collect();
    cluster_ids.sort_unstable();
    cluster_ids.dedup();
    cluster_ids.push(NOISE_CLUSTER_ID);

    let mut out = Vec::with_capacity(cluster_ids.len());
    for cluster_id in cluster_ids {
        let members: Vec<&Face> = faces.iter().filter(|f| f.cluster_id == cluster_id).collect();
        let is_noise = cluster_id == NOISE_CLUSTER_ID;
        let n = members.len().max(1) as f32;
        let stats = ClusterStats {
            avg_smile: members.iter().map(|f| f.smile_prob).sum::<f32>() / n,
            avg_sharpness: members.iter().map(|f| f.sharpness).sum::<f32>() / n,
        };
        let dir_name = cluster_dir_name(cluster_id);
        // The noise pseudo-cluster gets no recommendations.
        let top = if is_noise {
            Vec::new()
        } else {
            top_faces(members.iter().copied(), run.params.topk)
                .into_iter()
                .map(|face| TopPick {
                    face_id: face.id,
                    score: face.score,
                    smile: face.smile_prob,
                    sharpness: face.sharpness,
                    thumb_path: face.thumb_path.clone(),
                    photo_path: format!(
                        "{}/{}/{}",
                        GROUPED_DIR, dir_name, photos[face.photo_id as usize].file_name
                    ),
                })
                .collect()
        };
        out.push(Cluster {
            cluster_id,
            is_noise,
            size: members.len(),
            member_face_ids: members.iter().map(|f| f.id).collect(),
            stability: if is_noise {
                0.0
            } else {
                stabilities.get(cluster_id as usize).copied().unwrap_or(0.0)
            },
            default_name: if is_noise {
                "Noise".to_string()
            } else {
                format!("Person {}", cluster_id + 1)
            },
            custom_name: None,
            stats,
            top,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::testing::StubEngine;
    use std::sync::Mutex;

    fn params() -> PipelineParams {
        PipelineParams { topk: 2, min_cluster_size: 3, min_samples: None, link_originals: false }
    }

    fn run_for(input: &std::path::Path, output: &std::path::Path) -> (PipelineRun, Arc<Mutex<Vec<JobPhase>>>) {
        let seen: Arc<Mutex<Vec<JobPhase>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let run = PipelineRun {
            job_id: "test".to_string(),
            input_dir: input.to_path_buf(),
            output_dir: output.to_path_buf(),
            engine: Arc::new(StubEngine),
            params: params(),
            progress: Arc::new(move |phase, _fraction, _counts| {
                sink.lock().unwrap().push(phase);
            }),
        };
        (run, seen)
    }

    fn seed_input(dir: &std::path::Path) {
        // five of persona A, three of persona B, one lone C, one faceless
        for i in 0..5 {
            std::fs::write(dir.join(format!("a{}.jpg", i)), format!("persona=A;seed={};smile=0.{}", i, i + 1)).unwrap();
        }
        for i in 0..3 {
            std::fs::write(dir.join(format!("b{}.jpg", i)), format!("persona=B;seed={}", i)).unwrap();
        }
        std::fs::write(dir.join("c_lone.jpg"), "persona=C;seed=9;smile=0.9;sharp=500").unwrap();
        std::fs::write(dir.join("empty.jpg"), "none").unwrap();
        // unsupported extension is ignored by the scan
        std::fs::write(dir.join("notes.txt"), "persona=C").unwrap();
    }

    #[tokio::test]
    async fn test_pipeline_end_to_end() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        seed_input(input.path());

        let (run, phases) = run_for(input.path(), output.path());
        let ledger = run_pipeline(run).await.unwrap();

        assert_eq!(ledger.photos.len(), 10);
        assert_eq!(ledger.faces.len(), 9);
        // two identities plus the always-present noise record
        let real: Vec<&Cluster> = ledger.clusters.iter().filter(|c| !c.is_noise).collect();
        assert_eq!(real.len(), 2);
        assert_eq!(ledger.grouping.no_face.len(), 1);

        // top picks bounded by topk and scored
        for cluster in &real {
            assert!(cluster.top.len() <= 2);
            assert!(!cluster.top.is_empty());
        }

        // the lone face stays noise and, however well it scores, gets no
        // recommendation slot
        let noise = ledger.clusters.iter().find(|c| c.is_noise).unwrap();
        assert_eq!(noise.size, 1);
        assert!(noise.top.is_empty());

        // grouped tree exists on disk
        let person0 = output.path().join(GROUPED_DIR).join("person_000");
        assert!(person0.is_dir());
        assert!(std::fs::read_dir(person0).unwrap().count() >= 3);

        // descriptor cache header matches the face count
        let cache = std::fs::read(output.path().join(CACHE_DIR).join(EMBEDDINGS_FILE)).unwrap();
        let count = u32::from_le_bytes(cache[0..4].try_into().unwrap());
        assert_eq!(count, 9);

        // ledger is reloadable and phases ended at done
        let reloaded = Ledger::load(output.path()).unwrap();
        assert_eq!(reloaded.faces.len(), 9);
        let seen = phases.lock().unwrap();
        assert_eq!(*seen.last().unwrap(), JobPhase::Done);
        assert!(seen.contains(&JobPhase::Clustering));
    }

    #[tokio::test]
    async fn test_pipeline_empty_input_yields_empty_ledger() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let (run, phases) = run_for(input.path(), output.path());
        let ledger = run_pipeline(run).await.unwrap();
        assert!(ledger.photos.is_empty());
        assert_eq!(ledger.clusters.len(), 1);
        assert!(ledger.clusters[0].is_noise);
        assert_eq!(*phases.lock().unwrap().last().unwrap(), JobPhase::Done);
    }

    #[tokio::test]
    async fn test_pipeline_skips_broken_image() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        seed_input(input.path());
        // invalid utf-8 payload makes the stub engine fail for this one photo
        std::fs::write(input.path().join("broken.jpg"), [0xff, 0xfe, 0x00]).unwrap();

        let (run, _phases) = run_for(input.path(), output.path());
        let ledger = run_pipeline(run).await.unwrap();
        // broken photo dropped, everything else analyzed
        assert_eq!(ledger.photos.len(), 10);
        assert_eq!(ledger.faces.len(), 9);
    }
}
