use serde::{Deserialize, Serialize};

/// Face bounding box in pixel coordinates, `[x, y, w, h]` like the wire format.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// One stored original. Immutable once written; only purge/delete removes it.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Photo {
    pub id: u64,
    /// Path of the stored original relative to the job input root.
    pub path: String,
    pub file_name: String,
    pub bytes: u64,
}

/// One detected face. Created once; only the score is ever recomputed.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Face {
    pub id: u64,
    pub photo_id: u64,
    pub bbox: BoundingBox,
    pub det_score: f32,
    pub smile_prob: f32,
    pub sharpness: f32,
    /// 0.6·smile + 0.4·normalized sharpness, filled by the ranker.
    pub score: f32,
    pub thumb_path: String,
    /// Cluster label, -1 for noise.
    pub cluster_id: i64,
}
