use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Sentinel label for the noise pseudo-cluster.
pub const NOISE_CLUSTER_ID: i64 = -1;
/// Key of the noise pseudo-cluster in the grouping map.
pub const NOISE_KEY: &str = "noise";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq)]
pub struct ClusterStats {
    pub avg_smile: f32,
    pub avg_sharpness: f32,
}

/// One of the top-N recommended shots of a cluster.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TopPick {
    pub face_id: u64,
    pub score: f32,
    pub smile: f32,
    pub sharpness: f32,
    pub thumb_path: String,
    pub photo_path: String,
}

/// Durable record of one identity cluster (or the noise pseudo-cluster).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Cluster {
    pub cluster_id: i64,
    pub is_noise: bool,
    pub size: usize,
    pub member_face_ids: Vec<u64>,
    /// Persistence of the cluster over the distance range it existed.
    pub stability: f64,
    pub default_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    pub stats: ClusterStats,
    pub top: Vec<TopPick>,
}

impl Cluster {
    pub fn display_name(&self) -> &str {
        self.custom_name.as_deref().unwrap_or(&self.default_name)
    }
}

/// Maps the clustering onto the on-disk grouped-originals tree. Keys of
/// `clusters_to_photos` are numeric cluster ids plus the `noise` key; values
/// are ordered photo paths relative to the job output root. Member order is
/// significant and user-editable.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Grouping {
    pub grouped_dir: String,
    pub clusters_to_photos: BTreeMap<String, Vec<String>>,
    pub no_face: Vec<String>,
    /// Pool fed by cluster deletes; faces are never silently discarded.
    #[serde(default)]
    pub unassigned: Vec<String>,
}

pub fn grouping_key(cluster_id: i64) -> String {
    if cluster_id == NOISE_CLUSTER_ID {
        NOISE_KEY.to_string()
    } else {
        cluster_id.to_string()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct LedgerParams {
    pub topk: usize,
    pub min_cluster_size: usize,
}
