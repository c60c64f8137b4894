use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::cluster::{grouping_key, Cluster, Grouping, LedgerParams, NOISE_CLUSTER_ID};
use crate::domain::photo::{Face, Photo};

use super::error::{Error, Result};

pub const LEDGER_FILE: &str = "clusters.json";

/// The per-job ledger, persisted as one JSON file in the job output dir.
/// It is the single source of truth for result responses; every curation
/// operation mutates a loaded copy and swaps the file in atomically.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Ledger {
    pub photos: Vec<Photo>,
    pub faces: Vec<Face>,
    pub clusters: Vec<Cluster>,
    pub params: LedgerParams,
    pub grouping: Grouping,
}

impl Ledger {
    pub fn load(output_dir: &Path) -> Result<Ledger> {
        let path = output_dir.join(LEDGER_FILE);
        if !path.exists() {
            return Err(Error::FileNotFound(path.to_string_lossy().to_string()));
        }
        let content = std::fs::read_to_string(&path)?;
        let ledger = serde_json::from_str(&content)?;
        Ok(ledger)
    }

    /// Fully applied or not at all: serialize to a temp file next to the
    /// ledger, then rename over it.
    pub fn save(&self, output_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(output_dir)?;
        let path = output_dir.join(LEDGER_FILE);
        let tmp = output_dir.join(format!("{}.tmp", LEDGER_FILE));
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn cluster(&self, cluster_id: i64) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.cluster_id == cluster_id)
    }

    fn cluster_mut(&mut self, cluster_id: i64) -> Option<&mut Cluster> {
        self.clusters.iter_mut().find(|c| c.cluster_id == cluster_id)
    }

    /// Every list of the grouping that can hold a photo path.
    fn all_lists_mut(&mut self) -> Vec<&mut Vec<String>> {
        let mut lists: Vec<&mut Vec<String>> =
            self.grouping.clusters_to_photos.values_mut().collect();
        lists.push(&mut self.grouping.no_face);
        lists.push(&mut self.grouping.unassigned);
        lists
    }

    fn remove_path(&mut self, path: &str) -> bool {
        let mut removed = false;
        for list in self.all_lists_mut() {
            if let Some(pos) = list.iter().position(|p| p == path) {
                list.remove(pos);
                removed = true;
            }
        }
        removed
    }

    fn holds_path(&self, path: &str) -> bool {
        self.grouping.clusters_to_photos.values().any(|l| l.iter().any(|p| p == path))
            || self.grouping.no_face.iter().any(|p| p == path)
            || self.grouping.unassigned.iter().any(|p| p == path)
    }

    // -- Curation operations

    /// Set the custom display name. The noise pseudo-cluster has no identity
    /// to name and is refused.
    pub fn rename_cluster(&mut self, cluster_id: i64, name: &str) -> Result<()> {
        if cluster_id == NOISE_CLUSTER_ID {
            return Err(Error::NoiseClusterImmutable);
        }
        let cluster = self
            .cluster_mut(cluster_id)
            .ok_or_else(|| Error::ClusterNotFound(cluster_id.to_string()))?;
        let trimmed = name.trim();
        cluster.custom_name = if trimmed.is_empty() { None } else { Some(trimmed.to_string()) };
        Ok(())
    }

    /// Remove a cluster; its member paths move to the unassigned pool, never
    /// silently discarded.
    pub fn delete_cluster(&mut self, cluster_id: i64) -> Result<()> {
        let key = grouping_key(cluster_id);
        let members = self
            .grouping
            .clusters_to_photos
            .remove(&key)
            .ok_or_else(|| Error::ClusterNotFound(cluster_id.to_string()))?;
        self.grouping.unassigned.extend(members);
        if let Some(pos) = self.clusters.iter().position(|c| c.cluster_id == cluster_id) {
            let removed = self.clusters.remove(pos);
            for face in self.faces.iter_mut() {
                if removed.member_face_ids.contains(&face.id) {
                    face.cluster_id = NOISE_CLUSTER_ID;
                }
            }
        }
        Ok(())
    }

    /// Move a path into the target cluster, appended at the end of the member
    /// order. Idempotent when the path already is a member.
    pub fn assign(&mut self, path: &str, target_cluster_id: i64) -> Result<()> {
        let key = grouping_key(target_cluster_id);
        if !self.grouping.clusters_to_photos.contains_key(&key) {
            return Err(Error::ClusterNotFound(target_cluster_id.to_string()));
        }
        let already_member = self
            .grouping
            .clusters_to_photos
            .get(&key)
            .map(|l| l.iter().any(|p| p == path))
            .unwrap_or(false);
        if already_member {
            return Ok(());
        }
        if !self.remove_path(path) {
            return Err(Error::FaceNotFound(path.to_string()));
        }
        if let Some(target) = self.grouping.clusters_to_photos.get_mut(&key) {
            target.push(path.to_string());
        }
        Ok(())
    }

    /// Replace the given prefix of the member order. Members not named keep
    /// their relative order and are appended after the named ones; unknown
    /// paths are ignored.
    pub fn reorder(&mut self, cluster_id: i64, ordered_paths: &[String]) -> Result<()> {
        let key = grouping_key(cluster_id);
        let members = self
            .grouping
            .clusters_to_photos
            .get_mut(&key)
            .ok_or_else(|| Error::ClusterNotFound(cluster_id.to_string()))?;
        let mut reordered: Vec<String> = Vec::with_capacity(members.len());
        for path in ordered_paths {
            if members.iter().any(|p| p == path) && !reordered.iter().any(|p| p == path) {
                reordered.push(path.clone());
            }
        }
        for path in members.iter() {
            if !reordered.iter().any(|p| p == path) {
                reordered.push(path.clone());
            }
        }
        *members = reordered;
        Ok(())
    }

    /// Drop one path from whichever cluster or pool holds it. The underlying
    /// photo stays on disk.
    pub fn delete_face(&mut self, path: &str) -> Result<()> {
        if !self.remove_path(path) {
            return Err(Error::FaceNotFound(path.to_string()));
        }
        Ok(())
    }

    // -- Result view

    /// The wire shape of the result endpoint, built purely from the ledger.
    pub fn result_view(&self, job_id: &str) -> Value {
        let base = format!("/out/{}/", job_id);
        let originals = |paths: &[String]| -> Vec<Value> {
            paths
                .iter()
                .map(|p| {
                    json!({
                        "photo": format!("{}{}", base, p),
                        "thumb": format!("{}{}", base, p),
                    })
                })
                .collect()
        };

        let mut clusters_out: Vec<Value> = Vec::new();
        let mut sorted: Vec<&Cluster> = self.clusters.iter().collect();
        sorted.sort_by_key(|c| (c.is_noise, c.cluster_id));
        for cluster in sorted {
            let key = grouping_key(cluster.cluster_id);
            let paths = self
                .grouping
                .clusters_to_photos
                .get(&key)
                .cloned()
                .unwrap_or_default();
            clusters_out.push(json!({
                "cluster_id": cluster.cluster_id,
                "name": cluster.display_name(),
                "custom_name": cluster.custom_name,
                "default_name": cluster.default_name,
                "is_noise": cluster.is_noise,
                "size": paths.len(),
                "stability": cluster.stability,
                "top": cluster.top,
                "originals": originals(&paths),
            }));
        }

        let mut unassigned = self.grouping.unassigned.clone();
        unassigned.extend(self.grouping.no_face.iter().cloned());

        json!({
            "meta": {
                "total_photos": self.photos.len(),
                "total_faces": self.faces.len(),
            },
            "clusters": clusters_out,
            "unassigned": originals(&unassigned),
        })
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cluster::{ClusterStats, NOISE_KEY};

    fn cluster(id: i64, name_idx: usize) -> Cluster {
        Cluster {
            cluster_id: id,
            is_noise: id == NOISE_CLUSTER_ID,
            size: 0,
            member_face_ids: Vec::new(),
            stability: 1.0,
            default_name: if id == NOISE_CLUSTER_ID { "Noise".to_string() } else { format!("Person {}", name_idx) },
            custom_name: None,
            stats: ClusterStats::default(),
            top: Vec::new(),
        }
    }

    fn sample_ledger() -> Ledger {
        let mut grouping = Grouping {
            grouped_dir: "grouped_photos".to_string(),
            ..Default::default()
        };
        grouping.clusters_to_photos.insert(
            "0".to_string(),
            vec!["grouped_photos/person_000/a.jpg".to_string(), "grouped_photos/person_000/b.jpg".to_string()],
        );
        grouping.clusters_to_photos.insert(
            "1".to_string(),
            vec!["grouped_photos/person_001/c.jpg".to_string()],
        );
        grouping
            .clusters_to_photos
            .insert(NOISE_KEY.to_string(), vec!["grouped_photos/noise/d.jpg".to_string()]);
        grouping.no_face = vec!["grouped_photos/no_face/e.jpg".to_string()];

        Ledger {
            photos: Vec::new(),
            faces: Vec::new(),
            clusters: vec![cluster(0, 1), cluster(1, 2), cluster(NOISE_CLUSTER_ID, 0)],
            params: LedgerParams { topk: 3, min_cluster_size: 5 },
            grouping,
        }
    }

    #[test]
    fn test_rename_and_noise_refusal() {
        let mut ledger = sample_ledger();
        ledger.rename_cluster(0, "Alice").unwrap();
        assert_eq!(ledger.cluster(0).unwrap().display_name(), "Alice");
        // blank name clears the custom name
        ledger.rename_cluster(0, "  ").unwrap();
        assert_eq!(ledger.cluster(0).unwrap().display_name(), "Person 1");

        assert!(matches!(
            ledger.rename_cluster(NOISE_CLUSTER_ID, "x"),
            Err(Error::NoiseClusterImmutable)
        ));
        assert!(matches!(ledger.rename_cluster(42, "x"), Err(Error::ClusterNotFound(_))));
    }

    #[test]
    fn test_delete_cluster_moves_members_to_pool() {
        let mut ledger = sample_ledger();
        ledger.delete_cluster(0).unwrap();
        assert!(ledger.cluster(0).is_none());
        assert!(!ledger.grouping.clusters_to_photos.contains_key("0"));
        assert_eq!(
            ledger.grouping.unassigned,
            vec!["grouped_photos/person_000/a.jpg", "grouped_photos/person_000/b.jpg"]
        );
    }

    #[test]
    fn test_assign_round_trip_appends() {
        let mut ledger = sample_ledger();
        let path = "grouped_photos/person_000/a.jpg";
        ledger.assign(path, 1).unwrap();
        assert_eq!(
            ledger.grouping.clusters_to_photos["1"],
            vec!["grouped_photos/person_001/c.jpg", path]
        );
        assert_eq!(ledger.grouping.clusters_to_photos["0"], vec!["grouped_photos/person_000/b.jpg"]);

        // back again: membership restored, appended at the end
        ledger.assign(path, 0).unwrap();
        assert_eq!(
            ledger.grouping.clusters_to_photos["0"],
            vec!["grouped_photos/person_000/b.jpg", path]
        );

        // idempotent when already a member
        ledger.assign(path, 0).unwrap();
        assert_eq!(ledger.grouping.clusters_to_photos["0"].len(), 2);

        assert!(matches!(ledger.assign("nope.jpg", 0), Err(Error::FaceNotFound(_))));
        assert!(matches!(ledger.assign(path, 99), Err(Error::ClusterNotFound(_))));
    }

    #[test]
    fn test_assign_from_pool_and_no_face() {
        let mut ledger = sample_ledger();
        ledger.assign("grouped_photos/no_face/e.jpg", 0).unwrap();
        assert!(ledger.grouping.no_face.is_empty());
        assert!(ledger.grouping.clusters_to_photos["0"].iter().any(|p| p.ends_with("e.jpg")));
    }

    #[test]
    fn test_reorder_prefix_then_rest_in_order() {
        let mut ledger = sample_ledger();
        ledger.grouping.clusters_to_photos.insert(
            "0".to_string(),
            vec!["a".into(), "b".into(), "c".into(), "d".into()],
        );
        ledger
            .reorder(0, &["c".to_string(), "unknown".to_string(), "a".to_string()])
            .unwrap();
        assert_eq!(ledger.grouping.clusters_to_photos["0"], vec!["c", "a", "b", "d"]);
    }

    #[test]
    fn test_delete_face_keeps_rest() {
        let mut ledger = sample_ledger();
        ledger.delete_face("grouped_photos/person_000/a.jpg").unwrap();
        assert_eq!(ledger.grouping.clusters_to_photos["0"], vec!["grouped_photos/person_000/b.jpg"]);
        assert!(matches!(ledger.delete_face("missing.jpg"), Err(Error::FaceNotFound(_))));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = sample_ledger();
        ledger.rename_cluster(1, "Bob").unwrap();
        ledger.save(dir.path()).unwrap();
        let loaded = Ledger::load(dir.path()).unwrap();
        assert_eq!(loaded.cluster(1).unwrap().display_name(), "Bob");
        assert_eq!(loaded.grouping.clusters_to_photos.len(), 3);
        assert!(loaded.grouping.clusters_to_photos.contains_key(NOISE_KEY));
    }

    #[test]
    fn test_result_view_shape() {
        let ledger = sample_ledger();
        let view = ledger.result_view("job1");
        let clusters = view["clusters"].as_array().unwrap();
        assert_eq!(clusters.len(), 3);
        // numeric clusters first, noise last
        assert_eq!(clusters[0]["cluster_id"], 0);
        assert_eq!(clusters[2]["is_noise"], true);
        assert_eq!(
            clusters[0]["originals"][0]["photo"],
            "/out/job1/grouped_photos/person_000/a.jpg"
        );
        // unassigned pools no_face entries
        assert_eq!(view["unassigned"].as_array().unwrap().len(), 1);
        assert_eq!(view["meta"]["total_photos"], 0);
    }
}
