use crate::domain::photo::Face;

pub const SMILE_WEIGHT: f32 = 0.6;
pub const SHARPNESS_WEIGHT: f32 = 0.4;

/// Min-max normalize raw sharpness values across the whole job. A degenerate
/// range maps every value to 0.5 so the smile term decides alone.
pub fn min_max_norm(values: &[f32]) -> Vec<f32> {
    if values.is_empty() {
        return Vec::new();
    }
    let vmin = values.iter().cloned().fold(f32::INFINITY, f32::min);
    let vmax = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if vmax - vmin < 1e-8 {
        return vec![0.5; values.len()];
    }
    values.iter().map(|v| (v - vmin) / (vmax - vmin)).collect()
}

pub fn quality_score(smile: f32, sharpness_norm: f32) -> f32 {
    SMILE_WEIGHT * smile + SHARPNESS_WEIGHT * sharpness_norm
}

/// Pick the `topk` recommended faces of a cluster: descending score, ties by
/// ascending face id. Membership itself is never truncated, only the
/// recommendation list is.
pub fn top_faces<'a>(members: impl Iterator<Item = &'a Face>, topk: usize) -> Vec<&'a Face> {
    let mut ranked: Vec<&Face> = members.collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
    ranked.truncate(topk);
    ranked
}
