use serde::{Deserialize, Serialize};

/// Pipeline lifecycle. Transitions are monotonic: a job only moves forward
/// through these phases, or jumps to `Error` from anywhere.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, strum_macros::AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobPhase {
    Uploading,
    Preprocessing,
    Detecting,
    Embedding,
    Clustering,
    Ranking,
    Done,
    Error,
}

impl JobPhase {
    fn order(&self) -> u8 {
        match self {
            JobPhase::Uploading => 0,
            JobPhase::Preprocessing => 1,
            JobPhase::Detecting => 2,
            JobPhase::Embedding => 3,
            JobPhase::Clustering => 4,
            JobPhase::Ranking => 5,
            JobPhase::Done => 6,
            JobPhase::Error => 7,
        }
    }

    pub fn can_advance_to(&self, next: JobPhase) -> bool {
        next == JobPhase::Error || next.order() >= self.order()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub photos_done: u64,
    pub faces_done: u64,
    pub faces_total_est: u64,
}

/// The one mutable record per job, exposed through the read-only poll.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JobProgress {
    pub phase: JobPhase,
    pub fraction: f64,
    pub counts: JobCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Default for JobProgress {
    fn default() -> Self {
        Self { phase: JobPhase::Uploading, fraction: 0.0, counts: JobCounts::default(), message: None }
    }
}

impl JobProgress {
    /// Apply an update without ever letting the phase or the fraction move
    /// backwards within the job.
    pub fn advance(&mut self, phase: JobPhase, fraction: f64, counts: JobCounts) {
        if !self.phase.can_advance_to(phase) {
            return;
        }
        self.phase = phase;
        self.fraction = self.fraction.max(fraction.clamp(0.0, 1.0));
        self.counts = counts;
    }

    pub fn fail(&mut self, message: String) {
        self.phase = JobPhase::Error;
        self.message = Some(message);
    }
}
