pub mod curation;
pub mod files;
pub mod jobs;
pub mod ping;
