pub mod photo;
pub mod cluster;
pub mod job;
