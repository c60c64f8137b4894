pub mod file_tools;
pub mod log;
