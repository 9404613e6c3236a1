pub mod ask;
pub mod config_cmd;
pub mod generate;
pub mod job;
pub mod stream;
pub mod write;
