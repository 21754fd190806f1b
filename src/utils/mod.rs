pub mod config;
pub mod logging;
pub mod run_log;

pub use config::CompressorConfig;
pub use run_log::RunLog;
