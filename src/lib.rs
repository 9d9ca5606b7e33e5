pub mod analysis;
pub mod collector;
pub mod config;
pub mod encoder;
pub mod error;
pub mod gc;
pub mod logging;
pub mod models;
pub mod probe;
pub mod process_stat;
pub mod sampler;
pub mod source_check;
